//! # graphlink
//!
//! Client-side data layer for a GraphQL API.
//!
//! ## Overview
//!
//! Operations enter through a [`GraphqlClient`], pass a resilience chain
//! (diagnostic reporting, then retry with backoff) and reach the network over
//! the channel the transport selector picks: HTTP for queries and mutations,
//! a `graphql-ws` WebSocket for subscriptions in an interactive session.
//! Results are normalized into an identity-keyed cache before they are
//! returned.
//!
//! A [`ClientLifecycle`] hands out clients per execution context: a fresh one
//! per rendering pass, a process-wide singleton for an interactive session.
//! Cache state captured during rendering is carried over with a
//! [`CacheSnapshot`] and merged by [`hydration::merge`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use graphlink::{ClientConfig, ClientLifecycle, ExecutionContext, Operation};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> graphlink::Result<()> {
//!     let lifecycle = ClientLifecycle::new(ClientConfig::from_env()?);
//!     let client = lifecycle.resolve_client(ExecutionContext::Interactive, None)?;
//!
//!     let query = Operation::parse("query Post($id: ID!) { post(id: $id) { id title } }")?;
//!     client.execute(&query, json!({"id": "1"})).await?;
//!     println!("{:?}", client.read_query(&query));
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`client`] | Client instance, builder, subscriptions, error classification |
//! | [`lifecycle`] | Per-context client resolution and the interactive singleton |
//! | [`pipeline`] | Resilience chain: report, retry, terminating link |
//! | [`transport`] | Channel selection, HTTP and WebSocket channels |
//! | [`cache`] | Normalized store, identity keys, snapshots |
//! | [`hydration`] | Snapshot merge across the render/hydrate boundary |
//! | [`telemetry`] | Diagnostic events and sinks |
//! | [`notify`] | User-facing error notifications |
//! | [`config`] | Endpoints and policy from env or YAML |
//! | [`types`] | Operations, wire shapes, execution context |

pub mod cache;
pub mod client;
pub mod config;
pub mod hydration;
pub mod lifecycle;
pub mod notify;
pub mod pipeline;
pub mod telemetry;
pub mod transport;
pub mod types;

// Re-export main types for convenience
pub use cache::{CacheSnapshot, CacheStats, NormalizedStore, TypePolicies};
pub use client::{classify, GraphqlClient, GraphqlClientBuilder, SubscriptionStream};
pub use config::{ClientConfig, RetrySettings};
pub use lifecycle::ClientLifecycle;
pub use notify::{Notifier, QueryErrorHandler};
pub use telemetry::{DiagnosticEvent, DiagnosticSink};
pub use types::{
    ExecutionContext, GraphqlError, GraphqlRequest, GraphqlResponse, Operation, OperationKind,
    RetryIntent,
};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// A pinned, boxed stream that emits `Result<T>`
pub type BoxStream<'a, T> = futures::stream::BoxStream<'a, Result<T>>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};
