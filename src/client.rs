//! GraphQL client.
//!
//! Implementation details are split into submodules under `src/client/`.

pub mod builder;
pub mod core;
pub mod error_classification;
pub mod subscription;

pub use builder::GraphqlClientBuilder;
pub use core::GraphqlClient;
pub use error_classification::{classify, ErrorCategory, GENERIC_SERVER_ERROR_MESSAGE};
pub use subscription::SubscriptionStream;
