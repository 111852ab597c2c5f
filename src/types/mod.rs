//! Core type definitions shared across the data layer.
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`operation`] | Parsed operations and their kind |
//! | [`response`] | Request/response wire shapes |
//! | [`context`] | Rendering vs. interactive execution |

pub mod context;
pub mod operation;
pub mod response;

pub use context::ExecutionContext;
pub use operation::{Operation, OperationKind, RetryIntent};
pub use response::{GraphqlError, GraphqlErrorLocation, GraphqlRequest, GraphqlResponse};
