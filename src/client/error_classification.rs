//! Error classification logic
//!
//! Maps a failed operation to a message that is safe to show a user. Errors
//! the API reported are shown verbatim; a generic server failure is replaced
//! by a fixed message so internal detail does not leak.

use crate::Error;

/// Shown instead of the details of an HTTP 500.
pub const GENERIC_SERVER_ERROR_MESSAGE: &str = "An internal server error occurred.";

const GENERIC_SERVER_ERROR_STATUS: u16 = 500;

/// Prefix marking a message as coming from the API.
const API_ERROR_PREFIX: &str = "Error: ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The server executed the operation and reported errors.
    Api,
    /// The transport failed with the generic server-failure status.
    ServerFailure,
    Other,
}

/// Category of `err`, looking through retry exhaustion.
pub fn categorize(err: &Error) -> ErrorCategory {
    match err.root_cause() {
        Error::Api { errors } if !errors.is_empty() => ErrorCategory::Api,
        Error::Transport(t) if t.status() == Some(GENERIC_SERVER_ERROR_STATUS) => {
            ErrorCategory::ServerFailure
        }
        _ => ErrorCategory::Other,
    }
}

/// User-presentable message for `err`.
pub fn classify(err: &Error) -> String {
    if let Error::Api { errors } = err.root_cause() {
        if let Some(first) = errors.first() {
            return format!("{}{}", API_ERROR_PREFIX, first.message);
        }
    }
    match categorize(err) {
        ErrorCategory::ServerFailure => GENERIC_SERVER_ERROR_MESSAGE.to_string(),
        _ => err.to_string(),
    }
}
