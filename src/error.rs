use crate::types::response::GraphqlError;
use thiserror::Error;

/// Structured error context for diagnostics and logging.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorContext {
    /// Path or configuration key that caused the error (e.g., "config.public_api_url", "data.user.__typename")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g., expected shape, actual value)
    pub details: Option<String>,
    /// Source of the error (e.g., "transport_selector", "normalizer")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Failures of the physical channels (request/response and persistent stream).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Stream protocol error: {0}")]
    Protocol(String),

    #[error("Stream closed before the operation completed")]
    Closed,
}

impl TransportError {
    /// HTTP status attached to the failure, if the server answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Status { status, .. } => Some(*status),
            TransportError::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    fn is_transient(&self) -> bool {
        match self {
            TransportError::Status { status, .. } => {
                matches!(*status, 408 | 429) || (500..=599).contains(status)
            }
            TransportError::Http(e) => match e.status() {
                Some(s) => {
                    let s = s.as_u16();
                    matches!(s, 408 | 429) || (500..=599).contains(&s)
                }
                None => e.is_timeout() || e.is_connect() || e.is_request() || e.is_body(),
            },
            TransportError::WebSocket(_) | TransportError::Closed => true,
            TransportError::Protocol(_) => false,
        }
    }
}

/// Unified error type for the data layer.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("Network transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("GraphQL error: {}", format_api_errors(.errors))]
    Api { errors: Vec<GraphqlError> },

    #[error("Normalization error: {message}{}", format_context(.context))]
    Normalization {
        message: String,
        context: ErrorContext,
    },

    #[error("Operation failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Runtime error: {message}{}", format_context(.context))]
    Runtime {
        message: String,
        context: ErrorContext,
    },
}

fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

fn format_api_errors(errors: &[GraphqlError]) -> String {
    errors
        .iter()
        .map(|e| e.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    pub fn normalization_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Normalization {
            message: msg.into(),
            context,
        }
    }

    pub fn runtime_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Runtime {
            message: msg.into(),
            context,
        }
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Configuration { context, .. }
            | Error::Normalization { context, .. }
            | Error::Runtime { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Whether re-issuing the same operation may succeed.
    ///
    /// Only transport-level failures qualify; the server having executed the
    /// operation and reported errors is final.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Transport(e) => e.is_transient(),
            _ => false,
        }
    }

    /// The innermost error, looking through retry exhaustion.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::RetriesExhausted { source, .. } => source.root_cause(),
            other => other,
        }
    }
}
