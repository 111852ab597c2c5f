//! Physical channels and the policy that picks one per operation.
//!
//! | Channel | Implementation |
//! |---------|----------------|
//! | [`Channel::RequestResponse`] | [`HttpTransport`] (HTTP POST) |
//! | [`Channel::Stream`] | [`WsTransport`] (`graphql-ws` over WebSocket) |
//!
//! Both channels sit behind small async traits so the resilience chain can be
//! exercised against scripted executors.

pub mod http;
pub mod ws;

pub use crate::error::TransportError;
pub use http::HttpTransport;
pub use ws::WsTransport;

use crate::config::graphql_endpoint;
use crate::types::{ExecutionContext, GraphqlRequest, GraphqlResponse, Operation, OperationKind};
use crate::{BoxStream, Error, ErrorContext, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Request/response channel.
#[async_trait]
pub trait HttpExecutor: Send + Sync {
    async fn execute(&self, request: &GraphqlRequest) -> Result<GraphqlResponse>;
}

/// Persistent-stream channel.
///
/// The returned stream ends when the server completes the operation or when
/// `cancel` fires; no item is produced after cancellation.
#[async_trait]
pub trait StreamExecutor: Send + Sync {
    async fn subscribe(
        &self,
        request: &GraphqlRequest,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'static, GraphqlResponse>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    RequestResponse,
    Stream,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequestResponse => "request_response",
            Self::Stream => "stream",
        }
    }
}

/// Derive the persistent-stream endpoint from a request/response endpoint.
///
/// `https` becomes `wss`, `http` becomes `ws`; any other scheme is a
/// configuration error.
pub fn stream_endpoint(endpoint: &Url) -> Result<Url> {
    let scheme = match endpoint.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => {
            return Err(Error::configuration_with_context(
                format!("unknown endpoint scheme '{}'", other),
                ErrorContext::new()
                    .with_field_path("public_api_url")
                    .with_details(endpoint.to_string())
                    .with_source("transport_selector"),
            ));
        }
    };
    let mut derived = endpoint.clone();
    derived.set_scheme(scheme).map_err(|_| {
        Error::configuration_with_context(
            format!("cannot switch endpoint scheme to '{}'", scheme),
            ErrorContext::new()
                .with_details(endpoint.to_string())
                .with_source("transport_selector"),
        )
    })?;
    Ok(derived)
}

/// Picks the channel for an operation. Endpoints are resolved and validated
/// once, at construction.
#[derive(Debug, Clone)]
pub struct TransportSelector {
    context: ExecutionContext,
    http_endpoint: Url,
    stream_endpoint: Option<Url>,
}

impl TransportSelector {
    /// `api_base` serves request/response traffic; `stream_base` is the
    /// browser-reachable base the stream endpoint is derived from.
    pub fn new(context: ExecutionContext, api_base: &Url, stream_base: &Url) -> Result<Self> {
        let http_endpoint = graphql_endpoint(api_base);
        stream_endpoint(&http_endpoint)?;
        let derived = stream_endpoint(&graphql_endpoint(stream_base))?;
        Ok(Self {
            context,
            http_endpoint,
            stream_endpoint: context.is_interactive().then_some(derived),
        })
    }

    pub fn context(&self) -> ExecutionContext {
        self.context
    }

    pub fn http_endpoint(&self) -> &Url {
        &self.http_endpoint
    }

    /// `None` in a rendering context: no stream is ever opened there.
    pub fn stream_endpoint(&self) -> Option<&Url> {
        self.stream_endpoint.as_ref()
    }

    pub fn select(&self, operation: &Operation) -> Channel {
        match self.context {
            ExecutionContext::Rendering => Channel::RequestResponse,
            ExecutionContext::Interactive => match operation.kind() {
                OperationKind::Subscription => Channel::Stream,
                OperationKind::Query | OperationKind::Mutation => Channel::RequestResponse,
            },
        }
    }
}
