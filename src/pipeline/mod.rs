//! Request processing pipeline (the resilience chain).
//!
//! Every outbound operation flows through an ordered chain of stages, each
//! wrapping the next:
//!
//! ```text
//! ReportStage ──▶ RetryStage ──▶ TerminatingLink ──▶ HTTP / WebSocket
//!  (diagnostics)   (backoff)      (channel selection)
//! ```
//!
//! | Stage | Description |
//! |-------|-------------|
//! | [`ReportStage`] | Forwards outcome metadata to a [`DiagnosticSink`](crate::telemetry::DiagnosticSink) |
//! | [`RetryStage`] | Re-issues transient failures with exponential backoff |
//! | [`TerminatingLink`] | Picks a channel through the [`TransportSelector`](crate::transport::TransportSelector) |

pub mod report;
pub mod retry;
pub mod terminal;

pub use report::ReportStage;
pub use retry::{RetryPolicy, RetryStage};
pub use terminal::TerminatingLink;

use crate::telemetry::DiagnosticSink;
use crate::types::{GraphqlRequest, GraphqlResponse, Operation};
use crate::{BoxStream, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// One operation travelling through the chain.
#[derive(Debug, Clone)]
pub struct OperationRequest {
    pub id: String,
    pub operation: Arc<Operation>,
    pub body: GraphqlRequest,
    /// Cancels pending retry timers and open streams for this operation.
    pub cancel: CancellationToken,
}

impl OperationRequest {
    pub fn new(operation: Arc<Operation>, variables: Value) -> Self {
        let body = GraphqlRequest::new(&operation, variables);
        Self {
            id: Uuid::new_v4().to_string(),
            operation,
            body,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// A stage of the chain.
#[async_trait]
pub trait Link: Send + Sync {
    /// Run a single request/response exchange.
    async fn execute(&self, request: &OperationRequest) -> Result<GraphqlResponse>;

    /// Open a stream of responses.
    async fn subscribe(
        &self,
        request: &OperationRequest,
    ) -> Result<BoxStream<'static, GraphqlResponse>>;

    /// Stage names from this stage down to the terminal link.
    fn stages(&self) -> Vec<&'static str>;
}

/// The composed chain: report, then retry, then the terminating link.
pub struct Pipeline {
    head: ReportStage<RetryStage<TerminatingLink>>,
}

impl Pipeline {
    pub fn new(
        terminal: TerminatingLink,
        retry: RetryPolicy,
        sink: Arc<dyn DiagnosticSink>,
    ) -> Self {
        Self {
            head: ReportStage::new(sink, RetryStage::new(retry, terminal)),
        }
    }

    pub fn stages(&self) -> Vec<&'static str> {
        self.head.stages()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        self.head.inner().policy()
    }

    pub fn terminal(&self) -> &TerminatingLink {
        self.head.inner().inner()
    }

    /// Execute, then run `then` on the response inside the report stage so
    /// its failures are reported with the operation.
    pub async fn execute_then<F>(&self, request: &OperationRequest, then: F) -> Result<GraphqlResponse>
    where
        F: FnOnce(GraphqlResponse) -> Result<GraphqlResponse> + Send,
    {
        self.head.execute_then(request, then).await
    }

    /// Subscribe, passing every item through `then` inside the report stage.
    pub async fn subscribe_then<F>(
        &self,
        request: &OperationRequest,
        then: F,
    ) -> Result<BoxStream<'static, GraphqlResponse>>
    where
        F: Fn(GraphqlResponse) -> Result<GraphqlResponse> + Send + Sync + 'static,
    {
        self.head.subscribe_then(request, then).await
    }
}

#[async_trait]
impl Link for Pipeline {
    async fn execute(&self, request: &OperationRequest) -> Result<GraphqlResponse> {
        self.head.execute(request).await
    }

    async fn subscribe(
        &self,
        request: &OperationRequest,
    ) -> Result<BoxStream<'static, GraphqlResponse>> {
        self.head.subscribe(request).await
    }

    fn stages(&self) -> Vec<&'static str> {
        self.head.stages()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted executors for exercising the chain without a network.

    use crate::transport::{HttpExecutor, StreamExecutor, TransportError};
    use crate::types::{GraphqlRequest, GraphqlResponse};
    use crate::{BoxStream, Error, Result};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    pub(crate) fn server_error(status: u16) -> Error {
        Error::Transport(TransportError::Status {
            status,
            body: "upstream failure".into(),
        })
    }

    /// Replays scripted results; repeats the last one when the script runs out.
    pub(crate) struct ScriptedHttp {
        script: Mutex<VecDeque<Result<GraphqlResponse>>>,
        last: fn() -> Result<GraphqlResponse>,
        pub calls: AtomicU32,
    }

    impl ScriptedHttp {
        pub(crate) fn new(
            script: Vec<Result<GraphqlResponse>>,
            last: fn() -> Result<GraphqlResponse>,
        ) -> Self {
            Self {
                script: Mutex::new(script.into()),
                last,
                calls: AtomicU32::new(0),
            }
        }

        pub(crate) fn always(last: fn() -> Result<GraphqlResponse>) -> Self {
            Self::new(Vec::new(), last)
        }

        pub(crate) fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl HttpExecutor for ScriptedHttp {
        async fn execute(&self, _request: &GraphqlRequest) -> Result<GraphqlResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(self.last)
        }
    }

    /// Emits the given payloads, then ends.
    pub(crate) struct ScriptedStream {
        pub payloads: Vec<GraphqlResponse>,
        pub opened: AtomicU32,
    }

    impl ScriptedStream {
        pub(crate) fn new(payloads: Vec<GraphqlResponse>) -> Self {
            Self {
                payloads,
                opened: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl StreamExecutor for ScriptedStream {
        async fn subscribe(
            &self,
            _request: &GraphqlRequest,
            cancel: CancellationToken,
        ) -> Result<BoxStream<'static, GraphqlResponse>> {
            use futures::StreamExt;
            self.opened.fetch_add(1, Ordering::SeqCst);
            let items: Vec<Result<GraphqlResponse>> =
                self.payloads.iter().cloned().map(Ok).collect();
            Ok(Box::pin(
                futures::stream::iter(items).take_until(async move { cancel.cancelled().await }),
            ))
        }
    }
}
