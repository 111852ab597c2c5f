use super::{Link, OperationRequest};
use crate::telemetry::{DiagnosticDispatcher, DiagnosticEvent, DiagnosticSink, Outcome};
use crate::types::GraphqlResponse;
use crate::{BoxStream, Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

fn outcome_of<T>(result: &Result<T>, api_errors: impl Fn(&T) -> usize) -> Outcome {
    match result {
        Ok(value) => Outcome::Success {
            api_errors: api_errors(value),
        },
        Err(err) => Outcome::Failure {
            message: err.to_string(),
            transient: err.root_cause().is_transient(),
        },
    }
}

/// Reports the outcome of every operation to a diagnostic sink.
///
/// Observational only: the result passes through untouched, events are
/// delivered by a background [`DiagnosticDispatcher`], and a sink failure is
/// logged rather than surfaced.
pub struct ReportStage<L> {
    dispatcher: Arc<DiagnosticDispatcher>,
    inner: L,
}

impl<L: Link> ReportStage<L> {
    pub fn new(sink: Arc<dyn DiagnosticSink>, inner: L) -> Self {
        Self {
            dispatcher: Arc::new(DiagnosticDispatcher::new(sink)),
            inner,
        }
    }

    pub fn inner(&self) -> &L {
        &self.inner
    }

    fn emit(&self, request: &OperationRequest, started: Instant, outcome: Outcome) {
        self.dispatcher.dispatch(DiagnosticEvent::new(
            request.id.clone(),
            &request.operation,
            started.elapsed().as_millis() as u64,
            outcome,
        ));
    }

    /// Run the inner chain, then `then` on its response, and report the
    /// combined outcome. Lets the caller's post-processing (normalization)
    /// count as part of the operation.
    pub async fn execute_then<F>(&self, request: &OperationRequest, then: F) -> Result<GraphqlResponse>
    where
        F: FnOnce(GraphqlResponse) -> Result<GraphqlResponse> + Send,
    {
        let started = Instant::now();
        let result = self.inner.execute(request).await.and_then(then);
        self.emit(request, started, outcome_of(&result, |r| r.errors.len()));
        result
    }

    /// Open a stream through the inner chain and pass every item through
    /// `then`. Whether the stream opened is reported once; every failed item
    /// after that is reported as well.
    pub async fn subscribe_then<F>(
        &self,
        request: &OperationRequest,
        then: F,
    ) -> Result<BoxStream<'static, GraphqlResponse>>
    where
        F: Fn(GraphqlResponse) -> Result<GraphqlResponse> + Send + Sync + 'static,
    {
        let started = Instant::now();
        let result = self.inner.subscribe(request).await;
        self.emit(request, started, outcome_of(&result, |_| 0));
        let stream = result?;

        let dispatcher = Arc::clone(&self.dispatcher);
        let request = request.clone();
        Ok(stream
            .map(move |item| {
                let item = item.and_then(&then);
                if let Err(e) = &item {
                    if !matches!(e, Error::Cancelled) {
                        warn!(request_id = request.id.as_str(), error = %e, "subscription failed");
                        dispatcher.dispatch(DiagnosticEvent::new(
                            request.id.clone(),
                            &request.operation,
                            started.elapsed().as_millis() as u64,
                            outcome_of(&item, |_| 0),
                        ));
                    }
                }
                item
            })
            .boxed())
    }
}

#[async_trait]
impl<L: Link> Link for ReportStage<L> {
    async fn execute(&self, request: &OperationRequest) -> Result<GraphqlResponse> {
        self.execute_then(request, Ok).await
    }

    async fn subscribe(
        &self,
        request: &OperationRequest,
    ) -> Result<BoxStream<'static, GraphqlResponse>> {
        self.subscribe_then(request, Ok).await
    }

    fn stages(&self) -> Vec<&'static str> {
        let mut stages = vec!["report"];
        stages.extend(self.inner.stages());
        stages
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{server_error, ScriptedHttp, ScriptedStream};
    use super::super::TerminatingLink;
    use super::*;
    use crate::telemetry::InMemoryDiagnosticSink;
    use crate::transport::TransportSelector;
    use crate::types::{ExecutionContext, Operation};
    use crate::ErrorContext;
    use serde_json::{json, Value};
    use std::time::Duration;
    use url::Url;

    const WAIT: Duration = Duration::from_secs(2);

    struct FailingSink;

    #[async_trait]
    impl DiagnosticSink for FailingSink {
        async fn report(&self, _: DiagnosticEvent) -> Result<()> {
            Err(server_error(500))
        }
    }

    struct SlowSink;

    #[async_trait]
    impl DiagnosticSink for SlowSink {
        async fn report(&self, _: DiagnosticEvent) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok(())
        }
    }

    fn terminal(http: Arc<ScriptedHttp>) -> TerminatingLink {
        let base = Url::parse("https://api.example.com").unwrap();
        let selector = TransportSelector::new(ExecutionContext::Rendering, &base, &base).unwrap();
        TerminatingLink::new(selector, http, None)
    }

    fn request(doc: &str) -> OperationRequest {
        OperationRequest::new(Arc::new(Operation::parse(doc).unwrap()), Value::Null)
    }

    fn feed() -> OperationRequest {
        request("query Feed { feed { id } }")
    }

    fn rejected(_: GraphqlResponse) -> Result<GraphqlResponse> {
        Err(Error::normalization_with_context(
            "missing key field 'isbn'",
            ErrorContext::new().with_source("normalizer"),
        ))
    }

    #[tokio::test]
    async fn failures_are_reported_and_passed_through() {
        let http = Arc::new(ScriptedHttp::always(|| Err(server_error(404))));
        let sink = Arc::new(InMemoryDiagnosticSink::new(4));
        let stage = ReportStage::new(sink.clone(), terminal(http));

        let err = stage.execute(&feed()).await.unwrap_err();
        assert!(err.to_string().contains("404"));

        let events = sink.wait_for(1, WAIT).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].operation_name.as_deref(), Some("Feed"));
        match &events[0].outcome {
            Outcome::Failure { transient, .. } => assert!(!transient),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn post_processing_failures_are_reported() {
        let http = Arc::new(ScriptedHttp::always(|| {
            Ok(GraphqlResponse::from_data(json!({"feed": []})))
        }));
        let sink = Arc::new(InMemoryDiagnosticSink::new(4));
        let stage = ReportStage::new(sink.clone(), terminal(http));

        let err = stage.execute_then(&feed(), rejected).await.unwrap_err();
        assert!(matches!(err, Error::Normalization { .. }));

        let events = sink.wait_for(1, WAIT).await;
        match &events[0].outcome {
            Outcome::Failure { message, transient } => {
                assert!(message.contains("isbn"));
                assert!(!transient);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_stream_items_are_reported() {
        let http = Arc::new(ScriptedHttp::always(|| Ok(GraphqlResponse::default())));
        let stream = Arc::new(ScriptedStream::new(vec![
            GraphqlResponse::from_data(json!({"tick": 1})),
            GraphqlResponse::from_data(json!({"tick": 2})),
        ]));
        let base = Url::parse("https://api.example.com").unwrap();
        let selector =
            TransportSelector::new(ExecutionContext::Interactive, &base, &base).unwrap();
        let sink = Arc::new(InMemoryDiagnosticSink::new(8));
        let stage = ReportStage::new(
            sink.clone(),
            TerminatingLink::new(selector, http, Some(stream)),
        );

        let items: Vec<_> = stage
            .subscribe_then(&request("subscription Ticks { tick }"), |response| {
                match response.data.as_ref().and_then(|d| d["tick"].as_i64()) {
                    Some(2) => rejected(response),
                    _ => Ok(response),
                }
            })
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok() && items[1].is_err());

        let events = sink.wait_for(2, WAIT).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].outcome, Outcome::Success { api_errors: 0 });
        assert!(events[1].is_failure());
    }

    #[tokio::test]
    async fn sink_failure_does_not_change_the_outcome() {
        let http = Arc::new(ScriptedHttp::always(|| {
            Ok(GraphqlResponse::from_data(json!({"feed": []})))
        }));
        let stage = ReportStage::new(Arc::new(FailingSink), terminal(http));
        let resp = stage.execute(&feed()).await.unwrap();
        assert_eq!(resp.data, Some(json!({"feed": []})));
    }

    #[tokio::test]
    async fn slow_sink_does_not_delay_operations() {
        let http = Arc::new(ScriptedHttp::always(|| {
            Ok(GraphqlResponse::from_data(json!({"feed": []})))
        }));
        let stage = ReportStage::new(Arc::new(SlowSink), terminal(http));
        for _ in 0..3 {
            tokio::time::timeout(Duration::from_millis(500), stage.execute(&feed()))
                .await
                .expect("operation waited on the sink")
                .unwrap();
        }
    }
}
