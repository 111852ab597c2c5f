use crate::cache::{CacheSnapshot, CacheStats, NormalizedStore};
use crate::client::builder::GraphqlClientBuilder;
use crate::client::subscription::SubscriptionStream;
use crate::config::ClientConfig;
use crate::pipeline::{OperationRequest, Pipeline};
use crate::types::{ExecutionContext, GraphqlResponse, Operation, OperationKind};
use crate::{Error, Result};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// The single entry point operations flow through.
///
/// Owns one normalized store and one composed resilience chain. Responses are
/// normalized into the store before they are returned, so a read issued after
/// `execute` resolves observes the new fields.
pub struct GraphqlClient {
    pub(crate) id: String,
    pub(crate) context: ExecutionContext,
    pub(crate) pipeline: Pipeline,
    pub(crate) store: Arc<NormalizedStore>,
}

/// Commit `response` to the store, turning reported errors into `Error::Api`.
fn commit(store: &NormalizedStore, kind: OperationKind, response: GraphqlResponse) -> Result<GraphqlResponse> {
    if response.has_errors() {
        return Err(Error::Api {
            errors: response.errors,
        });
    }
    if let Some(data) = &response.data {
        store.write_result(kind, data)?;
    }
    Ok(response)
}

impl GraphqlClient {
    pub fn builder(config: ClientConfig, context: ExecutionContext) -> GraphqlClientBuilder {
        GraphqlClientBuilder::new(config, context)
    }

    /// Unique per instance; distinguishes a reused singleton from a fresh client.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn context(&self) -> ExecutionContext {
        self.context
    }

    pub fn store(&self) -> &NormalizedStore {
        &self.store
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Run one operation and normalize its data into the cache.
    ///
    /// Server-reported errors are returned as [`Error::Api`] and nothing from
    /// that response is written.
    pub async fn execute(&self, operation: &Operation, variables: Value) -> Result<GraphqlResponse> {
        self.execute_with_cancel(operation, variables, CancellationToken::new())
            .await
    }

    /// Like [`execute`](Self::execute); cancelling `cancel` aborts pending
    /// retries and any open stream.
    pub async fn execute_with_cancel(
        &self,
        operation: &Operation,
        variables: Value,
        cancel: CancellationToken,
    ) -> Result<GraphqlResponse> {
        let request =
            OperationRequest::new(Arc::new(operation.clone()), variables).with_cancel(cancel);
        let started = Instant::now();
        let kind = operation.kind();
        let response = self
            .pipeline
            .execute_then(&request, |response| commit(&self.store, kind, response))
            .await?;
        info!(
            client_id = self.id.as_str(),
            request_id = request.id.as_str(),
            operation = operation.display_name(),
            kind = operation.kind().as_str(),
            duration_ms = started.elapsed().as_millis() as u64,
            "operation completed"
        );
        Ok(response)
    }

    /// Open a subscription. Every payload is normalized before it is yielded.
    pub async fn subscribe(&self, operation: &Operation, variables: Value) -> Result<SubscriptionStream> {
        let cancel = CancellationToken::new();
        let request = OperationRequest::new(Arc::new(operation.clone()), variables)
            .with_cancel(cancel.clone());
        let store = Arc::clone(&self.store);
        let kind = operation.kind();
        let guard = cancel.clone();
        let request_id = request.id.clone();
        let stream = self
            .pipeline
            .subscribe_then(&request, move |response| {
                if guard.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                let committed = commit(&store, kind, response);
                debug!(request_id = request_id.as_str(), ok = committed.is_ok(), "subscription payload");
                committed
            })
            .await?;
        Ok(SubscriptionStream::new(stream, cancel))
    }

    /// Cached root fields of `operation`, references expanded; `None` unless
    /// every unconditional root field is present. Fields behind a variable
    /// `@skip`/`@include` are returned when cached.
    pub fn read_query(&self, operation: &Operation) -> Option<Value> {
        let required: Vec<String> = operation.required_fields().cloned().collect();
        self.store
            .read_root(operation.kind(), &required, operation.conditional_fields())
            .map(Value::Object)
    }

    pub fn extract(&self) -> CacheSnapshot {
        self.store.extract()
    }

    /// Replace the cache contents. Fails without changes if the snapshot has
    /// dangling references.
    pub fn restore(&self, snapshot: CacheSnapshot) -> Result<()> {
        self.store.restore(snapshot)
    }

    /// Merge a snapshot into the live cache without discarding concurrent
    /// writes. Returns the resulting entry count.
    pub fn hydrate(&self, snapshot: &CacheSnapshot) -> Result<usize> {
        self.store.hydrate(snapshot)
    }

    pub fn stats(&self) -> CacheStats {
        self.store.stats()
    }
}

impl std::fmt::Debug for GraphqlClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphqlClient")
            .field("id", &self.id)
            .field("context", &self.context)
            .field("entries", &self.store.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::cache::{CacheSnapshot, TypePolicies};
    use crate::client::GraphqlClient;
    use crate::config::ClientConfig;
    use crate::pipeline::testing::{server_error, ScriptedHttp, ScriptedStream};
    use crate::pipeline::RetryPolicy;
    use crate::telemetry::{InMemoryDiagnosticSink, Outcome};
    use crate::types::{ExecutionContext, GraphqlError, GraphqlResponse, Operation};
    use crate::Error;
    use futures::StreamExt;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use url::Url;

    fn config() -> ClientConfig {
        ClientConfig::new(Url::parse("https://api.example.com").unwrap())
    }

    fn client_with(http: Arc<ScriptedHttp>) -> GraphqlClient {
        GraphqlClient::builder(config(), ExecutionContext::Rendering)
            .http_executor(http)
            .retry_policy(RetryPolicy::new(
                3,
                Duration::from_millis(1),
                Duration::from_millis(2),
            ))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn execute_normalizes_then_reads_back() {
        let http = Arc::new(ScriptedHttp::always(|| {
            Ok(GraphqlResponse::from_data(json!({
                "me": {"__typename": "User", "id": 1, "name": "Ada"}
            })))
        }));
        let client = client_with(http);
        let op = Operation::parse("query Me { me { id name } }").unwrap();
        client.execute(&op, Value::Null).await.unwrap();

        assert_eq!(
            client.read_query(&op),
            Some(json!({"me": {"__typename": "User", "id": 1, "name": "Ada"}}))
        );
        assert!(client.extract().contains("User:1"));
    }

    #[tokio::test]
    async fn skipped_fields_do_not_block_cache_reads() {
        let http = Arc::new(ScriptedHttp::always(|| {
            Ok(GraphqlResponse::from_data(json!({
                "me": {"__typename": "User", "id": 1}
            })))
        }));
        let client = client_with(http);
        let op = Operation::parse(
            "query Me($full: Boolean!) { me { id } bio @include(if: $full) { text } }",
        )
        .unwrap();
        client
            .execute(&op, json!({"full": false}))
            .await
            .unwrap();

        let cached = client.read_query(&op).unwrap();
        assert_eq!(cached["me"]["id"], 1);
        assert!(cached.get("bio").is_none());
    }

    #[tokio::test]
    async fn normalization_failures_reach_the_diagnostic_sink() {
        let http = Arc::new(ScriptedHttp::always(|| {
            Ok(GraphqlResponse::from_data(json!({
                "book": {"__typename": "Book", "title": "no isbn"}
            })))
        }));
        let sink = Arc::new(InMemoryDiagnosticSink::new(4));
        let client = GraphqlClient::builder(config(), ExecutionContext::Rendering)
            .http_executor(http)
            .type_policies(TypePolicies::new().with_key_fields("Book", ["isbn"]))
            .diagnostic_sink(sink.clone())
            .build()
            .unwrap();

        let op = Operation::parse("query Book { book { title } }").unwrap();
        let err = client.execute(&op, Value::Null).await.unwrap_err();
        assert!(matches!(err, Error::Normalization { .. }));

        let events = sink.wait_for(1, Duration::from_secs(2)).await;
        assert_eq!(events.len(), 1);
        match &events[0].outcome {
            Outcome::Failure { message, .. } => assert!(message.contains("isbn")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn api_errors_fail_without_writing() {
        let http = Arc::new(ScriptedHttp::always(|| {
            Ok(GraphqlResponse {
                data: Some(json!({"me": {"__typename": "User", "id": 1}})),
                errors: vec![GraphqlError::new("bad input")],
                extensions: None,
            })
        }));
        let client = client_with(http.clone());
        let op = Operation::parse("{ me { id } }").unwrap();
        let err = client.execute(&op, Value::Null).await.unwrap_err();
        assert!(matches!(err, Error::Api { .. }));
        assert!(client.extract().is_empty());
        assert_eq!(http.calls(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_leave_cache_untouched() {
        let http = Arc::new(ScriptedHttp::always(|| Err(server_error(500))));
        let client = client_with(http.clone());
        let err = client
            .execute(&Operation::parse("{ a }").unwrap(), Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(http.calls(), 3);
        assert_eq!(client.extract(), CacheSnapshot::new());
    }

    #[tokio::test]
    async fn subscription_payloads_are_normalized() {
        let http = Arc::new(ScriptedHttp::always(|| Ok(GraphqlResponse::default())));
        let stream = Arc::new(ScriptedStream::new(vec![
            GraphqlResponse::from_data(json!({"ticked": {"__typename": "Clock", "id": 1, "n": 1}})),
            GraphqlResponse::from_data(json!({"ticked": {"__typename": "Clock", "id": 1, "n": 2}})),
        ]));
        let client = GraphqlClient::builder(config(), ExecutionContext::Interactive)
            .http_executor(http.clone())
            .stream_executor(stream)
            .build()
            .unwrap();

        let op = Operation::parse("subscription { ticked { id n } }").unwrap();
        let mut sub = client.subscribe(&op, Value::Null).await.unwrap();
        let first = sub.next().await.unwrap().unwrap();
        assert_eq!(first.data.unwrap()["ticked"]["n"], 1);
        assert_eq!(client.store().get("Clock:1").unwrap()["n"], 1);

        sub.cancel();
        assert!(sub.next().await.is_none());
        assert_eq!(client.store().get("Clock:1").unwrap()["n"], 1);
        assert_eq!(http.calls(), 0);
    }
}
