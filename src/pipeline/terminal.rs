use super::{Link, OperationRequest};
use crate::transport::{Channel, HttpExecutor, StreamExecutor, TransportError, TransportSelector};
use crate::types::GraphqlResponse;
use crate::{BoxStream, Error, ErrorContext, Result};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use tracing::trace;

/// Last stage of the chain: hands the request to the channel the selector
/// picks for it.
pub struct TerminatingLink {
    selector: TransportSelector,
    http: Arc<dyn HttpExecutor>,
    stream: Option<Arc<dyn StreamExecutor>>,
}

impl TerminatingLink {
    pub fn new(
        selector: TransportSelector,
        http: Arc<dyn HttpExecutor>,
        stream: Option<Arc<dyn StreamExecutor>>,
    ) -> Self {
        Self {
            selector,
            http,
            stream,
        }
    }

    pub fn selector(&self) -> &TransportSelector {
        &self.selector
    }

    fn stream_executor(&self) -> Result<&Arc<dyn StreamExecutor>> {
        self.stream.as_ref().ok_or_else(|| {
            Error::configuration_with_context(
                "no stream channel configured",
                ErrorContext::new()
                    .with_details(format!("context: {}", self.selector.context()))
                    .with_source("terminating_link"),
            )
        })
    }
}

#[async_trait]
impl Link for TerminatingLink {
    /// Over the stream channel this resolves with the first payload and then
    /// closes the stream.
    async fn execute(&self, request: &OperationRequest) -> Result<GraphqlResponse> {
        let channel = self.selector.select(&request.operation);
        trace!(request_id = request.id.as_str(), channel = channel.as_str(), "dispatch");
        match channel {
            Channel::RequestResponse => self.http.execute(&request.body).await,
            Channel::Stream => {
                let cancel = request.cancel.child_token();
                let mut stream = self
                    .stream_executor()?
                    .subscribe(&request.body, cancel.clone())
                    .await?;
                let first = stream.next().await;
                cancel.cancel();
                match first {
                    Some(item) => item,
                    None if request.cancel.is_cancelled() => Err(Error::Cancelled),
                    None => Err(Error::Transport(TransportError::Closed)),
                }
            }
        }
    }

    /// Over the request/response channel the stream carries exactly one item.
    async fn subscribe(
        &self,
        request: &OperationRequest,
    ) -> Result<BoxStream<'static, GraphqlResponse>> {
        let channel = self.selector.select(&request.operation);
        trace!(request_id = request.id.as_str(), channel = channel.as_str(), "dispatch stream");
        match channel {
            Channel::Stream => {
                self.stream_executor()?
                    .subscribe(&request.body, request.cancel.clone())
                    .await
            }
            Channel::RequestResponse => {
                let response = self.http.execute(&request.body).await?;
                Ok(futures::stream::once(async move { Ok(response) }).boxed())
            }
        }
    }

    fn stages(&self) -> Vec<&'static str> {
        vec!["terminal"]
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{ScriptedHttp, ScriptedStream};
    use super::*;
    use crate::types::{ExecutionContext, Operation};
    use serde_json::{json, Value};
    use std::sync::atomic::Ordering;
    use url::Url;

    fn selector(context: ExecutionContext) -> TransportSelector {
        let base = Url::parse("https://api.example.com").unwrap();
        TransportSelector::new(context, &base, &base).unwrap()
    }

    fn request(doc: &str) -> OperationRequest {
        OperationRequest::new(Arc::new(Operation::parse(doc).unwrap()), Value::Null)
    }

    #[tokio::test]
    async fn interactive_subscription_uses_the_stream() {
        let http = Arc::new(ScriptedHttp::always(|| Ok(GraphqlResponse::default())));
        let stream = Arc::new(ScriptedStream::new(vec![
            GraphqlResponse::from_data(json!({"tick": 1})),
            GraphqlResponse::from_data(json!({"tick": 2})),
        ]));
        let link = TerminatingLink::new(
            selector(ExecutionContext::Interactive),
            http.clone(),
            Some(stream.clone()),
        );

        let items: Vec<_> = link
            .subscribe(&request("subscription { tick }"))
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(items.len(), 2);
        assert_eq!(http.calls(), 0);

        let first = link.execute(&request("subscription { tick }")).await.unwrap();
        assert_eq!(first.data, Some(json!({"tick": 1})));
        assert_eq!(stream.opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rendering_subscription_is_a_single_http_exchange() {
        let http = Arc::new(ScriptedHttp::always(|| {
            Ok(GraphqlResponse::from_data(json!({"tick": 0})))
        }));
        let link = TerminatingLink::new(selector(ExecutionContext::Rendering), http.clone(), None);
        let items: Vec<_> = link
            .subscribe(&request("subscription { tick }"))
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(items.len(), 1);
        assert_eq!(http.calls(), 1);
    }

    #[tokio::test]
    async fn missing_stream_executor_is_a_configuration_error() {
        let http = Arc::new(ScriptedHttp::always(|| Ok(GraphqlResponse::default())));
        let link = TerminatingLink::new(selector(ExecutionContext::Interactive), http, None);
        let err = link.execute(&request("subscription { tick }")).await.unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }
}
