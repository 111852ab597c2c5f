use crate::cache::{CacheSnapshot, NormalizedStore, TypePolicies};
use crate::client::core::GraphqlClient;
use crate::config::ClientConfig;
use crate::pipeline::{Pipeline, RetryPolicy, TerminatingLink};
use crate::telemetry::{DiagnosticSink, HttpDiagnosticSink};
use crate::transport::{HttpExecutor, HttpTransport, StreamExecutor, TransportSelector, WsTransport};
use crate::types::ExecutionContext;
use crate::Result;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Builder for [`GraphqlClient`].
///
/// Endpoints, retry policy and the diagnostic sink default to what the
/// [`ClientConfig`] describes; each can be overridden.
pub struct GraphqlClientBuilder {
    config: ClientConfig,
    context: ExecutionContext,
    policies: TypePolicies,
    retry: Option<RetryPolicy>,
    http: Option<Arc<dyn HttpExecutor>>,
    stream: Option<Arc<dyn StreamExecutor>>,
    sink: Option<Arc<dyn DiagnosticSink>>,
    initial_state: Option<CacheSnapshot>,
}

impl GraphqlClientBuilder {
    pub fn new(config: ClientConfig, context: ExecutionContext) -> Self {
        Self {
            config,
            context,
            policies: TypePolicies::default(),
            retry: None,
            http: None,
            stream: None,
            sink: None,
            initial_state: None,
        }
    }

    /// Identity rules for the cache.
    pub fn type_policies(mut self, policies: TypePolicies) -> Self {
        self.policies = policies;
        self
    }

    /// Override the retry policy derived from `config.retry`.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Replace the HTTP channel (primarily for testing).
    pub fn http_executor(mut self, executor: Arc<dyn HttpExecutor>) -> Self {
        self.http = Some(executor);
        self
    }

    /// Replace the WebSocket channel. Ignored in a rendering context. The
    /// default channel reconnects dropped sockets with the retry policy.
    pub fn stream_executor(mut self, executor: Arc<dyn StreamExecutor>) -> Self {
        self.stream = Some(executor);
        self
    }

    /// Inject a diagnostic sink. Without one, events go to
    /// `config.observability_endpoint` when set and are dropped otherwise.
    pub fn diagnostic_sink(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Seed the cache before the client serves any operation.
    pub fn initial_state(mut self, snapshot: CacheSnapshot) -> Self {
        self.initial_state = Some(snapshot);
        self
    }

    /// Build the client. Endpoint schemes are validated here.
    pub fn build(self) -> Result<GraphqlClient> {
        let selector = TransportSelector::new(
            self.context,
            self.config.api_url(self.context),
            &self.config.public_api_url,
        )?;

        let retry = self
            .retry
            .unwrap_or_else(|| RetryPolicy::from_settings(&self.config.retry));

        let http: Arc<dyn HttpExecutor> = match self.http {
            Some(http) => http,
            None => Arc::new(HttpTransport::new(
                selector.http_endpoint().clone(),
                self.config.http_timeout(),
            )?),
        };
        let stream: Option<Arc<dyn StreamExecutor>> = match selector.stream_endpoint() {
            None => None,
            Some(endpoint) => Some(
                self.stream.unwrap_or_else(|| {
                    Arc::new(WsTransport::new(endpoint.clone()).with_reconnect(retry.clone()))
                }),
            ),
        };
        let sink: Arc<dyn DiagnosticSink> = match (self.sink, &self.config.observability_endpoint) {
            (Some(sink), _) => sink,
            (None, Some(endpoint)) => Arc::new(HttpDiagnosticSink::new(endpoint.clone())?),
            (None, None) => crate::telemetry::noop_sink(),
        };

        let store = NormalizedStore::with_policies(self.policies);
        if let Some(snapshot) = self.initial_state {
            store.restore(snapshot)?;
        }

        let id = Uuid::new_v4().to_string();
        info!(
            client_id = id.as_str(),
            context = self.context.as_str(),
            endpoint = selector.http_endpoint().as_str(),
            stream_endpoint = selector.stream_endpoint().map(|u| u.as_str()).unwrap_or("-"),
            max_attempts = retry.max_attempts,
            "graphql client created"
        );

        Ok(GraphqlClient {
            id,
            context: self.context,
            pipeline: Pipeline::new(TerminatingLink::new(selector, http, stream), retry, sink),
            store: Arc::new(store),
        })
    }
}
