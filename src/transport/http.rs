use super::{HttpExecutor, TransportError};
use crate::types::{GraphqlRequest, GraphqlResponse};
use crate::{Error, Result};
use async_trait::async_trait;
use std::env;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// GraphQL over HTTP POST.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpTransport {
    pub fn new(endpoint: Url, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(
                env::var("GRAPHLINK_HTTP_POOL_MAX_IDLE_PER_HOST")
                    .ok()
                    .and_then(|s| s.parse::<usize>().ok())
                    .unwrap_or(32),
            )
            .pool_idle_timeout(Some(Duration::from_secs(
                env::var("GRAPHLINK_HTTP_POOL_IDLE_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(90),
            )))
            .build()
            .map_err(|e| Error::Transport(TransportError::Http(e)))?;

        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl HttpExecutor for HttpTransport {
    async fn execute(&self, request: &GraphqlRequest) -> Result<GraphqlResponse> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .header("accept", "application/graphql-response+json, application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| Error::Transport(TransportError::Http(e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            debug!(
                http_status = status.as_u16(),
                endpoint = self.endpoint.as_str(),
                "graphql request rejected"
            );
            return Err(Error::Transport(TransportError::Status {
                status: status.as_u16(),
                body,
            }));
        }

        response
            .json::<GraphqlResponse>()
            .await
            .map_err(|e| Error::Transport(TransportError::Http(e)))
    }
}
