use super::{DiagnosticEvent, DiagnosticSink};
use crate::transport::TransportError;
use crate::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;
use url::Url;

/// Sends each event as a JSON POST to the observability endpoint.
pub struct HttpDiagnosticSink {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpDiagnosticSink {
    pub fn new(endpoint: Url) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| Error::Transport(TransportError::Http(e)))?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl DiagnosticSink for HttpDiagnosticSink {
    async fn report(&self, event: DiagnosticEvent) -> Result<()> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&event)
            .send()
            .await
            .map_err(|e| Error::Transport(TransportError::Http(e)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Transport(TransportError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            }));
        }
        Ok(())
    }
}
