//! Client configuration.
//!
//! Endpoints and policy knobs come from the environment (`ClientConfig::from_env`)
//! or from a YAML document (`ClientConfig::from_yaml_str`).

use crate::types::ExecutionContext;
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Retry knobs for the resilience chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Total attempts per operation, including the first one.
    pub max_attempts: u32,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
    /// Whether mutation-kind operations are retried like any other kind.
    pub retry_mutations: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            min_delay_ms: 300,
            max_delay_ms: 30_000,
            jitter: true,
            retry_mutations: true,
        }
    }
}

/// Environment-provided endpoints plus policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Request/response endpoint reachable only from a server-side context.
    #[serde(default)]
    pub internal_api_url: Option<Url>,
    /// Endpoint reachable from a browser.
    pub public_api_url: Url,
    /// Where diagnostic reports are sent.
    #[serde(default)]
    pub observability_endpoint: Option<Url>,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
}

fn default_http_timeout_secs() -> u64 {
    30
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw.trim().parse::<T>().map(Some).map_err(|_| {
            Error::configuration_with_context(
                format!("invalid value for {}", name),
                ErrorContext::new()
                    .with_field_path(name)
                    .with_details(raw)
                    .with_source("config"),
            )
        }),
        _ => Ok(None),
    }
}

fn parse_url(name: &str, raw: &str) -> Result<Url> {
    Url::parse(raw.trim()).map_err(|e| {
        Error::configuration_with_context(
            format!("failed to parse {}", name),
            ErrorContext::new()
                .with_field_path(name)
                .with_details(e.to_string())
                .with_source("config"),
        )
    })
}

impl ClientConfig {
    pub fn new(public_api_url: Url) -> Self {
        Self {
            internal_api_url: None,
            public_api_url,
            observability_endpoint: None,
            retry: RetrySettings::default(),
            http_timeout_secs: default_http_timeout_secs(),
        }
    }

    pub fn with_internal_api_url(mut self, url: Url) -> Self {
        self.internal_api_url = Some(url);
        self
    }

    pub fn with_observability_endpoint(mut self, url: Url) -> Self {
        self.observability_endpoint = Some(url);
        self
    }

    pub fn with_retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    /// Load configuration from `GRAPHLINK_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let public = env::var("GRAPHLINK_PUBLIC_API_URL").map_err(|_| {
            Error::configuration_with_context(
                "missing environment variable GRAPHLINK_PUBLIC_API_URL",
                ErrorContext::new()
                    .with_field_path("GRAPHLINK_PUBLIC_API_URL")
                    .with_source("config"),
            )
        })?;
        let mut config = Self::new(parse_url("GRAPHLINK_PUBLIC_API_URL", &public)?);

        if let Ok(raw) = env::var("GRAPHLINK_INTERNAL_API_URL") {
            if !raw.trim().is_empty() {
                config.internal_api_url = Some(parse_url("GRAPHLINK_INTERNAL_API_URL", &raw)?);
            }
        }
        if let Ok(raw) = env::var("GRAPHLINK_OBSERVABILITY_ENDPOINT") {
            if !raw.trim().is_empty() {
                config.observability_endpoint =
                    Some(parse_url("GRAPHLINK_OBSERVABILITY_ENDPOINT", &raw)?);
            }
        }
        if let Some(secs) = env_parse::<u64>("GRAPHLINK_HTTP_TIMEOUT_SECS")? {
            config.http_timeout_secs = secs.max(1);
        }
        if let Some(n) = env_parse::<u32>("GRAPHLINK_RETRY_MAX_ATTEMPTS")? {
            config.retry.max_attempts = n.max(1);
        }
        if let Some(ms) = env_parse::<u64>("GRAPHLINK_RETRY_MIN_DELAY_MS")? {
            config.retry.min_delay_ms = ms;
        }
        if let Some(ms) = env_parse::<u64>("GRAPHLINK_RETRY_MAX_DELAY_MS")? {
            config.retry.max_delay_ms = ms;
        }
        if let Some(j) = env_parse::<bool>("GRAPHLINK_RETRY_JITTER")? {
            config.retry.jitter = j;
        }
        if let Some(m) = env_parse::<bool>("GRAPHLINK_RETRY_MUTATIONS")? {
            config.retry.retry_mutations = m;
        }
        Ok(config)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).map_err(|e| {
            Error::configuration_with_context(
                "failed to parse client configuration",
                ErrorContext::new()
                    .with_details(e.to_string())
                    .with_source("config"),
            )
        })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration_with_context(
                "failed to read client configuration",
                ErrorContext::new()
                    .with_field_path(path.display().to_string())
                    .with_details(e.to_string())
                    .with_source("config"),
            )
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Base URL used for request/response traffic in `context`.
    pub fn api_url(&self, context: ExecutionContext) -> &Url {
        match context {
            ExecutionContext::Rendering => self
                .internal_api_url
                .as_ref()
                .unwrap_or(&self.public_api_url),
            ExecutionContext::Interactive => &self.public_api_url,
        }
    }
}

/// Append the `/graphql` segment to a base URL, dropping any trailing slash.
pub fn graphql_endpoint(base: &Url) -> Url {
    let mut endpoint = base.clone();
    let path = base.path().trim_end_matches('/');
    endpoint.set_path(&format!("{}/graphql", path));
    endpoint
}
