//! Diagnostic reporting.
//!
//! The report stage of the resilience chain emits one [`DiagnosticEvent`] per
//! operation outcome to a [`DiagnosticSink`]. Sinks are side-effect only: a
//! failing sink never changes the outcome of the operation it describes.
//!
//! | Sink | Description |
//! |------|-------------|
//! | [`NoopDiagnosticSink`] | Default; drops everything |
//! | [`InMemoryDiagnosticSink`] | Bounded buffer, used by tests |
//! | [`HttpDiagnosticSink`] | POSTs events to the observability endpoint |
//!
//! Events reach the sink through a [`DiagnosticDispatcher`], which queues them
//! for a background task so a slow collaborator never delays an operation.

mod dispatch;
mod http;

pub use dispatch::DiagnosticDispatcher;
pub use http::HttpDiagnosticSink;

use crate::types::{Operation, OperationKind};
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    /// The operation reached the server; `api_errors` counts errors it reported.
    Success { api_errors: usize },
    Failure { message: String, transient: bool },
}

/// Metadata about one finished operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticEvent {
    pub request_id: String,
    pub operation_name: Option<String>,
    pub kind: OperationKind,
    pub root_fields: Vec<String>,
    pub duration_ms: u64,
    pub outcome: Outcome,
    pub timestamp: f64,
}

impl DiagnosticEvent {
    pub fn new(
        request_id: impl Into<String>,
        operation: &Operation,
        duration_ms: u64,
        outcome: Outcome,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            operation_name: operation.name().map(str::to_string),
            kind: operation.kind(),
            root_fields: operation.root_fields().to_vec(),
            duration_ms,
            outcome,
            timestamp: timestamp(),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, Outcome::Failure { .. })
    }
}

#[async_trait]
pub trait DiagnosticSink: Send + Sync {
    async fn report(&self, event: DiagnosticEvent) -> Result<()>;
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

pub struct NoopDiagnosticSink;

#[async_trait]
impl DiagnosticSink for NoopDiagnosticSink {
    async fn report(&self, _: DiagnosticEvent) -> Result<()> {
        Ok(())
    }
}

/// Returns a no-op diagnostic sink.
pub fn noop_sink() -> Arc<dyn DiagnosticSink> {
    Arc::new(NoopDiagnosticSink)
}

/// In-memory sink for testing.
pub struct InMemoryDiagnosticSink {
    events: RwLock<Vec<DiagnosticEvent>>,
    max_events: usize,
}

impl InMemoryDiagnosticSink {
    pub fn new(max: usize) -> Self {
        Self {
            events: RwLock::new(Vec::new()),
            max_events: max.max(1),
        }
    }

    pub fn events(&self) -> Vec<DiagnosticEvent> {
        self.events.read().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.events.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.write() {
            events.clear();
        }
    }

    /// Wait until at least `count` events are buffered or `timeout` elapses,
    /// then return what is buffered.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> Vec<DiagnosticEvent> {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.len() < count && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.events()
    }
}

#[async_trait]
impl DiagnosticSink for InMemoryDiagnosticSink {
    async fn report(&self, event: DiagnosticEvent) -> Result<()> {
        let mut events = self.events.write().map_err(|_| {
            Error::runtime_with_context(
                "diagnostic buffer poisoned",
                ErrorContext::new().with_source("in_memory_sink"),
            )
        })?;
        events.push(event);
        if events.len() > self.max_events {
            events.remove(0);
        }
        Ok(())
    }
}
