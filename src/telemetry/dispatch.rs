use super::{DiagnosticEvent, DiagnosticSink};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

const DEFAULT_CAPACITY: usize = 256;

/// Hands events to a sink from a background task.
///
/// Events are queued on a bounded channel; when the queue is full the event
/// is dropped with a warning. The drain task is started on first use on the
/// current tokio runtime and restarted if that runtime has gone away.
pub struct DiagnosticDispatcher {
    sink: Arc<dyn DiagnosticSink>,
    capacity: usize,
    queue: Mutex<Option<mpsc::Sender<DiagnosticEvent>>>,
}

impl DiagnosticDispatcher {
    pub fn new(sink: Arc<dyn DiagnosticSink>) -> Self {
        Self::with_capacity(sink, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(sink: Arc<dyn DiagnosticSink>, capacity: usize) -> Self {
        Self {
            sink,
            capacity: capacity.max(1),
            queue: Mutex::new(None),
        }
    }

    pub fn sink(&self) -> &Arc<dyn DiagnosticSink> {
        &self.sink
    }

    /// Queue `event` without waiting for the sink.
    pub fn dispatch(&self, event: DiagnosticEvent) {
        let Some(tx) = self.sender() else {
            warn!(
                request_id = event.request_id.as_str(),
                "no async runtime; diagnostic event dropped"
            );
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(
                    request_id = event.request_id.as_str(),
                    capacity = self.capacity,
                    "diagnostic queue full; event dropped"
                );
            }
            Err(TrySendError::Closed(event)) => {
                warn!(
                    request_id = event.request_id.as_str(),
                    "diagnostic queue closed; event dropped"
                );
            }
        }
    }

    fn sender(&self) -> Option<mpsc::Sender<DiagnosticEvent>> {
        let mut slot = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = slot.as_ref().filter(|tx| !tx.is_closed()) {
            return Some(tx.clone());
        }
        let handle = tokio::runtime::Handle::try_current().ok()?;
        let (tx, rx) = mpsc::channel(self.capacity);
        handle.spawn(drain(Arc::clone(&self.sink), rx));
        *slot = Some(tx.clone());
        Some(tx)
    }
}

async fn drain(sink: Arc<dyn DiagnosticSink>, mut rx: mpsc::Receiver<DiagnosticEvent>) {
    while let Some(event) = rx.recv().await {
        let request_id = event.request_id.clone();
        if let Err(e) = sink.report(event).await {
            warn!(
                request_id = request_id.as_str(),
                error = %e,
                "diagnostic sink rejected event"
            );
        }
    }
    if let Err(e) = sink.close().await {
        warn!(error = %e, "diagnostic sink failed to close");
    }
    debug!("diagnostic dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{InMemoryDiagnosticSink, Outcome};
    use crate::types::Operation;
    use crate::Result;
    use async_trait::async_trait;
    use std::time::{Duration, Instant};

    struct SlowSink {
        delay: Duration,
        inner: InMemoryDiagnosticSink,
    }

    #[async_trait]
    impl DiagnosticSink for SlowSink {
        async fn report(&self, event: DiagnosticEvent) -> Result<()> {
            tokio::time::sleep(self.delay).await;
            self.inner.report(event).await
        }
    }

    fn event(id: &str) -> DiagnosticEvent {
        let op = Operation::parse("query Q { a }").unwrap();
        DiagnosticEvent::new(id, &op, 1, Outcome::Success { api_errors: 0 })
    }

    #[tokio::test]
    async fn dispatch_does_not_wait_for_the_sink() {
        let sink = Arc::new(SlowSink {
            delay: Duration::from_millis(300),
            inner: InMemoryDiagnosticSink::new(8),
        });
        let dispatcher = DiagnosticDispatcher::new(sink.clone());

        let started = Instant::now();
        dispatcher.dispatch(event("a"));
        dispatcher.dispatch(event("b"));
        assert!(started.elapsed() < Duration::from_millis(100));

        let events = sink.inner.wait_for(2, Duration::from_secs(5)).await;
        let ids: Vec<_> = events.iter().map(|e| e.request_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let sink = Arc::new(SlowSink {
            delay: Duration::from_millis(200),
            inner: InMemoryDiagnosticSink::new(16),
        });
        let dispatcher = DiagnosticDispatcher::with_capacity(sink.clone(), 1);
        for i in 0..10 {
            dispatcher.dispatch(event(&format!("e{}", i)));
        }
        tokio::time::sleep(Duration::from_millis(600)).await;
        let delivered = sink.inner.len();
        assert!((1..10).contains(&delivered), "delivered {}", delivered);
    }

    #[test]
    fn without_a_runtime_events_are_dropped() {
        let sink = Arc::new(InMemoryDiagnosticSink::new(4));
        let dispatcher = DiagnosticDispatcher::new(sink.clone());
        dispatcher.dispatch(event("lost"));
        assert!(sink.is_empty());
    }
}
