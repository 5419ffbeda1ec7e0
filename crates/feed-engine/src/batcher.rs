use std::sync::Arc;

use tracing::{debug, warn};

use feed_core::backend::FeedBackend;
use feed_core::errors::BackendError;
use feed_core::event::FeedEvent;
use feed_telemetry::MetricsRecorder;

/// FIFO queue of telemetry events with size-triggered delivery.
///
/// Delivery is at-least-once: a batch leaves the queue only after the
/// collector accepted it. A failed flush keeps every event in place, so the
/// next flush retries the same events ahead of anything recorded since.
pub struct EventBatcher {
    backend: Arc<dyn FeedBackend>,
    queue: Vec<FeedEvent>,
    threshold: usize,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl EventBatcher {
    pub fn new(backend: Arc<dyn FeedBackend>, threshold: usize) -> Self {
        Self {
            backend,
            queue: Vec::new(),
            threshold: threshold.max(1),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Option<Arc<MetricsRecorder>>) -> Self {
        self.set_metrics(metrics);
        self
    }

    pub fn set_metrics(&mut self, metrics: Option<Arc<MetricsRecorder>>) {
        self.metrics = metrics;
    }

    pub fn pending(&self) -> &[FeedEvent] {
        &self.queue
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Queue `event`; flush once the queue reaches the threshold.
    pub async fn record(&mut self, event: FeedEvent) {
        debug!(
            event_type = event.event_type.as_str(),
            ad_id = %event.ad_id,
            position = event.position_index,
            "event recorded"
        );
        self.queue.push(event);
        self.report_pending();
        if self.queue.len() >= self.threshold {
            // Failure is already logged and the queue kept; the next
            // record or explicit flush retries.
            let _ = self.flush().await;
        }
    }

    /// Send the whole queue as one batch. Returns how many events were delivered.
    pub async fn flush(&mut self) -> Result<usize, BackendError> {
        if self.queue.is_empty() {
            return Ok(0);
        }
        let count = self.queue.len();
        match self.backend.send_events(&self.queue).await {
            Ok(()) => {
                self.queue.drain(..count);
                self.report_pending();
                debug!(count, "events flushed");
                if let Some(m) = &self.metrics {
                    m.counter_inc("feed.events.flushed", &[], count as u64);
                }
                Ok(count)
            }
            Err(e) => {
                warn!(count, error = %e, kind = e.error_kind(), "event flush failed, keeping queue");
                if let Some(m) = &self.metrics {
                    m.counter_inc("feed.events.flush_failed", &[("kind", e.error_kind())], 1);
                }
                Err(e)
            }
        }
    }

    /// Put previously undelivered events back at the head of the queue.
    pub fn restore(&mut self, mut events: Vec<FeedEvent>) {
        if events.is_empty() {
            return;
        }
        events.append(&mut self.queue);
        self.queue = events;
        self.report_pending();
    }

    /// Hand the queue over, leaving it empty.
    pub fn take_pending(&mut self) -> Vec<FeedEvent> {
        let taken = std::mem::take(&mut self.queue);
        self.report_pending();
        taken
    }

    fn report_pending(&self) {
        if let Some(m) = &self.metrics {
            m.gauge_set("feed.events.pending", &[], self.queue.len() as f64);
        }
    }
}
