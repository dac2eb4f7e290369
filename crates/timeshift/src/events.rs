// Pipeline event stream: typed notifications emitted by the monitor,
// downloader, and cache as segments move through the system.

use parking_lot::RwLock;

use crate::error::ErrorCategory;

#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// The monitor saw a segment URL it had not seen before.
    SegmentDiscovered {
        sequence: u64,
        url: String,
        duration: f64,
    },
    /// The upstream media sequence jumped past the expected next value.
    Discontinuity {
        expected: u64,
        actual: u64,
        skipped: u64,
    },
    /// The monitor hit its consecutive-error cap and paused.
    MonitorPaused { consecutive_errors: u32 },
    DownloadSucceeded {
        url: String,
        sequence: Option<u64>,
        bytes: u64,
        duration_ms: u64,
    },
    /// A download failed terminally (retries exhausted or non-retryable).
    DownloadFailed {
        url: String,
        category: ErrorCategory,
        error: String,
    },
    SegmentAdded { sequence: u64, size: u64 },
    SegmentExpired { sequence: u64 },
}

type Observer = Box<dyn Fn(&PipelineEvent) + Send + Sync>;

/// Append-only observer registry.
///
/// Observers are registered at construction time and invoked inline under a
/// read lock; they must be fast and must not call back into the emitting
/// component.
#[derive(Default)]
pub struct EventBus {
    observers: RwLock<Vec<Observer>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, observer: F)
    where
        F: Fn(&PipelineEvent) + Send + Sync + 'static,
    {
        self.observers.write().push(Box::new(observer));
    }

    pub fn emit(&self, event: PipelineEvent) {
        for observer in self.observers.read().iter() {
            observer(&event);
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("observers", &self.observers.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn observers_see_every_event() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let counter = seen.clone();
        bus.subscribe(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        });
        let counter = seen.clone();
        bus.subscribe(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        });

        bus.emit(PipelineEvent::SegmentAdded {
            sequence: 1,
            size: 1024,
        });
        bus.emit(PipelineEvent::SegmentExpired { sequence: 1 });

        assert_eq!(seen.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn emit_with_no_observers_is_a_noop() {
        let bus = EventBus::new();
        bus.emit(PipelineEvent::MonitorPaused {
            consecutive_errors: 5,
        });
    }
}
