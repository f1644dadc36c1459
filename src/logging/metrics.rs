use once_cell::sync::OnceCell;

/// Metrics interface allowing pluggable sinks (default: no-op).
pub trait RecorderMetrics: Send + Sync {
    /// A capture record was dropped by an absorbed error.
    fn record_dropped_record(&self, _reason: &'static str) {}
    /// The patcher skipped a slot or an image.
    fn record_patch_skip(&self, _reason: &'static str) {}
    /// Capture detached per policy or due to an unrecoverable failure.
    fn record_detach(&self, _reason: &'static str) {}
    /// A panic was caught at the FFI boundary.
    fn record_panic(&self, _label: &'static str) {}
}

struct NoopMetrics;

impl RecorderMetrics for NoopMetrics {}

static METRICS_SINK: OnceCell<Box<dyn RecorderMetrics>> = OnceCell::new();

fn metrics_sink() -> &'static dyn RecorderMetrics {
    METRICS_SINK
        .get_or_init(|| Box::new(NoopMetrics) as Box<dyn RecorderMetrics>)
        .as_ref()
}

/// Install a custom metrics sink. Intended for embedding or tests.
#[cfg_attr(not(test), allow(dead_code))]
pub fn install_metrics(metrics: Box<dyn RecorderMetrics>) -> Result<(), Box<dyn RecorderMetrics>> {
    METRICS_SINK.set(metrics)
}

pub fn record_dropped_record(reason: &'static str) {
    metrics_sink().record_dropped_record(reason);
}

pub fn record_patch_skip(reason: &'static str) {
    metrics_sink().record_patch_skip(reason);
}

pub fn record_detach(reason: &'static str) {
    metrics_sink().record_detach(reason);
}

pub fn record_panic(label: &'static str) {
    metrics_sink().record_panic(label);
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use once_cell::sync::OnceCell;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    pub struct CapturingMetrics {
        events: Arc<Mutex<Vec<MetricEvent>>>,
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum MetricEvent {
        Dropped(&'static str),
        PatchSkip(&'static str),
        Detach(&'static str),
        Panic(&'static str),
    }

    impl CapturingMetrics {
        pub fn take(&self) -> Vec<MetricEvent> {
            let mut guard = self.events.lock().expect("metrics events lock");
            let events = guard.clone();
            guard.clear();
            events
        }

        fn push(&self, event: MetricEvent) {
            self.events
                .lock()
                .expect("metrics events lock")
                .push(event);
        }
    }

    impl RecorderMetrics for CapturingMetrics {
        fn record_dropped_record(&self, reason: &'static str) {
            self.push(MetricEvent::Dropped(reason));
        }

        fn record_patch_skip(&self, reason: &'static str) {
            self.push(MetricEvent::PatchSkip(reason));
        }

        fn record_detach(&self, reason: &'static str) {
            self.push(MetricEvent::Detach(reason));
        }

        fn record_panic(&self, label: &'static str) {
            self.push(MetricEvent::Panic(label));
        }
    }

    static CAPTURING: OnceCell<CapturingMetrics> = OnceCell::new();

    pub fn install() -> &'static CapturingMetrics {
        CAPTURING.get_or_init(|| {
            let metrics = CapturingMetrics::default();
            let _ = super::install_metrics(Box::new(metrics.clone()));
            metrics
        })
    }
}
