use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use crate::{MetricKind, MetricObserver, Observation};

/// The last value set, e.g. availability as 0 or 1 or a unix timestamp
///
/// Every recorder of the same attribute set shares the value, so concurrent setters race.
#[derive(Debug, Clone, Default)]
pub struct U64Gauge {
    state: Arc<AtomicU64>,
}

impl U64Gauge {
    pub fn set(&self, value: u64) {
        self.state.store(value, Ordering::Relaxed);
    }
}

impl MetricObserver for U64Gauge {
    type Recorder = Self;

    fn kind() -> MetricKind {
        MetricKind::U64Gauge
    }

    fn recorder(&self) -> Self::Recorder {
        self.clone()
    }

    fn observe(&self) -> Observation {
        Observation::U64Gauge(self.state.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gauge() {
        let gauge = U64Gauge::default();
        assert_eq!(gauge.observe(), Observation::U64Gauge(0));

        gauge.set(1);
        let recorder = gauge.recorder();
        recorder.set(0);
        drop(recorder);

        assert_eq!(gauge.observe(), Observation::U64Gauge(0));
    }
}
