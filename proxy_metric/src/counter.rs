use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use crate::{MetricKind, MetricObserver, Observation};

/// A monotonic counter
#[derive(Debug, Clone, Default)]
pub struct U64Counter {
    state: Arc<AtomicU64>,
}

impl U64Counter {
    pub fn inc(&self, count: u64) {
        self.state.fetch_add(count, Ordering::Relaxed);
    }

    pub fn fetch(&self) -> u64 {
        self.state.load(Ordering::Relaxed)
    }
}

impl MetricObserver for U64Counter {
    type Recorder = Self;

    fn kind() -> MetricKind {
        MetricKind::U64Counter
    }

    fn recorder(&self) -> Self::Recorder {
        self.clone()
    }

    fn observe(&self) -> Observation {
        Observation::U64Counter(self.fetch())
    }
}
