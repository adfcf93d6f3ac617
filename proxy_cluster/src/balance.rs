use hashbrown::HashMap;
use parking_lot::Mutex;

/// Per tag key round-robin counters choosing the first backend a query is sent to
#[derive(Debug, Default)]
pub(crate) struct BalanceCounter {
    counters: Mutex<HashMap<String, usize>>,
}

impl BalanceCounter {
    /// The current count for `key`, incrementing it for the next caller
    pub(crate) fn next(&self, key: &str) -> usize {
        let mut counters = self.counters.lock();
        match counters.get_mut(key) {
            Some(count) => {
                let current = *count;
                *count = current.wrapping_add(1);
                current
            }
            None => {
                counters.insert(key.to_string(), 1);
                0
            }
        }
    }
}
