use std::hash::{Hash, Hasher};

use siphasher::sip::SipHasher13;

/// A static siphash key so every proxy and the rebalancer place a tag key on the same hosts.
///
/// Generated with: xxd -i -l 16 /dev/urandom
const SEED_KEY: [u8; 16] = [
    0x6d, 0x83, 0x93, 0x52, 0xa3, 0x7c, 0xe6, 0x02, 0xac, 0x01, 0x11, 0x94, 0x79, 0x0c, 0x64, 0x42,
];

/// A [`JumpHash`] maps keys consistently onto an ordered set of buckets with near perfect
/// distribution.
///
/// Two instances built from the same buckets, in the same order, map every key to the same
/// bucket. Adding one bucket to `N` remaps about `1/N` of the keys.
///
/// Uses Google's [jump hash] internally.
///
/// [jump hash]: https://arxiv.org/ftp/arxiv/papers/1406/1406.2294.pdf
#[derive(Debug, Clone)]
pub struct JumpHash<T> {
    hasher: SipHasher13,
    buckets: Vec<T>,
}

impl<T> JumpHash<T> {
    /// # Correctness
    ///
    /// Changing the number or the order of `buckets` changes the mapping.
    pub fn new(buckets: impl IntoIterator<Item = T>) -> Self {
        Self {
            hasher: SipHasher13::new_with_key(&SEED_KEY),
            buckets: buckets.into_iter().collect(),
        }
    }

    pub fn buckets(&self) -> &[T] {
        &self.buckets
    }

    fn index<H: Hash>(&self, key: H) -> Option<usize> {
        if self.buckets.is_empty() {
            return None;
        }

        let mut state = self.hasher;
        key.hash(&mut state);
        let mut key = state.finish();

        let mut b = -1;
        let mut j = 0;
        while j < self.buckets.len() as i64 {
            b = j;
            key = key.wrapping_mul(2862933555777941757).wrapping_add(1);
            j = ((b.wrapping_add(1) as f64) * (((1u64 << 31) as f64) / (((key >> 33) + 1) as f64)))
                as i64
        }
        usize::try_from(b).ok()
    }

    /// Consistently hash `key` to a bucket, `None` when there are no buckets.
    pub fn hash<H: Hash>(&self, key: H) -> Option<&T> {
        self.index(key).and_then(|i| self.buckets.get(i))
    }

    /// `replicas` distinct buckets for `key`: the bucket `key` hashes to, followed by the ones
    /// after it in order, wrapping around.
    ///
    /// Returns every bucket when there are fewer than `replicas`.
    pub fn replicas<H: Hash>(&self, key: H, replicas: usize) -> Vec<&T> {
        let Some(first) = self.index(key) else {
            return vec![];
        };
        let len = self.buckets.len();
        (0..replicas.min(len))
            .filter_map(|offset| self.buckets.get((first + offset) % len))
            .collect()
    }
}
