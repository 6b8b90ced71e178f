//! Deterministic object sampling and the discard histogram.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use regex::Regex;
use serde::{Deserialize, Serialize};
use twox_hash::XxHash64;

use super::concurrent::ConcurrentMap;
use crate::config::DiscardConfig;
use crate::error::Result;

/// Decides which objects are left out of the index.
///
/// Each object address is hashed with the seed into a point `u` of `[0, 1)`. An object of
/// a matching class is dropped when `u` falls into the slice `[offset, offset + ratio)`
/// (wrapping at 1). The decision depends only on the seed and the address, so it does not
/// change with record order or worker count.
#[derive(Debug, Clone)]
pub struct DiscardSampler {
    pattern: Regex,
    ratio: f64,
    offset: f64,
    seed: u64,
}

impl DiscardSampler {
    /// Compiles a sampler; fails with `InvalidArgument` on bad settings.
    pub fn new(config: &DiscardConfig) -> Result<Self> {
        Ok(Self {
            pattern: config.compile()?,
            ratio: config.ratio,
            offset: config.offset,
            seed: config.seed,
        })
    }

    /// Whether objects of the named class are subject to sampling.
    pub fn matches(&self, class_name: &str) -> bool {
        self.pattern.is_match(class_name)
    }

    /// Whether the object at `address` falls into the dropped slice.
    pub fn drops(&self, address: u64) -> bool {
        if self.ratio <= 0.0 {
            return false;
        }
        let hash = XxHash64::oneshot(self.seed, &address.to_le_bytes());
        let u = (hash >> 11) as f64 / (1u64 << 53) as f64;
        (u - self.offset).rem_euclid(1.0) < self.ratio
    }

    /// Combined decision for an object of the named class.
    pub fn discards(&self, class_name: &str, address: u64) -> bool {
        self.drops(address) && self.matches(class_name)
    }
}

/// Count and heap size of discarded objects of one class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscardEntry {
    /// Class address.
    pub class_address: u64,
    /// Class name.
    pub class_name: String,
    /// Objects discarded.
    pub count: u64,
    /// Their summed heap size.
    pub bytes: u64,
}

/// Per-class totals of everything the sampler dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscardHistogram {
    /// Entries sorted by class address.
    pub entries: Vec<DiscardEntry>,
}

impl DiscardHistogram {
    /// Objects discarded in total.
    pub fn total_count(&self) -> u64 {
        self.entries.iter().map(|e| e.count).sum()
    }

    /// Heap bytes discarded in total.
    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.bytes).sum()
    }

    /// Entry for a class, if anything of it was discarded.
    pub fn get(&self, class_address: u64) -> Option<&DiscardEntry> {
        self.entries
            .binary_search_by_key(&class_address, |e| e.class_address)
            .ok()
            .map(|i| &self.entries[i])
    }
}

#[derive(Debug, Default)]
struct Counters {
    count: AtomicU64,
    bytes: AtomicU64,
}

/// Concurrent tally filled by Pass 2 workers.
#[derive(Debug, Default)]
pub(crate) struct DiscardTally {
    counters: ConcurrentMap<u64, Arc<Counters>>,
}

impl DiscardTally {
    pub fn record(&self, class_address: u64, bytes: u64) {
        let counters = match self
            .counters
            .get_or_insert_with(class_address, || Ok::<_, std::convert::Infallible>(Arc::default()))
        {
            Ok(c) => c,
            Err(never) => match never {},
        };
        counters.count.fetch_add(1, Ordering::Relaxed);
        counters.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn into_histogram(self, name_of: impl Fn(u64) -> String) -> DiscardHistogram {
        let mut entries: Vec<DiscardEntry> = self
            .counters
            .into_entries()
            .into_iter()
            .map(|(class_address, c)| DiscardEntry {
                class_address,
                class_name: name_of(class_address),
                count: c.count.load(Ordering::Relaxed),
                bytes: c.bytes.load(Ordering::Relaxed),
            })
            .collect();
        entries.sort_unstable_by_key(|e| e.class_address);
        DiscardHistogram { entries }
    }
}
