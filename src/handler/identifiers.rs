//! Address to dense object id mapping.

/// Sorted, duplicate-free list of object addresses; an object's id is its index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentifierIndex {
    addresses: Vec<u64>,
}

impl IdentifierIndex {
    /// Sorts and deduplicates `addresses`.
    pub fn from_unsorted(mut addresses: Vec<u64>) -> Self {
        addresses.sort_unstable();
        addresses.dedup();
        Self { addresses }
    }

    /// Wraps addresses that are already sorted and unique.
    pub fn from_sorted(addresses: Vec<u64>) -> Self {
        Self { addresses }
    }

    /// Number of objects.
    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    /// Whether no address is registered.
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// Id of `address`, if registered.
    pub fn reverse(&self, address: u64) -> Option<u32> {
        self.addresses
            .binary_search(&address)
            .ok()
            .map(|idx| idx as u32)
    }

    /// Whether `address` is registered.
    pub fn contains(&self, address: u64) -> bool {
        self.addresses.binary_search(&address).is_ok()
    }

    /// Address of object `id`.
    pub fn get(&self, id: u32) -> Option<u64> {
        self.addresses.get(id as usize).copied()
    }

    /// All addresses in id order.
    pub fn as_slice(&self) -> &[u64] {
        &self.addresses
    }

    /// Consumes the index into its addresses.
    pub fn into_vec(self) -> Vec<u64> {
        self.addresses
    }

    /// Smallest address strictly greater than `after` that is not registered and not
    /// rejected by `taken`.
    pub fn next_unused(&self, after: u64, taken: impl Fn(u64) -> bool) -> u64 {
        let mut candidate = after + 1;
        while self.contains(candidate) || taken(candidate) {
            candidate += 1;
        }
        candidate
    }
}
