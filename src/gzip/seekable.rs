//! Random access over a plain (non-chunked) gzip file.
//!
//! Deflate output can only be produced front to back, so seeking means decompressing from
//! some earlier point. [`SeekableGzip`] keeps a bounded pool of [`GzipStream`]s parked at
//! different logical offsets and serves a seek from the closest one at or before the target.
//!
//! ## Seek
//!
//! 1. The active stream is parked, unless a live stream already sits at the same offset.
//! 2. The closest live stream at or before the target is looked up in a `BTreeMap` keyed by
//!    `(position, sequence)`. If the target lies ahead of it and there is spare capacity, a
//!    clone is advanced instead so the original stays available for other targets.
//! 3. Without a usable stream, one slot is evicted if the pool is full and a fresh stream
//!    starts at the nearest known member boundary (byte 0 for single-member files).
//! 4. The stream skips forward to the target, leaving waypoint clones behind while spare
//!    capacity remains.
//!
//! ## Eviction
//!
//! Every `sweep_interval`-th seek evicts the slot with the smallest gap to its predecessor.
//! Other evictions scan the `lru_scan` least recently used slots and drop the one with the
//! lowest `gap - decay`, where decay grows each time a seek skips over the slot.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, trace};
use lru::LruCache;

use super::stream::{GzipStream, MemberSpan, STREAM_FOOTPRINT, SharedFile};
use super::summary::{Boundary, FileStamp, OffsetMappingCache, OffsetSummary};
use crate::config::DecompressionConfig;
use crate::error::Result;
use crate::io::RandomSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct StreamKey {
    position: u64,
    seq: u64,
}

#[derive(Debug)]
struct Slot {
    /// `None` once released under memory pressure.
    stream: Option<GzipStream>,
    decay: u64,
}

/// Counters describing how seeks were served.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeekStats {
    /// Seeks requested.
    pub seeks: u64,
    /// Seeks served by the active stream without moving it.
    pub in_place: u64,
    /// Streams started from a member boundary.
    pub fresh_streams: u64,
    /// Clones made of parked streams (including waypoints).
    pub clones: u64,
    /// Slots evicted.
    pub evictions: u64,
    /// Decompressed bytes skipped to reach targets.
    pub skipped_bytes: u64,
}

/// Pool-size heuristic from the compressed file length.
pub fn default_stream_count(file_len: u64) -> usize {
    let n = (file_len / 100_000).min(1000) + file_len / 1_000_000;
    n.clamp(2, 1_000_000) as usize
}

/// A randomly seekable view of a gzip file.
pub struct SeekableGzip {
    path: PathBuf,
    file: SharedFile,
    stamp: FileStamp,
    active: Option<GzipStream>,
    parked: BTreeMap<StreamKey, Slot>,
    recency: LruCache<StreamKey, ()>,
    capacity: usize,
    next_seq: u64,
    sweep_interval: u64,
    lru_scan: usize,
    waypoint_min_gap: u64,
    members: Vec<MemberSpan>,
    loaded_members: usize,
    eof_position: Option<u64>,
    estimated_len: u64,
    mapping_cache: Option<Arc<OffsetMappingCache>>,
    stats: SeekStats,
}

impl std::fmt::Debug for SeekableGzip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeekableGzip")
            .field("path", &self.path)
            .field("capacity", &self.capacity)
            .field("parked", &self.parked.len())
            .field("members", &self.members.len())
            .field("stats", &self.stats)
            .finish()
    }
}

impl SeekableGzip {
    /// Opens `path` with default settings and no summary cache.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with(path, &DecompressionConfig::default(), None)
    }

    /// Opens `path`, consulting `mapping_cache` for known member boundaries.
    pub fn open_with(
        path: &Path,
        config: &DecompressionConfig,
        mapping_cache: Option<Arc<OffsetMappingCache>>,
    ) -> Result<Self> {
        let mut file = SharedFile::open(path)?;
        let stamp = FileStamp::of(path)?;
        let capacity = match config.max_streams {
            0 => default_stream_count(file.len()),
            n => n.max(1),
        };
        let estimated_len = file.estimated_length().unwrap_or(0);

        let members = mapping_cache
            .as_ref()
            .and_then(|cache| cache.lookup(path, stamp, 0))
            .map(|summary| spans_from_summary(&summary))
            .unwrap_or_default();
        let loaded_members = members.len();
        if loaded_members > 0 {
            debug!(
                "{}: starting with {loaded_members} known gzip members",
                path.display()
            );
        }

        Ok(Self {
            path: path.to_path_buf(),
            file,
            stamp,
            active: None,
            parked: BTreeMap::new(),
            recency: LruCache::unbounded(),
            capacity,
            next_seq: 0,
            sweep_interval: config.sweep_interval.max(1),
            lru_scan: config.lru_scan.max(1),
            waypoint_min_gap: config.waypoint_min_gap.max(1),
            members,
            loaded_members,
            eof_position: None,
            estimated_len,
            mapping_cache,
            stats: SeekStats::default(),
        })
    }

    /// Maximum number of live streams.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of live (not released) streams, the active one included.
    pub fn live_streams(&self) -> usize {
        self.parked_live() + usize::from(self.active.is_some())
    }

    /// Approximate heap held by live streams.
    pub fn memory_footprint(&self) -> usize {
        self.live_streams() * STREAM_FOOTPRINT
    }

    /// Seek statistics since open.
    pub fn stats(&self) -> SeekStats {
        self.stats
    }

    /// Member boundaries known so far, contiguous from the start of the file.
    pub fn known_members(&self) -> &[MemberSpan] {
        &self.members
    }

    /// Logical position of the active stream, if any.
    pub fn position(&self) -> Option<u64> {
        self.active.as_ref().map(GzipStream::position)
    }

    /// Drops the state of every parked stream.
    ///
    /// The slots stay in the search structure as released entries; a later seek that finds
    /// one treats it as empty and removes it.
    pub fn release_idle(&mut self) {
        let mut released = 0;
        for slot in self.parked.values_mut() {
            if slot.stream.take().is_some() {
                released += 1;
            }
        }
        debug!("{}: released {released} parked streams", self.path.display());
    }

    fn parked_live(&self) -> usize {
        self.parked.values().filter(|s| s.stream.is_some()).count()
    }

    fn next_key(&mut self, position: u64) -> StreamKey {
        self.next_seq += 1;
        StreamKey {
            position,
            seq: self.next_seq,
        }
    }

    fn spare_capacity(&self) -> usize {
        self.capacity.saturating_sub(self.live_streams())
    }

    /// Moves the active stream into the pool.
    fn park_active(&mut self) {
        if let Some(stream) = self.active.take() {
            self.park(stream);
        }
    }

    fn park(&mut self, stream: GzipStream) {
        let position = stream.position();
        let duplicate = self
            .parked
            .range(
                StreamKey { position, seq: 0 }..=StreamKey {
                    position,
                    seq: u64::MAX,
                },
            )
            .any(|(_, slot)| slot.stream.is_some());
        if duplicate {
            trace!("dropping duplicate stream at {position}");
            return;
        }
        while self.live_streams() >= self.capacity && self.evict() {}
        let key = self.next_key(position);
        self.parked.insert(
            key,
            Slot {
                stream: Some(stream),
                decay: 0,
            },
        );
        self.recency.put(key, ());
    }

    fn remove_slot(&mut self, key: &StreamKey) -> Option<Slot> {
        self.recency.pop(key);
        self.parked.remove(key)
    }

    /// Distance from the slot to its predecessor (or to the file start).
    fn gap_before(&self, key: &StreamKey) -> u64 {
        self.parked
            .range(..*key)
            .next_back()
            .map_or(key.position, |(prev, _)| key.position - prev.position)
    }

    /// Evicts one slot; returns false when nothing is parked.
    fn evict(&mut self) -> bool {
        if self.parked.is_empty() {
            return false;
        }
        let victim = if self.stats.seeks % self.sweep_interval == 0 {
            self.smallest_gap_victim()
        } else {
            self.weighted_lru_victim()
        };
        match victim {
            Some(key) => {
                trace!("evicting stream at {}", key.position);
                self.remove_slot(&key);
                self.stats.evictions += 1;
                true
            }
            None => false,
        }
    }

    fn smallest_gap_victim(&self) -> Option<StreamKey> {
        let mut prev = 0u64;
        let mut best: Option<(u64, StreamKey)> = None;
        for (key, slot) in &self.parked {
            let gap = if slot.stream.is_some() {
                key.position - prev
            } else {
                0
            };
            if best.is_none_or(|(g, _)| gap < g) {
                best = Some((gap, *key));
            }
            prev = key.position;
        }
        best.map(|(_, key)| key)
    }

    fn weighted_lru_victim(&self) -> Option<StreamKey> {
        let mut best: Option<(u64, StreamKey)> = None;
        for (key, _) in self.recency.iter().rev().take(self.lru_scan) {
            let Some(slot) = self.parked.get(key) else {
                continue;
            };
            let score = match slot.stream {
                Some(_) => self.gap_before(key).saturating_sub(slot.decay),
                None => 0,
            };
            if best.is_none_or(|(s, _)| score < s) {
                best = Some((score, *key));
            }
        }
        best.map(|(_, key)| key)
    }

    /// Raises the decay of live slots strictly between `from` and `to`.
    fn decay_between(&mut self, from: u64, to: u64) {
        if to <= from + 1 {
            return;
        }
        let keys: Vec<StreamKey> = self
            .parked
            .range(
                StreamKey {
                    position: from + 1,
                    seq: 0,
                }..StreamKey {
                    position: to,
                    seq: 0,
                },
            )
            .filter(|(_, slot)| slot.stream.is_some())
            .map(|(k, _)| *k)
            .collect();
        for key in keys {
            let gap = self.gap_before(&key);
            if let Some(slot) = self.parked.get_mut(&key) {
                let left = gap.saturating_sub(slot.decay);
                slot.decay += left.div_ceil(2);
            }
        }
    }

    /// Takes the closest live stream at or before `pos` out of the pool, or clones it.
    fn take_floor(&mut self, pos: u64) -> Option<GzipStream> {
        let upper = StreamKey {
            position: pos,
            seq: u64::MAX,
        };
        let mut released = Vec::new();
        let mut found = None;
        for (key, slot) in self.parked.range(..=upper).rev() {
            if slot.stream.is_some() {
                found = Some(*key);
                break;
            }
            released.push(*key);
        }
        for key in released {
            self.remove_slot(&key);
        }

        let key = found?;
        let keep_original = key.position < pos && self.spare_capacity() > 0;
        if keep_original {
            self.recency.get(&key);
            let slot = self.parked.get_mut(&key)?;
            slot.decay = 0;
            self.stats.clones += 1;
            return slot.stream.clone();
        }
        self.remove_slot(&key).and_then(|slot| slot.stream)
    }

    fn fresh_stream(&mut self, pos: u64) -> GzipStream {
        while self.live_streams() >= self.capacity && self.evict() {}
        self.stats.fresh_streams += 1;
        let start = self
            .members
            .iter()
            .rev()
            .map(|m| {
                (
                    m.compressed_offset + m.compressed_len,
                    m.logical_offset + m.logical_len,
                )
            })
            .find(|(_, logical)| *logical <= pos);
        match start {
            Some((file_offset, logical)) => GzipStream::at_member(file_offset, logical),
            None => GzipStream::new(),
        }
    }

    fn harvest(&mut self, stream: &mut GzipStream) {
        for span in stream.take_completed() {
            let end = self
                .members
                .last()
                .map_or(0, |m| m.logical_offset + m.logical_len);
            if span.logical_offset == end {
                self.members.push(span);
            }
        }
        if stream.is_eof() {
            self.eof_position = Some(stream.position());
        }
    }

    /// Positions the active stream at `pos`; returns false if `pos` is past the end.
    pub fn seek(&mut self, pos: u64) -> Result<bool> {
        self.stats.seeks += 1;
        if let Some(active) = &self.active
            && active.position() == pos
        {
            self.stats.in_place += 1;
            return Ok(true);
        }
        if let Some(eof) = self.eof_position
            && pos >= eof
        {
            self.park_active();
            return Ok(false);
        }

        self.park_active();
        let mut stream = match self.take_floor(pos) {
            Some(stream) => stream,
            None => self.fresh_stream(pos),
        };

        let start = stream.position();
        self.decay_between(start, pos);
        let spare = self.spare_capacity().saturating_sub(1);
        let stride = if spare > 0 {
            ((pos - start) / (spare as u64 + 1)).max(self.waypoint_min_gap)
        } else {
            u64::MAX
        };
        let mut waypoints = spare;
        let mut last_waypoint = start;

        while stream.position() < pos {
            let step = (pos - stream.position()).min(stride);
            let skipped = stream.skip(&mut self.file, step)?;
            self.stats.skipped_bytes += skipped;
            self.harvest(&mut stream);
            if skipped < step {
                debug!(
                    "{}: seek to {pos} ran past the end at {}",
                    self.path.display(),
                    stream.position()
                );
                self.park(stream);
                return Ok(false);
            }
            if waypoints > 0
                && stream.position() < pos
                && stream.position() - last_waypoint >= stride
            {
                self.park(stream.clone());
                self.stats.clones += 1;
                waypoints -= 1;
                last_waypoint = stream.position();
            }
        }

        self.active = Some(stream);
        Ok(true)
    }

    /// Reads from the active stream.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let Some(mut stream) = self.active.take() else {
            return Ok(0);
        };
        let n = stream.read(&mut self.file, buf)?;
        self.harvest(&mut stream);
        if n == 0 {
            // End of stream: drop the decoder state right away.
            stream.release();
            return Ok(0);
        }
        self.active = Some(stream);
        Ok(n)
    }

    /// Offers the member table discovered so far to the mapping cache.
    pub fn persist_summary(&mut self) {
        if self.members.len() <= self.loaded_members {
            return;
        }
        let Some(cache) = &self.mapping_cache else {
            return;
        };
        let boundaries: Vec<Boundary> = std::iter::once(Boundary {
            file_offset: 0,
            logical_offset: 0,
        })
        .chain(self.members.iter().map(|m| Boundary {
            file_offset: m.compressed_offset + m.compressed_len,
            logical_offset: m.logical_offset + m.logical_len,
        }))
        .collect();
        let summary = OffsetSummary::from_boundaries(0, self.stamp, &boundaries);
        if cache.store(&self.path, summary) {
            self.loaded_members = self.members.len();
        }
    }
}

impl RandomSource for SeekableGzip {
    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        if self.position() != Some(pos) && !self.seek(pos)? {
            return Ok(0);
        }
        self.read(buf)
    }

    fn exact_len(&self) -> Option<u64> {
        self.eof_position
    }

    fn estimated_len(&self) -> u64 {
        self.eof_position.unwrap_or(self.estimated_len)
    }
}

impl Drop for SeekableGzip {
    fn drop(&mut self) {
        self.persist_summary();
    }
}

fn spans_from_summary(summary: &OffsetSummary) -> Vec<MemberSpan> {
    let mut spans = Vec::with_capacity(summary.chunks.len());
    let mut file_offset = 0;
    let mut logical_offset = 0;
    for chunk in &summary.chunks {
        spans.push(MemberSpan {
            compressed_offset: file_offset,
            compressed_len: chunk.compressed,
            logical_offset,
            logical_len: chunk.uncompressed,
        });
        file_offset += chunk.compressed;
        logical_offset += chunk.uncompressed;
    }
    spans
}
