//! Segment-indexed local entry storage.
//!
//! Entries live in one concurrent map per segment so that whole segments can be
//! snapshotted for transfer and dropped when ownership moves away. Every entry carries
//! the [`EntryVersion`] the primary assigned to it; replicated and transferred entries
//! are only applied over strictly older ones.
//!
//! While a segment is being received, removals leave a tombstone instead of deleting,
//! so that an older copy arriving later in the transfer cannot resurrect the entry.

use crate::error::{Error, Result};
use crate::statetransfer::TransferEntry;
use crate::types::{CacheStats, EntryVersion, Segment};
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn duration_millis(duration: Duration) -> u64 {
    duration.as_millis().min(u128::from(u64::MAX)) as u64
}

/// A stored entry, or a tombstone when `value` is `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalEntry {
    pub value: Option<Bytes>,
    pub version: EntryVersion,
    pub created_ms: u64,
    pub last_used_ms: u64,
    pub lifespan_ms: Option<u64>,
    pub max_idle_ms: Option<u64>,
}

impl InternalEntry {
    pub fn new(value: Bytes, version: EntryVersion, now_ms: u64) -> Self {
        Self {
            value: Some(value),
            version,
            created_ms: now_ms,
            last_used_ms: now_ms,
            lifespan_ms: None,
            max_idle_ms: None,
        }
    }

    /// Set lifespan and max-idle.
    pub fn with_expiration(mut self, lifespan: Option<Duration>, max_idle: Option<Duration>) -> Self {
        self.lifespan_ms = lifespan.map(duration_millis);
        self.max_idle_ms = max_idle.map(duration_millis);
        self
    }

    pub fn tombstone(version: EntryVersion, now_ms: u64) -> Self {
        Self {
            value: None,
            version,
            created_ms: now_ms,
            last_used_ms: now_ms,
            lifespan_ms: None,
            max_idle_ms: None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Whether the lifespan has elapsed. Touching cannot revive such an entry.
    pub fn is_lifespan_expired(&self, now_ms: u64) -> bool {
        self.lifespan_ms
            .is_some_and(|lifespan| self.created_ms.saturating_add(lifespan) <= now_ms)
    }

    /// Whether the entry has gone unused for longer than its max-idle.
    pub fn is_idle_expired(&self, now_ms: u64) -> bool {
        self.max_idle_ms
            .is_some_and(|idle| self.last_used_ms.saturating_add(idle) <= now_ms)
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.is_lifespan_expired(now_ms) || self.is_idle_expired(now_ms)
    }

    /// Neither a tombstone nor expired.
    pub fn is_live(&self, now_ms: u64) -> bool {
        !self.is_tombstone() && !self.is_expired(now_ms)
    }

    pub(crate) fn to_transfer(&self, key: &Bytes) -> Option<TransferEntry> {
        let value = self.value.clone()?;
        Some(TransferEntry {
            key: key.clone(),
            value,
            version: self.version,
            created_ms: self.created_ms,
            last_used_ms: self.last_used_ms,
            lifespan_ms: self.lifespan_ms,
            max_idle_ms: self.max_idle_ms,
        })
    }

    pub(crate) fn from_transfer(entry: TransferEntry) -> (Bytes, Self) {
        (
            entry.key,
            Self {
                value: Some(entry.value),
                version: entry.version,
                created_ms: entry.created_ms,
                last_used_ms: entry.last_used_ms,
                lifespan_ms: entry.lifespan_ms,
                max_idle_ms: entry.max_idle_ms,
            },
        )
    }
}

/// Outcome of a [`DataContainer::compute`] closure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryUpdate {
    /// Leave the entry as it is.
    Keep,
    /// Store a new entry.
    Put(InternalEntry),
    /// Remove the entry at the given version.
    Remove(EntryVersion),
}

/// Local storage for all segments of one cache.
pub struct DataContainer {
    segments: Vec<DashMap<Bytes, InternalEntry>>,

    /// Segments currently receiving state; removals there leave tombstones.
    retain_tombstones: Vec<AtomicBool>,

    hits: AtomicU64,
    misses: AtomicU64,
}

impl DataContainer {
    pub fn new(num_segments: u32) -> Self {
        let num_segments = num_segments.max(1) as usize;
        Self {
            segments: (0..num_segments).map(|_| DashMap::new()).collect(),
            retain_tombstones: (0..num_segments).map(|_| AtomicBool::new(false)).collect(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn num_segments(&self) -> u32 {
        self.segments.len() as u32
    }

    fn segment(&self, segment: Segment) -> Result<&DashMap<Bytes, InternalEntry>> {
        self.segments
            .get(segment as usize)
            .ok_or_else(|| Error::Internal(format!("segment {} out of range", segment)))
    }

    fn retains_tombstones(&self, segment: Segment) -> bool {
        self.retain_tombstones
            .get(segment as usize)
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }

    /// Read a live entry, refreshing its last-access time.
    pub fn get(&self, segment: Segment, key: &[u8]) -> Option<InternalEntry> {
        let now = now_millis();
        let found = self.segments.get(segment as usize).and_then(|map| {
            let mut entry = map.get_mut(key)?;
            if !entry.is_live(now) {
                return None;
            }
            entry.last_used_ms = now;
            Some(entry.clone())
        });

        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Read a live entry without touching it or counting stats.
    pub fn peek(&self, segment: Segment, key: &[u8]) -> Option<InternalEntry> {
        let now = now_millis();
        self.segments
            .get(segment as usize)?
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.clone())
    }

    /// Version of whatever is stored for a key, tombstones included.
    pub fn version_of(&self, segment: Segment, key: &[u8]) -> Option<EntryVersion> {
        self.segments
            .get(segment as usize)?
            .get(key)
            .map(|e| e.version)
    }

    /// Atomically read-modify-write one key.
    ///
    /// The closure sees the live entry (expired entries and tombstones read as absent)
    /// and runs under the key's lock.
    pub fn compute<R, F>(&self, segment: Segment, key: Bytes, f: F) -> Result<R>
    where
        F: FnOnce(Option<&InternalEntry>) -> Result<(EntryUpdate, R)>,
    {
        let map = self.segment(segment)?;
        let retain = self.retains_tombstones(segment);
        let now = now_millis();

        match map.entry(key) {
            Entry::Occupied(mut occupied) => {
                let current = Some(occupied.get()).filter(|e| e.is_live(now));
                let (update, result) = f(current)?;
                match update {
                    EntryUpdate::Keep => {}
                    EntryUpdate::Put(entry) => {
                        occupied.insert(entry);
                    }
                    EntryUpdate::Remove(version) if retain => {
                        occupied.insert(InternalEntry::tombstone(version, now));
                    }
                    EntryUpdate::Remove(_) => {
                        occupied.remove();
                    }
                }
                Ok(result)
            }
            Entry::Vacant(vacant) => {
                let (update, result) = f(None)?;
                match update {
                    EntryUpdate::Put(entry) => {
                        vacant.insert(entry);
                    }
                    EntryUpdate::Remove(version) if retain => {
                        vacant.insert(InternalEntry::tombstone(version, now));
                    }
                    EntryUpdate::Keep | EntryUpdate::Remove(_) => {}
                }
                Ok(result)
            }
        }
    }

    /// Apply an entry replicated or transferred from another node.
    ///
    /// Applied only if strictly newer than what is stored, tombstones included.
    /// Returns whether the stored state changed.
    pub fn apply_versioned(&self, segment: Segment, key: Bytes, incoming: InternalEntry) -> bool {
        let Ok(map) = self.segment(segment) else {
            return false;
        };
        let retain = self.retains_tombstones(segment);

        match map.entry(key) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().version >= incoming.version {
                    return false;
                }
                if incoming.is_tombstone() && !retain {
                    occupied.remove();
                } else {
                    occupied.insert(incoming);
                }
                true
            }
            Entry::Vacant(vacant) => {
                if incoming.is_tombstone() && !retain {
                    return false;
                }
                vacant.insert(incoming);
                true
            }
        }
    }

    /// Apply a batch of transferred entries. Returns how many were applied.
    pub fn apply_transferred(&self, segment: Segment, entries: Vec<TransferEntry>) -> usize {
        let mut applied = 0;
        for (key, entry) in entries.into_iter().map(InternalEntry::from_transfer) {
            if self.apply_versioned(segment, key, entry) {
                applied += 1;
            }
        }
        applied
    }

    /// Refresh the last-access time of an entry.
    ///
    /// An entry past its lifespan is never touched; one past its max-idle only when
    /// `even_if_expired` is set.
    pub fn touch(&self, segment: Segment, key: &[u8], even_if_expired: bool) -> bool {
        let now = now_millis();
        let Some(map) = self.segments.get(segment as usize) else {
            return false;
        };
        let Some(mut entry) = map.get_mut(key) else {
            return false;
        };

        if entry.is_tombstone() || entry.is_lifespan_expired(now) {
            return false;
        }
        if entry.is_idle_expired(now) && !even_if_expired {
            return false;
        }
        entry.last_used_ms = now;
        true
    }

    /// Live entries of a segment, for transfer.
    pub fn snapshot_segment(&self, segment: Segment) -> Vec<TransferEntry> {
        let now = now_millis();
        let Some(map) = self.segments.get(segment as usize) else {
            return Vec::new();
        };
        map.iter()
            .filter(|e| e.value().is_live(now))
            .filter_map(|e| e.value().to_transfer(e.key()))
            .collect()
    }

    /// Start or stop keeping tombstones for segments under transfer.
    ///
    /// Stopping purges the segment's tombstones.
    pub fn set_retain_tombstones(&self, segments: impl IntoIterator<Item = Segment>, retain: bool) {
        for segment in segments {
            let Some(flag) = self.retain_tombstones.get(segment as usize) else {
                continue;
            };
            flag.store(retain, Ordering::Release);
            if !retain {
                if let Some(map) = self.segments.get(segment as usize) {
                    map.retain(|_, e| !e.is_tombstone());
                }
            }
        }
    }

    /// Drop everything stored for the given segments.
    pub fn remove_segments(&self, segments: impl IntoIterator<Item = Segment>) -> usize {
        let mut removed = 0;
        for segment in segments {
            if let Some(map) = self.segments.get(segment as usize) {
                removed += map.len();
                map.clear();
            }
            if let Some(flag) = self.retain_tombstones.get(segment as usize) {
                flag.store(false, Ordering::Release);
            }
        }
        removed
    }

    /// Remove expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = now_millis();
        let mut purged = 0;
        for map in &self.segments {
            let before = map.len();
            map.retain(|_, e| e.is_tombstone() || !e.is_expired(now));
            purged += before - map.len();
        }
        purged
    }

    /// Live entries in one segment.
    pub fn segment_size(&self, segment: Segment) -> usize {
        let now = now_millis();
        self.segments
            .get(segment as usize)
            .map(|map| map.iter().filter(|e| e.value().is_live(now)).count())
            .unwrap_or(0)
    }

    /// Live entries across all segments.
    pub fn size(&self) -> usize {
        (0..self.num_segments()).map(|s| self.segment_size(s)).sum()
    }

    /// Segments that hold any live entry.
    pub fn segments_with_data(&self) -> BTreeSet<Segment> {
        (0..self.num_segments())
            .filter(|&s| self.segment_size(s) > 0)
            .collect()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entry_count: self.size() as u64,
            owned_segments: self.segments_with_data().len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for DataContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataContainer")
            .field("num_segments", &self.segments.len())
            .field("size", &self.size())
            .finish()
    }
}
