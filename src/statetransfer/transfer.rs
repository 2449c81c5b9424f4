//! Data moved between nodes during state transfer.
//!
//! A segment is pushed by its source as a sequence of [`StateChunk`]s. Each chunk is
//! acknowledged with a [`ChunkAck`] before the next is sent, and the last one is
//! flagged `is_final`.

use crate::types::{CacheName, EntryVersion, Segment, TopologyId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// An entry being transferred, with everything needed to rebuild it on the receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEntry {
    pub key: Bytes,
    pub value: Bytes,
    pub version: EntryVersion,

    /// Creation time in milliseconds since the Unix epoch.
    pub created_ms: u64,

    /// Last access time in milliseconds since the Unix epoch.
    pub last_used_ms: u64,

    pub lifespan_ms: Option<u64>,
    pub max_idle_ms: Option<u64>,
}

/// A bounded slice of one segment's entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChunk {
    pub cache: CacheName,

    /// Topology the transfer belongs to. Chunks of superseded topologies are dropped.
    pub topology_id: TopologyId,

    pub segment: Segment,

    /// Position of this chunk within the segment, from 0.
    pub sequence: u64,

    pub entries: Vec<TransferEntry>,

    /// Whether this is the last chunk of the segment.
    pub is_final: bool,
}

impl StateChunk {
    /// Split a segment's entries into chunks of at most `chunk_size` entries.
    ///
    /// An empty segment still yields one empty final chunk, so that the receiver
    /// learns the segment is complete.
    pub fn split(
        cache: &CacheName,
        topology_id: TopologyId,
        segment: Segment,
        entries: Vec<TransferEntry>,
        chunk_size: usize,
    ) -> Vec<StateChunk> {
        let chunk_size = chunk_size.max(1);
        if entries.is_empty() {
            return vec![StateChunk {
                cache: cache.clone(),
                topology_id,
                segment,
                sequence: 0,
                entries,
                is_final: true,
            }];
        }

        let count = entries.len().div_ceil(chunk_size);
        let mut chunks = Vec::with_capacity(count);
        let mut remaining = entries.into_iter().peekable();
        let mut sequence = 0;
        while remaining.peek().is_some() {
            let batch: Vec<TransferEntry> = remaining.by_ref().take(chunk_size).collect();
            chunks.push(StateChunk {
                cache: cache.clone(),
                topology_id,
                segment,
                sequence,
                entries: batch,
                is_final: remaining.peek().is_none(),
            });
            sequence += 1;
        }
        chunks
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Receiver's answer to a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkAck {
    pub topology_id: TopologyId,
    pub segment: Segment,
    pub sequence: u64,

    /// False when the chunk belonged to a superseded topology or an unexpected segment.
    /// The sender stops pushing that segment.
    pub accepted: bool,

    /// Entries that were newer than the receiver's copy and got applied.
    pub applied: u64,
}

impl ChunkAck {
    pub fn accepted(chunk: &StateChunk, applied: u64) -> Self {
        Self {
            topology_id: chunk.topology_id,
            segment: chunk.segment,
            sequence: chunk.sequence,
            accepted: true,
            applied,
        }
    }

    pub fn rejected(chunk: &StateChunk) -> Self {
        Self {
            topology_id: chunk.topology_id,
            segment: chunk.segment,
            sequence: chunk.sequence,
            accepted: false,
            applied: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(n: usize) -> Vec<TransferEntry> {
        (0..n)
            .map(|i| TransferEntry {
                key: Bytes::from(format!("k{}", i)),
                value: Bytes::from_static(b"v"),
                version: EntryVersion::new(1, i as u64),
                created_ms: 0,
                last_used_ms: 0,
                lifespan_ms: None,
                max_idle_ms: None,
            })
            .collect()
    }

    #[test]
    fn test_split_bounds_chunks() {
        let cache: CacheName = "default".into();
        let chunks = StateChunk::split(&cache, 4, 7, entries(25), 10);

        assert_eq!(chunks.len(), 3);
        assert_eq!(
            chunks.iter().map(StateChunk::len).collect::<Vec<_>>(),
            vec![10, 10, 5]
        );
        assert_eq!(
            chunks.iter().map(|c| c.sequence).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert!(chunks[..2].iter().all(|c| !c.is_final));
        assert!(chunks[2].is_final);
        assert!(chunks.iter().all(|c| c.segment == 7 && c.topology_id == 4));
    }

    #[test]
    fn test_split_exact_multiple() {
        let chunks = StateChunk::split(&"c".into(), 1, 0, entries(20), 10);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[1].is_final);
    }

    #[test]
    fn test_split_empty_segment() {
        let chunks = StateChunk::split(&"c".into(), 1, 0, Vec::new(), 10);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_final);
        assert!(chunks[0].is_empty());
    }

    #[test]
    fn test_ack() {
        let chunk = StateChunk::split(&"c".into(), 3, 2, entries(1), 10).remove(0);
        let ack = ChunkAck::accepted(&chunk, 1);
        assert!(ack.accepted);
        assert_eq!(ack.applied, 1);
        assert!(!ChunkAck::rejected(&chunk).accepted);
    }
}
