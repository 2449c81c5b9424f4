//! Bookkeeping for the transfers of one topology.

use crate::topology::CacheTopology;
use crate::types::{NodeId, Segment, TopologyId};
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

/// State of one inbound segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    /// No chunk received yet.
    Pending,
    /// Some chunks applied; the next expected sequence number.
    Receiving { next_sequence: u64 },
    /// The final chunk was applied. The segment is readable.
    Complete,
}

/// What to do with an incoming chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkDisposition {
    /// The next chunk in order: apply it.
    Apply,
    /// Already applied, for example a resend after a lost ack.
    Duplicate,
    /// Not part of this transfer.
    Unexpected,
}

/// Progress of one inbound segment.
#[derive(Debug, Clone)]
pub struct SegmentTransfer {
    pub segment: Segment,

    /// Node pushing the segment. `None` when no previous owner survived.
    pub source: Option<NodeId>,

    pub state: SegmentState,
    pub chunks_applied: u64,
    pub entries_applied: u64,
}

/// Aggregated progress of an inbound transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferProgress {
    pub topology_id: TopologyId,
    pub total_segments: usize,
    pub completed_segments: usize,
    pub entries_applied: u64,
}

impl TransferProgress {
    /// Completed share of segments, as a percentage.
    pub fn percentage(&self) -> f64 {
        if self.total_segments == 0 {
            100.0
        } else {
            self.completed_segments as f64 / self.total_segments as f64 * 100.0
        }
    }
}

/// Segments a node must receive for one rebalancing topology.
///
/// Replaced wholesale when a newer topology arrives; partial progress is never carried
/// over.
#[derive(Debug)]
pub struct InboundTransfer {
    topology_id: TopologyId,
    segments: BTreeMap<Segment, SegmentTransfer>,
    confirmed: bool,
    started_at: Instant,
}

impl InboundTransfer {
    /// Work out what `local` must receive under `topology`.
    pub fn new(topology: &CacheTopology, local: NodeId) -> Self {
        let segments = topology
            .inbound_segments(local)
            .into_iter()
            .map(|segment| {
                let source = topology.transfer_source(segment, local);
                let state = if source.is_some() {
                    SegmentState::Pending
                } else {
                    SegmentState::Complete
                };
                (
                    segment,
                    SegmentTransfer {
                        segment,
                        source,
                        state,
                        chunks_applied: 0,
                        entries_applied: 0,
                    },
                )
            })
            .collect();

        Self {
            topology_id: topology.topology_id(),
            segments,
            confirmed: false,
            started_at: Instant::now(),
        }
    }

    pub fn topology_id(&self) -> TopologyId {
        self.topology_id
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// All segments of this transfer, complete or not.
    pub fn segments(&self) -> BTreeSet<Segment> {
        self.segments.keys().copied().collect()
    }

    /// Segments still waiting for their final chunk.
    pub fn incomplete_segments(&self) -> BTreeSet<Segment> {
        self.segments
            .values()
            .filter(|t| t.state != SegmentState::Complete)
            .map(|t| t.segment)
            .collect()
    }

    /// Segments whose every previous owner is gone.
    pub fn orphaned_segments(&self) -> BTreeSet<Segment> {
        self.segments
            .values()
            .filter(|t| t.source.is_none())
            .map(|t| t.segment)
            .collect()
    }

    /// Whether a segment is still being received.
    pub fn is_pending(&self, segment: Segment) -> bool {
        self.segments
            .get(&segment)
            .is_some_and(|t| t.state != SegmentState::Complete)
    }

    pub fn is_complete(&self) -> bool {
        self.segments
            .values()
            .all(|t| t.state == SegmentState::Complete)
    }

    /// Classify an incoming chunk.
    pub fn disposition(&self, segment: Segment, sequence: u64) -> ChunkDisposition {
        let Some(transfer) = self.segments.get(&segment) else {
            return ChunkDisposition::Unexpected;
        };
        match transfer.state {
            SegmentState::Pending if sequence == 0 => ChunkDisposition::Apply,
            SegmentState::Receiving { next_sequence } if sequence == next_sequence => {
                ChunkDisposition::Apply
            }
            SegmentState::Receiving { next_sequence } if sequence < next_sequence => {
                ChunkDisposition::Duplicate
            }
            SegmentState::Complete => ChunkDisposition::Duplicate,
            _ => ChunkDisposition::Unexpected,
        }
    }

    /// Record an applied chunk. Returns true when it completed its segment.
    pub fn record_chunk(
        &mut self,
        segment: Segment,
        sequence: u64,
        applied: u64,
        is_final: bool,
    ) -> bool {
        let Some(transfer) = self.segments.get_mut(&segment) else {
            return false;
        };
        transfer.chunks_applied += 1;
        transfer.entries_applied += applied;
        transfer.state = if is_final {
            SegmentState::Complete
        } else {
            SegmentState::Receiving {
                next_sequence: sequence + 1,
            }
        };
        is_final
    }

    /// Mark the rebalance confirmed. Returns true only the first time.
    pub fn mark_confirmed(&mut self) -> bool {
        !std::mem::replace(&mut self.confirmed, true)
    }

    pub fn progress(&self) -> TransferProgress {
        TransferProgress {
            topology_id: self.topology_id,
            total_segments: self.segments.len(),
            completed_segments: self
                .segments
                .values()
                .filter(|t| t.state == SegmentState::Complete)
                .count(),
            entries_applied: self.segments.values().map(|t| t.entries_applied).sum(),
        }
    }
}

/// Segments this node must push to one destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundTransfer {
    pub topology_id: TopologyId,
    pub destination: NodeId,
    pub segments: Vec<Segment>,
}

impl OutboundTransfer {
    /// Every push `local` owes under `topology`.
    pub fn for_topology(topology: &CacheTopology, local: NodeId) -> Vec<OutboundTransfer> {
        topology
            .outbound_segments(local)
            .into_iter()
            .map(|(destination, segments)| OutboundTransfer {
                topology_id: topology.topology_id(),
                destination,
                segments,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partitioning::ConsistentHash;

    fn join_topology() -> CacheTopology {
        CacheTopology::rebalancing(
            2,
            1,
            1,
            vec![1, 2],
            ConsistentHash::compute(&[1], 1, 16),
            ConsistentHash::compute(&[1, 2], 1, 16),
        )
    }

    #[test]
    fn test_inbound_for_joiner() {
        let topology = join_topology();
        let transfer = InboundTransfer::new(&topology, 2);

        assert_eq!(transfer.topology_id(), 2);
        assert!(!transfer.segments().is_empty());
        assert_eq!(transfer.segments(), topology.inbound_segments(2));
        assert!(transfer.orphaned_segments().is_empty());
        assert!(!transfer.is_complete());

        // The existing owner receives nothing.
        assert!(InboundTransfer::new(&topology, 1).is_complete());
    }

    #[test]
    fn test_chunk_ordering() {
        let topology = join_topology();
        let mut transfer = InboundTransfer::new(&topology, 2);
        let segment = *transfer.segments().iter().next().unwrap();

        assert_eq!(transfer.disposition(segment, 1), ChunkDisposition::Unexpected);
        assert_eq!(transfer.disposition(segment, 0), ChunkDisposition::Apply);
        assert!(!transfer.record_chunk(segment, 0, 10, false));
        assert_eq!(transfer.disposition(segment, 0), ChunkDisposition::Duplicate);
        assert_eq!(transfer.disposition(segment, 1), ChunkDisposition::Apply);
        assert!(transfer.record_chunk(segment, 1, 3, true));
        assert!(!transfer.is_pending(segment));
        assert_eq!(transfer.disposition(segment, 1), ChunkDisposition::Duplicate);

        let progress = transfer.progress();
        assert_eq!(progress.completed_segments, 1);
        assert_eq!(progress.entries_applied, 13);
    }

    #[test]
    fn test_complete_after_all_segments() {
        let topology = join_topology();
        let mut transfer = InboundTransfer::new(&topology, 2);
        for segment in transfer.segments() {
            transfer.record_chunk(segment, 0, 0, true);
        }
        assert!(transfer.is_complete());
        assert_eq!(transfer.progress().percentage(), 100.0);
        assert!(transfer.mark_confirmed());
        assert!(!transfer.mark_confirmed());
    }

    #[test]
    fn test_orphaned_segments_start_complete() {
        let topology = CacheTopology::rebalancing(
            5,
            2,
            1,
            vec![1, 3],
            ConsistentHash::compute(&[2], 1, 8),
            ConsistentHash::compute(&[1, 3], 1, 8),
        );
        let transfer = InboundTransfer::new(&topology, 3);
        assert!(!transfer.segments().is_empty());
        assert_eq!(transfer.orphaned_segments(), transfer.segments());
        assert!(transfer.is_complete());
    }

    #[test]
    fn test_outbound_for_source() {
        let topology = join_topology();
        let outbound = OutboundTransfer::for_topology(&topology, 1);
        assert_eq!(outbound.len(), 1);
        assert_eq!(outbound[0].destination, 2);
        assert_eq!(
            outbound[0].segments.iter().copied().collect::<BTreeSet<_>>(),
            topology.inbound_segments(2)
        );
        assert!(OutboundTransfer::for_topology(&topology, 2).is_empty());
    }
}
