//! Cluster membership events.

use crate::types::NodeId;

/// Events related to cluster membership changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberEvent {
    /// A new node joined the cluster.
    NodeJoin {
        /// The node's ID.
        node_id: NodeId,
    },

    /// A node left the cluster gracefully.
    NodeLeave {
        /// The node's ID.
        node_id: NodeId,
    },

    /// A node is suspected to have failed.
    NodeSuspect {
        /// The node's ID.
        node_id: NodeId,
        /// Number of failed ping attempts.
        failed_pings: usize,
    },

    /// A node has been confirmed as failed.
    NodeFailed {
        /// The node's ID.
        node_id: NodeId,
    },

    /// A previously failed node has recovered.
    NodeRecovered {
        /// The node's ID.
        node_id: NodeId,
    },
}

impl MemberEvent {
    /// Get the node ID associated with this event.
    pub fn node_id(&self) -> NodeId {
        match self {
            MemberEvent::NodeJoin { node_id } => *node_id,
            MemberEvent::NodeLeave { node_id } => *node_id,
            MemberEvent::NodeSuspect { node_id, .. } => *node_id,
            MemberEvent::NodeFailed { node_id } => *node_id,
            MemberEvent::NodeRecovered { node_id } => *node_id,
        }
    }

    /// Check if this is a join-type event.
    pub fn is_join(&self) -> bool {
        matches!(
            self,
            MemberEvent::NodeJoin { .. } | MemberEvent::NodeRecovered { .. }
        )
    }

    /// Check if this is a leave-type event.
    ///
    /// Suspicion alone does not change the membership view.
    pub fn is_leave(&self) -> bool {
        matches!(
            self,
            MemberEvent::NodeLeave { .. } | MemberEvent::NodeFailed { .. }
        )
    }
}

/// Listener for membership events.
pub trait MemberEventListener: Send + Sync + 'static {
    /// Called when a membership event occurs.
    fn on_event(&self, event: MemberEvent);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_node_id() {
        let event = MemberEvent::NodeJoin { node_id: 42 };
        assert_eq!(event.node_id(), 42);
    }

    #[test]
    fn test_event_types() {
        let join = MemberEvent::NodeJoin { node_id: 1 };
        assert!(join.is_join());
        assert!(!join.is_leave());

        let failed = MemberEvent::NodeFailed { node_id: 1 };
        assert!(!failed.is_join());
        assert!(failed.is_leave());

        let suspect = MemberEvent::NodeSuspect {
            node_id: 1,
            failed_pings: 3,
        };
        assert!(!suspect.is_join());
        assert!(!suspect.is_leave());
    }
}
