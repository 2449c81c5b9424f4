//! Error types for the grid core.

use crate::types::{NodeId, NodeVersion, Segment, TopologyId};
use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Result type alias for grid operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the grid.
#[derive(Error, Debug)]
pub enum Error {
    /// Topology related errors.
    #[error("topology error: {0}")]
    Topology(#[from] TopologyError),

    /// Command validation and execution errors.
    #[error("command error: {0}")]
    Command(#[from] CommandError),

    /// State transfer errors.
    #[error("state transfer error: {0}")]
    StateTransfer(#[from] StateTransferError),

    /// Network communication errors.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// A target node was suspected to have failed mid-RPC.
    #[error("node {0} suspected")]
    Suspect(NodeId),

    /// An exception reported by a remote node.
    #[error("remote error from node {node}: {kind:?}: {message}")]
    Remote {
        node: NodeId,
        kind: ExceptionKind,
        message: String,
    },

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Topology related errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    /// The command was built against an older topology than the executing node holds.
    #[error("outdated topology: command {command}, current {current}")]
    Outdated {
        command: TopologyId,
        current: TopologyId,
    },

    /// Retries against refreshed topologies were exhausted.
    #[error("retries exhausted after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    /// No topology has been installed yet.
    #[error("no topology installed")]
    NotInstalled,

    /// The cluster has no members to own the segment.
    #[error("no owners for segment {0}")]
    NoOwners(Segment),

    /// The node is not a member of the topology.
    #[error("node {0} is not a member")]
    NotMember(NodeId),
}

/// Command validation and execution errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The command variant is newer than this node supports.
    #[error("command {command} requires version {required}, node supports {supported}")]
    UnsupportedVersion {
        command: &'static str,
        required: NodeVersion,
        supported: NodeVersion,
    },

    /// The wire type tag is not a known command.
    #[error("unknown command type tag {0}")]
    UnknownCommand(u16),

    /// The command targets a cache this node does not host.
    #[error("unknown cache: {0}")]
    UnknownCache(String),

    /// A functional command referenced an unregistered function.
    #[error("unknown function: {0}")]
    UnknownFunction(String),

    /// The stored value cannot be interpreted by the operation.
    #[error("invalid value for key: {0}")]
    InvalidValue(String),
}

/// State transfer errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateTransferError {
    /// The initial transfer did not complete in time.
    #[error("initial state transfer did not complete within {0:?}")]
    InitialTransferTimeout(std::time::Duration),

    /// A chunk could not be delivered to its destination.
    #[error("chunk for segment {segment} to node {destination} failed: {reason}")]
    ChunkFailed {
        segment: Segment,
        destination: NodeId,
        reason: String,
    },
}

/// Network communication errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Connection failed.
    #[error("connection failed to {addr}: {reason}")]
    ConnectionFailed { addr: String, reason: String },

    /// Connection was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The target node has no known address or endpoint.
    #[error("unknown node: {0}")]
    UnknownNode(NodeId),

    /// Failed to send message.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Frame checksum mismatch.
    #[error("checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    Checksum { expected: u32, actual: u32 },

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Exception category carried by exception responses.
///
/// Lets the receiving side rebuild a typed, retry-aware error from a remote failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExceptionKind {
    OutdatedTopology { current: TopologyId },
    UnsupportedVersion,
    UnknownCommand,
    UnknownFunction,
    InvalidValue,
    Timeout,
    Internal,
}

impl Error {
    /// Whether the failure is transient and the operation may be retried against a
    /// refreshed topology.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Topology(TopologyError::Outdated { .. }) => true,
            Error::Suspect(_) => true,
            Error::Remote { kind, .. } => {
                matches!(kind, ExceptionKind::OutdatedTopology { .. })
            }
            _ => false,
        }
    }

    /// The topology id a retry should wait for, if the failure names one.
    pub fn topology_hint(&self) -> Option<TopologyId> {
        match self {
            Error::Topology(TopologyError::Outdated { current, .. }) => Some(*current),
            Error::Remote {
                kind: ExceptionKind::OutdatedTopology { current },
                ..
            } => Some(*current),
            _ => None,
        }
    }

    /// Map a local error to the exception kind sent over the wire.
    pub fn exception_kind(&self) -> ExceptionKind {
        match self {
            Error::Topology(TopologyError::Outdated { current, .. }) => {
                ExceptionKind::OutdatedTopology { current: *current }
            }
            Error::Command(CommandError::UnsupportedVersion { .. }) => {
                ExceptionKind::UnsupportedVersion
            }
            Error::Command(CommandError::UnknownCommand(_)) => ExceptionKind::UnknownCommand,
            Error::Command(CommandError::UnknownFunction(_)) => ExceptionKind::UnknownFunction,
            Error::Command(CommandError::InvalidValue(_)) => ExceptionKind::InvalidValue,
            Error::Timeout => ExceptionKind::Timeout,
            Error::Remote { kind, .. } => *kind,
            _ => ExceptionKind::Internal,
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Network(NetworkError::Serialization(e.to_string()))
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let outdated: Error = TopologyError::Outdated {
            command: 3,
            current: 5,
        }
        .into();
        assert!(outdated.is_retryable());
        assert_eq!(outdated.topology_hint(), Some(5));

        assert!(Error::Suspect(2).is_retryable());
        assert!(!Error::Timeout.is_retryable());

        let rejected: Error = CommandError::UnsupportedVersion {
            command: "ReadOnlyMany",
            required: NodeVersion::SIXTEEN,
            supported: NodeVersion::FIFTEEN,
        }
        .into();
        assert!(!rejected.is_retryable());
        assert_eq!(rejected.exception_kind(), ExceptionKind::UnsupportedVersion);
    }

    #[test]
    fn test_remote_outdated_keeps_hint() {
        let remote = Error::Remote {
            node: 2,
            kind: ExceptionKind::OutdatedTopology { current: 9 },
            message: "stale".into(),
        };
        assert!(remote.is_retryable());
        assert_eq!(remote.topology_hint(), Some(9));
        assert_eq!(
            remote.exception_kind(),
            ExceptionKind::OutdatedTopology { current: 9 }
        );
    }
}
