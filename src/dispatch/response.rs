//! Responses to remote commands.

use crate::error::{Error, ExceptionKind, Result};
use crate::types::{NodeId, TopologyId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Value returned by a successful command.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ResponseValue {
    /// The command returns nothing.
    #[default]
    Empty,
    /// A single, possibly absent, value.
    Value(Option<Bytes>),
    /// A boolean outcome.
    Bool(bool),
    /// One result per key, in key order.
    Values(Vec<Option<Bytes>>),
    /// A node's topology and transfer state.
    Status(NodeStatus),
}

/// What one node reports about its topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub topology_id: TopologyId,
    pub rebalancing: bool,
    /// Segments this node is still receiving.
    pub segments_in_transfer: u32,
    pub initial_transfer_done: bool,
}

impl ResponseValue {
    pub fn into_value(self) -> Option<Bytes> {
        match self {
            ResponseValue::Value(value) => value,
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ResponseValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_status(&self) -> Option<NodeStatus> {
        match self {
            ResponseValue::Status(status) => Some(*status),
            _ => None,
        }
    }

    pub fn into_values(self) -> Vec<Option<Bytes>> {
        match self {
            ResponseValue::Values(values) => values,
            _ => Vec::new(),
        }
    }
}

/// One node's answer to a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// The command succeeded.
    Success(ResponseValue),
    /// The command failed on the target.
    Exception {
        kind: ExceptionKind,
        message: String,
    },
    /// The target left or became unreachable before answering.
    Suspect(NodeId),
}

impl Response {
    /// Build a response from a local execution result.
    pub fn from_result(result: Result<ResponseValue>) -> Self {
        match result {
            Ok(value) => Response::Success(value),
            Err(Error::Suspect(node)) => Response::Suspect(node),
            Err(e) => Response::Exception {
                kind: e.exception_kind(),
                message: e.to_string(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Response::Success(_))
    }

    /// Turn the response of `sender` into a result.
    ///
    /// Exceptions come back as [`Error::Remote`], keeping the kind so that retries
    /// still recognise an outdated topology.
    pub fn into_result(self, sender: NodeId) -> Result<ResponseValue> {
        match self {
            Response::Success(value) => Ok(value),
            Response::Exception { kind, message } => Err(Error::Remote {
                node: sender,
                kind,
                message,
            }),
            Response::Suspect(node) => Err(Error::Suspect(node)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TopologyError;

    #[test]
    fn test_from_result() {
        let ok = Response::from_result(Ok(ResponseValue::Bool(true)));
        assert_eq!(ok, Response::Success(ResponseValue::Bool(true)));

        let outdated = Response::from_result(Err(TopologyError::Outdated {
            command: 1,
            current: 2,
        }
        .into()));
        assert!(matches!(
            outdated,
            Response::Exception {
                kind: ExceptionKind::OutdatedTopology { current: 2 },
                ..
            }
        ));

        assert_eq!(
            Response::from_result(Err(Error::Suspect(4))),
            Response::Suspect(4)
        );
    }

    #[test]
    fn test_into_result_keeps_retry_information() {
        let response = Response::Exception {
            kind: ExceptionKind::OutdatedTopology { current: 7 },
            message: "outdated".into(),
        };
        let err = response.into_result(3).unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.topology_hint(), Some(7));

        assert!(Response::Suspect(3).into_result(3).unwrap_err().is_retryable());
    }

    #[test]
    fn test_value_accessors() {
        assert_eq!(
            ResponseValue::Value(Some(Bytes::from_static(b"v"))).into_value(),
            Some(Bytes::from_static(b"v"))
        );
        assert_eq!(ResponseValue::Empty.into_value(), None);
        assert_eq!(ResponseValue::Bool(false).as_bool(), Some(false));
        assert!(ResponseValue::Empty.into_values().is_empty());
    }
}
