//! Point-to-point delivery of encoded frames.
//!
//! The grid core never opens sockets itself: it hands encoded frames to a
//! [`Transport`] and receives frames through a [`FrameHandler`]. Two transports exist:
//! the TCP one in [`server`](super::server) and the in-process [`InMemoryNetwork`]
//! used to run whole clusters inside one test.

use crate::error::{NetworkError, Result};
use crate::types::NodeId;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use tracing::{debug, trace};

/// Sends frames to other nodes.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send a frame and wait for the reply frame.
    async fn send(&self, target: NodeId, frame: Bytes) -> Result<Bytes>;

    /// Send a frame without waiting for a reply.
    async fn send_one_way(&self, target: NodeId, frame: Bytes) -> Result<()>;
}

/// Receives frames from other nodes.
#[async_trait]
pub trait FrameHandler: Send + Sync + 'static {
    /// Handle one frame. Returns the reply frame, if the message has one.
    async fn handle_frame(&self, frame: Bytes) -> Option<Bytes>;
}

/// An in-process network connecting any number of nodes.
///
/// Each delivery runs in its own task, so a sender that gives up waiting does not
/// cancel the work on the receiving node.
#[derive(Default)]
pub struct InMemoryNetwork {
    endpoints: DashMap<NodeId, Arc<dyn FrameHandler>>,

    /// Nodes whose next reply is lost after the request was handled.
    drop_next_reply: DashSet<NodeId>,
}

impl InMemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a node.
    pub fn register(&self, node_id: NodeId, handler: Arc<dyn FrameHandler>) {
        debug!(node_id, "Endpoint registered");
        self.endpoints.insert(node_id, handler);
    }

    /// Detach a node. Frames to it fail from now on.
    pub fn unregister(&self, node_id: NodeId) {
        debug!(node_id, "Endpoint unregistered");
        self.endpoints.remove(&node_id);
    }

    pub fn is_registered(&self, node_id: NodeId) -> bool {
        self.endpoints.contains_key(&node_id)
    }

    /// Deliver the next request to `node_id` but lose its reply.
    pub fn drop_next_reply(&self, node_id: NodeId) {
        self.drop_next_reply.insert(node_id);
    }

    /// Transport for one attached node.
    pub fn transport(self: &Arc<Self>, local: NodeId) -> Arc<InMemoryTransport> {
        Arc::new(InMemoryTransport {
            local,
            network: Arc::clone(self),
        })
    }

    fn endpoint(&self, target: NodeId) -> Result<Arc<dyn FrameHandler>> {
        self.endpoints
            .get(&target)
            .map(|h| Arc::clone(h.value()))
            .ok_or_else(|| NetworkError::UnknownNode(target).into())
    }
}

/// One node's view of an [`InMemoryNetwork`].
pub struct InMemoryTransport {
    local: NodeId,
    network: Arc<InMemoryNetwork>,
}

impl InMemoryTransport {
    pub fn local_node(&self) -> NodeId {
        self.local
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(&self, target: NodeId, frame: Bytes) -> Result<Bytes> {
        let handler = self.network.endpoint(target)?;
        trace!(from = self.local, to = target, len = frame.len(), "Sending frame");

        let delivery = tokio::spawn(async move { handler.handle_frame(frame).await });
        let reply = delivery
            .await
            .map_err(|e| NetworkError::SendFailed(e.to_string()))?;

        if self.network.drop_next_reply.remove(&target).is_some() {
            debug!(from = self.local, to = target, "Dropping reply");
            return Err(NetworkError::ConnectionClosed.into());
        }
        if !self.network.is_registered(target) {
            return Err(NetworkError::ConnectionClosed.into());
        }
        reply.ok_or_else(|| NetworkError::ConnectionClosed.into())
    }

    async fn send_one_way(&self, target: NodeId, frame: Bytes) -> Result<()> {
        let handler = self.network.endpoint(target)?;
        tokio::spawn(async move {
            handler.handle_frame(frame).await;
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Echo {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl FrameHandler for Echo {
        async fn handle_frame(&self, frame: Bytes) -> Option<Bytes> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Some(frame)
        }
    }

    #[tokio::test]
    async fn test_send_and_reply() {
        let network = InMemoryNetwork::new();
        let echo = Arc::new(Echo {
            calls: AtomicUsize::new(0),
        });
        network.register(2, echo.clone());

        let transport = network.transport(1);
        let reply = transport.send(2, Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(reply.as_ref(), b"ping");
        assert_eq!(echo.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_target() {
        let network = InMemoryNetwork::new();
        let transport = network.transport(1);
        let err = transport.send(9, Bytes::new()).await.unwrap_err();
        assert!(matches!(err, Error::Network(NetworkError::UnknownNode(9))));
    }

    #[tokio::test]
    async fn test_dropped_reply_still_executes() {
        let network = InMemoryNetwork::new();
        let echo = Arc::new(Echo {
            calls: AtomicUsize::new(0),
        });
        network.register(2, echo.clone());
        network.drop_next_reply(2);

        let transport = network.transport(1);
        assert!(transport.send(2, Bytes::new()).await.is_err());
        assert_eq!(echo.calls.load(Ordering::SeqCst), 1);

        // Only the next reply is lost.
        assert!(transport.send(2, Bytes::new()).await.is_ok());
    }
}
