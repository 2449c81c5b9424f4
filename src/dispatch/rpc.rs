//! Remote invocation on top of a [`Transport`].

use crate::commands::Command;
use crate::dispatch::collector::ResponseCollector;
use crate::dispatch::response::Response;
use crate::error::{Error, ExceptionKind, NetworkError, Result};
use crate::network::{Message, MessageCodec, Transport};
use crate::types::{NodeId, NodeVersion};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

/// Sends messages and commands to other nodes and gathers their replies.
pub struct RpcManager {
    codec: MessageCodec,
    transport: Arc<dyn Transport>,
    timeout: Duration,
}

async fn request(
    transport: Arc<dyn Transport>,
    codec: MessageCodec,
    target: NodeId,
    frame: Bytes,
    timeout: Duration,
) -> Result<Message> {
    let reply = tokio::time::timeout(timeout, transport.send(target, frame)).await??;
    Ok(codec.decode(reply)?.message)
}

impl RpcManager {
    pub fn new(
        local: NodeId,
        version: NodeVersion,
        transport: Arc<dyn Transport>,
        timeout: Duration,
    ) -> Self {
        Self {
            codec: MessageCodec::new(local, version),
            transport,
            timeout,
        }
    }

    pub fn local_node(&self) -> NodeId {
        self.codec.local_node()
    }

    pub fn codec(&self) -> &MessageCodec {
        &self.codec
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send a message and wait for the reply.
    pub async fn send_message(&self, target: NodeId, message: &Message) -> Result<Message> {
        let frame = self.codec.encode(message)?;
        trace!(target, message = message.name(), "Sending message");
        request(
            Arc::clone(&self.transport),
            self.codec,
            target,
            frame,
            self.timeout,
        )
        .await
    }

    /// Send a message without waiting for a reply.
    pub async fn send_one_way(&self, target: NodeId, message: &Message) -> Result<()> {
        let frame = self.codec.encode(message)?;
        self.transport.send_one_way(target, frame).await
    }

    /// Send a message to every target without waiting for replies.
    ///
    /// Returns how many targets the message was handed to.
    pub async fn broadcast_one_way(&self, targets: &[NodeId], message: &Message) -> Result<usize> {
        let frame = self.codec.encode(message)?;
        let mut delivered = 0;
        for &target in targets {
            match self.transport.send_one_way(target, frame.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => debug!(target, error = %e, "One-way send failed"),
            }
        }
        Ok(delivered)
    }

    /// Send a message to every target concurrently and wait for every reply.
    pub async fn broadcast(
        &self,
        targets: &[NodeId],
        message: &Message,
    ) -> Result<BTreeMap<NodeId, Result<Message>>> {
        let frame = self.codec.encode(message)?;
        let mut set = JoinSet::new();
        for &target in targets {
            let transport = Arc::clone(&self.transport);
            let codec = self.codec;
            let frame = frame.clone();
            let timeout = self.timeout;
            set.spawn(async move {
                (
                    target,
                    request(transport, codec, target, frame, timeout).await,
                )
            });
        }

        let mut replies = BTreeMap::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((target, reply)) => {
                    replies.insert(target, reply);
                }
                Err(e) => warn!(error = %e, "Broadcast task failed"),
            }
        }
        Ok(replies)
    }

    /// Invoke a command on every target, folding replies through `collector`.
    pub async fn invoke_command<C: ResponseCollector>(
        &self,
        targets: &[NodeId],
        command: &Command,
        collector: C,
    ) -> Result<C::Output> {
        self.invoke_command_seeded(targets, command, collector, Vec::new())
            .await
    }

    /// Like [`invoke_command`](Self::invoke_command), with responses already obtained
    /// locally fed to the collector first.
    ///
    /// As soon as the collector produces a result, replies still in flight are
    /// abandoned.
    pub async fn invoke_command_seeded<C: ResponseCollector>(
        &self,
        targets: &[NodeId],
        command: &Command,
        mut collector: C,
        seed: Vec<(NodeId, Response)>,
    ) -> Result<C::Output> {
        for (sender, response) in seed {
            if let Some(result) = collector.add_response(sender, response) {
                return result;
            }
        }
        if targets.is_empty() {
            return collector.finish();
        }

        let frame = self.codec.encode(&Message::Command(command.clone()))?;
        let mut set = JoinSet::new();
        for &target in targets {
            let transport = Arc::clone(&self.transport);
            let codec = self.codec;
            let frame = frame.clone();
            let timeout = self.timeout;
            set.spawn(async move {
                let reply = request(transport, codec, target, frame, timeout).await;
                (target, Self::to_response(target, reply))
            });
        }

        while let Some(joined) = set.join_next().await {
            let (sender, response) =
                joined.map_err(|e| Error::Internal(format!("invocation task failed: {}", e)))?;
            trace!(sender, success = response.is_success(), "Response received");
            if let Some(result) = collector.add_response(sender, response) {
                set.abort_all();
                return result;
            }
        }
        collector.finish()
    }

    fn to_response(target: NodeId, reply: Result<Message>) -> Response {
        match reply {
            Ok(Message::Response(response)) => response,
            Ok(other) => Response::Exception {
                kind: ExceptionKind::Internal,
                message: format!("unexpected reply {}", other.name()),
            },
            Err(Error::Timeout) => Response::Exception {
                kind: ExceptionKind::Timeout,
                message: format!("node {} timed out", target),
            },
            Err(Error::Network(NetworkError::Deserialization(reason))) => Response::Exception {
                kind: ExceptionKind::Internal,
                message: reason,
            },
            Err(e) => {
                debug!(target, error = %e, "Target suspected");
                Response::Suspect(target)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{Flags, GetCommand};
    use crate::dispatch::collector::{FirstSuccessCollector, UnanimousCollector};
    use crate::dispatch::response::ResponseValue;
    use crate::network::{FrameHandler, InMemoryNetwork};
    use async_trait::async_trait;

    /// Answers every command with a fixed value, or never answers.
    struct FixedNode {
        codec: MessageCodec,
        value: Option<&'static [u8]>,
    }

    #[async_trait]
    impl FrameHandler for FixedNode {
        async fn handle_frame(&self, frame: Bytes) -> Option<Bytes> {
            self.codec.decode(frame).ok()?;
            let Some(value) = self.value else {
                tokio::time::sleep(Duration::from_secs(60)).await;
                return None;
            };
            let response = Response::Success(ResponseValue::Value(Some(Bytes::from_static(value))));
            self.codec.encode(&Message::Response(response)).ok()
        }
    }

    fn get() -> Command {
        Command::Get(GetCommand {
            cache: "default".into(),
            key: Bytes::from_static(b"k"),
            segment: 0,
            flags: Flags::NONE,
            topology_id: 1,
        })
    }

    fn setup(nodes: &[(NodeId, Option<&'static [u8]>)]) -> RpcManager {
        let network = InMemoryNetwork::new();
        for &(node, value) in nodes {
            network.register(
                node,
                Arc::new(FixedNode {
                    codec: MessageCodec::new(node, NodeVersion::CURRENT),
                    value,
                }),
            );
        }
        RpcManager::new(
            1,
            NodeVersion::CURRENT,
            network.transport(1),
            Duration::from_millis(200),
        )
    }

    #[tokio::test]
    async fn test_unanimous_over_network() {
        let rpc = setup(&[(2, Some(b"a")), (3, Some(b"b"))]);
        let values = rpc
            .invoke_command(&[2, 3], &get(), UnanimousCollector::new())
            .await
            .unwrap();
        assert_eq!(values.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_target_is_suspected() {
        let rpc = setup(&[(2, Some(b"a"))]);
        let err = rpc
            .invoke_command(&[2, 9], &get(), UnanimousCollector::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Suspect(9)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_first_success_does_not_wait_for_slow_target() {
        let rpc = setup(&[(2, None), (3, Some(b"fast"))]);
        let value = rpc
            .invoke_command(&[2, 3], &get(), FirstSuccessCollector::new())
            .await
            .unwrap();
        assert_eq!(value.into_value(), Some(Bytes::from_static(b"fast")));
    }

    #[tokio::test]
    async fn test_seeded_responses_count() {
        let rpc = setup(&[]);
        let values = rpc
            .invoke_command_seeded(
                &[],
                &get(),
                UnanimousCollector::new(),
                vec![(1, Response::Success(ResponseValue::Bool(true)))],
            )
            .await
            .unwrap();
        assert_eq!(values[&1], ResponseValue::Bool(true));
    }

    #[tokio::test]
    async fn test_timeout_becomes_exception() {
        let rpc = setup(&[(2, None)]);
        let err = rpc
            .invoke_command(&[2], &get(), UnanimousCollector::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Remote {
                kind: ExceptionKind::Timeout,
                ..
            }
        ));
    }
}
