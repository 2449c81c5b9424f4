//! Messages exchanged between nodes and their wire encoding.
//!
//! Commands are encoded field by field so that peers running different versions can
//! still read them. Control messages carry a single bincode payload in field 1.

use crate::commands::{
    BackupWriteCommand, ClearCrossSiteStatusCommand, Command, CommandKind, Flags, GetCommand,
    Params, ReadOnlyManyCommand, TopologyInfoCommand, TouchCommand, WriteCommand, WriteOp,
};
use crate::dispatch::{Response, ResponseValue};
use crate::error::{CommandError, Error, ExceptionKind, NetworkError, Result};
use crate::network::codec::{FieldReader, FieldWriter, Frame};
use crate::statetransfer::{ChunkAck, StateChunk};
use crate::topology::CacheTopology;
use crate::types::{CacheName, EntryVersion, NodeId, NodeVersion, TopologyId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::time::Duration;
use uuid::Uuid;

pub const RESPONSE_TAG: u16 = 2001;
pub const TOPOLOGY_UPDATE_TAG: u16 = 2002;
pub const REBALANCE_CONFIRM_TAG: u16 = 2003;
pub const STATE_CHUNK_TAG: u16 = 2004;
pub const CHUNK_ACK_TAG: u16 = 2005;

// Header fields shared by all commands.
const F_CACHE: u16 = 1;
const F_FLAGS: u16 = 2;
const F_TOPOLOGY: u16 = 3;

// Control messages.
const F_PAYLOAD: u16 = 1;

/// A new topology pushed by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyUpdate {
    pub cache: CacheName,
    pub topology: CacheTopology,
}

/// A member reporting that it received every segment of a rebalance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebalanceConfirm {
    pub cache: CacheName,
    pub node: NodeId,
    pub topology_id: TopologyId,
}

/// Everything that travels between nodes.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Command(Command),
    Response(Response),
    TopologyUpdate(TopologyUpdate),
    RebalanceConfirm(RebalanceConfirm),
    StateChunk(StateChunk),
    ChunkAck(ChunkAck),
}

impl Message {
    pub fn type_tag(&self) -> u16 {
        match self {
            Message::Command(command) => command.type_tag(),
            Message::Response(_) => RESPONSE_TAG,
            Message::TopologyUpdate(_) => TOPOLOGY_UPDATE_TAG,
            Message::RebalanceConfirm(_) => REBALANCE_CONFIRM_TAG,
            Message::StateChunk(_) => STATE_CHUNK_TAG,
            Message::ChunkAck(_) => CHUNK_ACK_TAG,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Message::Command(command) => command.name(),
            Message::Response(_) => "Response",
            Message::TopologyUpdate(_) => "TopologyUpdate",
            Message::RebalanceConfirm(_) => "RebalanceConfirm",
            Message::StateChunk(_) => "StateChunk",
            Message::ChunkAck(_) => "ChunkAck",
        }
    }
}

/// A decoded message with its sender.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub origin: NodeId,
    pub version: NodeVersion,
    pub message: Message,
}

/// Encodes and decodes messages for one node.
#[derive(Debug, Clone, Copy)]
pub struct MessageCodec {
    local: NodeId,
    version: NodeVersion,
}

impl MessageCodec {
    pub fn new(local: NodeId, version: NodeVersion) -> Self {
        Self { local, version }
    }

    pub fn local_node(&self) -> NodeId {
        self.local
    }

    pub fn version(&self) -> NodeVersion {
        self.version
    }

    /// Encode a message into a frame.
    pub fn encode(&self, message: &Message) -> Result<Bytes> {
        let body = match message {
            Message::Command(command) => encode_command(command)?,
            Message::Response(response) => encode_response(response)?,
            Message::TopologyUpdate(update) => payload(update)?,
            Message::RebalanceConfirm(confirm) => payload(confirm)?,
            Message::StateChunk(chunk) => payload(chunk)?,
            Message::ChunkAck(ack) => payload(ack)?,
        };
        Ok(Frame::new(message.type_tag(), self.version, self.local, body).encode()?)
    }

    /// Decode a frame.
    ///
    /// A command this node's version does not support is rejected before its body
    /// is read.
    pub fn decode(&self, data: Bytes) -> Result<Envelope> {
        let frame = Frame::decode(data)?;
        let message = self.decode_frame(&frame)?;
        Ok(Envelope {
            origin: frame.origin,
            version: frame.version,
            message,
        })
    }

    fn decode_frame(&self, frame: &Frame) -> Result<Message> {
        let fields = FieldReader::parse(frame.body.clone())?;
        let message = match frame.type_tag {
            RESPONSE_TAG => Message::Response(decode_response(&fields)?),
            TOPOLOGY_UPDATE_TAG => Message::TopologyUpdate(fields.serde(F_PAYLOAD)?),
            REBALANCE_CONFIRM_TAG => Message::RebalanceConfirm(fields.serde(F_PAYLOAD)?),
            STATE_CHUNK_TAG => Message::StateChunk(fields.serde(F_PAYLOAD)?),
            CHUNK_ACK_TAG => Message::ChunkAck(fields.serde(F_PAYLOAD)?),
            tag => {
                let kind =
                    CommandKind::from_type_tag(tag).ok_or(CommandError::UnknownCommand(tag))?;
                if kind.supported_since() > self.version {
                    return Err(CommandError::UnsupportedVersion {
                        command: kind.name(),
                        required: kind.supported_since(),
                        supported: self.version,
                    }
                    .into());
                }
                Message::Command(decode_command(kind, &fields)?)
            }
        };
        Ok(message)
    }
}

fn payload<T: Serialize>(value: &T) -> Result<Bytes> {
    let mut writer = FieldWriter::new();
    writer.put_serde(F_PAYLOAD, value)?;
    Ok(writer.finish())
}

fn millis(duration: Option<Duration>) -> Option<u64> {
    duration.map(|d| d.as_millis().min(u128::from(u64::MAX)) as u64)
}

fn encode_command(command: &Command) -> Result<Bytes> {
    let mut w = FieldWriter::new();
    w.put_str(F_CACHE, command.cache_name());
    w.put_u64(F_FLAGS, command.flags().bits());
    if let Some(topology_id) = command.topology_id() {
        w.put_u64(F_TOPOLOGY, topology_id);
    }

    match command {
        Command::Get(c) => {
            w.put_bytes(4, &c.key).put_u64(5, u64::from(c.segment));
        }
        Command::Write(c) => {
            w.put_bytes(4, &c.key)
                .put_u64(5, u64::from(c.segment))
                .put_u64(6, c.op.code())
                .put_bytes(11, c.invocation_id.as_bytes());
            match &c.op {
                WriteOp::Put {
                    value,
                    lifespan,
                    max_idle,
                } => {
                    w.put_bytes(7, value)
                        .put_opt_u64(8, millis(*lifespan))
                        .put_opt_u64(9, millis(*max_idle));
                }
                WriteOp::Remove => {}
                WriteOp::Increment { delta } => {
                    w.put_i64(10, *delta);
                }
            }
        }
        Command::BackupWrite(c) => {
            w.put_bytes(4, &c.key)
                .put_u64(5, u64::from(c.segment))
                .put_opt_bytes(6, c.value.as_deref())
                .put_u64(7, c.version.topology_id)
                .put_u64(8, c.version.sequence)
                .put_opt_u64(9, c.lifespan_ms)
                .put_opt_u64(10, c.max_idle_ms)
                .put_u64(11, c.created_ms)
                .put_bytes(12, c.invocation_id.as_bytes());
            w.put_serde(13, &c.result)?;
        }
        Command::ReadOnlyMany(c) => {
            w.put_list(4, &c.keys)
                .put_str(5, &c.function)
                .put_u64(6, c.params.flags.bits())
                .put_list(7, &c.params.arguments);
        }
        Command::Touch(c) => {
            w.put_bytes(4, &c.key)
                .put_u64(5, u64::from(c.segment))
                .put_bool(6, c.touch_even_if_expired);
        }
        Command::ClearCrossSiteStatus(_) | Command::TopologyInfo(_) => {}
    }
    Ok(w.finish())
}

fn segment(fields: &FieldReader, field: u16) -> Result<u32> {
    let raw = fields.u64(field)?;
    u32::try_from(raw).map_err(|_| {
        Error::Network(NetworkError::Deserialization(format!(
            "segment {} out of range",
            raw
        )))
    })
}

fn invocation_id(fields: &FieldReader, field: u16) -> Result<Uuid> {
    let raw = fields.bytes(field)?;
    Uuid::from_slice(&raw)
        .map_err(|e| Error::Network(NetworkError::Deserialization(e.to_string())))
}

fn decode_command(kind: CommandKind, f: &FieldReader) -> Result<Command> {
    let cache: CacheName = SmolStr::new(f.string(F_CACHE)?);
    let flags = Flags::from_bits(f.u64_or(F_FLAGS, 0)?);
    let topology_id = f.u64_or(F_TOPOLOGY, 0)?;

    let command = match kind {
        CommandKind::Get => Command::Get(GetCommand {
            cache,
            key: f.bytes(4)?,
            segment: segment(f, 5)?,
            flags,
            topology_id,
        }),
        CommandKind::Write => {
            let op = match f.u64(6)? {
                0 => WriteOp::Put {
                    value: f.bytes(7)?,
                    lifespan: f.opt_u64(8)?.map(Duration::from_millis),
                    max_idle: f.opt_u64(9)?.map(Duration::from_millis),
                },
                1 => WriteOp::Remove,
                2 => WriteOp::Increment {
                    delta: f.i64_or(10, 1)?,
                },
                other => {
                    return Err(NetworkError::Deserialization(format!(
                        "unknown write op {}",
                        other
                    ))
                    .into())
                }
            };
            Command::Write(WriteCommand {
                cache,
                key: f.bytes(4)?,
                segment: segment(f, 5)?,
                flags,
                topology_id,
                op,
                invocation_id: invocation_id(f, 11)?,
            })
        }
        CommandKind::BackupWrite => Command::BackupWrite(BackupWriteCommand {
            cache,
            key: f.bytes(4)?,
            segment: segment(f, 5)?,
            topology_id,
            value: f.opt_bytes(6),
            version: EntryVersion::new(f.u64(7)?, f.u64(8)?),
            lifespan_ms: f.opt_u64(9)?,
            max_idle_ms: f.opt_u64(10)?,
            created_ms: f.u64_or(11, 0)?,
            invocation_id: invocation_id(f, 12)?,
            result: f.serde_or_default::<ResponseValue>(13)?,
        }),
        CommandKind::ReadOnlyMany => Command::ReadOnlyMany(ReadOnlyManyCommand {
            cache,
            keys: f.list(4)?,
            function: SmolStr::new(f.string(5)?),
            params: Params {
                flags: Flags::from_bits(f.u64_or(6, 0)?),
                arguments: f.list(7)?,
            },
            flags,
            topology_id,
        }),
        CommandKind::Touch => Command::Touch(TouchCommand {
            cache,
            key: f.bytes(4)?,
            segment: segment(f, 5)?,
            flags,
            topology_id,
            touch_even_if_expired: f.bool_or(6, false)?,
        }),
        CommandKind::ClearCrossSiteStatus => {
            Command::ClearCrossSiteStatus(ClearCrossSiteStatusCommand { cache })
        }
        CommandKind::TopologyInfo => Command::TopologyInfo(TopologyInfoCommand { cache }),
    };
    Ok(command)
}

const RESPONSE_SUCCESS: u64 = 0;
const RESPONSE_EXCEPTION: u64 = 1;
const RESPONSE_SUSPECT: u64 = 2;

fn encode_response(response: &Response) -> Result<Bytes> {
    let mut w = FieldWriter::new();
    match response {
        Response::Success(value) => {
            w.put_u64(1, RESPONSE_SUCCESS);
            w.put_serde(2, value)?;
        }
        Response::Exception { kind, message } => {
            w.put_u64(1, RESPONSE_EXCEPTION);
            w.put_serde(3, kind)?;
            w.put_str(4, message);
        }
        Response::Suspect(node) => {
            w.put_u64(1, RESPONSE_SUSPECT).put_u64(5, *node);
        }
    }
    Ok(w.finish())
}

fn decode_response(f: &FieldReader) -> Result<Response> {
    let response = match f.u64(1)? {
        RESPONSE_SUCCESS => Response::Success(f.serde_or_default(2)?),
        RESPONSE_EXCEPTION => Response::Exception {
            kind: if f.contains(3) {
                f.serde(3)?
            } else {
                ExceptionKind::Internal
            },
            message: f.string_or(4, "")?,
        },
        RESPONSE_SUSPECT => Response::Suspect(f.u64(5)?),
        other => {
            return Err(
                NetworkError::Deserialization(format!("unknown response kind {}", other)).into(),
            )
        }
    };
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partitioning::ConsistentHash;
    use crate::statetransfer::TransferEntry;

    fn codec(version: NodeVersion) -> MessageCodec {
        MessageCodec::new(1, version)
    }

    fn read_many() -> Command {
        Command::ReadOnlyMany(ReadOnlyManyCommand {
            cache: "default".into(),
            keys: vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")],
            function: "value".into(),
            params: Params::new(vec![Bytes::from_static(b"arg")]),
            flags: Flags::SKIP_LOAD,
            topology_id: 6,
        })
    }

    fn roundtrip(message: Message) -> Envelope {
        let codec = codec(NodeVersion::CURRENT);
        let encoded = codec.encode(&message).unwrap();
        let envelope = codec.decode(encoded).unwrap();
        assert_eq!(envelope.origin, 1);
        assert_eq!(envelope.message, message);
        envelope
    }

    #[test]
    fn test_command_variants() {
        roundtrip(Message::Command(read_many()));
        roundtrip(Message::Command(Command::Write(WriteCommand {
            cache: "default".into(),
            key: Bytes::from_static(b"counter"),
            segment: 12,
            flags: Flags::NONE,
            topology_id: 3,
            op: WriteOp::Increment { delta: -4 },
            invocation_id: Uuid::new_v4(),
        })));
        roundtrip(Message::Command(Command::Write(WriteCommand {
            cache: "default".into(),
            key: Bytes::from_static(b"k"),
            segment: 1,
            flags: Flags::IGNORE_RETURN_VALUES,
            topology_id: 3,
            op: WriteOp::Put {
                value: Bytes::from_static(b"v"),
                lifespan: Some(Duration::from_secs(60)),
                max_idle: None,
            },
            invocation_id: Uuid::new_v4(),
        })));
        roundtrip(Message::Command(Command::BackupWrite(BackupWriteCommand {
            cache: "default".into(),
            key: Bytes::from_static(b"k"),
            segment: 1,
            topology_id: 3,
            value: None,
            version: EntryVersion::new(3, 9),
            created_ms: 100,
            lifespan_ms: None,
            max_idle_ms: Some(5),
            invocation_id: Uuid::new_v4(),
            result: ResponseValue::Value(Some(Bytes::from_static(b"prev"))),
        })));
        roundtrip(Message::Command(Command::ClearCrossSiteStatus(
            ClearCrossSiteStatusCommand {
                cache: "default".into(),
            },
        )));
        roundtrip(Message::Command(Command::TopologyInfo(TopologyInfoCommand {
            cache: "default".into(),
        })));
    }

    #[test]
    fn test_control_messages() {
        let topology = CacheTopology::stable(2, 1, 1, vec![1, 2], ConsistentHash::compute(&[1, 2], 2, 8));
        roundtrip(Message::TopologyUpdate(TopologyUpdate {
            cache: "default".into(),
            topology,
        }));
        roundtrip(Message::RebalanceConfirm(RebalanceConfirm {
            cache: "default".into(),
            node: 2,
            topology_id: 4,
        }));

        let chunk = StateChunk {
            cache: "default".into(),
            topology_id: 4,
            segment: 3,
            sequence: 0,
            entries: vec![TransferEntry {
                key: Bytes::from_static(b"k"),
                value: Bytes::from_static(b"v"),
                version: EntryVersion::new(2, 1),
                created_ms: 1,
                last_used_ms: 2,
                lifespan_ms: None,
                max_idle_ms: None,
            }],
            is_final: true,
        };
        roundtrip(Message::ChunkAck(ChunkAck::accepted(&chunk, 1)));
        roundtrip(Message::StateChunk(chunk));
    }

    #[test]
    fn test_responses() {
        roundtrip(Message::Response(Response::Success(ResponseValue::Values(vec![
            Some(Bytes::from_static(b"a")),
            None,
        ]))));
        roundtrip(Message::Response(Response::Exception {
            kind: ExceptionKind::OutdatedTopology { current: 4 },
            message: "outdated".into(),
        }));
        roundtrip(Message::Response(Response::Suspect(3)));
    }

    #[test]
    fn test_newer_command_rejected_by_older_node() {
        let sender = codec(NodeVersion::SIXTEEN);
        let receiver = MessageCodec::new(2, NodeVersion::FIFTEEN);
        let encoded = sender.encode(&Message::Command(read_many())).unwrap();

        match receiver.decode(encoded) {
            Err(Error::Command(CommandError::UnsupportedVersion {
                command,
                required,
                supported,
            })) => {
                assert_eq!(command, "ReadOnlyMany");
                assert_eq!(required, NodeVersion::SIXTEEN);
                assert_eq!(supported, NodeVersion::FIFTEEN);
            }
            other => panic!("expected version rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_tag() {
        let frame = Frame::new(4242, NodeVersion::CURRENT, 9, Bytes::new())
            .encode()
            .unwrap();
        assert!(matches!(
            codec(NodeVersion::CURRENT).decode(frame),
            Err(Error::Command(CommandError::UnknownCommand(4242)))
        ));
    }

    #[test]
    fn test_missing_optional_fields_use_defaults() {
        let mut w = FieldWriter::new();
        w.put_str(F_CACHE, "default")
            .put_bytes(4, b"k")
            .put_u64(5, 2);
        let frame = Frame::new(
            CommandKind::Touch.type_tag(),
            NodeVersion::CURRENT,
            3,
            w.finish(),
        );
        let envelope = codec(NodeVersion::CURRENT)
            .decode(frame.encode().unwrap())
            .unwrap();
        match envelope.message {
            Message::Command(Command::Touch(touch)) => {
                assert_eq!(touch.topology_id, 0);
                assert_eq!(touch.flags, Flags::NONE);
                assert!(!touch.touch_even_if_expired);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
