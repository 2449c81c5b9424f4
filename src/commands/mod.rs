//! Commands exchanged between grid nodes.
//!
//! The command set is closed: every operation a node can ask another node to perform
//! is a variant of [`Command`]. Each variant carries the cache it targets, the flags
//! it was issued with and the topology id it was routed against, and declares:
//!
//! - the wire type tag used to marshal it
//! - the protocol version it was introduced in
//! - how much of the existing entry it needs loaded
//! - whether the caller waits for a return value
//!
//! ```text
//!  dispatcher ──Command──▶ codec ──frame──▶ transport ──▶ codec ──▶ CommandExecutor
//!      ▲                                                                  │
//!      └──────────────────────────── Response ◀───────────────────────────┘
//! ```

pub mod executor;
pub mod functional;

pub use executor::{CacheLoader, CommandExecutor};
pub use functional::{FunctionRegistry, Params, ReadEntryView, ReadFunction};

use crate::dispatch::ResponseValue;
use crate::types::{CacheName, EntryVersion, NodeVersion, Segment, TopologyId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Bit set of per-invocation flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Flags(u64);

impl Flags {
    pub const NONE: Flags = Flags(0);
    /// Execute on the local node only, without topology checks or routing.
    pub const CACHE_MODE_LOCAL: Flags = Flags(1);
    /// The caller does not need the previous value.
    pub const IGNORE_RETURN_VALUES: Flags = Flags(1 << 1);
    /// Never consult the cache loader.
    pub const SKIP_LOAD: Flags = Flags(1 << 2);
    /// Read the local copy even while its segment is still being transferred.
    pub const SKIP_TRANSFER_WAIT: Flags = Flags(1 << 3);

    pub const fn from_bits(bits: u64) -> Self {
        Flags(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn with(self, other: Flags) -> Self {
        Flags(self.0 | other.0)
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        self.with(rhs)
    }
}

/// How much of the existing entry a command needs before it executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadType {
    /// Nothing: the command does not look at the previous value.
    DontLoad,
    /// Load on any owner.
    Owner,
    /// Load on the primary owner only.
    Primary,
}

/// Fieldless discriminant of [`Command`], used before a body is decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Get,
    Write,
    BackupWrite,
    ReadOnlyMany,
    Touch,
    ClearCrossSiteStatus,
    TopologyInfo,
}

impl CommandKind {
    pub const ALL: [CommandKind; 7] = [
        CommandKind::Get,
        CommandKind::Write,
        CommandKind::BackupWrite,
        CommandKind::ReadOnlyMany,
        CommandKind::Touch,
        CommandKind::ClearCrossSiteStatus,
        CommandKind::TopologyInfo,
    ];

    /// Wire type tag.
    pub const fn type_tag(self) -> u16 {
        match self {
            CommandKind::Get => 1001,
            CommandKind::Write => 1002,
            CommandKind::BackupWrite => 1003,
            CommandKind::ReadOnlyMany => 1004,
            CommandKind::Touch => 1005,
            CommandKind::ClearCrossSiteStatus => 1006,
            CommandKind::TopologyInfo => 1007,
        }
    }

    pub fn from_type_tag(tag: u16) -> Option<CommandKind> {
        CommandKind::ALL.into_iter().find(|k| k.type_tag() == tag)
    }

    /// First protocol version that understands this command.
    pub const fn supported_since(self) -> NodeVersion {
        match self {
            CommandKind::Get
            | CommandKind::Write
            | CommandKind::BackupWrite
            | CommandKind::TopologyInfo => NodeVersion::FOURTEEN,
            CommandKind::Touch => NodeVersion::FIFTEEN,
            CommandKind::ReadOnlyMany | CommandKind::ClearCrossSiteStatus => {
                NodeVersion::SIXTEEN
            }
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            CommandKind::Get => "Get",
            CommandKind::Write => "Write",
            CommandKind::BackupWrite => "BackupWrite",
            CommandKind::ReadOnlyMany => "ReadOnlyMany",
            CommandKind::Touch => "Touch",
            CommandKind::ClearCrossSiteStatus => "ClearCrossSiteStatus",
            CommandKind::TopologyInfo => "TopologyInfo",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Read a single key.
#[derive(Debug, Clone, PartialEq)]
pub struct GetCommand {
    pub cache: CacheName,
    pub key: Bytes,
    pub segment: Segment,
    pub flags: Flags,
    pub topology_id: TopologyId,
}

/// Mutation applied by a [`WriteCommand`].
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Store a value, returning the previous one.
    Put {
        value: Bytes,
        lifespan: Option<Duration>,
        max_idle: Option<Duration>,
    },
    /// Remove a value, returning the previous one.
    Remove,
    /// Add to a big-endian `i64` counter, returning the new value.
    Increment { delta: i64 },
}

impl WriteOp {
    pub(crate) const fn code(&self) -> u64 {
        match self {
            WriteOp::Put { .. } => 0,
            WriteOp::Remove => 1,
            WriteOp::Increment { .. } => 2,
        }
    }
}

/// Write a single key through its primary owner.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteCommand {
    pub cache: CacheName,
    pub key: Bytes,
    pub segment: Segment,
    pub flags: Flags,
    pub topology_id: TopologyId,
    pub op: WriteOp,
    /// Identifies the invocation across retries.
    pub invocation_id: Uuid,
}

impl WriteCommand {
    /// A put whose previous value nobody reads needs nothing loaded.
    pub fn load_type(&self) -> LoadType {
        match self.op {
            WriteOp::Put { .. } if self.flags.contains(Flags::IGNORE_RETURN_VALUES) => {
                LoadType::DontLoad
            }
            _ => LoadType::Primary,
        }
    }
}

/// Replicate a versioned write from the primary to the other write owners.
#[derive(Debug, Clone, PartialEq)]
pub struct BackupWriteCommand {
    pub cache: CacheName,
    pub key: Bytes,
    pub segment: Segment,
    pub topology_id: TopologyId,
    /// `None` replicates a removal.
    pub value: Option<Bytes>,
    pub version: EntryVersion,
    pub created_ms: u64,
    pub lifespan_ms: Option<u64>,
    pub max_idle_ms: Option<u64>,
    pub invocation_id: Uuid,
    /// Result the primary returned, remembered for retried invocations.
    pub result: ResponseValue,
}

/// Apply a named read-only function to many keys.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadOnlyManyCommand {
    pub cache: CacheName,
    pub keys: Vec<Bytes>,
    pub function: SmolStr,
    pub params: Params,
    pub flags: Flags,
    pub topology_id: TopologyId,
}

impl ReadOnlyManyCommand {
    /// Same command restricted to a subset of keys.
    pub fn with_keys(&self, keys: Vec<Bytes>) -> Self {
        Self {
            keys,
            ..self.clone()
        }
    }
}

/// Refresh the last-access time of an entry on every write owner.
#[derive(Debug, Clone, PartialEq)]
pub struct TouchCommand {
    pub cache: CacheName,
    pub key: Bytes,
    pub segment: Segment,
    pub flags: Flags,
    pub topology_id: TopologyId,
    /// Touch entries whose max-idle has already elapsed.
    pub touch_even_if_expired: bool,
}

/// Reset cross-site push status on every node.
#[derive(Debug, Clone, PartialEq)]
pub struct ClearCrossSiteStatusCommand {
    pub cache: CacheName,
}

/// Ask a node for its view of the topology and its transfer state.
#[derive(Debug, Clone, PartialEq)]
pub struct TopologyInfoCommand {
    pub cache: CacheName,
}

/// A command that can be sent to, and executed on, a grid node.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Get(GetCommand),
    Write(WriteCommand),
    BackupWrite(BackupWriteCommand),
    ReadOnlyMany(ReadOnlyManyCommand),
    Touch(TouchCommand),
    ClearCrossSiteStatus(ClearCrossSiteStatusCommand),
    TopologyInfo(TopologyInfoCommand),
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Get(_) => CommandKind::Get,
            Command::Write(_) => CommandKind::Write,
            Command::BackupWrite(_) => CommandKind::BackupWrite,
            Command::ReadOnlyMany(_) => CommandKind::ReadOnlyMany,
            Command::Touch(_) => CommandKind::Touch,
            Command::ClearCrossSiteStatus(_) => CommandKind::ClearCrossSiteStatus,
            Command::TopologyInfo(_) => CommandKind::TopologyInfo,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().name()
    }

    pub fn type_tag(&self) -> u16 {
        self.kind().type_tag()
    }

    pub fn supported_since(&self) -> NodeVersion {
        self.kind().supported_since()
    }

    pub fn cache_name(&self) -> &CacheName {
        match self {
            Command::Get(c) => &c.cache,
            Command::Write(c) => &c.cache,
            Command::BackupWrite(c) => &c.cache,
            Command::ReadOnlyMany(c) => &c.cache,
            Command::Touch(c) => &c.cache,
            Command::ClearCrossSiteStatus(c) => &c.cache,
            Command::TopologyInfo(c) => &c.cache,
        }
    }

    pub fn flags(&self) -> Flags {
        match self {
            Command::Get(c) => c.flags,
            Command::Write(c) => c.flags,
            Command::ReadOnlyMany(c) => c.flags,
            Command::Touch(c) => c.flags,
            Command::BackupWrite(_)
            | Command::ClearCrossSiteStatus(_)
            | Command::TopologyInfo(_) => Flags::NONE,
        }
    }

    /// Topology the command was routed against. `None` for commands that are not
    /// topology-aware.
    pub fn topology_id(&self) -> Option<TopologyId> {
        match self {
            Command::Get(c) => Some(c.topology_id),
            Command::Write(c) => Some(c.topology_id),
            Command::BackupWrite(c) => Some(c.topology_id),
            Command::ReadOnlyMany(c) => Some(c.topology_id),
            Command::Touch(c) => Some(c.topology_id),
            Command::ClearCrossSiteStatus(_) | Command::TopologyInfo(_) => None,
        }
    }

    /// Re-stamp the topology id before a retry.
    ///
    /// The only mutation a command allows after construction.
    pub fn set_topology_id(&mut self, topology_id: TopologyId) {
        match self {
            Command::Get(c) => c.topology_id = topology_id,
            Command::Write(c) => c.topology_id = topology_id,
            Command::BackupWrite(c) => c.topology_id = topology_id,
            Command::ReadOnlyMany(c) => c.topology_id = topology_id,
            Command::Touch(c) => c.topology_id = topology_id,
            Command::ClearCrossSiteStatus(_) | Command::TopologyInfo(_) => {}
        }
    }

    /// Segment of a single-key command.
    pub fn segment(&self) -> Option<Segment> {
        match self {
            Command::Get(c) => Some(c.segment),
            Command::Write(c) => Some(c.segment),
            Command::BackupWrite(c) => Some(c.segment),
            Command::Touch(c) => Some(c.segment),
            Command::ReadOnlyMany(_)
            | Command::ClearCrossSiteStatus(_)
            | Command::TopologyInfo(_) => None,
        }
    }

    pub fn load_type(&self) -> LoadType {
        match self {
            Command::Get(_) | Command::ReadOnlyMany(_) => LoadType::Owner,
            Command::Write(c) => c.load_type(),
            Command::BackupWrite(_)
            | Command::Touch(_)
            | Command::ClearCrossSiteStatus(_)
            | Command::TopologyInfo(_) => LoadType::DontLoad,
        }
    }

    /// Whether the caller waits for a response at all.
    pub fn is_return_value_expected(&self) -> bool {
        !matches!(self, Command::ClearCrossSiteStatus(_))
    }

    /// Whether a previous-value read may be skipped for this command.
    pub fn skips_load(&self) -> bool {
        self.load_type() == LoadType::DontLoad || self.flags().contains(Flags::SKIP_LOAD)
    }
}
