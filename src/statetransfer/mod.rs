//! State transfer between segment owners, and cross-site push status.

pub mod manager;
pub mod task;
pub mod transfer;
pub mod xsite;

pub use manager::StateTransferManager;
pub use task::{InboundTransfer, OutboundTransfer, TransferProgress};
pub use transfer::{ChunkAck, StateChunk, TransferEntry};
pub use xsite::{CrossSiteStateTransfer, PushStatus};
