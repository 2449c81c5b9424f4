//! Network communication layer.
//!
//! ```text
//! Message ──MessageCodec──▶ frame bytes ──Transport──▶ peer FrameHandler
//! ```

pub mod codec;
pub mod message;
pub mod server;
pub mod transport;

pub use codec::{FieldReader, FieldWriter, Frame};
pub use message::{Envelope, Message, MessageCodec, RebalanceConfirm, TopologyUpdate};
pub use server::{NetworkServer, TcpTransport};
pub use transport::{FrameHandler, InMemoryNetwork, InMemoryTransport, Transport};
