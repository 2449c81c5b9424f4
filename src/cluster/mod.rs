//! Cluster membership events.

pub mod events;

pub use events::{MemberEvent, MemberEventListener};
