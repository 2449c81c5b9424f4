//! Getting commands to the nodes that own their keys.
//!
//! ```text
//! CommandDispatcher ──route──▶ local CommandExecutor
//!        │
//!        └──RpcManager──▶ remote nodes ──▶ ResponseCollector ──▶ result
//! ```
//!
//! A dispatch that fails because the topology moved is retried against the newer one.

pub mod collector;
pub mod dispatcher;
pub mod response;
pub mod rpc;

pub use collector::{
    FirstSuccessCollector, PassthroughMapCollector, ResponseCollector, UnanimousCollector,
};
pub use dispatcher::CommandDispatcher;
pub use response::{NodeStatus, Response, ResponseValue};
pub use rpc::RpcManager;
