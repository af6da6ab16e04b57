//! Request/reply over a message broker.
//!
//! [`RpcClient`] publishes run requests and matches replies by correlation
//! id; [`RpcServer`] consumes requests one at a time and always replies.

pub mod broker;
pub mod client;
pub mod message;
pub mod server;

pub use broker::{connect, Broker, MemoryBroker, RedisBroker};
pub use client::{RpcClient, DEFAULT_RPC_TIMEOUT};
pub use message::Message;
pub use server::{RequestHandler, RpcServer};
