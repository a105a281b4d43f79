//! The connection: address parsing, configuration, the per-connection task
//! queue, the transport, and the engine with its two threads.

mod address;
mod configuration;
mod connection_core;
mod task_queue;
mod tcp_client;

pub use address::{Address, AddressList, TlsOptions};
pub use configuration::FeedConfiguration;
pub use connection_core::Connection;

pub(crate) use connection_core::ConnectionCore;
pub(crate) use task_queue::{TaskCommand, TaskQueue, TaskResult};
pub(crate) use tcp_client::TcpClient;
