//! # chat-relay-transport
//!
//! Network plumbing for the chat relay.
//!
//! - **TCP server** - Accepts chat clients and drives a [`MessageHandler`]
//! - **TCP bus** - A [`Bus`] link to a shared hub, so nodes in separate
//!   processes see each other's traffic
//! - **Hub** - The fan-out point the bus links connect to
//!
//! ```rust,ignore
//! use chat_relay_transport::{ConnectionTable, TcpConfig, TcpServer};
//!
//! let connections = Arc::new(ConnectionTable::new());
//! let router = Arc::new(Router::new(registry, bus, connections.clone()));
//! let server = TcpServer::bind(TcpConfig::default(), connections, router).await?;
//! server.run_until(shutdown).await?;
//! ```
//!
//! [`MessageHandler`]: chat_relay_core::MessageHandler
//! [`Bus`]: chat_relay_core::Bus

pub mod bus;
pub mod hub;
pub mod tcp;

pub use bus::{TcpBus, TcpBusConfig, MAX_BUS_FRAME};
pub use hub::BusHub;
pub use tcp::{ConnectionTable, TcpConfig, TcpServer};
