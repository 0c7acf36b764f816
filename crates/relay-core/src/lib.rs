//! # chat-relay-core
//!
//! Client registry, bus and message routing for the chat relay.
//!
//! - **Registry** - Per-node username/address index
//! - **Bus** - Publish/subscribe fan-out between nodes
//! - **Router** - Admits local messages and delivers bus messages
//! - **Transport** - The boundary a socket layer implements
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐  process  ┌──────────┐  publish  ┌─────────┐
//! │ Transport │──────────▶│  Router  │──────────▶│   Bus   │
//! └───────────┘           └──────────┘           └─────────┘
//!       ▲                   │      ▲                  │
//!       │ send              ▼      │    deliver       │
//!       │             ┌──────────┐ └──────────────────┘
//!       └─────────────│ Registry │
//!                     └──────────┘
//! ```

pub mod bus;
pub mod registry;
pub mod router;
pub mod transport;

pub use bus::{Bus, BusError, Envelope, LocalBus, NodeId, Subscription};
pub use registry::{ClientRecord, ClientRegistry, RegistryError};
pub use router::{Admission, DeliveryReport, Router, RouterConfig, RouterError, RouterHandle};
pub use transport::{MessageHandler, Outbound, TransportError};
