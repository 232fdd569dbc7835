//! terminservice: a terminal session broker.
//!
//! Spawns processes on pseudo-terminals, keeps their recent output, relays it
//! to any number of attached clients and forwards their input. The
//! [`Broker`] is the in-process API; [`server::Server`] exposes it over TCP.

pub mod attach;
pub mod broker;
pub mod config;
pub mod pty;
pub mod recording;
pub mod registry;
pub mod relay;
pub mod server;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use attach::{AttachmentManager, AttachmentStream};
pub use broker::Broker;
pub use config::{BrokerConfig, ServiceConfig};
pub use pty::{NativePtyBackend, PtyBackend};
pub use registry::SessionRegistry;
