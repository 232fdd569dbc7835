//! Client library for terminservice.
//!
//! Connects to the service over TCP and exposes the broker operations as
//! async methods. Used by the `termin` CLI and by out-of-process front-ends.

pub mod client;

pub use client::{Attachment, BrokerClient};
