//! Network Module Implementation
//!
//! This module provides the transport-facing pieces of the framework: frame
//! parsing, the inbound read loop, and the per-connection handle shared
//! between the core and the embedding application.
//!
//! # Components
//!
//! - `MessageFrame`: length-prefixed framing of opaque message payloads
//! - `Connection`: read half of a socket plus its decode buffer
//! - `ConnectionHandle`: write half, lifecycle state, and metadata store
//! - `MetaValue`: tagged value type for per-connection metadata

pub use connection::Connection;
pub use frame::MessageFrame;
pub use handle::{ConnectionHandle, HandleState};
pub use metadata::MetaValue;

mod connection;
mod frame;
mod handle;
mod metadata;
