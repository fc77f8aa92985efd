//! Core library for the sluice tunnel.
//!
//! sluice establishes a TCP tunnel between two hosts that cannot reach each
//! other directly, by relaying bytes through an HTTP service that pairs a
//! POST request body with a GET response body on the same path.
//!
//! Layering, bottom up:
//! - [`relay::DuplexChannel`] - one upload and one download HTTP exchange
//!   composed into a single bidirectional byte stream
//! - [`crypto::CipherStream`] - optional symmetric encryption of that stream
//! - [`tunnel::MuxSession`] - optional multiplexing of many logical streams
//!   over the one physical channel
//! - [`tunnel::proxy`] - per-connection bidirectional copying
//! - [`tunnel::TunnelManager`] - session orchestration for both roles

pub mod config;
pub mod crypto;
pub mod error;
pub mod relay;
pub mod tunnel;

pub use error::TunnelError;
