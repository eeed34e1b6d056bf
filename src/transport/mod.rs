//! Shared UDP transport for gateway communication.
//!
//! Provides one process-wide socket per listening port with ordered handler
//! dispatch and explicit create-on-first-registration lifecycle.

pub mod socket;

pub use socket::{register, shutdown, unregister, DatagramHandler, UdpChannel, PROTOCOL_PORT};
