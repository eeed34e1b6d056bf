//! Protocol layer for gateway communication.
//!
//! This module handles building command strings, encrypting the session
//! token for authenticated writes, and mapping model strings to device types.

pub mod commands;
pub mod crypto;
pub mod model;

pub use commands::{build_command, build_write_data, Commands};
pub use crypto::encrypt;
pub use model::{model_to_label, model_to_type, DeviceType};
