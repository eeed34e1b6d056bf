//! Client core for the Mi Home / Lumi gateway UDP protocol.
//!
//! Discovers a gateway and its child devices over a shared UDP channel,
//! tracks device state and liveness in an in-memory registry, issues
//! authenticated write commands encrypted with the rotating session token
//! and the gateway's pre-shared key, and fans every state change out to
//! subscribed observers.
//!
//! The transport is lossy and unordered; the only acknowledgment mechanism
//! is the application-level echo messages of the protocol itself. The
//! gateway's online status is therefore derived from message recency, not
//! from a connection.

pub mod error;
pub mod observer;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod transport;

pub use error::{EncryptionError, GatewayError, NetworkError, Result};
pub use observer::{ObserverRegistry, UpdateObserver};
pub use protocol::{model_to_label, model_to_type, DeviceType};
pub use registry::{DeviceRecord, DeviceRegistry};
pub use session::{GatewayConfig, GatewaySession, GatewayStatus};
pub use transport::{DatagramHandler, UdpChannel, PROTOCOL_PORT};
