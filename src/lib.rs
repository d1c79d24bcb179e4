//! Host-side client for a remote automotive diagnostics adapter: discovery,
//! a framed TCP/UDP transport, ISO-TP transport codec, and a UDS session
//! layer.

pub mod config;
pub mod discovery;
pub mod error;
pub mod frame;
pub mod isotp;
pub mod logged;
pub mod search;
pub mod settings;
pub mod transport;
pub mod uds;
pub mod wire;

pub use config::{DeviceConfig, SessionConfig};
pub use error::{IsoTpError, LogError, SearchError, SessionError, SettingsError, TransportError, WireError};
pub use frame::Frame;
pub use isotp::handler::IsoTpHandler;
pub use isotp::message::IsoTpMessage;
pub use logged::LoggedInterface;
pub use settings::DeviceSettings;
pub use transport::{CanFrameInterface, DeviceHandle};
pub use uds::session::Session;
pub use wire::WireMessage;
