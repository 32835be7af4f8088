//! PeriphHome - ESPHome native API node for Linux single-board computers
//!
//! The daemon presents itself to Home Assistant as an ESPHome device: it
//! speaks the native API (length-prefixed protobuf over TCP), announces
//! itself via mDNS, and exposes sensors, lights and a camera backed by
//! local hardware or fakes.

pub mod api;
pub mod cancel;
pub mod config;
pub mod entity;
pub mod error;
pub mod hostinfo;
pub mod install;
pub mod mdns;
pub mod node;

// Re-export commonly used types
pub use config::Root;
pub use error::{Error, Result};
pub use node::{Node, NodeOptions};

/// Implementation version, advertised over mDNS and in device info.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
