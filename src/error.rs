//! Error types for PeriphHome
//!
//! # Error Recovery Strategies
//!
//! Different error types require different recovery approaches:
//!
//! ## Fatal To The Connection
//!
//! - **`Io`** / **`Disconnected`**: socket failure or orderly close. The
//!   connection handler exits; the rest of the node is unaffected.
//!
//! - **`Protocol`** / **`Oversize`** / **`UnsupportedMessage`** / **`Decode`**:
//!   the peer broke the framing contract. The connection is closed without a
//!   diagnostic frame; clients reconnect and renegotiate.
//!
//! - **`AuthFailed`**: the password in `ConnectRequest` did not match. The
//!   rejection response is sent first, then the connection is closed.
//!
//! ## Log and Continue
//!
//! - **`UnknownKey`**: a command addressed an entity that does not exist.
//!   Logged; the connection stays up.
//!
//! - **`NoSuchCapability`**: a command of one kind was sent to an entity of
//!   another (e.g. a switch command to a light). Logged; connection stays up.
//!
//! - **`NotImplemented`**: the feature behind the message is absent
//!   (service execution). Logged; connection stays up.
//!
//! ## Fix and Restart
//!
//! - **`Config`** / **`Yaml`**: the configuration file is invalid. Fix the
//!   file and restart.
//!
//! - **`BadName`**: an entity name produced an empty object id. Node
//!   construction aborts.

use thiserror::Error;

/// Errors that can occur in PeriphHome
///
/// See module-level documentation for recovery strategies.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed by peer")]
    Disconnected,

    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    #[error("frame too large: {0} bytes")]
    Oversize(u64),

    #[error("unsupported message id {0}")]
    UnsupportedMessage(u32),

    #[error("message decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("invalid password")]
    AuthFailed,

    #[error("no usable object id can be derived from name {0:?}")]
    BadName(String),

    #[error("unknown entity key {0:#010x}")]
    UnknownKey(u32),

    #[error("{name} is no {kind}")]
    NoSuchCapability { name: String, kind: &'static str },

    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    #[error("config error: {0}")]
    Config(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the error must tear down the connection it occurred on.
    ///
    /// Command-level failures (unknown key, wrong entity kind, unimplemented
    /// feature) are reported in the log and the connection keeps serving.
    /// Everything at the framing or auth layer is fatal to the connection.
    pub fn closes_connection(&self) -> bool {
        !matches!(
            self,
            Error::UnknownKey(_) | Error::NoSuchCapability { .. } | Error::NotImplemented(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
