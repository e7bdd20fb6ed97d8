//! KMIP client.
//!
//! Speaks just enough KMIP 1.3 to escrow symmetric keys on an external
//! appliance: `Create` a 256-bit AES key and `Get` its material back.
//! Each operation dials a fresh TLS connection; there are no sessions.

mod client;
mod messages;
mod tags;

pub use client::{KmipClient, KmipConfig};
pub use messages::Credential;

use keyward_ttlv::TtlvError;

#[derive(Debug, thiserror::Error)]
pub enum KmipError {
    #[error("KMIP network failure: {0}")]
    Network(String),

    #[error("KMIP TLS failure: {0}")]
    Tls(String),

    /// The appliance answered, but not with the structure this client
    /// understands.
    #[error("KMIP protocol mismatch: {0}")]
    ProtocolMismatch(String),

    /// The appliance processed the request and refused it.
    #[error("KMIP operation failed with status {status}: {text}")]
    Failure { status: u32, text: String },

    #[error("invalid KMIP configuration: {0}")]
    Config(String),
}

impl From<TtlvError> for KmipError {
    fn from(e: TtlvError) -> Self {
        KmipError::ProtocolMismatch(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, KmipError>;
