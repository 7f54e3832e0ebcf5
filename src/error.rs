//! Error taxonomy for the interception engine.

use thiserror::Error;

/// Which of the two terminated connections an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leg {
    /// The victim-facing connection (we act as the server).
    Inbound,
    /// The real-server-facing connection (we act as the client).
    Outbound,
}

impl std::fmt::Display for Leg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Leg::Inbound => write!(f, "inbound"),
            Leg::Outbound => write!(f, "outbound"),
        }
    }
}

/// Errors producing or parsing host key material.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("unsupported RSA key length: {0} bits (accepted range {min}..={max})",
        min = crate::identity::MIN_RSA_BITS,
        max = crate::identity::MAX_RSA_BITS)]
    UnsupportedBits(usize),

    #[error("could not parse private key: {0}")]
    Parse(#[source] russh::keys::Error),

    #[error("key generation failed: {0}")]
    Generate(#[source] russh::keys::ssh_key::Error),
}

/// Terminal and per-operation errors of one intercepted session.
///
/// Identity and handshake failures abort a session before any relaying
/// starts. Pairing failures reject a single channel-open and leave the
/// session running. Relay failures tear down one channel pair, and only
/// become the session's terminal error when a top-level leg itself died.
#[derive(Debug, Error)]
pub enum MitmError {
    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error("{leg} handshake failed: {reason}")]
    Handshake { leg: Leg, reason: String },

    #[error("could not mirror channel-open to the real server: {0}")]
    Pairing(#[source] russh::Error),

    #[error("{leg} leg failed: {reason}")]
    Relay { leg: Leg, reason: String },

    #[error("session deadline expired")]
    Timeout,
}

impl MitmError {
    pub fn handshake(leg: Leg, reason: impl std::fmt::Display) -> Self {
        MitmError::Handshake {
            leg,
            reason: reason.to_string(),
        }
    }

    pub fn relay(leg: Leg, reason: impl std::fmt::Display) -> Self {
        MitmError::Relay {
            leg,
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, MitmError>;
