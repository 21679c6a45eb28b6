//! Error taxonomy of the replication protocol.
use thiserror::Error;

/// Rejected credentials. Messages double as the `error` field of replies.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid key")]
    InvalidKey,
    #[error("signature mismatch")]
    SignatureMismatch,
    #[error("domain mismatch")]
    DomainMismatch,
    #[error("stale payload")]
    StalePayload,
}

/// Body that is not a usable sync payload.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("payload has no post")]
    MissingPost,
    #[error("invalid payload: {0}")]
    Invalid(&'static str),
}

/// Why a delivery to one target failed.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("invalid target url: {0}")]
    InvalidTarget(String),
    #[error("{0}")]
    Transport(#[from] reqwest::Error),
    #[error("HTTP {status}: {body}")]
    Upstream { status: u16, body: String },
}
