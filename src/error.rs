use std::io;

use thiserror::Error;

use crate::bencode::BencodeError;

/// Errors produced by the routing table, the transaction registry and the engine.
#[derive(Debug, Error)]
pub enum DhtError {
    // Structural errors, unreachable through correct call sequences but reachable through
    // malformed persisted data.
    #[error("bucket is at capacity")]
    CapacityExceeded,

    #[error("identifier is outside the bucket range")]
    OutOfRange,

    #[error("only a full bucket can be split")]
    BucketNotFull,

    #[error("invalid bucket: {0}")]
    InvalidBucket(&'static str),

    // Table errors.
    #[error("node is already present in the routing table")]
    DuplicateNode,

    #[error("no bucket has space for the node")]
    NoSpaceFound,

    // Network facing errors.
    #[error("transport error: {0}")]
    Transport(#[source] io::Error),

    #[error("timeout")]
    Timeout,

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("remote error {code}: {message}")]
    Remote { code: i64, message: String },

    #[error("too many pending transactions")]
    TooManyPending,

    // Codec and persistence.
    #[error("bencode error: {0}")]
    Bencode(#[from] BencodeError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("the dht task has shut down")]
    Shutdown,
}

/// Result type for DHT operations.
pub type Result<T> = std::result::Result<T, DhtError>;
