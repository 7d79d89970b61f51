//! Error taxonomy for the frame ring

use thiserror::Error;

/// Fatal errors from buffer construction and `put`
#[derive(Debug, Error)]
pub enum BufferError {
    /// Frame geometry that cannot back a slot: a zero dimension, an
    /// overflowing slot size, or a `put` whose geometry does not match the
    /// buffer it targets. A geometry change requires building a new buffer.
    #[error("invalid frame geometry: {0}")]
    InvalidShape(String),

    /// Shared segment could not be created, attached, or validated.
    /// Fatal to the attaching handle, surfaced at attach time.
    #[error("shared segment unavailable: {0}")]
    SharedResourceUnavailable(String),
}

/// Transient condition on retrieval: no frame available
///
/// Expected and recoverable. Callers poll in their own loop or wait with
/// `get_timeout`, which returns the same condition on expiry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TryGetError {
    #[error("no frame available")]
    Empty,
}

impl From<std::io::Error> for BufferError {
    fn from(err: std::io::Error) -> Self {
        BufferError::SharedResourceUnavailable(err.to_string())
    }
}

impl From<nix::Error> for BufferError {
    fn from(err: nix::Error) -> Self {
        BufferError::SharedResourceUnavailable(err.to_string())
    }
}
