use std::fmt::Display;

pub type ChannelResult<T, E = ChannelError> = Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// A sanity check failed: bad paging parameters, a load-count mismatch,
    /// a reliable message on a channel that does not accept them.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// A persistence operation failed. Never retried here; the failed
    /// operation is tagged so callers can tell which store call broke.
    #[error("store operation '{op}' failed: {message}")]
    Store { op: &'static str, message: String },

    /// A boundary operation was called in the wrong channel state.
    #[error("illegal state: {0}")]
    IllegalState(&'static str),
}

impl ChannelError {
    pub fn store(op: &'static str, err: impl Display) -> Self {
        ChannelError::Store {
            op,
            message: err.to_string(),
        }
    }
}
