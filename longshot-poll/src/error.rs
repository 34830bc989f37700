/// Errors returned by the [`Coordinator`](crate::Coordinator).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PollError {
    /// No resource is registered under this id.
    #[error("resource not found: {0}")]
    NotFound(String),

    /// A caller supplied argument could not be understood.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Parse a caller supplied "last seen" timestamp (epoch milliseconds).
///
/// # Errors
///
/// Returns [`PollError::InvalidArgument`] unless `raw` is a non-negative integer.
pub fn parse_last_seen(raw: &str) -> Result<u64, PollError> {
    raw.trim().parse::<u64>().map_err(|_| {
        PollError::InvalidArgument(format!(
            "last seen must be epoch milliseconds, got {raw:?}"
        ))
    })
}
