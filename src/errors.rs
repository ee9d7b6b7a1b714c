use thiserror::Error;

/// Failure taxonomy surfaced by a `VenueAdapter`. Transient variants are
/// retried locally with backoff; permanent ones are not.
#[derive(Debug, Error, Clone)]
pub enum VenueError {
    #[error("invalid size (qty/notional below venue minimum)")]
    InvalidSize,
    #[error("invalid price (fails tick rounding or bounds check)")]
    InvalidPrice,
    #[error("position mode mismatch (hedge vs one-way)")]
    PositionModeMismatch,
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("request timed out")]
    Timeout,
    #[error("venue rejected order: code={code} msg={msg}")]
    VenueRejected { code: i64, msg: String },
    #[error("not found")]
    NotFound,
    #[error("unauthorized")]
    Unauthorized,
    #[error("transport error: {0}")]
    TransportError(String),
}

impl VenueError {
    /// Transient errors are safe to retry with backoff; permanent ones are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            VenueError::RateLimited { .. } | VenueError::Timeout | VenueError::TransportError(_)
        )
    }

    /// Known "price too close to market" rejection codes Bybit-family venues
    /// use for LIMIT orders that would otherwise fill as taker immediately.
    pub fn is_price_too_close_to_market(&self) -> bool {
        matches!(self, VenueError::VenueRejected { code, .. } if matches!(code, 30208 | 110043 | 10001))
    }
}

/// Top-level engine error. Wraps venue/config failures with context and adds
/// invariant-violation and data-inconsistency classes of its own.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("venue error: {0}")]
    Venue(#[from] VenueError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("data inconsistency: {0}")]
    DataInconsistency(String),

    #[error("repository error: {0}")]
    Repository(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required key: {0}")]
    MissingKey(String),
    #[error("type mismatch for key {key}: expected {expected}")]
    TypeMismatch { key: String, expected: &'static str },
}
