use thiserror::Error;

/// Structured broker failure taxonomy. The REST client classifies rejection
/// bodies into these variants once, so nothing downstream matches on strings.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("insufficient balance (requested: {requested}, available: {available})")]
    InsufficientBalance { requested: f64, available: f64 },

    #[error("order below minimum order size")]
    MinimumOrderSize,

    #[error("no recent trade for {0}")]
    MissingQuote(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("broker API error: {0}")]
    Api(String),
}

#[derive(Error, Debug)]
pub enum EngineError {
    /// Fatal: too many failed external requests inside the sliding window.
    /// Raised after attempting liquidation; never retried.
    #[error("circuit breaker tripped: {failures} failed requests within {window_minutes} minutes")]
    CircuitBreaker { failures: usize, window_minutes: i64 },

    #[error(transparent)]
    Broker(#[from] BrokerError),
}
