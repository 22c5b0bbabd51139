use chrono::NaiveDateTime;

/// One aggregated hourly price observation for a single symbol.
/// Timestamps are timezone-naive UTC at the bar open.
#[derive(Debug, Clone, PartialEq)]
pub struct Bar {
    pub timestamp: NaiveDateTime,
    pub symbol: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub trade_count: u64,
    pub vwap: f64,
}
