use chrono::{DateTime, NaiveDate, Utc};

use crate::error::BrokerError;
use crate::model::bar::Bar;
use crate::model::order::OrderSide;

#[derive(Debug, Clone)]
pub struct BrokerPosition {
    pub symbol: String,
    pub qty: f64,
    pub current_price: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BrokerAccount {
    pub equity: f64,
    pub cash: f64,
}

#[derive(Debug, Clone)]
pub struct BrokerOrder {
    pub id: String,
    pub symbol: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub qty: f64,
    pub client_order_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatusFilter {
    Open,
    All,
}

impl OrderStatusFilter {
    pub fn as_query_str(&self) -> &'static str {
        match self {
            OrderStatusFilter::Open => "open",
            OrderStatusFilter::All => "all",
        }
    }
}

/// Trading-side boundary. The execution engine is generic over this trait so
/// integration tests can drive it against a scripted mock instead of the
/// live REST client.
#[allow(async_fn_in_trait)]
pub trait Broker {
    async fn list_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError>;

    async fn get_account(&self) -> Result<BrokerAccount, BrokerError>;

    async fn list_orders(
        &self,
        filter: OrderStatusFilter,
        limit: usize,
    ) -> Result<Vec<BrokerOrder>, BrokerError>;

    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError>;

    /// Submit a market order. Rejections surface as the structured
    /// `BrokerError` variants, never as message strings.
    async fn submit_order(&self, request: &OrderRequest) -> Result<BrokerOrder, BrokerError>;

    /// Latest trade price for a symbol, `None` when the feed has no recent
    /// trade to report.
    async fn latest_trade_price(&self, symbol: &str) -> Result<Option<f64>, BrokerError>;
}

/// Market-data boundary used by the bar updater and the backfill job.
#[allow(async_fn_in_trait)]
pub trait MarketData {
    /// Hourly bars for every requested symbol over [start, end), ascending
    /// by timestamp.
    async fn get_bars(
        &self,
        symbols: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Bar>, BrokerError>;
}
