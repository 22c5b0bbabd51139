use std::fmt;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_alpaca_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// A signed rebalance quantity for one symbol. Positive buys, negative sells.
/// Transient: built once per cycle and consumed by order submission.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderIntent {
    pub symbol: String,
    pub qty: f64,
}

impl OrderIntent {
    pub fn side(&self) -> OrderSide {
        if self.qty < 0.0 {
            OrderSide::Sell
        } else {
            OrderSide::Buy
        }
    }
}

/// Append-only record of a successfully submitted order.
#[derive(Debug, Clone)]
pub struct OrderRecord {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: f64,
    pub submitted_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intent_side_follows_sign() {
        let sell = OrderIntent {
            symbol: "BTC/USD".to_string(),
            qty: -0.5,
        };
        let buy = OrderIntent {
            symbol: "ETH/USD".to_string(),
            qty: 1.2,
        };
        assert_eq!(sell.side(), OrderSide::Sell);
        assert_eq!(buy.side(), OrderSide::Buy);
    }
}
