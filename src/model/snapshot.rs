use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};

/// Live state of one held symbol at snapshot time.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PositionSnapshot {
    pub qty: f64,
    pub price: f64,
    pub market_value: f64,
    /// Fraction of account equity held in this symbol.
    pub weight: f64,
}

/// Immutable view of positions and account taken by one refresh.
/// Each execution cycle works from a fresh snapshot instead of mutating
/// shared state in place.
#[derive(Debug, Clone, Default)]
pub struct PortfolioSnapshot {
    pub equity: f64,
    pub cash: f64,
    pub positions: BTreeMap<String, PositionSnapshot>,
    pub taken_at: DateTime<Utc>,
}

impl PortfolioSnapshot {
    pub fn qty(&self, symbol: &str) -> f64 {
        self.positions.get(symbol).map(|p| p.qty).unwrap_or(0.0)
    }

    pub fn weight(&self, symbol: &str) -> f64 {
        self.positions.get(symbol).map(|p| p.weight).unwrap_or(0.0)
    }

    pub fn price(&self, symbol: &str) -> Option<f64> {
        self.positions
            .get(symbol)
            .map(|p| p.price)
            .filter(|p| *p > 0.0)
    }
}

impl fmt::Display for PortfolioSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Total equity: USD {:.2}; Total cash: USD {:.2}",
            self.equity, self.cash
        )?;
        for (symbol, pos) in &self.positions {
            writeln!(
                f,
                "{}: USD {:.2} ({:.2}%)",
                symbol,
                pos.market_value,
                pos.weight * 100.0
            )?;
        }
        Ok(())
    }
}
