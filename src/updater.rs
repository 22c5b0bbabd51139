use anyhow::Result;
use chrono::{Duration, Months, NaiveDate, NaiveDateTime, Utc};

use crate::broker::MarketData;
use crate::features::PriceSeries;
use crate::store::BarStore;

/// Pulls fresh bars from the market-data provider into the bar store.
pub struct Updater<M: MarketData> {
    market: M,
    store: BarStore,
    symbols: Vec<String>,
}

impl<M: MarketData> Updater<M> {
    pub fn new(market: M, store: BarStore, symbols: Vec<String>) -> Self {
        Self {
            market,
            store,
            symbols,
        }
    }

    pub fn max_timestamp(&self) -> Result<Option<NaiveDateTime>> {
        self.store.max_timestamp()
    }

    pub fn load_series(&self) -> Result<PriceSeries> {
        self.store.load_series(&self.symbols)
    }

    /// Fetch the trailing `prior_days` of bars (through tomorrow, so the
    /// current partial day is included) and append them. Returns the store's
    /// new maximum timestamp.
    pub async fn update(&mut self, prior_days: i64) -> Result<Option<NaiveDateTime>> {
        let today = Utc::now().date_naive();
        let start = today - Duration::days(prior_days);
        let end = today + Duration::days(1);

        let bars = self.market.get_bars(&self.symbols, start, end).await?;
        if !bars.is_empty() {
            let appended = self.store.append(&bars)?;
            tracing::debug!(appended, "Appended bars to store");
        }
        self.store.max_timestamp()
    }

    /// Backfill history month by month from `from` through today. Months
    /// without data are skipped. Returns the total number of bars appended.
    pub async fn backfill(&mut self, from: NaiveDate) -> Result<usize> {
        let today = Utc::now().date_naive();
        let mut start = from;
        let mut total = 0;

        while start <= today {
            let month_end = (start + Months::new(1)).min(today + Duration::days(1));
            let bars = self.market.get_bars(&self.symbols, start, month_end).await?;
            if bars.is_empty() {
                tracing::info!(start = %start, end = %month_end, "No data for range");
            } else {
                total += self.store.append(&bars)?;
                tracing::info!(
                    start = %start,
                    end = %month_end,
                    rows = bars.len(),
                    "Backfilled bars"
                );
            }
            start = start + Months::new(1);
        }
        Ok(total)
    }
}
