use std::path::Path;

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use rusqlite::{params, Connection};

use crate::features::PriceSeries;
use crate::model::bar::Bar;

const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Sqlite-backed bar store, the sole source of price history for the model.
/// Duplicate (timestamp, symbol) rows keep the most recently inserted value.
pub struct BarStore {
    conn: Connection,
}

impl BarStore {
    pub fn open(path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open bar store at {}", path))?;
        Self::init(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;
        Ok(Self { conn })
    }

    fn init(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS bars (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                symbol TEXT NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume REAL NOT NULL,
                trade_count INTEGER NOT NULL,
                vwap REAL NOT NULL,
                added_on TEXT DEFAULT CURRENT_TIMESTAMP
            );

            CREATE INDEX IF NOT EXISTS idx_bars_timestamp_symbol
                ON bars (timestamp, symbol);
            "#,
        )?;
        Ok(())
    }

    /// Append bars, then drop superseded duplicates so each
    /// (timestamp, symbol) keeps only the newest insert.
    pub fn append(&mut self, bars: &[Bar]) -> Result<usize> {
        let tx = self.conn.transaction()?;
        for bar in bars {
            tx.execute(
                r#"
                INSERT INTO bars (
                    timestamp, symbol, open, high, low, close,
                    volume, trade_count, vwap
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
                params![
                    bar.timestamp.format(TS_FORMAT).to_string(),
                    bar.symbol,
                    bar.open,
                    bar.high,
                    bar.low,
                    bar.close,
                    bar.volume,
                    bar.trade_count as i64,
                    bar.vwap,
                ],
            )?;
        }
        tx.execute(
            r#"
            DELETE FROM bars
            WHERE id NOT IN (
                SELECT MAX(id) FROM bars GROUP BY timestamp, symbol
            )
            "#,
            [],
        )?;
        tx.commit()?;
        Ok(bars.len())
    }

    pub fn max_timestamp(&self) -> Result<Option<NaiveDateTime>> {
        let raw: Option<String> =
            self.conn
                .query_row("SELECT MAX(timestamp) FROM bars", [], |row| row.get(0))?;
        raw.map(|s| {
            NaiveDateTime::parse_from_str(&s, TS_FORMAT)
                .with_context(|| format!("invalid timestamp '{}' in bar store", s))
        })
        .transpose()
    }

    /// Full close history for the given symbols, pivoted into a
    /// forward-filled price series.
    pub fn load_series(&self, symbols: &[String]) -> Result<PriceSeries> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT timestamp, symbol, close
            FROM bars
            ORDER BY timestamp ASC, id ASC
            "#,
        )?;
        let mapped = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, f64>(2)?,
            ))
        })?;

        let mut rows = Vec::new();
        for entry in mapped {
            let (raw_ts, symbol, close) = entry?;
            let timestamp = NaiveDateTime::parse_from_str(&raw_ts, TS_FORMAT)
                .with_context(|| format!("invalid timestamp '{}' in bar store", raw_ts))?;
            rows.push((timestamp, symbol, close));
        }
        Ok(PriceSeries::from_rows(symbols.to_vec(), &rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    fn bar(hour: u32, symbol: &str, close: f64) -> Bar {
        Bar {
            timestamp: ts(hour),
            symbol: symbol.to_string(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
            trade_count: 10,
            vwap: close,
        }
    }

    #[test]
    fn append_and_query_max_timestamp() {
        let mut store = BarStore::open_in_memory().unwrap();
        assert!(store.max_timestamp().unwrap().is_none());

        store
            .append(&[bar(0, "BTC/USD", 100.0), bar(1, "BTC/USD", 101.0)])
            .unwrap();
        assert_eq!(store.max_timestamp().unwrap(), Some(ts(1)));
    }

    #[test]
    fn duplicate_rows_keep_most_recent_insert() {
        let mut store = BarStore::open_in_memory().unwrap();
        store.append(&[bar(0, "BTC/USD", 100.0)]).unwrap();
        store.append(&[bar(0, "BTC/USD", 105.0)]).unwrap();

        let series = store
            .load_series(&["BTC/USD".to_string()])
            .unwrap();
        assert_eq!(series.len(), 1);
        assert!((series.close(0, 0) - 105.0).abs() < f64::EPSILON);
    }

    #[test]
    fn load_series_pivots_symbols_in_order() {
        let mut store = BarStore::open_in_memory().unwrap();
        store
            .append(&[
                bar(0, "BTC/USD", 100.0),
                bar(0, "ETH/USD", 10.0),
                bar(1, "BTC/USD", 102.0),
                bar(1, "ETH/USD", 11.0),
            ])
            .unwrap();

        let series = store
            .load_series(&["BTC/USD".to_string(), "ETH/USD".to_string()])
            .unwrap();
        assert_eq!(series.len(), 2);
        assert!((series.close(1, 0) - 102.0).abs() < f64::EPSILON);
        assert!((series.close(1, 1) - 11.0).abs() < f64::EPSILON);
    }
}
