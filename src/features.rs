use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use ndarray::Array2;

/// (short, long) moving-average window pairs behind the momentum signals.
pub const MA_LAG_PAIRS: [(usize, usize); 5] = [(10, 20), (10, 50), (50, 200), (100, 400), (150, 600)];

/// History required before the first feature row: the largest MA window,
/// plus the prior close for the period return.
pub const MAX_LOOKBACK: usize = 600;

/// Dense close-price history, ordered by time, forward-filled per symbol.
/// Read-only once constructed.
#[derive(Debug, Clone)]
pub struct PriceSeries {
    symbols: Vec<String>,
    timestamps: Vec<NaiveDateTime>,
    closes: Vec<Vec<f64>>,
}

impl PriceSeries {
    /// Build from (timestamp, symbol, close) rows. Rows may arrive unsorted;
    /// duplicates keep the last value seen. Gaps are forward-filled from the
    /// last known close; leading rows where some symbol has no close yet are
    /// dropped entirely.
    pub fn from_rows(symbols: Vec<String>, rows: &[(NaiveDateTime, String, f64)]) -> Self {
        let index: BTreeMap<&str, usize> = symbols
            .iter()
            .enumerate()
            .map(|(i, s)| (s.as_str(), i))
            .collect();

        let mut by_time: BTreeMap<NaiveDateTime, Vec<Option<f64>>> = BTreeMap::new();
        for (ts, symbol, close) in rows {
            let Some(&col) = index.get(symbol.as_str()) else {
                continue;
            };
            by_time.entry(*ts).or_insert_with(|| vec![None; symbols.len()])[col] = Some(*close);
        }

        let mut timestamps = Vec::with_capacity(by_time.len());
        let mut closes = Vec::with_capacity(by_time.len());
        let mut last: Vec<Option<f64>> = vec![None; symbols.len()];
        for (ts, row) in by_time {
            for (col, value) in row.into_iter().enumerate() {
                if value.is_some() {
                    last[col] = value;
                }
            }
            if last.iter().all(|v| v.is_some()) {
                timestamps.push(ts);
                closes.push(last.iter().map(|v| v.unwrap()).collect());
            }
        }

        Self {
            symbols,
            timestamps,
            closes,
        }
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn timestamps(&self) -> &[NaiveDateTime] {
        &self.timestamps
    }

    pub fn last_timestamp(&self) -> Option<NaiveDateTime> {
        self.timestamps.last().copied()
    }

    pub fn close(&self, row: usize, symbol_idx: usize) -> f64 {
        self.closes[row][symbol_idx]
    }
}

/// Feature rows over a suffix of the price series: per-asset period returns
/// first (column named by symbol), then the MA-ratio signals grouped per
/// asset.
#[derive(Debug, Clone)]
pub struct FeatureMatrix {
    pub columns: Vec<String>,
    pub timestamps: Vec<NaiveDateTime>,
    pub data: Array2<f64>,
    pub n_assets: usize,
}

impl FeatureMatrix {
    pub fn empty(symbols: &[String]) -> Self {
        Self {
            columns: feature_columns(symbols),
            timestamps: Vec::new(),
            data: Array2::zeros((0, symbols.len() * (1 + MA_LAG_PAIRS.len()))),
            n_assets: symbols.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn n_rows(&self) -> usize {
        self.timestamps.len()
    }

    pub fn n_cols(&self) -> usize {
        self.columns.len()
    }

    /// The asset symbols, i.e. the names of the raw return columns.
    pub fn symbols(&self) -> &[String] {
        &self.columns[..self.n_assets]
    }
}

fn feature_columns(symbols: &[String]) -> Vec<String> {
    let mut columns: Vec<String> = symbols.to_vec();
    for symbol in symbols {
        for (short, long) in MA_LAG_PAIRS {
            columns.push(format!("{} MA{}/{}", symbol, short, long));
        }
    }
    columns
}

/// Turn a price series into the feature matrix. Deterministic and free of
/// side effects. With fewer than `MAX_LOOKBACK + 1` rows there is not enough
/// history for a single fully-defined row and the result is empty.
pub fn build_features(prices: &PriceSeries) -> FeatureMatrix {
    let n = prices.len();
    let n_assets = prices.symbols().len();
    if n <= MAX_LOOKBACK || n_assets == 0 {
        return FeatureMatrix::empty(prices.symbols());
    }

    // Prefix sums per symbol make each MA an O(1) window lookup.
    let mut prefix = vec![vec![0.0_f64; n + 1]; n_assets];
    for (col, sums) in prefix.iter_mut().enumerate() {
        for row in 0..n {
            sums[row + 1] = sums[row] + prices.close(row, col);
        }
    }
    let ma = |col: usize, row: usize, window: usize| -> f64 {
        (prefix[col][row + 1] - prefix[col][row + 1 - window]) / window as f64
    };

    let n_rows = n - MAX_LOOKBACK;
    let n_cols = n_assets * (1 + MA_LAG_PAIRS.len());
    let mut data = Array2::zeros((n_rows, n_cols));
    let mut timestamps = Vec::with_capacity(n_rows);

    for (out_row, row) in (MAX_LOOKBACK..n).enumerate() {
        timestamps.push(prices.timestamps()[row]);
        for col in 0..n_assets {
            let prev = prices.close(row - 1, col);
            data[[out_row, col]] = prices.close(row, col) / prev - 1.0;
        }
        let mut out_col = n_assets;
        for col in 0..n_assets {
            for (short, long) in MA_LAG_PAIRS {
                data[[out_row, out_col]] = ma(col, row, short) / ma(col, row, long) - 1.0;
                out_col += 1;
            }
        }
    }

    FeatureMatrix {
        columns: feature_columns(prices.symbols()),
        timestamps,
        data,
        n_assets,
    }
}
