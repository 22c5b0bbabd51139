//! Full modeling pipeline on synthetic history: prices in, target weights
//! out, with every stage's shape and invariant checked along the way.

use chrono::{Duration, NaiveDate, NaiveDateTime};
use quant_rebalancer::allocate::Allocator;
use quant_rebalancer::features::{build_features, PriceSeries, MAX_LOOKBACK};
use quant_rebalancer::forecast::{return_covariance, VarModel};

/// Deterministic noise so the test never flakes.
struct Lcg(u64);

impl Lcg {
    fn next_unit(&mut self) -> f64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        ((self.0 >> 33) as f64) / ((1u64 << 31) as f64) - 1.0
    }
}

fn synthetic_series(n: usize) -> PriceSeries {
    let start = NaiveDate::from_ymd_opt(2024, 1, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap();
    let symbols = vec!["BTC/USD".to_string(), "ETH/USD".to_string()];
    let mut rng = Lcg(42);
    let mut prices = [50_000.0_f64, 3_000.0_f64];

    let mut rows: Vec<(NaiveDateTime, String, f64)> = Vec::with_capacity(n * 2);
    for i in 0..n {
        let ts = start + Duration::hours(i as i64);
        for (j, symbol) in symbols.iter().enumerate() {
            // Random walk in log space, ~0.5% hourly noise.
            prices[j] *= 1.0 + 0.005 * rng.next_unit();
            rows.push((ts, symbol.clone(), prices[j]));
        }
    }
    PriceSeries::from_rows(symbols, &rows)
}

#[test]
fn pipeline_produces_valid_target_weights() {
    let n = MAX_LOOKBACK + 300;
    let series = synthetic_series(n);
    assert_eq!(series.len(), n);

    let features = build_features(&series);
    assert_eq!(features.n_rows(), n - MAX_LOOKBACK);
    // Two return columns plus five moving-average ratios per asset.
    assert_eq!(features.n_cols(), 2 + 2 * 5);

    let model = VarModel::fit(&features, 2).unwrap();
    assert!(model.lag_order >= 1 && model.lag_order <= 2);

    let predictions = model.forecast_one(&features).unwrap();
    assert_eq!(predictions.len(), features.n_cols());
    assert!(predictions.iter().all(|p| p.is_finite()));

    let cov = return_covariance(&features);
    assert_eq!(cov.dim(), (2, 2));
    assert!(cov[[0, 0]] > 0.0 && cov[[1, 1]] > 0.0);

    let allocator = Allocator::new(3.0);
    let targets = allocator.allocate(features.symbols(), &predictions[..2], &cov);
    assert_eq!(targets.len(), 2);
    assert!(targets.values().all(|w| *w >= 0.0));
    let total: f64 = targets.values().sum();
    assert!((total - 1.0).abs() < 1e-9);
}

#[test]
fn short_history_yields_no_features() {
    let series = synthetic_series(MAX_LOOKBACK);
    let features = build_features(&series);
    assert!(features.is_empty());
}
