use anyhow::{bail, Result};
use chrono::{Duration, NaiveDateTime};
use ndarray::{Array1, Array2};

use crate::features::FeatureMatrix;

/// Fitted vector autoregression over the feature matrix. Immutable once fit;
/// the control loop refits from the latest features every forecast cycle.
#[derive(Debug, Clone)]
pub struct VarModel {
    pub lag_order: usize,
    /// Stacked coefficients, shape (1 + k * lag_order, k): intercept row
    /// first, then one k x k block per lag.
    coefs: Array2<f64>,
    n_features: usize,
}

impl VarModel {
    /// Fit with lag order chosen from 1..=max_lag by minimizing AIC over a
    /// common sample anchored at max_lag, then refit the winner on the full
    /// sample. Candidates with too few observations or a degenerate residual
    /// covariance are skipped.
    pub fn fit(features: &FeatureMatrix, max_lag: usize) -> Result<Self> {
        let t = features.n_rows();
        let k = features.n_cols();
        if max_lag == 0 {
            bail!("max_lag must be at least 1");
        }
        if t <= max_lag + 1 {
            bail!(
                "not enough feature rows to fit a VAR: {} rows, max lag {}",
                t,
                max_lag
            );
        }

        let mut best: Option<(f64, usize)> = None;
        for p in 1..=max_lag {
            let Some(aic) = candidate_aic(features, p, max_lag) else {
                continue;
            };
            if best.map(|(score, _)| aic < score).unwrap_or(true) {
                best = Some((aic, p));
            }
        }
        let Some((aic, lag_order)) = best else {
            bail!("no feasible VAR lag order in 1..={}", max_lag);
        };
        tracing::debug!(lag_order, aic, "Selected VAR lag order");

        let (x, y) = design_matrices(features, lag_order, lag_order);
        let Some(coefs) = least_squares(&x, &y) else {
            bail!("VAR design matrix is singular at lag {}", lag_order);
        };

        Ok(Self {
            lag_order,
            coefs,
            n_features: k,
        })
    }

    /// One-step-ahead forecast for every feature column, from the last
    /// `lag_order` rows. Callers keep the leading raw-return entries.
    pub fn forecast_one(&self, features: &FeatureMatrix) -> Result<Vec<f64>> {
        let t = features.n_rows();
        if t < self.lag_order {
            bail!(
                "need {} feature rows for a forecast, have {}",
                self.lag_order,
                t
            );
        }
        if features.n_cols() != self.n_features {
            bail!(
                "feature width {} does not match fitted model width {}",
                features.n_cols(),
                self.n_features
            );
        }

        let mut x = Array1::zeros(1 + self.n_features * self.lag_order);
        x[0] = 1.0;
        for lag in 1..=self.lag_order {
            let row = features.data.row(t - lag);
            for col in 0..self.n_features {
                x[1 + (lag - 1) * self.n_features + col] = row[col];
            }
        }
        Ok(x.dot(&self.coefs).to_vec())
    }
}

/// Sample covariance (ddof = 1) of the raw asset-return columns over the full
/// feature window. Deliberately not the model residual covariance.
pub fn return_covariance(features: &FeatureMatrix) -> Array2<f64> {
    let n = features.n_rows();
    let k = features.n_assets;
    let mut cov = Array2::zeros((k, k));
    if n < 2 {
        return cov;
    }

    let means: Vec<f64> = (0..k)
        .map(|col| features.data.column(col).sum() / n as f64)
        .collect();
    for i in 0..k {
        for j in i..k {
            let mut acc = 0.0;
            for row in 0..n {
                acc += (features.data[[row, i]] - means[i]) * (features.data[[row, j]] - means[j]);
            }
            let value = acc / (n - 1) as f64;
            cov[[i, j]] = value;
            cov[[j, i]] = value;
        }
    }
    cov
}

/// A forecast is only due once real time has advanced past the close of the
/// last observed bar; before that the model would be rescoring stale data.
pub fn forecast_due(last_bar: NaiveDateTime, bar_period: Duration, now: NaiveDateTime) -> bool {
    now > last_bar + bar_period
}

/// AIC of lag order `p` fit on the common selection sample that starts at
/// `anchor` (so every candidate sees identical observations).
fn candidate_aic(features: &FeatureMatrix, p: usize, anchor: usize) -> Option<f64> {
    let t = features.n_rows();
    let k = features.n_cols();
    let n_obs = t.checked_sub(anchor)?;
    let n_regressors = 1 + k * p;
    if n_obs <= n_regressors {
        return None;
    }

    let (x, y) = design_matrices(features, p, anchor);
    let coefs = least_squares(&x, &y)?;
    let residuals = &y - &x.dot(&coefs);
    let sigma_mle = residuals.t().dot(&residuals) / n_obs as f64;
    let log_det = log_det_pd(sigma_mle)?;
    let free_params = (p * k * k + k) as f64;
    Some(log_det + 2.0 * free_params / n_obs as f64)
}

/// Targets are rows anchor..T; regressors per target row t are
/// [1, y_{t-1}, ..., y_{t-p}].
fn design_matrices(features: &FeatureMatrix, p: usize, anchor: usize) -> (Array2<f64>, Array2<f64>) {
    let t = features.n_rows();
    let k = features.n_cols();
    let n_obs = t - anchor;
    let mut x = Array2::zeros((n_obs, 1 + k * p));
    let mut y = Array2::zeros((n_obs, k));

    for (obs, row) in (anchor..t).enumerate() {
        x[[obs, 0]] = 1.0;
        for lag in 1..=p {
            let lagged = features.data.row(row - lag);
            for col in 0..k {
                x[[obs, 1 + (lag - 1) * k + col]] = lagged[col];
            }
        }
        for col in 0..k {
            y[[obs, col]] = features.data[[row, col]];
        }
    }
    (x, y)
}

/// Multi-RHS least squares via the normal equations.
fn least_squares(x: &Array2<f64>, y: &Array2<f64>) -> Option<Array2<f64>> {
    let gram = x.t().dot(x);
    let moment = x.t().dot(y);
    solve(gram, moment)
}

/// Solve A * X = B with Gaussian elimination and partial pivoting.
/// Returns None when A is numerically singular.
fn solve(mut a: Array2<f64>, mut b: Array2<f64>) -> Option<Array2<f64>> {
    let n = a.nrows();
    let rhs = b.ncols();

    for col in 0..n {
        let mut pivot_row = col;
        let mut pivot_abs = a[[col, col]].abs();
        for row in (col + 1)..n {
            let candidate = a[[row, col]].abs();
            if candidate > pivot_abs {
                pivot_abs = candidate;
                pivot_row = row;
            }
        }
        if pivot_abs < 1e-12 {
            return None;
        }
        if pivot_row != col {
            for j in 0..n {
                a.swap([col, j], [pivot_row, j]);
            }
            for j in 0..rhs {
                b.swap([col, j], [pivot_row, j]);
            }
        }

        let pivot = a[[col, col]];
        for row in (col + 1)..n {
            let factor = a[[row, col]] / pivot;
            if factor == 0.0 {
                continue;
            }
            for j in col..n {
                let value = a[[col, j]];
                a[[row, j]] -= factor * value;
            }
            for j in 0..rhs {
                let value = b[[col, j]];
                b[[row, j]] -= factor * value;
            }
        }
    }

    // Back substitution.
    let mut x = Array2::zeros((n, rhs));
    for col in (0..n).rev() {
        for j in 0..rhs {
            let mut acc = b[[col, j]];
            for inner in (col + 1)..n {
                acc -= a[[col, inner]] * x[[inner, j]];
            }
            x[[col, j]] = acc / a[[col, col]];
        }
    }
    Some(x)
}

/// ln det of a positive-definite matrix via LU with partial pivoting.
/// Returns None when the determinant is non-positive or the matrix is
/// numerically singular.
fn log_det_pd(mut a: Array2<f64>) -> Option<f64> {
    let n = a.nrows();
    let mut sign = 1.0_f64;
    let mut log_det = 0.0_f64;

    for col in 0..n {
        let mut pivot_row = col;
        let mut pivot_abs = a[[col, col]].abs();
        for row in (col + 1)..n {
            let candidate = a[[row, col]].abs();
            if candidate > pivot_abs {
                pivot_abs = candidate;
                pivot_row = row;
            }
        }
        if pivot_abs < 1e-300 {
            return None;
        }
        if pivot_row != col {
            sign = -sign;
            for j in 0..n {
                a.swap([col, j], [pivot_row, j]);
            }
        }

        let pivot = a[[col, col]];
        sign *= pivot.signum();
        log_det += pivot.abs().ln();
        for row in (col + 1)..n {
            let factor = a[[row, col]] / pivot;
            if factor == 0.0 {
                continue;
            }
            for j in col..n {
                let value = a[[col, j]];
                a[[row, j]] -= factor * value;
            }
        }
    }

    (sign > 0.0).then_some(log_det)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use ndarray::array;

    fn ts(hour_offset: usize) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            + Duration::hours(hour_offset as i64)
    }

    /// Deterministic pseudo-noise in [-0.5, 0.5).
    struct Lcg(u64);

    impl Lcg {
        fn next_f64(&mut self) -> f64 {
            self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            ((self.0 >> 11) as f64 / (1u64 << 53) as f64) - 0.5
        }
    }

    fn synthetic_var1(rows: usize, noise: f64) -> FeatureMatrix {
        let mut rng = Lcg(42);
        let mut data = Array2::zeros((rows, 2));
        let (mut a, mut b) = (0.3_f64, -0.2_f64);
        for row in 0..rows {
            let next_a = 0.6 * a - 0.1 * b + noise * rng.next_f64();
            let next_b = 0.2 * a + 0.4 * b + noise * rng.next_f64();
            a = next_a;
            b = next_b;
            data[[row, 0]] = a;
            data[[row, 1]] = b;
        }
        FeatureMatrix {
            columns: vec!["A".to_string(), "B".to_string()],
            timestamps: (0..rows).map(ts).collect(),
            data,
            n_assets: 2,
        }
    }

    /// Six-series VAR(1): diagonal persistence plus a weak circulant
    /// cross-term. Wide enough that the AIC complexity penalty dominates
    /// spurious higher-lag fits.
    fn synthetic_var1_wide(rows: usize, noise: f64) -> FeatureMatrix {
        let k = 6;
        let mut rng = Lcg(7);
        let mut state = vec![0.1_f64; k];
        let mut data = Array2::zeros((rows, k));
        for row in 0..rows {
            let prev = state.clone();
            for (i, value) in state.iter_mut().enumerate() {
                *value = 0.5 * prev[i] + 0.1 * prev[(i + 1) % k] + noise * rng.next_f64();
                data[[row, i]] = *value;
            }
        }
        FeatureMatrix {
            columns: (0..k).map(|i| format!("S{}", i)).collect(),
            timestamps: (0..rows).map(ts).collect(),
            data,
            n_assets: k,
        }
    }

    /// Two-series VAR(2) with a strong second lag, so an order-1 fit is a
    /// clear underfit.
    fn synthetic_var2(rows: usize, noise: f64) -> FeatureMatrix {
        let mut rng = Lcg(99);
        let mut data = Array2::zeros((rows, 2));
        let (mut a1, mut b1, mut a2, mut b2) = (0.2_f64, -0.1_f64, 0.1_f64, 0.05_f64);
        for row in 0..rows {
            let next_a = 0.4 * a1 + 0.35 * a2 + noise * rng.next_f64();
            let next_b = 0.3 * b1 + 0.4 * b2 + noise * rng.next_f64();
            a2 = a1;
            b2 = b1;
            a1 = next_a;
            b1 = next_b;
            data[[row, 0]] = a1;
            data[[row, 1]] = b1;
        }
        FeatureMatrix {
            columns: vec!["A".to_string(), "B".to_string()],
            timestamps: (0..rows).map(ts).collect(),
            data,
            n_assets: 2,
        }
    }

    #[test]
    fn solve_recovers_known_system() {
        let a = array![[2.0, 1.0], [1.0, 3.0]];
        let b = array![[5.0], [10.0]];
        let x = solve(a, b).unwrap();
        assert!((x[[0, 0]] - 1.0).abs() < 1e-9);
        assert!((x[[1, 0]] - 3.0).abs() < 1e-9);
    }

    #[test]
    fn solve_rejects_singular_matrix() {
        let a = array![[1.0, 2.0], [2.0, 4.0]];
        let b = array![[1.0], [2.0]];
        assert!(solve(a, b).is_none());
    }

    #[test]
    fn log_det_of_diagonal_matrix() {
        let a = array![[2.0, 0.0], [0.0, 8.0]];
        assert!((log_det_pd(a).unwrap() - 16.0_f64.ln()).abs() < 1e-9);
    }

    #[test]
    fn log_det_rejects_non_positive_definite() {
        let a = array![[1.0, 0.0], [0.0, -1.0]];
        assert!(log_det_pd(a).is_none());
    }

    #[test]
    fn aic_selects_generating_lag_order() {
        let features = synthetic_var1_wide(500, 0.05);
        let model = VarModel::fit(&features, 4).unwrap();
        assert_eq!(model.lag_order, 1);
    }

    #[test]
    fn aic_rejects_underfit_lag_order() {
        let features = synthetic_var2(400, 0.05);
        let model = VarModel::fit(&features, 2).unwrap();
        assert_eq!(model.lag_order, 2);
    }

    #[test]
    fn forecast_tracks_var1_dynamics() {
        let features = synthetic_var1(600, 0.02);
        let model = VarModel::fit(&features, 1).unwrap();
        let forecast = model.forecast_one(&features).unwrap();
        let t = features.n_rows();
        let (a, b) = (features.data[[t - 1, 0]], features.data[[t - 1, 1]]);
        let expected_a = 0.6 * a - 0.1 * b;
        let expected_b = 0.2 * a + 0.4 * b;
        assert!((forecast[0] - expected_a).abs() < 0.02);
        assert!((forecast[1] - expected_b).abs() < 0.02);
    }

    #[test]
    fn fit_rejects_insufficient_history() {
        let features = synthetic_var1(10, 0.05);
        assert!(VarModel::fit(&features, 15).is_err());
    }

    #[test]
    fn covariance_matches_hand_computation() {
        let data = array![[1.0, 2.0], [2.0, 4.0], [3.0, 6.0], [4.0, 8.0]];
        let features = FeatureMatrix {
            columns: vec!["A".to_string(), "B".to_string()],
            timestamps: (0..4).map(ts).collect(),
            data,
            n_assets: 2,
        };
        let cov = return_covariance(&features);
        let var_a = 5.0 / 3.0;
        assert!((cov[[0, 0]] - var_a).abs() < 1e-9);
        assert!((cov[[0, 1]] - 2.0 * var_a).abs() < 1e-9);
        assert!((cov[[1, 1]] - 4.0 * var_a).abs() < 1e-9);
        assert!((cov[[0, 1]] - cov[[1, 0]]).abs() < 1e-12);
    }

    #[test]
    fn forecast_due_gates_on_bar_close() {
        let last_bar = ts(10);
        let period = Duration::hours(1);
        assert!(!forecast_due(last_bar, period, ts(10)));
        assert!(!forecast_due(last_bar, period, ts(11)));
        assert!(forecast_due(last_bar, period, ts(11) + Duration::seconds(1)));
    }
}
