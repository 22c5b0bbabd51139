use std::collections::BTreeMap;

use ndarray::Array2;

/// Asset to fraction-of-equity mapping. Non-negative, sums to 1.
pub type TargetWeights = BTreeMap<String, f64>;

/// Long-only regularized tangency allocator.
#[derive(Debug, Clone, Copy)]
pub struct Allocator {
    lambda_reg: f64,
}

impl Allocator {
    pub fn new(lambda_reg: f64) -> Self {
        Self { lambda_reg }
    }

    pub fn allocate(
        &self,
        symbols: &[String],
        predictions: &[f64],
        cov: &Array2<f64>,
    ) -> TargetWeights {
        let weights = tangency_weights(predictions, cov, self.lambda_reg);
        symbols.iter().cloned().zip(weights).collect()
    }
}

/// Regularized tangency portfolio, long-only:
/// 1. keep only the covariance diagonal (variance-only risk model),
/// 2. shrink it by (1 + lambda),
/// 3. weights proportional to inverse variance times expected return,
///   scaled so ones' Sigma^-1 mu = 1,
/// 4. clip negatives and renormalize.
///
/// When every weight clips to zero (or the scaling degenerates) the result
/// falls back to equal weights: the loop must always produce a valid
/// full-investment target rather than divide by zero.
pub fn tangency_weights(mu: &[f64], cov: &Array2<f64>, lambda_reg: f64) -> Vec<f64> {
    let n = mu.len();
    if n == 0 {
        return Vec::new();
    }
    let equal = vec![1.0 / n as f64; n];

    let mut raw = Vec::with_capacity(n);
    for (i, &expected) in mu.iter().enumerate() {
        let variance = cov[[i, i]];
        if !(variance > 0.0) {
            return equal;
        }
        raw.push(expected / ((1.0 + lambda_reg) * variance));
    }

    let denom: f64 = raw.iter().sum();
    if !denom.is_finite() || denom == 0.0 {
        return equal;
    }
    let scaling = 1.0 / denom;

    let mut weights: Vec<f64> = raw.iter().map(|r| (scaling * r).max(0.0)).collect();
    let total: f64 = weights.iter().sum();
    if !total.is_finite() || total <= f64::EPSILON {
        return equal;
    }
    for w in &mut weights {
        *w /= total;
    }
    weights
}
