use anyhow::Result;
use chrono::{Duration, NaiveDateTime, Utc};

use crate::allocate::{Allocator, TargetWeights};
use crate::broker::{Broker, MarketData};
use crate::config::{ModelConfig, RunnerConfig};
use crate::error::EngineError;
use crate::execution::ExecutionEngine;
use crate::features::{build_features, FeatureMatrix};
use crate::forecast::{forecast_due, return_covariance, VarModel};
use crate::updater::Updater;

/// States of one rebalance cycle. Every cycle starts at `WaitForData` and
/// terminates in `Idle` or `Execute`; the runner then sleeps and starts the
/// next cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    WaitForData,
    Decide,
    ForecastAndAllocate,
    Idle,
    Execute,
}

/// Gate out of `WaitForData`: the store must hold a strictly newer bar than
/// the one the last rebalance was computed from. Without this the loop would
/// re-run the whole pipeline on identical data every poll whenever the feed
/// lags behind the wall clock.
pub fn new_bar_arrived(
    latest: Option<NaiveDateTime>,
    last_rebalanced: Option<NaiveDateTime>,
) -> bool {
    match (latest, last_rebalanced) {
        (Some(latest), Some(prev)) => latest > prev,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

/// Transition out of `Decide`: no features means there is nothing to model,
/// otherwise forecast only when the freshly arrived bar is recent enough (or
/// a rebalance is forced).
pub fn decide_transition(features_empty: bool, due: bool) -> LoopState {
    if features_empty || !due {
        LoopState::Idle
    } else {
        LoopState::ForecastAndAllocate
    }
}

/// The unattended rebalancing loop: wait for a new bar, decide whether a
/// forecast is due, fit and allocate, execute. Missing quotes are the only
/// transient failure (charged to the engine's failure window inside
/// `refresh_prices`); every other broker or store error propagates and
/// terminates the process.
pub struct ControlLoop<B: Broker, M: MarketData> {
    updater: Updater<M>,
    engine: ExecutionEngine<B>,
    allocator: Allocator,
    max_lag: usize,
    bar_period: Duration,
    poll_interval: std::time::Duration,
    stale_order_hours: i64,
    force_rebalance: bool,
    /// Store max timestamp the last executed rebalance was computed from.
    last_rebalanced_bar: Option<NaiveDateTime>,
}

impl<B: Broker, M: MarketData> ControlLoop<B, M> {
    pub fn new(
        updater: Updater<M>,
        engine: ExecutionEngine<B>,
        allocator: Allocator,
        model: &ModelConfig,
        runner: &RunnerConfig,
        bar_period: Duration,
    ) -> Self {
        Self {
            updater,
            engine,
            allocator,
            max_lag: model.max_lag,
            bar_period,
            poll_interval: std::time::Duration::from_secs(runner.poll_interval_secs),
            stale_order_hours: runner.stale_order_hours,
            force_rebalance: false,
            last_rebalanced_bar: None,
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        self.engine.cancel_open_orders().await?;
        self.check_startup_staleness().await?;
        // Prime the store and take the baseline for the new-bar gate: data
        // already available at startup belongs to the previous deployment's
        // schedule and never triggers a rebalance by itself.
        self.last_rebalanced_bar = self.updater.update(1).await?;

        loop {
            self.cycle().await?;
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// A most-recent order older than the staleness cutoff (or no order at
    /// all) means the previous deployment died mid-schedule; rebalance
    /// immediately instead of waiting for the next bar close.
    async fn check_startup_staleness(&mut self) -> Result<(), EngineError> {
        let cutoff = Duration::hours(self.stale_order_hours);
        match self.engine.last_order_created_at().await? {
            Some(created_at) if Utc::now() - created_at <= cutoff => {
                tracing::info!(last_order = %created_at, "Recent order found; waiting for next bar");
            }
            Some(created_at) => {
                tracing::info!(last_order = %created_at, "Last order is stale; forcing rebalance");
                self.force_rebalance = true;
            }
            None => {
                tracing::info!("No order history; forcing rebalance");
                self.force_rebalance = true;
            }
        }
        Ok(())
    }

    /// One pass through the state machine. Any error is fatal to the loop;
    /// transient missing-quote events are absorbed by `refresh_prices` and
    /// only resurface as the circuit breaker.
    async fn cycle(&mut self) -> Result<()> {
        let mut state = LoopState::WaitForData;
        let mut latest_bar: Option<NaiveDateTime> = None;
        let mut features: Option<FeatureMatrix> = None;
        let mut targets: Option<TargetWeights> = None;

        loop {
            state = match state {
                LoopState::WaitForData => {
                    let latest = self.updater.update(1).await?;
                    let snapshot = self.engine.refresh_positions().await?;
                    println!("{}", snapshot);
                    if self.force_rebalance || new_bar_arrived(latest, self.last_rebalanced_bar) {
                        latest_bar = latest;
                        LoopState::Decide
                    } else {
                        tracing::debug!("No new bar in store; waiting");
                        LoopState::Idle
                    }
                }
                LoopState::Decide => {
                    let due = self.forecast_is_due(latest_bar);
                    let series = self.updater.load_series()?;
                    let built = build_features(&series);
                    let next = decide_transition(built.is_empty(), due);
                    features = Some(built);
                    next
                }
                LoopState::ForecastAndAllocate => match features.take() {
                    Some(features) => match self.forecast_and_allocate(&features) {
                        Some(weights) => {
                            targets = Some(weights);
                            LoopState::Execute
                        }
                        None => LoopState::Idle,
                    },
                    None => LoopState::Idle,
                },
                LoopState::Idle => {
                    tracing::debug!("Nothing to do this cycle");
                    return Ok(());
                }
                LoopState::Execute => {
                    let targets = targets.take().unwrap_or_default();
                    self.execute(&targets).await?;
                    self.force_rebalance = false;
                    self.last_rebalanced_bar = latest_bar.or(self.last_rebalanced_bar);
                    return Ok(());
                }
            };
        }
    }

    fn forecast_is_due(&self, latest_bar: Option<NaiveDateTime>) -> bool {
        if self.force_rebalance {
            return true;
        }
        latest_bar
            .map(|ts| forecast_due(ts, self.bar_period, Utc::now().naive_utc()))
            .unwrap_or(false)
    }

    /// Fit the VAR, forecast one step, and turn the per-asset return
    /// predictions into target weights. Model failures skip the cycle; the
    /// market is still there next poll.
    fn forecast_and_allocate(&self, features: &FeatureMatrix) -> Option<TargetWeights> {
        let model = match VarModel::fit(features, self.max_lag) {
            Ok(model) => model,
            Err(e) => {
                tracing::warn!(error = %e, "VAR fit failed; skipping cycle");
                return None;
            }
        };
        let predictions = match model.forecast_one(features) {
            Ok(predictions) => predictions,
            Err(e) => {
                tracing::warn!(error = %e, "Forecast failed; skipping cycle");
                return None;
            }
        };
        let n_assets = features.symbols().len();
        let cov = return_covariance(features);
        let targets = self
            .allocator
            .allocate(features.symbols(), &predictions[..n_assets], &cov);
        tracing::info!(
            lag_order = model.lag_order,
            targets = ?targets,
            "Allocation computed"
        );
        Some(targets)
    }

    async fn execute(&mut self, targets: &TargetWeights) -> Result<(), EngineError> {
        self.engine.cancel_open_orders().await?;
        let snapshot = self.engine.refresh_positions().await?;
        let prices = self.engine.refresh_prices(&snapshot).await?;
        let intents = self.engine.build_order_intents(targets, &snapshot, &prices);
        tracing::info!(orders = intents.len(), "Submitting rebalance orders");
        self.engine.submit_orders(intents, &snapshot).await?;

        let after = self.engine.refresh_positions().await?;
        println!("{}", after);
        Ok(())
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

    #[test]
    fn unchanged_max_timestamp_is_not_a_new_bar() {
        assert!(!new_bar_arrived(Some(ts(5)), Some(ts(5))));
        assert!(!new_bar_arrived(Some(ts(4)), Some(ts(5))));
        assert!(!new_bar_arrived(None, Some(ts(5))));
        assert!(!new_bar_arrived(None, None));
    }

    #[test]
    fn advancing_max_timestamp_is_a_new_bar() {
        assert!(new_bar_arrived(Some(ts(6)), Some(ts(5))));
        assert!(new_bar_arrived(Some(ts(0)), None));
    }

    #[test]
    fn no_features_idles_even_when_due() {
        assert_eq!(decide_transition(true, true), LoopState::Idle);
        assert_eq!(decide_transition(true, false), LoopState::Idle);
    }

    #[test]
    fn features_without_due_forecast_idle() {
        assert_eq!(decide_transition(false, false), LoopState::Idle);
    }

    #[test]
    fn features_and_due_forecast_proceed() {
        assert_eq!(
            decide_transition(false, true),
            LoopState::ForecastAndAllocate
        );
    }
}
