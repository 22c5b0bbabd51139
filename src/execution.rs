use std::cmp::Ordering;
use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Duration, Utc};

use crate::allocate::TargetWeights;
use crate::broker::{Broker, OrderRequest, OrderStatusFilter};
use crate::config::ExecutionConfig;
use crate::error::{BrokerError, EngineError};
use crate::model::order::{OrderIntent, OrderRecord, OrderSide};
use crate::model::snapshot::{PortfolioSnapshot, PositionSnapshot};

/// Sliding window of failed external requests. Entries older than the window
/// relative to the newest failure are pruned on every record.
#[derive(Debug, Clone)]
pub struct FailureWindow {
    window: Duration,
    limit: usize,
    events: VecDeque<DateTime<Utc>>,
}

impl FailureWindow {
    pub fn new(window: Duration, limit: usize) -> Self {
        Self {
            window,
            limit,
            events: VecDeque::new(),
        }
    }

    /// Record a failure at `now`. Returns true when the retained count
    /// exceeds the limit, i.e. the breaker must trip.
    pub fn record(&mut self, now: DateTime<Utc>) -> bool {
        while let Some(&front) = self.events.front() {
            if front <= now - self.window {
                self.events.pop_front();
            } else {
                break;
            }
        }
        self.events.push_back(now);
        self.events.len() > self.limit
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn oldest(&self) -> Option<DateTime<Utc>> {
        self.events.front().copied()
    }
}

/// Round half-away-from-zero to `decimals` places, matching broker quantity
/// precision.
fn round_qty(qty: f64, decimals: u32) -> f64 {
    let scale = 10_f64.powi(decimals as i32);
    (qty * scale).round() / scale
}

/// Round toward zero; used when capping sells so rounding can never push the
/// quantity above what is actually held.
fn floor_qty(qty: f64, decimals: u32) -> f64 {
    let scale = 10_f64.powi(decimals as i32);
    (qty * scale).floor() / scale
}

/// Per-asset signed rebalance quantities. Buy-side deltas are shrunk by the
/// margin buffer so a full rebalance cannot overdraw available cash; sells
/// are left unshrunk.
pub fn compute_order_intents(
    targets: &TargetWeights,
    snapshot: &PortfolioSnapshot,
    prices: &BTreeMap<String, f64>,
    margin_buffer: f64,
) -> Vec<OrderIntent> {
    let mut intents = Vec::with_capacity(targets.len());
    for (symbol, &target) in targets {
        let delta_weight = target - snapshot.weight(symbol);
        let mut delta_value = delta_weight * snapshot.equity;
        if delta_value > 0.0 {
            delta_value *= 1.0 - margin_buffer;
        }
        let Some(&price) = prices.get(symbol) else {
            tracing::warn!(symbol = %symbol, "No price for symbol; skipping intent");
            continue;
        };
        if price <= 0.0 {
            tracing::warn!(symbol = %symbol, price, "Non-positive price; skipping intent");
            continue;
        }
        let qty = delta_value / price;
        if qty != 0.0 {
            intents.push(OrderIntent {
                symbol: symbol.clone(),
                qty,
            });
        }
    }
    intents
}

/// Turns target weights into broker orders and guards the loop with the
/// failure circuit breaker. Generic over the broker seam so tests drive it
/// with a scripted mock.
pub struct ExecutionEngine<B: Broker> {
    broker: B,
    symbols: Vec<String>,
    margin_buffer: f64,
    qty_decimals: u32,
    max_balance_retries: usize,
    failure_window_minutes: i64,
    failures: FailureWindow,
    order_history: Vec<OrderRecord>,
}

impl<B: Broker> ExecutionEngine<B> {
    pub fn new(broker: B, symbols: Vec<String>, cfg: &ExecutionConfig) -> Self {
        Self {
            broker,
            symbols,
            margin_buffer: cfg.margin_buffer,
            qty_decimals: cfg.qty_decimals,
            max_balance_retries: cfg.max_balance_retries,
            failure_window_minutes: cfg.failure_window_minutes,
            failures: FailureWindow::new(
                Duration::minutes(cfg.failure_window_minutes),
                cfg.failure_limit,
            ),
            order_history: Vec::new(),
        }
    }

    pub fn order_history(&self) -> &[OrderRecord] {
        &self.order_history
    }

    /// Pull live positions and account equity/cash into a fresh immutable
    /// snapshot. Universe symbols without an open position appear with zero
    /// quantity and weight.
    pub async fn refresh_positions(&self) -> Result<PortfolioSnapshot, EngineError> {
        let positions = self.broker.list_positions().await?;
        let account = self.broker.get_account().await?;

        let mut snapshot = PortfolioSnapshot {
            equity: account.equity,
            cash: account.cash,
            taken_at: Utc::now(),
            positions: self
                .symbols
                .iter()
                .map(|s| (s.clone(), PositionSnapshot::default()))
                .collect(),
        };
        for position in positions {
            if !snapshot.positions.contains_key(&position.symbol) {
                tracing::debug!(symbol = %position.symbol, "Position outside the universe; ignoring");
                continue;
            }
            let market_value = position.qty * position.current_price;
            let weight = if account.equity > 0.0 {
                market_value / account.equity
            } else {
                0.0
            };
            snapshot.positions.insert(
                position.symbol.clone(),
                PositionSnapshot {
                    qty: position.qty,
                    price: position.current_price,
                    market_value,
                    weight,
                },
            );
        }
        Ok(snapshot)
    }

    /// Latest trade price per universe symbol, seeded from position prices so
    /// a missing quote still leaves a usable (stale) value. Every missing
    /// quote records a failure event against the circuit breaker instead of
    /// aborting the cycle.
    pub async fn refresh_prices(
        &mut self,
        snapshot: &PortfolioSnapshot,
    ) -> Result<BTreeMap<String, f64>, EngineError> {
        let mut prices: BTreeMap<String, f64> = snapshot
            .positions
            .iter()
            .filter(|(_, p)| p.price > 0.0)
            .map(|(s, p)| (s.clone(), p.price))
            .collect();

        let symbols = self.symbols.clone();
        for symbol in symbols {
            match self.broker.latest_trade_price(&symbol).await {
                Ok(Some(price)) if price > 0.0 => {
                    prices.insert(symbol, price);
                }
                Ok(_) | Err(BrokerError::MissingQuote(_)) => {
                    tracing::warn!(symbol = %symbol, "Missing quote; recording failure");
                    self.record_failure().await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(prices)
    }

    pub fn build_order_intents(
        &self,
        targets: &TargetWeights,
        snapshot: &PortfolioSnapshot,
        prices: &BTreeMap<String, f64>,
    ) -> Vec<OrderIntent> {
        compute_order_intents(targets, snapshot, prices, self.margin_buffer)
    }

    /// Submit intents sorted ascending by signed quantity so every sell
    /// executes before any buy, freeing cash first. This ordering is
    /// load-bearing; do not reorder.
    pub async fn submit_orders(
        &mut self,
        mut intents: Vec<OrderIntent>,
        snapshot: &PortfolioSnapshot,
    ) -> Result<(), EngineError> {
        intents.sort_by(|a, b| a.qty.partial_cmp(&b.qty).unwrap_or(Ordering::Equal));
        for intent in intents {
            if intent.qty < 0.0 {
                self.submit_sell(&intent, snapshot).await?;
            } else {
                self.submit_buy(&intent).await?;
            }
        }
        Ok(())
    }

    async fn submit_sell(
        &mut self,
        intent: &OrderIntent,
        snapshot: &PortfolioSnapshot,
    ) -> Result<(), EngineError> {
        let held = snapshot.qty(&intent.symbol);
        let mut qty = round_qty(intent.qty.abs(), self.qty_decimals);
        if qty > held {
            // Never sell more than owned; floor so rounding cannot push the
            // quantity back above the held amount.
            qty = floor_qty(held, self.qty_decimals);
        }
        if qty <= 0.0 {
            return Ok(());
        }

        let request = OrderRequest {
            symbol: intent.symbol.clone(),
            side: OrderSide::Sell,
            qty,
            client_order_id: new_client_order_id(),
        };
        let order = self.broker.submit_order(&request).await?;
        tracing::info!(symbol = %request.symbol, qty, order_id = %order.id, "Sell submitted");
        self.push_history(&request, &order);
        Ok(())
    }

    async fn submit_buy(&mut self, intent: &OrderIntent) -> Result<(), EngineError> {
        let mut qty = round_qty(intent.qty, self.qty_decimals);
        if qty <= 0.0 {
            return Ok(());
        }

        for attempt in 0..=self.max_balance_retries {
            let request = OrderRequest {
                symbol: intent.symbol.clone(),
                side: OrderSide::Buy,
                qty,
                client_order_id: new_client_order_id(),
            };
            match self.broker.submit_order(&request).await {
                Ok(order) => {
                    tracing::info!(symbol = %request.symbol, qty, attempt, order_id = %order.id, "Buy submitted");
                    self.push_history(&request, &order);
                    return Ok(());
                }
                Err(BrokerError::InsufficientBalance {
                    requested,
                    available,
                }) => {
                    if requested <= 0.0 || available <= 0.0 {
                        tracing::warn!(symbol = %intent.symbol, requested, available, "Unrecoverable balance rejection; dropping buy");
                        return Ok(());
                    }
                    qty = round_qty(qty * (available / requested), self.qty_decimals);
                    if qty <= 0.0 {
                        tracing::warn!(symbol = %intent.symbol, "Rescaled buy rounds to zero; dropping");
                        return Ok(());
                    }
                    tracing::warn!(
                        symbol = %intent.symbol,
                        requested,
                        available,
                        rescaled_qty = qty,
                        attempt,
                        "Insufficient balance; rescaling buy"
                    );
                }
                Err(BrokerError::MinimumOrderSize) => {
                    tracing::debug!(symbol = %intent.symbol, qty, "Buy below minimum order size; skipping");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }
        tracing::warn!(
            symbol = %intent.symbol,
            retries = self.max_balance_retries,
            "Dropping buy after exhausting balance retries"
        );
        Ok(())
    }

    /// Cancel every broker-resident open order; called at the start of each
    /// cycle so stale orders never compete with the next rebalance.
    pub async fn cancel_open_orders(&self) -> Result<(), EngineError> {
        let open = self.broker.list_orders(OrderStatusFilter::Open, 500).await?;
        for order in open {
            tracing::info!(order_id = %order.id, symbol = %order.symbol, "Cancelling open order");
            self.broker.cancel_order(&order.id).await?;
        }
        Ok(())
    }

    /// Timestamp of the most recent broker order, used for the startup
    /// staleness check.
    pub async fn last_order_created_at(&self) -> Result<Option<DateTime<Utc>>, EngineError> {
        let orders = self.broker.list_orders(OrderStatusFilter::All, 1).await?;
        Ok(orders.first().map(|o| o.created_at))
    }

    /// Emergency stop: market-sell every held quantity.
    pub async fn liquidate_all(&mut self) -> Result<(), EngineError> {
        let positions = self.broker.list_positions().await?;
        for position in positions {
            let qty = floor_qty(position.qty, self.qty_decimals);
            if qty <= 0.0 {
                continue;
            }
            let request = OrderRequest {
                symbol: position.symbol.clone(),
                side: OrderSide::Sell,
                qty,
                client_order_id: new_client_order_id(),
            };
            let order = self.broker.submit_order(&request).await?;
            tracing::warn!(symbol = %request.symbol, qty, order_id = %order.id, "Liquidation sell submitted");
            self.push_history(&request, &order);
        }
        Ok(())
    }

    /// Record one failed external request. Past the limit: liquidate every
    /// position and surface the fatal halt condition.
    pub async fn record_failure(&mut self) -> Result<(), EngineError> {
        if self.failures.record(Utc::now()) {
            let failures = self.failures.len();
            tracing::error!(
                failures,
                window_minutes = self.failure_window_minutes,
                "Failure threshold exceeded; liquidating all positions"
            );
            self.liquidate_all().await?;
            return Err(EngineError::CircuitBreaker {
                failures,
                window_minutes: self.failure_window_minutes,
            });
        }
        Ok(())
    }

    fn push_history(&mut self, request: &OrderRequest, order: &crate::broker::BrokerOrder) {
        self.order_history.push(OrderRecord {
            order_id: order.id.clone(),
            symbol: request.symbol.clone(),
            side: request.side,
            qty: request.qty,
            submitted_at: Utc::now(),
        });
    }
}

fn new_client_order_id() -> String {
    format!("rb-{}", &uuid::Uuid::new_v4().to_string()[..8])
}
