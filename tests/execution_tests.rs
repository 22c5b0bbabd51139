//! End-to-end execution engine behavior against a scripted broker: order
//! sequencing, sell caps, balance rescaling, and the failure circuit breaker.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::Utc;
use quant_rebalancer::broker::{
    Broker, BrokerAccount, BrokerOrder, BrokerPosition, OrderRequest, OrderStatusFilter,
};
use quant_rebalancer::config::ExecutionConfig;
use quant_rebalancer::error::{BrokerError, EngineError};
use quant_rebalancer::execution::ExecutionEngine;
use quant_rebalancer::model::order::{OrderIntent, OrderSide};
use quant_rebalancer::model::snapshot::{PortfolioSnapshot, PositionSnapshot};

#[derive(Default)]
struct MockBroker {
    positions: Mutex<Vec<BrokerPosition>>,
    account: Mutex<BrokerAccount>,
    open_orders: Mutex<Vec<BrokerOrder>>,
    prices: Mutex<HashMap<String, f64>>,
    /// Scripted rejections per symbol, consumed front to back.
    rejections: Mutex<HashMap<String, VecDeque<BrokerError>>>,
    /// When set, every buy is rejected with these (requested, available)
    /// balance figures.
    reject_all_buys: Mutex<Option<(f64, f64)>>,
    submitted: Mutex<Vec<OrderRequest>>,
    cancelled: Mutex<Vec<String>>,
    next_id: Mutex<u32>,
}

impl MockBroker {
    fn with_position(self, symbol: &str, qty: f64, price: f64) -> Self {
        self.positions.lock().unwrap().push(BrokerPosition {
            symbol: symbol.to_string(),
            qty,
            current_price: price,
        });
        self
    }

    fn with_account(self, equity: f64, cash: f64) -> Self {
        *self.account.lock().unwrap() = BrokerAccount { equity, cash };
        self
    }

    fn script_rejection(&self, symbol: &str, error: BrokerError) {
        self.rejections
            .lock()
            .unwrap()
            .entry(symbol.to_string())
            .or_default()
            .push_back(error);
    }

    fn submitted(&self) -> Vec<OrderRequest> {
        self.submitted.lock().unwrap().clone()
    }
}

impl Broker for &MockBroker {
    async fn list_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        Ok(self.positions.lock().unwrap().clone())
    }

    async fn get_account(&self) -> Result<BrokerAccount, BrokerError> {
        Ok(*self.account.lock().unwrap())
    }

    async fn list_orders(
        &self,
        _filter: OrderStatusFilter,
        limit: usize,
    ) -> Result<Vec<BrokerOrder>, BrokerError> {
        let orders = self.open_orders.lock().unwrap();
        Ok(orders.iter().take(limit).cloned().collect())
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError> {
        self.cancelled.lock().unwrap().push(order_id.to_string());
        Ok(())
    }

    async fn submit_order(&self, request: &OrderRequest) -> Result<BrokerOrder, BrokerError> {
        self.submitted.lock().unwrap().push(request.clone());

        if let Some(error) = self
            .rejections
            .lock()
            .unwrap()
            .get_mut(&request.symbol)
            .and_then(|queue| queue.pop_front())
        {
            return Err(error);
        }
        if request.side == OrderSide::Buy {
            if let Some((requested, available)) = *self.reject_all_buys.lock().unwrap() {
                return Err(BrokerError::InsufficientBalance {
                    requested,
                    available,
                });
            }
        }

        let mut next_id = self.next_id.lock().unwrap();
        *next_id += 1;
        Ok(BrokerOrder {
            id: format!("order-{}", *next_id),
            symbol: request.symbol.clone(),
            status: "accepted".to_string(),
            created_at: Utc::now(),
        })
    }

    async fn latest_trade_price(&self, symbol: &str) -> Result<Option<f64>, BrokerError> {
        Ok(self.prices.lock().unwrap().get(symbol).copied())
    }
}

fn exec_config() -> ExecutionConfig {
    ExecutionConfig {
        margin_buffer: 0.01,
        qty_decimals: 4,
        max_balance_retries: 8,
        failure_limit: 10,
        failure_window_minutes: 30,
    }
}

fn symbols(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn intent(symbol: &str, qty: f64) -> OrderIntent {
    OrderIntent {
        symbol: symbol.to_string(),
        qty,
    }
}

fn snapshot_with(holdings: &[(&str, f64)]) -> PortfolioSnapshot {
    let mut snapshot = PortfolioSnapshot {
        equity: 10_000.0,
        cash: 1_000.0,
        ..Default::default()
    };
    for (symbol, qty) in holdings {
        snapshot.positions.insert(
            symbol.to_string(),
            PositionSnapshot {
                qty: *qty,
                price: 10.0,
                market_value: qty * 10.0,
                weight: qty * 10.0 / snapshot.equity,
            },
        );
    }
    snapshot
}

#[tokio::test]
async fn sells_execute_before_any_buy() {
    let mock = MockBroker::default();
    let mut engine = ExecutionEngine::new(&mock, symbols(&["A", "B", "C", "D"]), &exec_config());
    let snapshot = snapshot_with(&[("A", 5.0), ("D", 5.0)]);

    let intents = vec![
        intent("B", 2.0),
        intent("A", -1.0),
        intent("C", 1.0),
        intent("D", -0.5),
    ];
    engine.submit_orders(intents, &snapshot).await.unwrap();

    let submitted = mock.submitted();
    let sides: Vec<OrderSide> = submitted.iter().map(|r| r.side).collect();
    assert_eq!(
        sides,
        vec![
            OrderSide::Sell,
            OrderSide::Sell,
            OrderSide::Buy,
            OrderSide::Buy
        ]
    );
    // Largest sell first, smallest buy first.
    assert_eq!(submitted[0].symbol, "A");
    assert_eq!(submitted[1].symbol, "D");
    assert!(submitted[2].qty < submitted[3].qty);
}

#[tokio::test]
async fn sell_quantity_never_exceeds_held() {
    let mock = MockBroker::default();
    let mut engine = ExecutionEngine::new(&mock, symbols(&["A"]), &exec_config());
    let snapshot = snapshot_with(&[("A", 2.55557)]);

    engine
        .submit_orders(vec![intent("A", -10.0)], &snapshot)
        .await
        .unwrap();

    let submitted = mock.submitted();
    assert_eq!(submitted.len(), 1);
    // Floored, not rounded: rounding up would oversell.
    assert!((submitted[0].qty - 2.5555).abs() < 1e-12);
}

#[tokio::test]
async fn insufficient_balance_rescales_the_buy() {
    let mock = MockBroker::default();
    mock.script_rejection(
        "B",
        BrokerError::InsufficientBalance {
            requested: 120.0,
            available: 100.0,
        },
    );
    let mut engine = ExecutionEngine::new(&mock, symbols(&["B"]), &exec_config());
    let snapshot = snapshot_with(&[]);

    engine
        .submit_orders(vec![intent("B", 1.2)], &snapshot)
        .await
        .unwrap();

    let submitted = mock.submitted();
    assert_eq!(submitted.len(), 2);
    assert!((submitted[0].qty - 1.2).abs() < 1e-12);
    // Rescaled by available / requested = 100 / 120.
    assert!((submitted[1].qty - 1.0).abs() < 1e-12);
    assert_eq!(engine.order_history().len(), 1);
    assert!((engine.order_history()[0].qty - 1.0).abs() < 1e-12);
}

#[tokio::test]
async fn balance_retries_are_bounded() {
    let mock = MockBroker::default();
    *mock.reject_all_buys.lock().unwrap() = Some((100.0, 99.0));
    let config = exec_config();
    let mut engine = ExecutionEngine::new(&mock, symbols(&["B"]), &config);
    let snapshot = snapshot_with(&[]);

    engine
        .submit_orders(vec![intent("B", 1.0)], &snapshot)
        .await
        .unwrap();

    // Initial attempt plus max_balance_retries rescaled attempts, then the
    // buy is dropped rather than looping forever.
    assert_eq!(mock.submitted().len(), config.max_balance_retries + 1);
    assert!(engine.order_history().is_empty());
}

#[tokio::test]
async fn minimum_order_size_rejection_is_skipped() {
    let mock = MockBroker::default();
    mock.script_rejection("B", BrokerError::MinimumOrderSize);
    let mut engine = ExecutionEngine::new(&mock, symbols(&["B"]), &exec_config());
    let snapshot = snapshot_with(&[]);

    engine
        .submit_orders(vec![intent("B", 0.001)], &snapshot)
        .await
        .unwrap();

    assert_eq!(mock.submitted().len(), 1);
    assert!(engine.order_history().is_empty());
}

#[tokio::test]
async fn unrecognized_rejection_propagates() {
    let mock = MockBroker::default();
    mock.script_rejection("B", BrokerError::Api("boom".to_string()));
    let mut engine = ExecutionEngine::new(&mock, symbols(&["B"]), &exec_config());
    let snapshot = snapshot_with(&[]);

    let result = engine.submit_orders(vec![intent("B", 1.0)], &snapshot).await;
    assert!(matches!(
        result,
        Err(EngineError::Broker(BrokerError::Api(_)))
    ));
}

#[tokio::test]
async fn circuit_breaker_liquidates_and_halts() {
    let mock = MockBroker::default()
        .with_position("A", 1.5, 10.0)
        .with_account(1_000.0, 100.0);
    let mut config = exec_config();
    config.failure_limit = 2;
    let mut engine = ExecutionEngine::new(&mock, symbols(&["A", "B", "C"]), &config);

    // No quotes scripted: every symbol records a failure, the third trips
    // the breaker.
    let snapshot = PortfolioSnapshot::default();
    let result = engine.refresh_prices(&snapshot).await;
    assert!(matches!(
        result,
        Err(EngineError::CircuitBreaker { failures: 3, .. })
    ));

    let submitted = mock.submitted();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].symbol, "A");
    assert_eq!(submitted[0].side, OrderSide::Sell);
    assert!((submitted[0].qty - 1.5).abs() < 1e-12);
}

#[tokio::test]
async fn cancel_open_orders_cancels_each_one() {
    let mock = MockBroker::default();
    for id in ["order-a", "order-b"] {
        mock.open_orders.lock().unwrap().push(BrokerOrder {
            id: id.to_string(),
            symbol: "A".to_string(),
            status: "new".to_string(),
            created_at: Utc::now(),
        });
    }
    let engine = ExecutionEngine::new(&mock, symbols(&["A"]), &exec_config());

    engine.cancel_open_orders().await.unwrap();
    assert_eq!(
        *mock.cancelled.lock().unwrap(),
        vec!["order-a".to_string(), "order-b".to_string()]
    );
}

#[tokio::test]
async fn refresh_positions_seeds_the_whole_universe() {
    let mock = MockBroker::default()
        .with_position("A", 2.0, 10.0)
        .with_position("X", 5.0, 1.0)
        .with_account(100.0, 20.0);
    let engine = ExecutionEngine::new(&mock, symbols(&["A", "B"]), &exec_config());

    let snapshot = engine.refresh_positions().await.unwrap();
    assert_eq!(snapshot.positions.len(), 2);
    assert!((snapshot.qty("A") - 2.0).abs() < 1e-12);
    assert!((snapshot.weight("A") - 0.2).abs() < 1e-12);
    assert_eq!(snapshot.qty("B"), 0.0);
    // Out-of-universe position is ignored, not traded.
    assert!(!snapshot.positions.contains_key("X"));
}
