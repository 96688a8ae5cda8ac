use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{
    ExecutionError, ExecutionStats, OrderCallback, OrderRequest, OrderResult, OrderStatus,
    OrderType,
};
use crate::exchange::retry::{with_retry, RetryPolicy};
use crate::exchange::{ExchangeApi, OrderParams, VenueOrder, VenueOrderStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_min_order_amount")]
    pub min_order_amount: f64,
    /// How long a limit order may sit unfilled before it is cancelled
    #[serde(default = "default_order_timeout_secs")]
    pub order_timeout_secs: u64,
    #[serde(default = "default_fill_poll_ms")]
    pub fill_poll_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_min_order_amount() -> f64 {
    0.01
}
fn default_order_timeout_secs() -> u64 {
    30
}
fn default_fill_poll_ms() -> u64 {
    1000
}
fn default_queue_capacity() -> usize {
    1000
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            min_order_amount: default_min_order_amount(),
            order_timeout_secs: default_order_timeout_secs(),
            fill_poll_ms: default_fill_poll_ms(),
            queue_capacity: default_queue_capacity(),
            retry: RetryPolicy::default(),
        }
    }
}

struct QueuedOrder {
    request: OrderRequest,
    done: Option<oneshot::Sender<OrderResult>>,
}

/// Queued order executor.
///
/// Orders are validated on submission, then drained by a single background
/// task in strict FIFO order. Type-specific handling: market orders execute
/// once (with transient retry), limit orders poll for a fill up to a timeout
/// and are cancelled on expiry, stop orders carry their trigger price as an
/// execution parameter.
pub struct OrderExecutor {
    exchange: Arc<dyn ExchangeApi>,
    config: ExecutorConfig,
    tx: mpsc::Sender<QueuedOrder>,
    completed: Arc<Mutex<HashMap<Uuid, OrderResult>>>,
    callbacks: Arc<RwLock<Vec<Arc<dyn OrderCallback>>>>,
    stats: Arc<Mutex<ExecutionStats>>,
    token: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl OrderExecutor {
    pub fn new(exchange: Arc<dyn ExchangeApi>, config: ExecutorConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let completed = Arc::new(Mutex::new(HashMap::new()));
        let callbacks: Arc<RwLock<Vec<Arc<dyn OrderCallback>>>> =
            Arc::new(RwLock::new(Vec::new()));
        let stats = Arc::new(Mutex::new(ExecutionStats::default()));
        let token = CancellationToken::new();

        let worker = Worker {
            exchange: exchange.clone(),
            config: config.clone(),
            completed: completed.clone(),
            callbacks: callbacks.clone(),
            stats: stats.clone(),
        };
        let handle = tokio::spawn(worker.run(rx, token.clone()));

        Self {
            exchange,
            config,
            tx,
            completed,
            callbacks,
            stats,
            token,
            worker: Mutex::new(Some(handle)),
        }
    }

    /// Validate and enqueue; returns the request id without waiting for the fill
    pub fn submit(&self, request: OrderRequest) -> Result<Uuid, ExecutionError> {
        self.validate(&request)?;
        let id = request.id;

        tracing::info!(
            order_id = %id,
            symbol = %request.symbol,
            side = request.side.as_str(),
            order_type = request.order_type.as_str(),
            amount = request.amount,
            strategy = %request.strategy,
            "order submitted"
        );

        self.enqueue(QueuedOrder {
            request,
            done: None,
        })?;
        Ok(id)
    }

    /// Validate, enqueue, and wait for the terminal result
    pub async fn execute(&self, request: OrderRequest) -> Result<OrderResult, ExecutionError> {
        self.validate(&request)?;
        let (done_tx, done_rx) = oneshot::channel();

        self.enqueue(QueuedOrder {
            request,
            done: Some(done_tx),
        })?;

        done_rx.await.map_err(|_| ExecutionError::Shutdown)
    }

    pub fn add_callback(&self, callback: Arc<dyn OrderCallback>) {
        self.callbacks.write().unwrap().push(callback);
    }

    pub fn result(&self, request_id: Uuid) -> Option<OrderResult> {
        self.completed.lock().unwrap().get(&request_id).cloned()
    }

    pub fn stats(&self) -> ExecutionStats {
        self.stats.lock().unwrap().clone()
    }

    pub fn exchange(&self) -> Arc<dyn ExchangeApi> {
        self.exchange.clone()
    }

    /// Stop the drain loop and wait for it to wind down
    pub async fn shutdown(&self) {
        self.token.cancel();
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    fn enqueue(&self, order: QueuedOrder) -> Result<(), ExecutionError> {
        self.tx.try_send(order).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ExecutionError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => ExecutionError::Shutdown,
        })
    }

    fn validate(&self, request: &OrderRequest) -> Result<(), ExecutionError> {
        if request.amount <= 0.0 {
            return Err(ExecutionError::Validation(format!(
                "amount must be positive, got {}",
                request.amount
            )));
        }
        if request.amount < self.config.min_order_amount {
            return Err(ExecutionError::Validation(format!(
                "amount {} below minimum {}",
                request.amount, self.config.min_order_amount
            )));
        }
        if request.order_type.requires_price() && request.price.unwrap_or(0.0) <= 0.0 {
            return Err(ExecutionError::Validation(format!(
                "{} order requires a price",
                request.order_type.as_str()
            )));
        }
        if request.order_type.requires_stop_price() && request.stop_price.unwrap_or(0.0) <= 0.0 {
            return Err(ExecutionError::Validation(format!(
                "{} order requires a stop price",
                request.order_type.as_str()
            )));
        }
        Ok(())
    }
}

struct Worker {
    exchange: Arc<dyn ExchangeApi>,
    config: ExecutorConfig,
    completed: Arc<Mutex<HashMap<Uuid, OrderResult>>>,
    callbacks: Arc<RwLock<Vec<Arc<dyn OrderCallback>>>>,
    stats: Arc<Mutex<ExecutionStats>>,
}

impl Worker {
    async fn run(self, mut rx: mpsc::Receiver<QueuedOrder>, token: CancellationToken) {
        tracing::info!("order execution loop started");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                queued = rx.recv() => {
                    let Some(queued) = queued else { break };
                    self.process(queued).await;
                }
            }
        }
        tracing::info!("order execution loop stopped");
    }

    async fn process(&self, queued: QueuedOrder) {
        let started = Instant::now();
        let request = queued.request;
        let result = self.execute_order(&request).await;

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.record_stats(&result, elapsed_ms);

        match result.status {
            OrderStatus::Filled | OrderStatus::Submitted => tracing::info!(
                order_id = %request.id,
                venue_order_id = ?result.venue_order_id,
                status = ?result.status,
                filled = result.filled_amount,
                avg_price = result.average_price,
                attempts = result.attempts,
                "order executed"
            ),
            _ => tracing::error!(
                order_id = %request.id,
                status = ?result.status,
                error = ?result.error,
                attempts = result.attempts,
                "order failed"
            ),
        }

        self.completed
            .lock()
            .unwrap()
            .insert(request.id, result.clone());

        self.notify(&request, &result);

        if let Some(done) = queued.done {
            let _ = done.send(result);
        }
    }

    async fn execute_order(&self, request: &OrderRequest) -> OrderResult {
        let mut result = OrderResult::pending(request.id);
        result.remaining_amount = request.amount;

        let params = OrderParams {
            pos_side: request.pos_side,
            stop_price: request.stop_price,
            tag: Some(truncate_tag(&request.strategy)),
            client_order_id: Some(request.client_order_id.clone()),
        };

        let placed = with_retry(&self.config.retry, "create_order", || {
            self.exchange.create_order(
                &request.symbol,
                request.order_type,
                request.side,
                request.amount,
                request.price,
                &params,
            )
        })
        .await;

        let (venue_order, attempts) = match placed {
            Ok(placed) => placed,
            Err(e) => {
                result.status = OrderStatus::Failed;
                result.attempts = if e.is_transient() {
                    self.config.retry.max_attempts
                } else {
                    1
                };
                result.error = Some(e.to_string());
                return result;
            }
        };

        result.attempts = attempts;
        result.venue_order_id = Some(venue_order.id.clone());

        let final_order = match request.order_type {
            OrderType::Limit if venue_order.status == VenueOrderStatus::Open => {
                match self.wait_for_fill(&venue_order.id, &request.symbol).await {
                    Ok(order) => order,
                    Err(e) => {
                        result.status = OrderStatus::Expired;
                        result.error = Some(e.to_string());
                        return result;
                    }
                }
            }
            _ => venue_order,
        };

        result.status = match final_order.status {
            VenueOrderStatus::Filled => OrderStatus::Filled,
            VenueOrderStatus::Open => OrderStatus::Submitted,
            VenueOrderStatus::Cancelled => OrderStatus::Cancelled,
            VenueOrderStatus::Rejected => OrderStatus::Rejected,
        };
        result.filled_amount = final_order.filled;
        result.remaining_amount = (request.amount - final_order.filled).max(0.0);
        result.average_price = final_order.average_price;
        result.fees = final_order.fee;
        result.executed_at = Some(chrono::Utc::now());

        result
    }

    /// Poll the venue until the order fills or the window expires; expired
    /// orders are cancelled before the fault is surfaced
    async fn wait_for_fill(
        &self,
        order_id: &str,
        symbol: &str,
    ) -> Result<VenueOrder, ExecutionError> {
        let timeout = std::time::Duration::from_secs(self.config.order_timeout_secs);
        let poll = std::time::Duration::from_millis(self.config.fill_poll_ms);
        let deadline = Instant::now() + timeout;

        while Instant::now() < deadline {
            tokio::time::sleep(poll).await;

            match self.exchange.fetch_order(order_id, symbol).await {
                Ok(order) if order.status == VenueOrderStatus::Filled => return Ok(order),
                Ok(order) if order.status.is_terminal() => return Ok(order),
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!(order_id, error = %e, "fill poll failed, will retry");
                }
            }
        }

        if let Err(e) = self.exchange.cancel_order(order_id, symbol).await {
            tracing::warn!(order_id, error = %e, "failed to cancel expired limit order");
        } else {
            tracing::warn!(order_id, "limit order expired, cancelled");
        }

        Err(ExecutionError::FillTimeout {
            order_id: order_id.to_string(),
            timeout_secs: self.config.order_timeout_secs,
        })
    }

    fn record_stats(&self, result: &OrderResult, elapsed_ms: f64) {
        let mut stats = self.stats.lock().unwrap();
        stats.total_orders += 1;
        if result.is_filled() || result.status == OrderStatus::Submitted {
            stats.successful_orders += 1;
            stats.total_volume += result.filled_amount * result.average_price;
        } else {
            stats.failed_orders += 1;
        }
        stats.total_retries += result.attempts.saturating_sub(1) as u64;

        let n = stats.total_orders as f64;
        stats.avg_execution_ms = (stats.avg_execution_ms * (n - 1.0) + elapsed_ms) / n;
    }

    fn notify(&self, request: &OrderRequest, result: &OrderResult) {
        let callbacks = self.callbacks.read().unwrap().clone();
        for callback in callbacks {
            if let Err(e) = callback.on_complete(request, result) {
                tracing::error!(
                    order_id = %request.id,
                    error = %e,
                    "order completion callback failed"
                );
            }
        }
    }
}

fn truncate_tag(strategy: &str) -> String {
    strategy.chars().take(8).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::paper::PaperExchange;
    use crate::exchange::ExchangeError;
    use crate::execution::OrderSide;

    fn fast_config() -> ExecutorConfig {
        ExecutorConfig {
            min_order_amount: 0.01,
            order_timeout_secs: 1,
            fill_poll_ms: 20,
            queue_capacity: 16,
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay_ms: 1,
                max_delay_ms: 5,
                jitter_factor: 0.0,
            },
        }
    }

    fn setup() -> (Arc<PaperExchange>, OrderExecutor) {
        let venue = Arc::new(PaperExchange::new());
        venue.set_price("BTC-USDT-SWAP", 50_000.0);
        let executor = OrderExecutor::new(venue.clone(), fast_config());
        (venue, executor)
    }

    #[tokio::test]
    async fn test_zero_amount_rejected_before_queue() {
        let (venue, executor) = setup();

        let request = OrderRequest::market("BTC-USDT-SWAP", OrderSide::Buy, 0.0, "test");
        let err = executor.submit(request).unwrap_err();

        assert!(matches!(err, ExecutionError::Validation(_)));
        assert_eq!(venue.order_count(), 0);
    }

    #[tokio::test]
    async fn test_below_minimum_rejected_before_queue() {
        let (venue, executor) = setup();

        let request = OrderRequest::market("BTC-USDT-SWAP", OrderSide::Buy, 0.001, "test");
        let err = executor.submit(request).unwrap_err();

        assert!(matches!(err, ExecutionError::Validation(_)));
        assert!(err.to_string().contains("below minimum"));
        assert_eq!(venue.order_count(), 0);
    }

    #[tokio::test]
    async fn test_limit_without_price_rejected() {
        let (_venue, executor) = setup();

        let mut request = OrderRequest::market("BTC-USDT-SWAP", OrderSide::Buy, 1.0, "test");
        request.order_type = OrderType::Limit;

        let err = executor.submit(request).unwrap_err();
        assert!(matches!(err, ExecutionError::Validation(_)));
    }

    #[tokio::test]
    async fn test_stop_without_trigger_rejected() {
        let (_venue, executor) = setup();

        let mut request = OrderRequest::market("BTC-USDT-SWAP", OrderSide::Sell, 1.0, "test");
        request.order_type = OrderType::Stop;

        let err = executor.submit(request).unwrap_err();
        assert!(matches!(err, ExecutionError::Validation(_)));
    }

    #[tokio::test]
    async fn test_market_order_fills() {
        let (_venue, executor) = setup();

        let request = OrderRequest::market("BTC-USDT-SWAP", OrderSide::Sell, 2.0, "test");
        let result = executor.execute(request).await.unwrap();

        assert_eq!(result.status, OrderStatus::Filled);
        assert_eq!(result.filled_amount, 2.0);
        assert_eq!(result.average_price, 50_000.0);
        assert_eq!(result.attempts, 1);

        let stats = executor.stats();
        assert_eq!(stats.total_orders, 1);
        assert_eq!(stats.successful_orders, 1);
        assert_eq!(stats.total_retries, 0);
    }

    #[tokio::test]
    async fn test_orders_drain_in_submission_order() {
        let (venue, executor) = setup();

        let ids: Vec<Uuid> = (0..3)
            .map(|i| {
                let request =
                    OrderRequest::market("BTC-USDT-SWAP", OrderSide::Buy, 1.0 + i as f64, "test");
                executor.submit(request).unwrap()
            })
            .collect();

        // Wait for the queue to drain
        for _ in 0..100 {
            if ids.iter().all(|id| executor.result(*id).is_some()) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        // Paper venue ids are sequential, so FIFO execution maps the first
        // request to the first venue order
        for (i, id) in ids.iter().enumerate() {
            let result = executor.result(*id).unwrap();
            assert_eq!(
                result.venue_order_id.as_deref(),
                Some(format!("paper-{}", i + 1).as_str())
            );
        }
        assert_eq!(venue.order_count(), 3);
    }

    #[tokio::test]
    async fn test_transient_faults_retried_to_success() {
        let (venue, executor) = setup();
        venue.inject_fault(ExchangeError::Network("reset".into()));
        venue.inject_fault(ExchangeError::Network("reset again".into()));

        let request = OrderRequest::market("BTC-USDT-SWAP", OrderSide::Buy, 1.0, "test");
        let result = executor.execute(request).await.unwrap();

        assert_eq!(result.status, OrderStatus::Filled);
        assert_eq!(result.attempts, 3);

        let stats = executor.stats();
        assert_eq!(stats.total_retries, 2);
        assert_eq!(stats.successful_orders, 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_the_order() {
        let (venue, executor) = setup();
        for _ in 0..3 {
            venue.inject_fault(ExchangeError::RateLimited("slow down".into()));
        }

        let request = OrderRequest::market("BTC-USDT-SWAP", OrderSide::Buy, 1.0, "test");
        let result = executor.execute(request).await.unwrap();

        assert_eq!(result.status, OrderStatus::Failed);
        assert!(result.error.as_deref().unwrap().contains("rate limited"));
        assert_eq!(executor.stats().failed_orders, 1);
    }

    #[tokio::test]
    async fn test_venue_rejection_not_retried() {
        let (venue, executor) = setup();
        venue.inject_fault(ExchangeError::Rejected("insufficient balance".into()));

        let request = OrderRequest::market("BTC-USDT-SWAP", OrderSide::Buy, 1.0, "test");
        let result = executor.execute(request).await.unwrap();

        assert_eq!(result.status, OrderStatus::Failed);
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test]
    async fn test_unfilled_limit_order_times_out_and_cancels() {
        let (venue, executor) = setup();

        // Buy far below market: rests until the 1s window expires
        let request =
            OrderRequest::limit("BTC-USDT-SWAP", OrderSide::Buy, 1.0, 10_000.0, "test");
        let result = executor.execute(request).await.unwrap();

        assert_eq!(result.status, OrderStatus::Expired);
        assert!(result.error.as_deref().unwrap().contains("unfilled"));

        let venue_order = venue.order(result.venue_order_id.as_deref().unwrap()).unwrap();
        assert_eq!(venue_order.status, crate::exchange::VenueOrderStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_limit_order_fills_when_price_crosses() {
        let (venue, executor) = setup();

        let request =
            OrderRequest::limit("BTC-USDT-SWAP", OrderSide::Buy, 1.0, 45_000.0, "test");

        let venue_for_move = venue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(60)).await;
            venue_for_move.set_price("BTC-USDT-SWAP", 44_000.0);
        });

        let result = executor.execute(request).await.unwrap();
        assert_eq!(result.status, OrderStatus::Filled);
        assert_eq!(result.average_price, 45_000.0);
    }

    struct Recorder {
        seen: Mutex<Vec<Uuid>>,
    }

    impl OrderCallback for Recorder {
        fn on_complete(&self, request: &OrderRequest, _result: &OrderResult) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(request.id);
            Ok(())
        }
    }

    struct Exploder;

    impl OrderCallback for Exploder {
        fn on_complete(&self, _request: &OrderRequest, _result: &OrderResult) -> anyhow::Result<()> {
            anyhow::bail!("callback blew up")
        }
    }

    #[tokio::test]
    async fn test_callback_fault_is_isolated() {
        let (_venue, executor) = setup();

        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        // The exploding callback registered first must not prevent the recorder
        executor.add_callback(Arc::new(Exploder));
        executor.add_callback(recorder.clone());

        let request = OrderRequest::market("BTC-USDT-SWAP", OrderSide::Buy, 1.0, "test");
        let id = request.id;
        executor.execute(request).await.unwrap();

        assert_eq!(recorder.seen.lock().unwrap().as_slice(), &[id]);
    }

    #[tokio::test]
    async fn test_queue_full_backpressure() {
        let venue = Arc::new(PaperExchange::new());
        // No price set: orders would fail, but we only care about queueing.
        // Tiny queue, and stall the worker with a resting limit order first.
        venue.set_price("BTC-USDT-SWAP", 50_000.0);
        let mut config = fast_config();
        config.queue_capacity = 1;
        config.order_timeout_secs = 2;
        let executor = OrderExecutor::new(venue, config);

        // Occupies the worker for several seconds
        executor
            .submit(OrderRequest::limit(
                "BTC-USDT-SWAP",
                OrderSide::Buy,
                1.0,
                10_000.0,
                "test",
            ))
            .unwrap();

        // Fill the single queue slot, then the next submit must fail fast
        let mut saw_queue_full = false;
        for _ in 0..3 {
            let request = OrderRequest::market("BTC-USDT-SWAP", OrderSide::Buy, 1.0, "test");
            match executor.submit(request) {
                Err(ExecutionError::QueueFull) => {
                    saw_queue_full = true;
                    break;
                }
                Ok(_) => continue,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert!(saw_queue_full);

        executor.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_worker() {
        let (_venue, executor) = setup();
        executor.shutdown().await;

        let request = OrderRequest::market("BTC-USDT-SWAP", OrderSide::Buy, 1.0, "test");
        // Queue may accept or report shutdown depending on timing; executing
        // must not hang either way
        match executor.execute(request).await {
            Ok(_) | Err(ExecutionError::Shutdown) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
}
