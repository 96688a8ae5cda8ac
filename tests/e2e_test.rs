use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use reversebot::dispatch::{DispatchMode, Dispatcher};
use reversebot::exchange::paper::PaperExchange;
use reversebot::exchange::retry::RetryPolicy;
use reversebot::exchange::ExchangeError;
use reversebot::execution::{
    ExecutionError, ExecutorConfig, OrderExecutor, OrderRequest, OrderSide, OrderStatus,
};
use reversebot::models::{Direction, Signal, SignalAction};
use reversebot::position::{PositionBook, PositionStatus};
use reversebot::signal::{SignalParser, SignalValidator, ValidationResult, ValidatorConfig};
use reversebot::strategy::{
    FixedTargetConfig, FixedTargetStrategy, SelectionMode, Strategy, StrategySelector,
    TieredConfig, TieredStrategy,
};

const SYMBOL: &str = "BTC-USDT-SWAP";

fn fast_executor_config() -> ExecutorConfig {
    ExecutorConfig {
        fill_poll_ms: 10,
        order_timeout_secs: 1,
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
            jitter_factor: 0.0,
        },
        ..Default::default()
    }
}

struct Stack {
    venue: Arc<PaperExchange>,
    executor: Arc<OrderExecutor>,
    book: Arc<Mutex<PositionBook>>,
}

fn stack(initial_price: f64) -> Stack {
    let venue = Arc::new(PaperExchange::new());
    venue.set_price(SYMBOL, initial_price);
    let executor = Arc::new(OrderExecutor::new(venue.clone(), fast_executor_config()));
    let book = Arc::new(Mutex::new(PositionBook::new()));
    Stack {
        venue,
        executor,
        book,
    }
}

fn open_signal(action: SignalAction, quantity: f64, confidence: f64) -> Signal {
    let mut signal = Signal::directional(
        format!("[{}] qty:{} market:{}", action.as_str(), quantity, SYMBOL),
        action,
        quantity,
        SYMBOL.into(),
    );
    signal.confidence = confidence;
    signal
}

// Scenario 1: an open-long signal is reversed into a short sized
// base_size x quantity x max(0.5, confidence); a 30% favorable move closes it
// with reason take-profit.
#[tokio::test]
async fn test_fixed_target_reverses_and_takes_profit() {
    let s = stack(100.0);
    let strategy = Arc::new(FixedTargetStrategy::new(
        "reverse-fixed",
        FixedTargetConfig::default(),
        s.venue.clone(),
        s.executor.clone(),
        s.book.clone(),
        Arc::new(AtomicBool::new(false)),
    ));
    assert!(strategy.start().await);

    let selector = Arc::new(StrategySelector::new(
        vec![strategy.clone() as Arc<dyn Strategy>],
        SelectionMode::AllActive,
    ));

    let signal = open_signal(SignalAction::OpenLong, 1.0, 0.9);
    let decisions = selector
        .process_signal(&signal, &ValidationResult::passing())
        .await;

    assert_eq!(decisions.len(), 1);
    assert!(decisions[0].is_execute());
    assert_eq!(decisions[0].action, Some(SignalAction::OpenShort));
    // base 10 x qty 1 x max(0.5, 0.9)
    assert_eq!(decisions[0].quantity, 9.0);

    {
        let book = s.book.lock().unwrap();
        let positions = book.positions_for_strategy("reverse-fixed");
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].side, Direction::Short);
        assert_eq!(positions[0].entry_price, 100.0);
    }

    // 30% in the short's favor
    s.venue.set_price(SYMBOL, 70.0);
    strategy.run_monitor_cycle().await;

    let book = s.book.lock().unwrap();
    let position = book.positions_for_strategy("reverse-fixed")[0];
    assert_eq!(position.status, PositionStatus::Closed);

    let metrics = strategy.core().metrics();
    assert_eq!(metrics.successful_trades, 1);
    assert!((metrics.total_pnl - 270.0).abs() < 1e-9); // (100 - 70) * 9

    strategy.stop().await;
}

// Scenario 2: three open-short signals with quantities 3, 4, 5 arriving close
// together build one sequence with three tier-table-sized positions; hitting
// the top tier's threshold takes partial profit across the whole sequence.
#[tokio::test]
async fn test_tiered_sequence_builds_and_takes_partial_profit() {
    let s = stack(100.0);
    let strategy = Arc::new(TieredStrategy::new(
        "reverse-tiered",
        TieredConfig::default(),
        s.venue.clone(),
        s.executor.clone(),
        s.book.clone(),
        Arc::new(AtomicBool::new(false)),
    ));
    assert!(strategy.start().await);

    for quantity in [3.0, 4.0, 5.0] {
        let signal = open_signal(SignalAction::OpenShort, quantity, 1.0);
        let decision = strategy
            .process_signal(&signal, &ValidationResult::passing())
            .await;
        assert!(decision.is_execute(), "tier {} rejected", quantity);
        assert!(strategy.execute_decision(&decision).await.unwrap());
    }

    assert_eq!(strategy.active_sequence_count(), 1);
    let sequence = strategy.sequences_snapshot().pop().unwrap();
    assert_eq!(sequence.position_ids.len(), 3);
    // Tier table at confidence 1.0: 30 + 40 + 50
    assert_eq!(sequence.total_size, 120.0);

    // Signals were open-short, so the sequence holds longs; +30% arms the
    // top tier (threshold 0.30, close ratio 0.90)
    s.venue.set_price(SYMBOL, 130.0);
    strategy.run_monitor_cycle().await;

    let sequence = strategy.sequences_snapshot().pop().unwrap();
    assert!(sequence.fired_tiers.contains(&5));

    let open_total: f64 = {
        let book = s.book.lock().unwrap();
        book.positions_for_strategy("reverse-tiered")
            .iter()
            .map(|p| p.size)
            .sum()
    };
    // 90% of 120 closed, 12 remains
    assert!((open_total - 12.0).abs() < 1e-9);

    // The fired tier never fires twice
    strategy.run_monitor_cycle().await;
    let open_after: f64 = {
        let book = s.book.lock().unwrap();
        book.positions_for_strategy("reverse-tiered")
            .iter()
            .map(|p| p.size)
            .sum()
    };
    assert_eq!(open_total, open_after);

    strategy.stop().await;
}

// Scenario 3: an order below the configured minimum is rejected before it
// ever reaches the execution queue.
#[tokio::test]
async fn test_undersized_order_rejected_before_queue() {
    let s = stack(100.0);

    let request = OrderRequest::market(SYMBOL, OrderSide::Buy, 0.001, "test");
    let err = s.executor.submit(request).unwrap_err();

    assert!(matches!(err, ExecutionError::Validation(_)));
    assert_eq!(s.venue.order_count(), 0);
    assert_eq!(s.executor.stats().total_orders, 0);
}

// Scenario 4: two transient venue faults followed by a success within
// max-attempts 3 still produce a FILLED order, with the retries visible in
// the execution statistics.
#[tokio::test]
async fn test_transient_faults_recovered_within_retry_budget() {
    let s = stack(100.0);
    s.venue.inject_fault(ExchangeError::Network("connection reset".into()));
    s.venue.inject_fault(ExchangeError::RateLimited("429".into()));

    let request = OrderRequest::market(SYMBOL, OrderSide::Sell, 2.0, "test");
    let result = s.executor.execute(request).await.unwrap();

    assert_eq!(result.status, OrderStatus::Filled);
    assert_eq!(result.attempts, 3);

    let stats = s.executor.stats();
    assert_eq!(stats.successful_orders, 1);
    assert_eq!(stats.total_retries, 2);
}

// Dispatcher backpressure: a full intake queue rejects instead of blocking.
#[tokio::test]
async fn test_dispatch_queue_backpressure() {
    let dispatcher = Dispatcher::new(DispatchMode::Parallel, 2);

    for quantity in [1.0, 2.0] {
        dispatcher
            .enqueue(
                open_signal(SignalAction::OpenLong, quantity, 0.9),
                ValidationResult::passing(),
            )
            .unwrap();
    }

    let err = dispatcher
        .enqueue(
            open_signal(SignalAction::OpenLong, 3.0, 0.9),
            ValidationResult::passing(),
        )
        .unwrap_err();
    assert!(err.to_string().contains("full"));
}

// Round trip: the canonical rendering of a parsed signal parses back to the
// same fields.
#[test]
fn test_canonical_round_trip() {
    let mut parser = SignalParser::new();

    for raw in [
        "[open-long] qty:1 market:BTC-USDT-SWAP",
        "[open-short] qty:2.5 market:ETH-USDT-SWAP",
        "[close-short] qty:4 market:BTC-USDT-SWAP",
    ] {
        let first = parser.parse(raw).unwrap();
        let second = parser.parse(&first.render()).unwrap();

        assert_eq!(second.action, first.action);
        assert_eq!(second.quantity, first.quantity);
        assert_eq!(second.symbol, first.symbol);
        assert_eq!(second.kind, first.kind);
    }
}

// Duplicate detection: an identical signal inside the 60s window halves the
// confidence score.
#[test]
fn test_duplicate_signal_penalty() {
    let mut validator = SignalValidator::new(ValidatorConfig::default());

    let first = validator.validate(&open_signal(SignalAction::OpenLong, 4.0, 0.9));
    let second = validator.validate(&open_signal(SignalAction::OpenLong, 4.0, 0.9));

    assert!(first.is_valid);
    assert!(second.is_duplicate);
    assert!(second.confidence_score <= first.confidence_score * 0.5);
}

// Full pipeline through the background drain loop: raw text in, reverse
// position out.
#[tokio::test]
async fn test_pipeline_from_raw_text_to_position() {
    let s = stack(100.0);
    let strategy = Arc::new(FixedTargetStrategy::new(
        "reverse-fixed",
        FixedTargetConfig::default(),
        s.venue.clone(),
        s.executor.clone(),
        s.book.clone(),
        Arc::new(AtomicBool::new(false)),
    ));
    assert!(strategy.start().await);

    let selector = Arc::new(StrategySelector::new(
        vec![strategy.clone() as Arc<dyn Strategy>],
        SelectionMode::Conditional,
    ));

    let dispatcher = Arc::new(Dispatcher::new(DispatchMode::Parallel, 100));
    dispatcher.subscribe("strategy-selector", selector, 5, None, 4);
    dispatcher.clone().start();

    let mut parser = SignalParser::new();
    let mut validator = SignalValidator::new(ValidatorConfig::default());

    let signal = parser.parse("[open-short] qty:2 market:BTC-USDT-SWAP").unwrap();
    let validation = validator.validate(&signal);
    assert!(validation.is_valid);

    dispatcher.enqueue(signal, validation).unwrap();

    // Wait for the drain loop to route the signal into a fill
    let mut opened = false;
    for _ in 0..100 {
        {
            let book = s.book.lock().unwrap();
            if !book.positions_for_strategy("reverse-fixed").is_empty() {
                opened = true;
                break;
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(opened, "no position opened by the pipeline");

    {
        let book = s.book.lock().unwrap();
        let position = book.positions_for_strategy("reverse-fixed")[0];
        // open-short reversed into a long
        assert_eq!(position.side, Direction::Long);
    }

    dispatcher.stop().await;
    strategy.stop().await;
    s.executor.shutdown().await;
}

// A closing signal from the feed flattens every tiered sequence immediately,
// regardless of PnL.
#[tokio::test]
async fn test_hand_over_flattens_sequences() {
    let s = stack(100.0);
    let strategy = Arc::new(TieredStrategy::new(
        "reverse-tiered",
        TieredConfig::default(),
        s.venue.clone(),
        s.executor.clone(),
        s.book.clone(),
        Arc::new(AtomicBool::new(false)),
    ));
    assert!(strategy.start().await);

    for quantity in [3.0, 4.0] {
        let signal = open_signal(SignalAction::OpenShort, quantity, 1.0);
        let decision = strategy
            .process_signal(&signal, &ValidationResult::passing())
            .await;
        strategy.execute_decision(&decision).await.unwrap();
    }
    assert_eq!(strategy.active_sequence_count(), 1);

    // Losing territory for the longs; hand-over must close anyway
    s.venue.set_price(SYMBOL, 95.0);

    let closing = open_signal(SignalAction::CloseShort, 1.0, 1.0);
    let decision = strategy
        .process_signal(&closing, &ValidationResult::passing())
        .await;
    assert!(!decision.is_execute());

    assert_eq!(strategy.active_sequence_count(), 0);
    let book = s.book.lock().unwrap();
    for position in book.positions_for_strategy("reverse-tiered") {
        assert_eq!(position.status, PositionStatus::Closed);
    }
}
