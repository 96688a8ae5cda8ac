use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use reversebot::config::AppConfig;
use reversebot::dispatch::{Dispatcher, SignalFilter, SignalHandler};
use reversebot::exchange::okx::{OkxClient, OkxCredentials};
use reversebot::exchange::paper::PaperExchange;
use reversebot::exchange::ExchangeApi;
use reversebot::execution::OrderExecutor;
use reversebot::models::{ControlCommand, Signal, SignalKind};
use reversebot::position::PositionBook;
use reversebot::signal::{SignalParser, SignalValidator, ValidationResult};
use reversebot::strategy::{
    FixedTargetStrategy, SelectionMode, Strategy, StrategySelector, TieredStrategy,
};
use reversebot::Result;

#[derive(Parser)]
#[command(name = "reversebot", about = "Reverse-following signal trading bot")]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<String>,

    /// Trade against the live venue instead of the paper simulator
    #[arg(long)]
    live: bool,

    /// Override the dispatch mode: parallel | sequential | selective
    #[arg(long)]
    dispatch_mode: Option<String>,
}

/// Handles operational commands from the feed: pause/resume, sizing mode,
/// uptime queries, leverage updates
struct ControlHandler {
    strategies: Vec<Arc<dyn Strategy>>,
    conservative: Arc<AtomicBool>,
    leverage: AtomicU32,
    started: Instant,
}

#[async_trait]
impl SignalHandler for ControlHandler {
    async fn handle(&self, signal: &Signal, _validation: &ValidationResult) -> anyhow::Result<()> {
        let Some(command) = signal.control else {
            return Ok(());
        };

        match command {
            ControlCommand::Pause => {
                for strategy in &self.strategies {
                    strategy.pause();
                }
                tracing::warn!("all strategies paused by control command");
            }
            ControlCommand::Resume => {
                for strategy in &self.strategies {
                    strategy.resume();
                }
                tracing::info!("all strategies resumed by control command");
            }
            ControlCommand::ConservativeMode => {
                self.conservative.store(true, Ordering::SeqCst);
                tracing::warn!("conservative sizing enabled");
            }
            ControlCommand::NormalMode => {
                self.conservative.store(false, Ordering::SeqCst);
                tracing::info!("normal sizing restored");
            }
            ControlCommand::UptimeQuery => {
                tracing::info!(
                    uptime_secs = self.started.elapsed().as_secs(),
                    leverage = self.leverage.load(Ordering::SeqCst),
                    "uptime query"
                );
            }
            ControlCommand::Leverage(n) => {
                self.leverage.store(n, Ordering::SeqCst);
                tracing::info!(leverage = n, "leverage updated");
            }
        }
        Ok(())
    }
}

struct ControlOnly;

impl SignalFilter for ControlOnly {
    fn accepts(&self, signal: &Signal, _validation: &ValidationResult) -> bool {
        signal.kind == SignalKind::Control
    }
}

fn setup_logging() {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn build_exchange(config: &AppConfig) -> Result<Arc<dyn ExchangeApi>> {
    if config.exchange.paper {
        tracing::info!("using paper venue (no live orders)");
        let venue = PaperExchange::new();
        // Seed marks so the simulator can quote the whitelisted instruments
        for (symbol, price) in [("BTC-USDT-SWAP", 60_000.0), ("ETH-USDT-SWAP", 3_000.0)] {
            venue.set_price(symbol, price);
        }
        return Ok(Arc::new(venue));
    }

    let (Some(api_key), Some(api_secret), Some(passphrase)) = (
        config.exchange.api_key.clone(),
        config.exchange.api_secret.clone(),
        config.exchange.passphrase.clone(),
    ) else {
        return Err("live trading requires api_key, api_secret and passphrase".into());
    };

    tracing::info!(rest_url = %config.exchange.rest_url, "using live venue");
    Ok(Arc::new(OkxClient::new(
        config.exchange.rest_url.clone(),
        Some(OkxCredentials {
            api_key,
            api_secret,
            passphrase,
        }),
    )))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();
    let mut config = reversebot::config::load(cli.config.as_deref())?;
    if cli.live {
        config.exchange.paper = false;
    }
    if let Some(mode) = &cli.dispatch_mode {
        config.dispatcher.mode = mode.clone();
    }

    tracing::info!("reversebot starting");
    tracing::info!(
        paper = config.exchange.paper,
        dispatch_mode = %config.dispatcher.mode,
        base_size = config.fixed_target.base_size,
        max_sequences = config.tiered.max_active_sequences,
        "configuration loaded"
    );

    // Venue, executor, registry
    let exchange = build_exchange(&config)?;
    let executor = Arc::new(OrderExecutor::new(exchange.clone(), config.executor.clone()));
    let book = Arc::new(Mutex::new(PositionBook::new()));
    let conservative = Arc::new(AtomicBool::new(false));

    // Strategies
    let fixed = Arc::new(FixedTargetStrategy::new(
        "reverse-fixed",
        config.fixed_target.clone(),
        exchange.clone(),
        executor.clone(),
        book.clone(),
        conservative.clone(),
    ));
    let tiered = Arc::new(TieredStrategy::new(
        "reverse-tiered",
        config.tiered.clone(),
        exchange.clone(),
        executor.clone(),
        book.clone(),
        conservative.clone(),
    ));

    let strategies: Vec<Arc<dyn Strategy>> = vec![fixed.clone(), tiered.clone()];
    for strategy in &strategies {
        if !strategy.start().await {
            return Err(format!("strategy {} failed to start", strategy.name()).into());
        }
    }

    let selector = Arc::new(StrategySelector::new(
        strategies.clone(),
        SelectionMode::Conditional,
    ));

    // Dispatch wiring: control commands outrank strategy routing
    let dispatcher = Arc::new(Dispatcher::new(
        config.dispatcher.dispatch_mode(),
        config.dispatcher.queue_capacity,
    ));
    dispatcher.subscribe(
        "system-control",
        Arc::new(ControlHandler {
            strategies: strategies.clone(),
            conservative: conservative.clone(),
            leverage: AtomicU32::new(0),
            started: Instant::now(),
        }),
        10,
        Some(Arc::new(ControlOnly)),
        1,
    );
    dispatcher.subscribe("strategy-selector", selector.clone(), 5, None, 4);
    dispatcher.clone().start();

    // Housekeeping: purge closed positions past the retention window
    let purge_task = {
        let book = book.clone();
        tokio::spawn(async move {
            let mut tick =
                tokio::time::interval(std::time::Duration::from_secs(3600));
            loop {
                tick.tick().await;
                book.lock().unwrap().purge_closed(chrono::Duration::days(7));
            }
        })
    };

    // Feed loop: the message-channel listener is an external collaborator,
    // raw signal lines arrive on stdin
    let mut parser = SignalParser::new();
    let mut validator = SignalValidator::new(config.validator.clone());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    tracing::info!("reading raw signals from stdin (ctrl-c to stop)");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown requested");
                break;
            }
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                let signal = match parser.parse(line) {
                    Ok(signal) => signal,
                    Err(e) => {
                        // Malformed input is dropped, never retried
                        tracing::warn!(error = %e, "dropping unparseable feed line");
                        continue;
                    }
                };

                let validation = validator.validate(&signal);
                if !validation.is_valid {
                    tracing::warn!(signal_id = %signal.id, "dropping invalid signal");
                    continue;
                }

                if let Err(e) = dispatcher.enqueue(signal, validation) {
                    tracing::error!(error = %e, "signal dropped by backpressure");
                }
            }
        }
    }

    // Orderly shutdown: stop intake, then strategies (cancelling their
    // monitors), then the execution loop
    dispatcher.stop().await;
    for strategy in &strategies {
        strategy.stop().await;
    }
    executor.shutdown().await;
    purge_task.abort();

    let stats = dispatcher.stats();
    tracing::info!(
        dispatched = stats.total_dispatched,
        delivered = stats.successful_deliveries,
        failed = stats.failed_deliveries,
        "reversebot stopped"
    );

    Ok(())
}
