use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::Signal;
use crate::signal::ValidationResult;

/// A strategy or service receiving validated signals
#[async_trait]
pub trait SignalHandler: Send + Sync {
    async fn handle(&self, signal: &Signal, validation: &ValidationResult) -> anyhow::Result<()>;
}

/// Predicate deciding whether a subscriber wants a given signal
pub trait SignalFilter: Send + Sync {
    fn accepts(&self, signal: &Signal, validation: &ValidationResult) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DispatchMode {
    /// Invoke all eligible subscribers concurrently
    Parallel,
    /// Invoke one at a time in priority order, continuing past failures
    Sequential,
    /// Pick at most 3 subscribers matching the signal category, else all
    Selective,
}

#[derive(Error, Debug)]
pub enum DispatchError {
    /// Backpressure valve: the intake queue is at capacity
    #[error("signal intake queue is full")]
    QueueFull,

    #[error("dispatcher is stopped")]
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchResult {
    pub signal_id: Uuid,
    pub total_subscribers: usize,
    pub successful: usize,
    pub failed: usize,
    pub dispatch_ms: f64,
    /// Per-subscriber delivery outcome, in invocation order
    pub deliveries: Vec<(String, bool)>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct SubscriberStats {
    pub received: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub avg_handle_ms: f64,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct DispatchStats {
    pub total_dispatched: u64,
    pub successful_deliveries: u64,
    pub failed_deliveries: u64,
    pub avg_dispatch_ms: f64,
    pub per_subscriber: HashMap<String, SubscriberStats>,
}

struct Subscription {
    name: String,
    handler: Arc<dyn SignalHandler>,
    priority: i32,
    filter: Option<Arc<dyn SignalFilter>>,
    active: AtomicBool,
    max_concurrent: usize,
    in_flight: AtomicUsize,
}

/// Fans validated signals out to registered subscribers.
///
/// Failures are isolated per subscriber; the bounded intake queue rejects new
/// signals with `QueueFull` rather than blocking when full.
pub struct Dispatcher {
    mode: DispatchMode,
    subscribers: RwLock<HashMap<String, Arc<Subscription>>>,
    stats: Arc<Mutex<DispatchStats>>,
    tx: mpsc::Sender<(Arc<Signal>, Arc<ValidationResult>)>,
    rx: Mutex<Option<mpsc::Receiver<(Arc<Signal>, Arc<ValidationResult>)>>>,
    token: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(mode: DispatchMode, queue_capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_capacity);
        Self {
            mode,
            subscribers: RwLock::new(HashMap::new()),
            stats: Arc::new(Mutex::new(DispatchStats::default())),
            tx,
            rx: Mutex::new(Some(rx)),
            token: CancellationToken::new(),
            worker: Mutex::new(None),
        }
    }

    pub fn subscribe(
        &self,
        name: &str,
        handler: Arc<dyn SignalHandler>,
        priority: i32,
        filter: Option<Arc<dyn SignalFilter>>,
        max_concurrent: usize,
    ) {
        let subscription = Arc::new(Subscription {
            name: name.to_string(),
            handler,
            priority,
            filter,
            active: AtomicBool::new(true),
            max_concurrent: max_concurrent.max(1),
            in_flight: AtomicUsize::new(0),
        });

        self.subscribers
            .write()
            .unwrap()
            .insert(name.to_string(), subscription);
        self.stats
            .lock()
            .unwrap()
            .per_subscriber
            .insert(name.to_string(), SubscriberStats::default());

        tracing::info!(subscriber = name, priority, "subscriber registered");
    }

    pub fn unsubscribe(&self, name: &str) {
        self.subscribers.write().unwrap().remove(name);
        tracing::info!(subscriber = name, "subscriber removed");
    }

    pub fn set_active(&self, name: &str, active: bool) {
        if let Some(sub) = self.subscribers.read().unwrap().get(name) {
            sub.active.store(active, Ordering::SeqCst);
            tracing::info!(subscriber = name, active, "subscriber state changed");
        }
    }

    /// Queue a signal for the background drain loop.
    ///
    /// Fails fast with `QueueFull` once the bounded queue is at capacity.
    pub fn enqueue(
        &self,
        signal: Signal,
        validation: ValidationResult,
    ) -> Result<(), DispatchError> {
        self.tx
            .try_send((Arc::new(signal), Arc::new(validation)))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => DispatchError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => DispatchError::Stopped,
            })
    }

    pub fn queue_capacity_remaining(&self) -> usize {
        self.tx.capacity()
    }

    /// Start the background queue drain loop
    pub fn start(self: Arc<Self>) {
        let Some(mut rx) = self.rx.lock().unwrap().take() else {
            return;
        };

        let dispatcher = self.clone();
        let token = self.token.clone();
        let handle = tokio::spawn(async move {
            tracing::info!("signal dispatch loop started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    next = rx.recv() => {
                        let Some((signal, validation)) = next else { break };
                        dispatcher.dispatch_shared(signal, validation).await;
                    }
                }
            }
            tracing::info!("signal dispatch loop stopped");
        });

        *self.worker.lock().unwrap() = Some(handle);
    }

    /// Stop the drain loop and wait for in-flight dispatching to settle
    pub async fn stop(&self) {
        self.token.cancel();
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub async fn dispatch(&self, signal: Signal, validation: ValidationResult) -> DispatchResult {
        self.dispatch_shared(Arc::new(signal), Arc::new(validation))
            .await
    }

    async fn dispatch_shared(
        &self,
        signal: Arc<Signal>,
        validation: Arc<ValidationResult>,
    ) -> DispatchResult {
        let started = Instant::now();
        self.stats.lock().unwrap().total_dispatched += 1;

        let eligible = self.eligible_subscribers(&signal, &validation);

        if eligible.is_empty() {
            tracing::warn!(signal_id = %signal.id, "no eligible subscribers for signal");
            return DispatchResult {
                signal_id: signal.id,
                total_subscribers: 0,
                successful: 0,
                failed: 0,
                dispatch_ms: 0.0,
                deliveries: Vec::new(),
            };
        }

        let deliveries = match self.mode {
            DispatchMode::Parallel => self.dispatch_parallel(&signal, &validation, eligible).await,
            DispatchMode::Sequential => {
                self.dispatch_sequential(&signal, &validation, eligible).await
            }
            DispatchMode::Selective => {
                let selected = select_by_category(&signal, eligible);
                self.dispatch_parallel(&signal, &validation, selected).await
            }
        };

        let successful = deliveries.iter().filter(|(_, ok)| *ok).count();
        let failed = deliveries.len() - successful;
        let dispatch_ms = started.elapsed().as_secs_f64() * 1000.0;

        {
            let mut stats = self.stats.lock().unwrap();
            stats.successful_deliveries += successful as u64;
            stats.failed_deliveries += failed as u64;
            let n = stats.total_dispatched as f64;
            stats.avg_dispatch_ms = (stats.avg_dispatch_ms * (n - 1.0) + dispatch_ms) / n;
        }

        if failed > 0 {
            tracing::warn!(
                signal_id = %signal.id,
                successful,
                failed,
                "signal dispatched with failures"
            );
        } else {
            tracing::debug!(
                signal_id = %signal.id,
                subscribers = deliveries.len(),
                dispatch_ms,
                "signal dispatched"
            );
        }

        DispatchResult {
            signal_id: signal.id,
            total_subscribers: deliveries.len(),
            successful,
            failed,
            dispatch_ms,
            deliveries,
        }
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats.lock().unwrap().clone()
    }

    fn eligible_subscribers(
        &self,
        signal: &Signal,
        validation: &ValidationResult,
    ) -> Vec<Arc<Subscription>> {
        let mut eligible: Vec<Arc<Subscription>> = self
            .subscribers
            .read()
            .unwrap()
            .values()
            .filter(|sub| sub.active.load(Ordering::SeqCst))
            .filter(|sub| {
                sub.filter
                    .as_ref()
                    .map(|f| f.accepts(signal, validation))
                    .unwrap_or(true)
            })
            .filter(|sub| {
                let busy = sub.in_flight.load(Ordering::SeqCst) >= sub.max_concurrent;
                if busy {
                    tracing::warn!(
                        subscriber = %sub.name,
                        "subscriber at max concurrency, skipping"
                    );
                }
                !busy
            })
            .cloned()
            .collect();

        eligible.sort_by_key(|sub| std::cmp::Reverse(sub.priority));
        eligible
    }

    async fn dispatch_parallel(
        &self,
        signal: &Arc<Signal>,
        validation: &Arc<ValidationResult>,
        subscribers: Vec<Arc<Subscription>>,
    ) -> Vec<(String, bool)> {
        let mut handles = Vec::with_capacity(subscribers.len());

        for sub in subscribers {
            sub.in_flight.fetch_add(1, Ordering::SeqCst);
            let signal = signal.clone();
            let validation = validation.clone();
            let stats = self.stats.clone();
            handles.push(tokio::spawn(async move {
                let ok = invoke(&sub, &signal, &validation, &stats).await;
                sub.in_flight.fetch_sub(1, Ordering::SeqCst);
                (sub.name.clone(), ok)
            }));
        }

        let mut deliveries = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(outcome) => deliveries.push(outcome),
                Err(e) => {
                    tracing::error!(error = %e, "subscriber task panicked");
                }
            }
        }
        deliveries
    }

    async fn dispatch_sequential(
        &self,
        signal: &Arc<Signal>,
        validation: &Arc<ValidationResult>,
        subscribers: Vec<Arc<Subscription>>,
    ) -> Vec<(String, bool)> {
        let mut deliveries = Vec::with_capacity(subscribers.len());

        for sub in subscribers {
            sub.in_flight.fetch_add(1, Ordering::SeqCst);
            let ok = invoke(&sub, signal, validation, &self.stats).await;
            sub.in_flight.fetch_sub(1, Ordering::SeqCst);

            if !ok {
                tracing::warn!(subscriber = %sub.name, "subscriber failed, continuing");
            }
            deliveries.push((sub.name.clone(), ok));
        }

        deliveries
    }
}

async fn invoke(
    sub: &Subscription,
    signal: &Signal,
    validation: &ValidationResult,
    stats: &Mutex<DispatchStats>,
) -> bool {
    let started = Instant::now();
    let outcome = sub.handler.handle(signal, validation).await;
    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

    let mut stats = stats.lock().unwrap();
    let entry = stats.per_subscriber.entry(sub.name.clone()).or_default();
    entry.received += 1;

    match outcome {
        Ok(()) => {
            entry.succeeded += 1;
            let n = entry.succeeded as f64;
            entry.avg_handle_ms = (entry.avg_handle_ms * (n - 1.0) + elapsed_ms) / n;
            true
        }
        Err(e) => {
            entry.failed += 1;
            tracing::error!(
                subscriber = %sub.name,
                signal_id = %signal.id,
                error = %e,
                "subscriber handler failed"
            );
            false
        }
    }
}

/// SELECTIVE mode: route by signal category, capped at 3 subscribers,
/// falling back to everything eligible when no name matches
fn select_by_category(signal: &Signal, eligible: Vec<Arc<Subscription>>) -> Vec<Arc<Subscription>> {
    const MAX_SELECTED: usize = 3;

    let matches =
        |sub: &Arc<Subscription>, needles: &[&str]| needles.iter().any(|n| sub.name.to_lowercase().contains(n));

    let mut selected: Vec<Arc<Subscription>> =
        if signal.kind == crate::models::SignalKind::Control {
            eligible
                .iter()
                .filter(|s| matches(s, &["control", "system"]))
                .cloned()
                .collect()
        } else if signal.is_reverse_trigger() {
            eligible
                .iter()
                .filter(|s| matches(s, &["reverse"]))
                .cloned()
                .collect()
        } else if signal.is_forward_trigger() {
            eligible
                .iter()
                .filter(|s| matches(s, &["forward", "main"]))
                .cloned()
                .collect()
        } else {
            Vec::new()
        };

    if selected.is_empty() {
        selected = eligible;
    }
    selected.truncate(MAX_SELECTED);
    selected
}
