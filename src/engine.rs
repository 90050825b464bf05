//! Trading engine: wires admission, risk, execution and positions together.
//!
//! The admission loop owns the [`AdmissionCoordinator`] outright and talks to
//! dispatch tasks over channels. The risk gate and the position book are
//! shared behind mutexes that are never held across a network call.
//! Background tasks mark positions, reconcile uncertain trades and roll the
//! trading day.

use crate::admission::AdmissionCoordinator;
use crate::config::EngineConfig;
use crate::execution::{ExecutionPipeline, SwapClient};
use crate::journal::{JournalHandle, PositionEvent};
use crate::metrics::{MetricsCollector, CANDIDATES_FILTERED, CANDIDATES_RECEIVED, OPEN_POSITIONS, RISK_REJECTIONS};
use crate::notify::{Notification, Notifier};
use crate::positions::{realized_pnl, ExitReason, PositionBook};
use crate::risk::{RiskGate, RiskState};
use crate::types::{now_millis, Candidate, ExecutionResult, Order, Position, Pubkey, Side, SignatureStatus};
use chrono::{NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

/// Status checks before an unobserved trade is given up on.
const MAX_RECONCILE_CHECKS: u32 = 60;

const MIN_TASK_PERIOD: Duration = Duration::from_millis(10);

/// A submitted trade whose outcome is not known yet.
#[derive(Debug, Clone)]
struct PendingTrade {
    order: Order,
    signature: String,
    quoted_input: u64,
    quoted_output: u64,
    attempts: u32,
    pair_address: Option<Pubkey>,
    /// Set for sells
    exit_reason: Option<ExitReason>,
    checks: u32,
}

#[derive(Debug, Clone, Copy)]
enum Task {
    MonitorPositions,
    Reconcile,
    RollDay,
}

/// Sends the completion for a dispatch when dropped, on every exit path.
struct CompletionGuard {
    token_address: Pubkey,
    done: mpsc::UnboundedSender<Pubkey>,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        let token_address = std::mem::take(&mut self.token_address);
        if self.done.send(token_address).is_err() {
            debug!("Admission loop gone before completion");
        }
    }
}

#[derive(Clone)]
pub struct TradingEngine {
    config: EngineConfig,
    pipeline: Arc<ExecutionPipeline>,
    risk: Arc<Mutex<RiskGate>>,
    positions: Arc<Mutex<PositionBook>>,
    reconciliation: Arc<Mutex<Vec<PendingTrade>>>,
    /// One reconciliation pass at a time
    reconcile_lock: Arc<Mutex<()>>,
    notifier: Notifier,
    journal: JournalHandle,
    metrics: Arc<MetricsCollector>,
}

impl TradingEngine {
    pub fn new(config: EngineConfig, client: Arc<dyn SwapClient>, notifier: Notifier, journal: JournalHandle) -> Self {
        let metrics = Arc::new(MetricsCollector::new());
        let pipeline = Arc::new(ExecutionPipeline::new(client, config.execution.clone(), metrics.clone()));
        let risk = RiskGate::new(config.risk.clone(), notifier.clone());
        let positions = PositionBook::new(&config.trading);

        Self {
            config,
            pipeline,
            risk: Arc::new(Mutex::new(risk)),
            positions: Arc::new(Mutex::new(positions)),
            reconciliation: Arc::new(Mutex::new(Vec::new())),
            reconcile_lock: Arc::new(Mutex::new(())),
            notifier,
            journal,
            metrics,
        }
    }

    /// Consume candidates until the stream closes and all work drains, or
    /// until `shutdown` flips to `true`.
    #[instrument(skip_all)]
    pub async fn run(&self, mut candidates: mpsc::Receiver<Candidate>, mut shutdown: watch::Receiver<bool>) {
        info!("Trading engine starting");
        let (mut coordinator, mut dispatches) = AdmissionCoordinator::channel(&self.config.admission);
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Pubkey>();
        let mut waiting: HashMap<Pubkey, Candidate> = HashMap::new();
        let mut candidates_open = true;

        let trading = &self.config.trading;
        let background = [
            self.spawn_task(Task::MonitorPositions, trading.position_check_interval(), shutdown.clone()),
            self.spawn_task(Task::Reconcile, trading.reconcile_interval(), shutdown.clone()),
            self.spawn_task(Task::RollDay, trading.rollover_check_interval(), shutdown.clone()),
        ];

        loop {
            let wakeup = coordinator.next_wakeup(Instant::now());
            let deadline = wakeup.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                received = candidates.recv(), if candidates_open => match received {
                    Some(candidate) => self.admit(&mut coordinator, &mut waiting, candidate).await,
                    None => {
                        info!("Candidate stream closed");
                        candidates_open = false;
                    }
                },
                Some(dispatch) = dispatches.recv() => {
                    let candidate = waiting.remove(&dispatch.token_address);
                    let guard = CompletionGuard {
                        token_address: dispatch.token_address.clone(),
                        done: done_tx.clone(),
                    };
                    let engine = self.clone();
                    tokio::spawn(async move {
                        let _guard = guard;
                        engine.handle_dispatch(&dispatch.token_address, candidate).await;
                    });
                },
                Some(token_address) = done_rx.recv() => {
                    coordinator.complete(&token_address);
                },
                _ = sleep_until(deadline), if wakeup.is_some() => {
                    coordinator.pump(Instant::now());
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown requested");
                        break;
                    }
                },
            }

            if !candidates_open && coordinator.in_flight_count() == 0 && coordinator.pending_count() == 0 {
                info!("All candidates processed");
                break;
            }
        }

        for task in background {
            task.abort();
        }
        info!("Trading engine stopped");
    }

    async fn admit(
        &self,
        coordinator: &mut AdmissionCoordinator,
        waiting: &mut HashMap<Pubkey, Candidate>,
        candidate: Candidate,
    ) {
        self.metrics.increment_counter(CANDIDATES_RECEIVED).await;
        if candidate.confidence < self.config.trading.min_confidence {
            self.metrics.increment_counter(CANDIDATES_FILTERED).await;
            debug!(
                "Dropping {} (confidence {:.2} < {:.2})",
                candidate.token_address, candidate.confidence, self.config.trading.min_confidence
            );
            return;
        }
        let token_address = candidate.token_address.clone();
        // The dispatch is read on a later loop turn, after the insert.
        if coordinator.enqueue(&token_address) {
            waiting.insert(token_address, candidate);
        }
    }

    /// Buy size for a candidate: its hint capped at the risk limit, or the default.
    pub fn buy_size(&self, candidate: Option<&Candidate>) -> u64 {
        candidate
            .and_then(|c| c.suggested_size_hint)
            .filter(|hint| *hint > 0)
            .map(|hint| hint.min(self.config.risk.max_position_size_lamports))
            .unwrap_or(self.config.trading.default_buy_lamports)
    }

    #[instrument(skip(self, candidate))]
    async fn handle_dispatch(&self, token_address: &str, candidate: Option<Candidate>) {
        if self.positions.lock().await.contains(token_address) {
            debug!("Already holding {}, skipping", token_address);
            return;
        }
        if self.has_pending(token_address, Side::Buy).await {
            info!("Buy of {} is still unreconciled, skipping", token_address);
            return;
        }

        let size = self.buy_size(candidate.as_ref());
        let admitted = self.risk.lock().await.try_open_position(size);
        if let Err(rejection) = admitted {
            self.metrics.increment_counter(RISK_REJECTIONS).await;
            info!("Risk gate rejected {}: {}", token_address, rejection);
            return;
        }

        let order = Order::buy(token_address, size, self.config.trading.buy_slippage_bps);
        let result = self.pipeline.execute(&order).await;
        self.journal.record_execution(&result);
        let pair_address = candidate.and_then(|c| c.pair_address);

        if result.success {
            self.open_position(&result, pair_address).await;
            self.notifier.notify(Notification::OrderFilled { result });
        } else if result.is_uncertain() {
            // Funds may have moved; the slot stays reserved until reconciled.
            self.queue_reconciliation(order, &result, pair_address, None).await;
            self.notifier.notify(Notification::OrderFailed { result });
        } else {
            self.risk.lock().await.release_position();
            self.notifier.notify(Notification::OrderFailed { result });
        }
    }

    async fn open_position(&self, result: &ExecutionResult, pair_address: Option<Pubkey>) {
        let (Some(cost), Some(quantity)) = (result.input_amount, result.output_amount) else {
            error!("Filled buy of {} without amounts", result.token_address);
            return;
        };
        let (position, open, merged) = {
            let mut positions = self.positions.lock().await;
            let merged = positions.contains(&result.token_address);
            let position = positions.open(&result.token_address, pair_address, result.execution_price, quantity, cost);
            (position, positions.len(), merged)
        };
        if merged {
            // The added fill reserved a slot of its own.
            self.risk.lock().await.release_position();
        }
        self.journal.record_position(&position, PositionEvent::Opened);
        self.metrics.set_gauge(OPEN_POSITIONS, open as f64).await;
    }

    async fn queue_reconciliation(
        &self,
        order: Order,
        result: &ExecutionResult,
        pair_address: Option<Pubkey>,
        exit_reason: Option<ExitReason>,
    ) {
        let Some(signature) = result.signature.clone() else {
            error!("Uncertain {} of {} without a signature", order.side, order.token_address);
            return;
        };
        warn!("Queued {} of {} ({}) for reconciliation", order.side, order.token_address, signature);
        let trade = PendingTrade {
            quoted_input: result.input_amount.unwrap_or(order.size_native_units),
            quoted_output: result.output_amount.unwrap_or(0),
            attempts: result.attempts,
            order,
            signature,
            pair_address,
            exit_reason,
            checks: 0,
        };
        self.reconciliation.lock().await.push(trade);
    }

    async fn has_pending(&self, token_address: &str, side: Side) -> bool {
        self.reconciliation
            .lock()
            .await
            .iter()
            .any(|trade| trade.order.side == side && trade.order.token_address == token_address)
    }

    /// Drop a trade from the queue once its outcome is settled.
    async fn dequeue(&self, signature: &str) {
        self.reconciliation.lock().await.retain(|trade| trade.signature != signature);
    }

    fn spawn_task(&self, task: Task, period: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(period.max(MIN_TASK_PERIOD));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => match task {
                        Task::MonitorPositions => engine.monitor_positions().await,
                        Task::Reconcile => engine.reconcile().await,
                        Task::RollDay => {
                            engine.roll_day(Utc::now().date_naive()).await;
                        }
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("{:?} task stopping", task);
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Mark every open position and start closing those whose exit fired.
    pub async fn monitor_positions(&self) {
        let open = self.positions.lock().await.monitored();
        for position in open {
            let value = self
                .pipeline
                .quote_value(&position.token_address, position.quantity, self.config.trading.sell_slippage_bps)
                .await;
            let Some(value) = value else {
                continue;
            };

            let closing = {
                let mut positions = self.positions.lock().await;
                match positions.mark(&position.token_address, value, now_millis()) {
                    Some(reason) => positions.begin_close(&position.token_address).map(|p| (p, reason)),
                    None => None,
                }
            };
            if let Some((position, reason)) = closing {
                info!("Exit {} fired for {}", reason, position.token_address);
                let engine = self.clone();
                tokio::spawn(async move { engine.sell(position, reason).await });
            }
        }
    }

    /// Close a position on operator request. Allowed even while halted.
    pub async fn close_position(&self, token_address: &str) -> Option<ExecutionResult> {
        let position = self.positions.lock().await.begin_close(token_address)?;
        Some(self.sell(position, ExitReason::Manual).await)
    }

    /// Sell a position already flagged as closing.
    async fn sell(&self, position: Position, reason: ExitReason) -> ExecutionResult {
        let order = Order::sell(&position.token_address, position.quantity, self.config.trading.sell_slippage_bps);
        let result = self.pipeline.execute(&order).await;
        self.journal.record_execution(&result);

        if result.success {
            self.settle_close(&position.token_address, result.output_amount.unwrap_or(0), reason)
                .await;
            self.notifier.notify(Notification::OrderFilled { result: result.clone() });
        } else if result.is_uncertain() {
            self.queue_reconciliation(order, &result, position.pair_address.clone(), Some(reason))
                .await;
            self.notifier.notify(Notification::OrderFailed { result: result.clone() });
        } else {
            self.positions.lock().await.abort_close(&position.token_address);
            self.notifier.notify(Notification::OrderFailed { result: result.clone() });
        }
        result
    }

    /// Remove a sold position and settle its PnL with the risk gate.
    async fn settle_close(&self, token_address: &str, proceeds_lamports: u64, reason: ExitReason) {
        let (closed, open) = {
            let mut positions = self.positions.lock().await;
            (positions.finish_close(token_address), positions.len())
        };
        let Some(mut closed) = closed else {
            warn!("Sell settled for {} with no open position", token_address);
            return;
        };

        let pnl = realized_pnl(&closed, proceeds_lamports);
        {
            let mut risk = self.risk.lock().await;
            risk.record_trade(pnl);
            risk.release_position();
        }
        info!("Closed {} ({}): realized {:+.6} SOL", token_address, reason, pnl);

        closed.unrealized_pnl_sol = 0.0;
        self.journal.record_position(&closed, PositionEvent::Closed);
        self.metrics.set_gauge(OPEN_POSITIONS, open as f64).await;
        self.notifier.notify(Notification::PositionClosed {
            token_address: token_address.to_string(),
            reason,
            realized_pnl_sol: pnl,
        });
    }

    /// Check every uncertain trade once and settle those with a known outcome.
    ///
    /// Trades stay queued until settled, so a dispatch racing a pass still
    /// sees an unreconciled buy.
    pub async fn reconcile(&self) {
        let _pass = self.reconcile_lock.lock().await;
        let pending = self.reconciliation.lock().await.clone();

        for trade in pending {
            match self.pipeline.check_signature(&trade.signature).await {
                Ok(SignatureStatus::Landed) => {
                    // Dequeued only once the position exists.
                    let signature = trade.signature.clone();
                    self.resolve_landed(trade).await;
                    self.dequeue(&signature).await;
                }
                Ok(SignatureStatus::Failed(reason)) => {
                    self.dequeue(&trade.signature).await;
                    self.resolve_failed(trade, &reason).await;
                }
                Ok(SignatureStatus::Pending) => {
                    let checks = trade.checks + 1;
                    if checks >= MAX_RECONCILE_CHECKS {
                        self.dequeue(&trade.signature).await;
                        self.abandon(trade).await;
                    } else if let Some(queued) = self
                        .reconciliation
                        .lock()
                        .await
                        .iter_mut()
                        .find(|queued| queued.signature == trade.signature)
                    {
                        queued.checks = checks;
                    }
                }
                Err(e) => warn!("Reconciliation lookup for {} failed: {:#}", trade.signature, e),
            }
        }
    }

    async fn resolve_landed(&self, trade: PendingTrade) {
        info!("Uncertain {} of {} landed ({})", trade.order.side, trade.order.token_address, trade.signature);
        let output = self
            .pipeline
            .settled_output(&trade.signature, trade.order.output_mint(), trade.quoted_output)
            .await;
        let (lamports, token_units) = match trade.order.side {
            Side::Buy => (trade.quoted_input, output),
            Side::Sell => (output, trade.quoted_input),
        };
        let price = self.pipeline.price(&trade.order.token_address, lamports, token_units).await;
        let result = ExecutionResult::filled(
            &trade.order,
            trade.signature.clone(),
            trade.quoted_input,
            output,
            price,
            trade.attempts,
        );
        self.journal.record_execution(&result);

        match trade.order.side {
            Side::Buy => self.open_position(&result, trade.pair_address).await,
            Side::Sell => {
                let reason = trade.exit_reason.unwrap_or(ExitReason::Manual);
                self.settle_close(&trade.order.token_address, output, reason).await
            }
        }
        self.notifier.notify(Notification::OrderFilled { result });
    }

    async fn resolve_failed(&self, trade: PendingTrade, reason: &str) {
        info!(
            "Uncertain {} of {} failed on-chain: {}",
            trade.order.side, trade.order.token_address, reason
        );
        match trade.order.side {
            Side::Buy => self.risk.lock().await.release_position(),
            Side::Sell => self.positions.lock().await.abort_close(&trade.order.token_address),
        }
    }

    async fn abandon(&self, trade: PendingTrade) {
        match trade.order.side {
            Side::Buy => error!(
                "Buy of {} ({}) never observed; its position slot stays reserved",
                trade.order.token_address, trade.signature
            ),
            Side::Sell => {
                // A repeat sell of tokens already sold fails in simulation.
                warn!(
                    "Sell of {} ({}) never observed; position reopened for exits",
                    trade.order.token_address, trade.signature
                );
                self.positions.lock().await.abort_close(&trade.order.token_address);
            }
        }
    }

    /// Start a new trading day on the risk gate.
    pub async fn roll_day(&self, day: NaiveDate) -> bool {
        self.risk.lock().await.roll_day(day)
    }

    pub async fn emergency_stop(&self, active: bool) {
        self.risk.lock().await.set_emergency_stop(active);
    }

    pub async fn reset_circuit_breaker(&self) {
        self.risk.lock().await.reset_circuit_breaker();
    }

    pub async fn risk_metrics(&self) -> RiskState {
        self.risk.lock().await.metrics()
    }

    pub async fn positions(&self) -> Vec<Position> {
        self.positions.lock().await.snapshot()
    }

    pub async fn pending_reconciliations(&self) -> usize {
        self.reconciliation.lock().await.len()
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        self.metrics.clone()
    }

    pub fn pipeline(&self) -> Arc<ExecutionPipeline> {
        self.pipeline.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::PaperClient;

    const TOKEN: &str = "AdmitToken111111111111111111111111111111111";

    #[tokio::test]
    async fn test_candidate_for_busy_token_is_not_held() {
        let config = EngineConfig::default();
        let (notifier, _notifications) = Notifier::channel(8);
        let engine = TradingEngine::new(
            config.clone(),
            Arc::new(PaperClient::default()),
            notifier,
            JournalHandle::disabled(),
        );
        let (mut coordinator, mut dispatches) = AdmissionCoordinator::channel(&config.admission);
        let mut waiting = HashMap::new();

        engine.admit(&mut coordinator, &mut waiting, Candidate::new(TOKEN, 0.9)).await;
        let dispatch = dispatches.recv().await.unwrap();
        assert!(waiting.remove(&dispatch.token_address).is_some());

        // Still in flight: the enqueue is refused and nothing is kept.
        engine.admit(&mut coordinator, &mut waiting, Candidate::new(TOKEN, 0.9)).await;
        assert!(waiting.is_empty());
        assert_eq!(coordinator.in_flight_count(), 1);
    }
}
