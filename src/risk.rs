//! Risk gate: the single authority on whether a new position may be opened.
//!
//! Tracks balance, high-water mark, drawdown and daily loss, and halts all
//! new trading through a circuit breaker and an operator emergency stop.
//! Closing a position is never gated here; a halted engine may still reduce.

use crate::config::RiskConfig;
use crate::error::RiskRejection;
use crate::notify::{Notification, Notifier};
use crate::types::now_millis;
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

/// The limit that tripped the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TripReason {
    MaxDrawdown,
    MaxDailyLoss,
}

impl fmt::Display for TripReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TripReason::MaxDrawdown => f.write_str("maxDrawdown"),
            TripReason::MaxDailyLoss => f.write_str("maxDailyLoss"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Normal,
    Tripped(TripReason),
}

/// Read-only snapshot of the gate's state.
#[derive(Debug, Clone, Serialize)]
pub struct RiskState {
    pub current_balance: f64,
    pub high_water_mark: f64,
    pub daily_start_balance: f64,
    /// Percent below the high-water mark
    pub drawdown_pct: f64,
    /// Percent below the day's starting balance
    pub daily_loss_pct: f64,
    pub open_position_count: usize,
    pub circuit_breaker_tripped: bool,
    pub trip_reason: Option<TripReason>,
    pub emergency_stop: bool,
    pub trading_day: NaiveDate,
}

pub struct RiskGate {
    config: RiskConfig,
    notifier: Notifier,
    current_balance: f64,
    high_water_mark: f64,
    daily_start_balance: f64,
    drawdown_pct: f64,
    daily_loss_pct: f64,
    open_position_count: usize,
    breaker: BreakerState,
    emergency_stop: bool,
    trading_day: NaiveDate,
}

impl RiskGate {
    pub fn new(config: RiskConfig, notifier: Notifier) -> Self {
        let balance = config.initial_balance_sol;
        info!(
            "Risk gate: balance {} SOL, max {} positions, drawdown limit {}%, daily loss limit {}%",
            balance, config.max_positions, config.max_drawdown_pct, config.max_daily_loss_pct
        );
        Self {
            config,
            notifier,
            current_balance: balance,
            high_water_mark: balance,
            daily_start_balance: balance,
            drawdown_pct: 0.0,
            daily_loss_pct: 0.0,
            open_position_count: 0,
            breaker: BreakerState::Normal,
            emergency_stop: false,
            trading_day: Utc::now().date_naive(),
        }
    }

    /// Pure predicate: may a position of `size` lamports be opened now?
    pub fn can_open_position(&self, size: u64) -> bool {
        self.check_open_position(size).is_ok()
    }

    /// Same checks as [`can_open_position`](Self::can_open_position), with the reason.
    pub fn check_open_position(&self, size: u64) -> Result<(), RiskRejection> {
        if self.emergency_stop {
            return Err(RiskRejection::EmergencyStop);
        }
        if let BreakerState::Tripped(reason) = self.breaker {
            return Err(RiskRejection::CircuitBreakerTripped(reason));
        }
        if self.open_position_count >= self.config.max_positions {
            return Err(RiskRejection::MaxPositions {
                open: self.open_position_count,
                max: self.config.max_positions,
            });
        }
        if size > self.config.max_position_size_lamports {
            return Err(RiskRejection::PositionTooLarge {
                size,
                max: self.config.max_position_size_lamports,
            });
        }
        Ok(())
    }

    /// Check and reserve a position slot in one step.
    ///
    /// Concurrent dispatches cannot both pass the count check; the slot is
    /// returned with [`release_position`](Self::release_position).
    pub fn try_open_position(&mut self, size: u64) -> Result<(), RiskRejection> {
        self.check_open_position(size)?;
        self.open_position_count += 1;
        debug!("Reserved position slot ({}/{})", self.open_position_count, self.config.max_positions);
        Ok(())
    }

    pub fn release_position(&mut self) {
        if self.open_position_count == 0 {
            warn!("release_position() with no open positions");
            return;
        }
        self.open_position_count -= 1;
        debug!("Released position slot ({}/{})", self.open_position_count, self.config.max_positions);
    }

    /// Settle a realized PnL (in SOL). The only path that trips the breaker.
    pub fn record_trade(&mut self, pnl: f64) {
        self.current_balance += pnl;
        self.high_water_mark = self.high_water_mark.max(self.current_balance);
        self.drawdown_pct = percent_below(self.high_water_mark, self.current_balance);
        self.daily_loss_pct = percent_below(self.daily_start_balance, self.current_balance);

        debug!(
            "Trade settled: pnl {:+.6} SOL, balance {:.6}, drawdown {:.2}%, daily loss {:.2}%",
            pnl, self.current_balance, self.drawdown_pct, self.daily_loss_pct
        );

        match self.breaker {
            BreakerState::Tripped(TripReason::MaxDrawdown) => {}
            // Reduce-only settlements keep coming while halted for the day;
            // a drawdown breach outlives the day and must not auto-reset.
            BreakerState::Tripped(TripReason::MaxDailyLoss) => {
                if self.drawdown_breached() {
                    self.trip_drawdown();
                }
            }
            BreakerState::Normal => {
                if self.drawdown_breached() {
                    self.trip_drawdown();
                } else if self.daily_loss_pct >= self.config.max_daily_loss_pct {
                    let message = format!(
                        "Daily loss {:.2}% reached limit {:.2}%",
                        self.daily_loss_pct, self.config.max_daily_loss_pct
                    );
                    self.trip(TripReason::MaxDailyLoss, message);
                }
            }
        }
    }

    fn drawdown_breached(&self) -> bool {
        self.drawdown_pct >= self.config.max_drawdown_pct
    }

    fn trip_drawdown(&mut self) {
        let message = format!(
            "Drawdown {:.2}% reached limit {:.2}%",
            self.drawdown_pct, self.config.max_drawdown_pct
        );
        self.trip(TripReason::MaxDrawdown, message);
    }

    fn trip(&mut self, reason: TripReason, message: String) {
        warn!("Circuit breaker tripped ({}): {}", reason, message);
        self.breaker = BreakerState::Tripped(reason);
        self.notifier.notify(Notification::CircuitBreaker {
            reason,
            message,
            timestamp: now_millis(),
        });
    }

    pub fn reset_circuit_breaker(&mut self) {
        if self.breaker == BreakerState::Normal {
            debug!("reset_circuit_breaker() while not tripped");
            return;
        }
        info!("Circuit breaker reset");
        self.breaker = BreakerState::Normal;
        self.notifier.notify(Notification::CircuitBreakerReset {
            timestamp: now_millis(),
        });
    }

    pub fn set_emergency_stop(&mut self, active: bool) {
        if self.emergency_stop == active {
            return;
        }
        self.emergency_stop = active;
        let timestamp = now_millis();
        if active {
            warn!("Emergency stop engaged");
            self.notifier.notify(Notification::EmergencyStop { timestamp });
        } else {
            info!("Emergency stop released");
            self.notifier.notify(Notification::EmergencyStopReset { timestamp });
        }
    }

    /// Start a new trading day. Must be called once per day by the scheduler.
    ///
    /// Returns `false` when `day` is not after the current trading day.
    pub fn roll_day(&mut self, day: NaiveDate) -> bool {
        if day <= self.trading_day {
            return false;
        }
        info!(
            "Trading day {} -> {}; daily start balance {:.6} SOL",
            self.trading_day, day, self.current_balance
        );
        self.trading_day = day;
        self.daily_start_balance = self.current_balance;
        self.daily_loss_pct = 0.0;

        if self.breaker == BreakerState::Tripped(TripReason::MaxDailyLoss) {
            if self.drawdown_breached() {
                self.trip_drawdown();
            } else if self.config.reset_breaker_on_rollover {
                self.reset_circuit_breaker();
            }
        }
        true
    }

    pub fn is_halted(&self) -> bool {
        self.emergency_stop || self.breaker != BreakerState::Normal
    }

    pub fn open_position_count(&self) -> usize {
        self.open_position_count
    }

    pub fn metrics(&self) -> RiskState {
        let trip_reason = match self.breaker {
            BreakerState::Normal => None,
            BreakerState::Tripped(reason) => Some(reason),
        };
        RiskState {
            current_balance: self.current_balance,
            high_water_mark: self.high_water_mark,
            daily_start_balance: self.daily_start_balance,
            drawdown_pct: self.drawdown_pct,
            daily_loss_pct: self.daily_loss_pct,
            open_position_count: self.open_position_count,
            circuit_breaker_tripped: trip_reason.is_some(),
            trip_reason,
            emergency_stop: self.emergency_stop,
            trading_day: self.trading_day,
        }
    }
}

/// How far `value` sits below `reference`, in percent; zero when above.
fn percent_below(reference: f64, value: f64) -> f64 {
    if reference <= 0.0 {
        return 0.0;
    }
    ((reference - value) / reference * 100.0).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NotificationReceiver;

    fn gate(balance: f64, max_drawdown_pct: f64, max_daily_loss_pct: f64) -> (RiskGate, NotificationReceiver) {
        let (notifier, receiver) = Notifier::channel(16);
        let config = RiskConfig {
            initial_balance_sol: balance,
            max_positions: 2,
            max_position_size_lamports: 1_000,
            max_drawdown_pct,
            max_daily_loss_pct,
            reset_breaker_on_rollover: true,
        };
        (RiskGate::new(config, notifier), receiver)
    }

    fn events(receiver: &mut NotificationReceiver) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Ok(n) = receiver.try_recv() {
            out.push(n);
        }
        out
    }

    #[test]
    fn test_daily_loss_trips_breaker() {
        let (mut gate, mut rx) = gate(1000.0, 20.0, 10.0);

        gate.record_trade(-50.0);
        assert!(gate.can_open_position(10));
        gate.record_trade(-55.0);

        let state = gate.metrics();
        assert!((state.daily_loss_pct - 10.5).abs() < 1e-9);
        assert!(state.circuit_breaker_tripped);
        assert_eq!(state.trip_reason, Some(TripReason::MaxDailyLoss));
        assert!(!gate.can_open_position(10));

        let events = events(&mut rx);
        assert_eq!(events.len(), 1);
        match &events[0] {
            Notification::CircuitBreaker { reason, .. } => assert_eq!(reason.to_string(), "maxDailyLoss"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_drawdown_trips_until_reset() {
        let (mut gate, mut rx) = gate(1000.0, 20.0, 50.0);

        gate.record_trade(-100.0);
        gate.record_trade(-110.0);
        assert!((gate.metrics().drawdown_pct - 21.0).abs() < 1e-9);
        assert_eq!(gate.metrics().trip_reason, Some(TripReason::MaxDrawdown));

        // Winning trades do not clear the trip.
        gate.record_trade(500.0);
        assert!(!gate.can_open_position(1));
        assert_eq!(
            gate.check_open_position(1),
            Err(RiskRejection::CircuitBreakerTripped(TripReason::MaxDrawdown))
        );

        gate.reset_circuit_breaker();
        assert!(gate.can_open_position(1));

        let kinds: Vec<_> = events(&mut rx).iter().map(|n| n.kind()).collect();
        assert_eq!(kinds, vec!["circuitBreaker", "circuitBreakerReset"]);
    }

    #[test]
    fn test_high_water_mark_is_monotonic() {
        let (mut gate, _rx) = gate(100.0, 90.0, 90.0);
        let mut last_hwm = gate.metrics().high_water_mark;

        for pnl in [10.0, -5.0, 20.0, -30.0, 3.0, -1.0] {
            gate.record_trade(pnl);
            let state = gate.metrics();
            assert!(state.high_water_mark >= last_hwm);
            let expected = (state.high_water_mark - state.current_balance) / state.high_water_mark * 100.0;
            assert!((state.drawdown_pct - expected).abs() < 1e-9);
            assert!(state.drawdown_pct >= 0.0);
            last_hwm = state.high_water_mark;
        }
        assert_eq!(last_hwm, 130.0);
    }

    #[test]
    fn test_emergency_stop_overrides_everything() {
        let (mut gate, mut rx) = gate(1000.0, 20.0, 10.0);

        gate.set_emergency_stop(true);
        gate.set_emergency_stop(true);
        assert_eq!(gate.check_open_position(1), Err(RiskRejection::EmergencyStop));

        gate.record_trade(-150.0);
        gate.reset_circuit_breaker();
        assert_eq!(gate.check_open_position(1), Err(RiskRejection::EmergencyStop));

        gate.set_emergency_stop(false);
        assert!(gate.can_open_position(1));

        let kinds: Vec<_> = events(&mut rx).iter().map(|n| n.kind()).collect();
        assert_eq!(
            kinds,
            vec!["emergencyStop", "circuitBreaker", "circuitBreakerReset", "emergencyStopReset"]
        );
    }

    #[test]
    fn test_position_limits() {
        let (mut gate, _rx) = gate(1000.0, 20.0, 10.0);

        assert_eq!(
            gate.check_open_position(1_001),
            Err(RiskRejection::PositionTooLarge { size: 1_001, max: 1_000 })
        );
        assert!(gate.try_open_position(500).is_ok());
        assert!(gate.try_open_position(500).is_ok());
        assert_eq!(
            gate.try_open_position(500),
            Err(RiskRejection::MaxPositions { open: 2, max: 2 })
        );

        gate.release_position();
        assert!(gate.can_open_position(500));
        assert_eq!(gate.open_position_count(), 1);
    }

    #[test]
    fn test_rollover_resets_daily_loss_and_breaker() {
        let (mut gate, _rx) = gate(1000.0, 50.0, 10.0);
        let today = gate.metrics().trading_day;

        gate.record_trade(-120.0);
        assert!(gate.is_halted());
        assert!(!gate.roll_day(today));

        assert!(gate.roll_day(today.succ_opt().unwrap()));
        let state = gate.metrics();
        assert_eq!(state.daily_start_balance, 880.0);
        assert_eq!(state.daily_loss_pct, 0.0);
        assert!(!state.circuit_breaker_tripped);
        assert!((state.drawdown_pct - 12.0).abs() < 1e-9);
    }

    #[test]
    fn test_rollover_keeps_drawdown_trip() {
        let (mut gate, _rx) = gate(1000.0, 20.0, 50.0);
        let today = gate.metrics().trading_day;

        gate.record_trade(-250.0);
        gate.roll_day(today.succ_opt().unwrap());
        assert_eq!(gate.metrics().trip_reason, Some(TripReason::MaxDrawdown));
    }

    #[test]
    fn test_drawdown_breach_while_halted_for_the_day_survives_rollover() {
        let (mut gate, mut rx) = gate(1000.0, 20.0, 10.0);
        let today = gate.metrics().trading_day;

        gate.record_trade(-110.0);
        assert_eq!(gate.metrics().trip_reason, Some(TripReason::MaxDailyLoss));

        // A reduce-only close settles while halted.
        gate.record_trade(-150.0);
        let state = gate.metrics();
        assert!((state.drawdown_pct - 26.0).abs() < 1e-9);
        assert_eq!(state.trip_reason, Some(TripReason::MaxDrawdown));

        assert!(gate.roll_day(today.succ_opt().unwrap()));
        assert!(gate.metrics().circuit_breaker_tripped);
        assert!(!gate.can_open_position(1));

        let reasons: Vec<_> = events(&mut rx)
            .into_iter()
            .filter_map(|n| match n {
                Notification::CircuitBreaker { reason, .. } => Some(reason),
                _ => None,
            })
            .collect();
        assert_eq!(reasons, vec![TripReason::MaxDailyLoss, TripReason::MaxDrawdown]);
    }
}
