//! Open positions owned by the trading engine.
//!
//! A position is created by a settled buy, marked to market from sell
//! quotes, and removed when a sell settles. The risk gate only counts
//! positions; it never holds them.

use crate::config::TradingConfig;
use crate::types::{lamports_to_sol, now_millis, Position, Pubkey};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::{debug, info, warn};

/// Why a position is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    MaxHold,
    /// Closed by the operator
    Manual,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExitReason::StopLoss => "stopLoss",
            ExitReason::TakeProfit => "takeProfit",
            ExitReason::MaxHold => "maxHold",
            ExitReason::Manual => "manual",
        };
        f.write_str(name)
    }
}

pub struct PositionBook {
    positions: HashMap<Pubkey, Position>,
    /// Positions with a sell in flight; skipped by the monitor
    closing: HashSet<Pubkey>,
    stop_loss_pct: f64,
    take_profit_pct: f64,
    max_hold_ms: Option<u64>,
}

impl PositionBook {
    pub fn new(config: &TradingConfig) -> Self {
        Self {
            positions: HashMap::new(),
            closing: HashSet::new(),
            stop_loss_pct: config.stop_loss_pct,
            take_profit_pct: config.take_profit_pct,
            max_hold_ms: (config.max_hold_seconds > 0).then(|| config.max_hold_seconds * 1_000),
        }
    }

    /// Record a settled buy.
    ///
    /// `entry_price` falls back to lamports per raw unit when the mint's
    /// decimals were unavailable; exits only compare against it, so the
    /// unit does not matter as long as it is consistent.
    pub fn open(
        &mut self,
        token_address: &str,
        pair_address: Option<Pubkey>,
        entry_price: Option<f64>,
        quantity: u64,
        cost_basis_lamports: u64,
    ) -> Position {
        let entry_price = entry_price
            .filter(|p| *p > 0.0)
            .unwrap_or_else(|| lamports_to_sol(cost_basis_lamports) / quantity.max(1) as f64);

        if let Some(existing) = self.positions.get_mut(token_address) {
            // A second fill for a held token adds to it at the blended price.
            let total = existing.quantity.saturating_add(quantity);
            let blended = (existing.entry_price * existing.quantity as f64 + entry_price * quantity as f64)
                / total.max(1) as f64;
            existing.quantity = total;
            existing.cost_basis_lamports = existing.cost_basis_lamports.saturating_add(cost_basis_lamports);
            existing.entry_price = blended;
            existing.stop_loss = blended * (1.0 - self.stop_loss_pct / 100.0);
            existing.take_profit = blended * (1.0 + self.take_profit_pct / 100.0);
            existing.last_price = blended;
            if existing.pair_address.is_none() {
                existing.pair_address = pair_address;
            }
            warn!(
                "Added {} units to open position {}: now {} units at {:.9} SOL",
                quantity, token_address, total, blended
            );
            return existing.clone();
        }

        let position = Position {
            token_address: token_address.to_string(),
            pair_address,
            entry_price,
            quantity,
            entry_timestamp: now_millis(),
            stop_loss: entry_price * (1.0 - self.stop_loss_pct / 100.0),
            take_profit: entry_price * (1.0 + self.take_profit_pct / 100.0),
            cost_basis_lamports,
            last_price: entry_price,
            unrealized_pnl_sol: 0.0,
        };
        info!(
            "Opened position {}: {} units at {:.9} SOL (SL {:.9}, TP {:.9})",
            token_address, quantity, entry_price, position.stop_loss, position.take_profit
        );
        self.positions.insert(token_address.to_string(), position.clone());
        position
    }

    /// Mark a position with what selling it now would return.
    ///
    /// Returns the exit that fired, if any. Positions already closing are
    /// updated but never signal.
    pub fn mark(&mut self, token_address: &str, value_lamports: u64, now_ms: u64) -> Option<ExitReason> {
        let position = self.positions.get_mut(token_address)?;

        if position.cost_basis_lamports > 0 {
            position.last_price =
                position.entry_price * value_lamports as f64 / position.cost_basis_lamports as f64;
        }
        position.unrealized_pnl_sol =
            lamports_to_sol(value_lamports) - lamports_to_sol(position.cost_basis_lamports);

        debug!(
            "Marked {}: {:.9} SOL/unit, unrealized {:+.6} SOL",
            token_address, position.last_price, position.unrealized_pnl_sol
        );

        if self.closing.contains(token_address) {
            return None;
        }
        exit_signal(position, self.max_hold_ms, now_ms)
    }

    /// Flag a position as closing. Returns `None` if unknown or already closing.
    pub fn begin_close(&mut self, token_address: &str) -> Option<Position> {
        let position = self.positions.get(token_address)?;
        if !self.closing.insert(token_address.to_string()) {
            return None;
        }
        Some(position.clone())
    }

    /// The sell did not settle; the position is eligible for exits again.
    pub fn abort_close(&mut self, token_address: &str) {
        self.closing.remove(token_address);
    }

    /// Remove a position whose sell settled.
    pub fn finish_close(&mut self, token_address: &str) -> Option<Position> {
        self.closing.remove(token_address);
        let position = self.positions.remove(token_address)?;
        info!("Closed position {}", token_address);
        Some(position)
    }

    pub fn get(&self, token_address: &str) -> Option<&Position> {
        self.positions.get(token_address)
    }

    pub fn contains(&self, token_address: &str) -> bool {
        self.positions.contains_key(token_address)
    }

    pub fn is_closing(&self, token_address: &str) -> bool {
        self.closing.contains(token_address)
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Positions that are not closing, for the monitor.
    pub fn monitored(&self) -> Vec<Position> {
        self.positions
            .values()
            .filter(|p| !self.closing.contains(&p.token_address))
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> Vec<Position> {
        self.positions.values().cloned().collect()
    }
}

fn exit_signal(position: &Position, max_hold_ms: Option<u64>, now_ms: u64) -> Option<ExitReason> {
    if position.last_price <= position.stop_loss {
        return Some(ExitReason::StopLoss);
    }
    if position.last_price >= position.take_profit {
        return Some(ExitReason::TakeProfit);
    }
    match max_hold_ms {
        Some(limit) if now_ms.saturating_sub(position.entry_timestamp) >= limit => Some(ExitReason::MaxHold),
        _ => None,
    }
}

/// Realized PnL in SOL of selling a position for `proceeds_lamports`.
pub fn realized_pnl(position: &Position, proceeds_lamports: u64) -> f64 {
    lamports_to_sol(proceeds_lamports) - lamports_to_sol(position.cost_basis_lamports)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book() -> PositionBook {
        PositionBook::new(&TradingConfig {
            stop_loss_pct: 25.0,
            take_profit_pct: 50.0,
            max_hold_seconds: 60,
            ..TradingConfig::default()
        })
    }

    #[test]
    fn test_open_sets_exit_levels() {
        let mut book = book();
        let position = book.open("TOKEN", None, Some(0.002), 50_000_000, 100_000_000);

        assert!((position.stop_loss - 0.0015).abs() < 1e-12);
        assert!((position.take_profit - 0.003).abs() < 1e-12);
        assert_eq!(book.len(), 1);
    }

    #[test]
    fn test_mark_fires_exits() {
        let mut book = book();
        let position = book.open("TOKEN", None, Some(0.002), 50_000_000, 100_000_000);
        let now = position.entry_timestamp;

        assert_eq!(book.mark("TOKEN", 90_000_000, now), None);
        assert!((book.get("TOKEN").unwrap().unrealized_pnl_sol + 0.01).abs() < 1e-9);

        assert_eq!(book.mark("TOKEN", 70_000_000, now), Some(ExitReason::StopLoss));
        assert_eq!(book.mark("TOKEN", 160_000_000, now), Some(ExitReason::TakeProfit));
        assert_eq!(book.mark("TOKEN", 100_000_000, now + 60_000), Some(ExitReason::MaxHold));
    }

    #[test]
    fn test_closing_positions_do_not_signal() {
        let mut book = book();
        let position = book.open("TOKEN", None, None, 1_000, 100_000_000);

        assert!(book.begin_close("TOKEN").is_some());
        assert!(book.begin_close("TOKEN").is_none());
        assert_eq!(book.mark("TOKEN", 1, position.entry_timestamp), None);
        assert!(book.monitored().is_empty());

        book.abort_close("TOKEN");
        assert_eq!(book.monitored().len(), 1);

        book.begin_close("TOKEN");
        let closed = book.finish_close("TOKEN").unwrap();
        assert!((realized_pnl(&closed, 120_000_000) - 0.02).abs() < 1e-9);
        assert!(book.is_empty());
    }

    #[test]
    fn test_second_fill_merges_into_position() {
        let mut book = book();
        let first = book.open("TOKEN", None, Some(0.002), 50_000_000, 100_000_000);
        let merged = book.open("TOKEN", Some("PAIR".to_string()), Some(0.004), 50_000_000, 200_000_000);

        assert_eq!(book.len(), 1);
        assert_eq!(merged.quantity, 100_000_000);
        assert_eq!(merged.cost_basis_lamports, 300_000_000);
        assert!((merged.entry_price - 0.003).abs() < 1e-12);
        assert!((merged.stop_loss - 0.00225).abs() < 1e-12);
        assert_eq!(merged.entry_timestamp, first.entry_timestamp);
        assert_eq!(merged.pair_address.as_deref(), Some("PAIR"));
        assert_eq!(book.get("TOKEN").unwrap().quantity, 100_000_000);
    }

    #[test]
    fn test_unknown_token_is_ignored() {
        let mut book = book();
        assert_eq!(book.mark("NOPE", 1, 0), None);
        assert!(book.finish_close("NOPE").is_none());
    }
}
