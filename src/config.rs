//! Engine configuration.
//!
//! Every section has defaults, so a config file only needs to carry the
//! values it overrides. `EngineBuilder` offers the same knobs fluently.

use crate::types::LAMPORTS_PER_SOL;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Complete engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub admission: AdmissionConfig,
    pub risk: RiskConfig,
    pub execution: ExecutionConfig,
    pub trading: TradingConfig,
    pub jupiter: JupiterConfig,
    /// SQLite URL for the trade journal; journaling is off when unset
    pub journal_url: Option<String>,
}

/// Admission coordinator limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Maximum dispatches in flight at once
    pub max_concurrent: usize,
    /// Minimum time between two dispatches of the same token
    pub cooldown_seconds: u64,
}

impl AdmissionConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_seconds)
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            cooldown_seconds: 60,
        }
    }
}

/// Global risk limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Starting balance in SOL
    pub initial_balance_sol: f64,
    pub max_positions: usize,
    pub max_position_size_lamports: u64,
    /// Drawdown from the high-water mark that trips the breaker (percent)
    pub max_drawdown_pct: f64,
    /// Loss relative to the day's starting balance that trips the breaker (percent)
    pub max_daily_loss_pct: f64,
    /// Reset a daily-loss breaker trip when the trading day rolls over
    pub reset_breaker_on_rollover: bool,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            initial_balance_sol: 10.0,
            max_positions: 5,
            max_position_size_lamports: LAMPORTS_PER_SOL,
            max_drawdown_pct: 20.0,
            max_daily_loss_pct: 10.0,
            reset_breaker_on_rollover: true,
        }
    }
}

/// Execution pipeline retry and timeout settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Attempt ceiling for the whole quote -> confirm sequence
    pub max_attempts: u32,
    /// Backoff before attempt `n + 1` is `base_backoff_ms * n`
    pub base_backoff_ms: u64,
    /// Per-call timeout for quote, build, simulate and submit
    pub call_timeout_ms: u64,
    pub confirm_max_polls: u32,
    pub confirm_poll_interval_ms: u64,
    /// Quotes older than this are not simulated or submitted
    pub quote_ttl_ms: u64,
    pub decimals_cache_capacity: u64,
}

impl ExecutionConfig {
    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn confirm_poll_interval(&self) -> Duration {
        Duration::from_millis(self.confirm_poll_interval_ms)
    }

    pub fn quote_ttl(&self) -> Duration {
        Duration::from_millis(self.quote_ttl_ms)
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 500,
            call_timeout_ms: 10_000,
            confirm_max_polls: 5,
            confirm_poll_interval_ms: 3_000,
            quote_ttl_ms: 5_000,
            decimals_cache_capacity: 10_000,
        }
    }
}

/// Trading policy applied by the engine around the core components.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    /// Candidates below this confidence are dropped before admission
    pub min_confidence: f64,
    /// Buy size when a candidate carries no size hint
    pub default_buy_lamports: u64,
    pub buy_slippage_bps: u16,
    pub sell_slippage_bps: u16,
    /// Exit when price falls this far below entry (percent)
    pub stop_loss_pct: f64,
    /// Exit when price rises this far above entry (percent)
    pub take_profit_pct: f64,
    /// Exit regardless of price after this long; 0 disables
    pub max_hold_seconds: u64,
    pub position_check_interval_ms: u64,
    pub reconcile_interval_ms: u64,
    pub rollover_check_interval_seconds: u64,
}

impl TradingConfig {
    pub fn position_check_interval(&self) -> Duration {
        Duration::from_millis(self.position_check_interval_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    pub fn rollover_check_interval(&self) -> Duration {
        Duration::from_secs(self.rollover_check_interval_seconds)
    }
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.6,
            default_buy_lamports: LAMPORTS_PER_SOL / 10,
            buy_slippage_bps: 500,
            sell_slippage_bps: 1_000,
            stop_loss_pct: 25.0,
            take_profit_pct: 50.0,
            max_hold_seconds: 1_800,
            position_check_interval_ms: 2_000,
            reconcile_interval_ms: 5_000,
            rollover_check_interval_seconds: 60,
        }
    }
}

/// Live aggregator and RPC settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JupiterConfig {
    pub quote_api_url: String,
    pub rpc_endpoints: Vec<String>,
    /// Path to a Solana CLI keypair file
    pub keypair_path: Option<String>,
    pub requests_per_second: u32,
    pub priority_fee_lamports: Option<u64>,
    /// "processed", "confirmed" or "finalized"
    pub commitment: String,
    pub rpc_timeout_seconds: u64,
}

impl Default for JupiterConfig {
    fn default() -> Self {
        Self {
            quote_api_url: "https://quote-api.jup.ag/v6".to_string(),
            rpc_endpoints: vec!["https://api.mainnet-beta.solana.com".to_string()],
            keypair_path: None,
            requests_per_second: 10,
            priority_fee_lamports: None,
            commitment: "confirmed".to_string(),
            rpc_timeout_seconds: 10,
        }
    }
}

impl EngineConfig {
    /// Load a JSON config file and validate it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: EngineConfig = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.admission.max_concurrent == 0 {
            bail!("admission.max_concurrent must be at least 1");
        }
        if self.execution.max_attempts == 0 {
            bail!("execution.max_attempts must be at least 1");
        }
        if self.execution.confirm_max_polls == 0 {
            bail!("execution.confirm_max_polls must be at least 1");
        }
        if self.risk.initial_balance_sol <= 0.0 {
            bail!("risk.initial_balance_sol must be positive");
        }
        for (name, pct) in [
            ("risk.max_drawdown_pct", self.risk.max_drawdown_pct),
            ("risk.max_daily_loss_pct", self.risk.max_daily_loss_pct),
        ] {
            if !(pct > 0.0 && pct <= 100.0) {
                bail!("{} must be in (0, 100], got {}", name, pct);
            }
        }
        if !(0.0..=1.0).contains(&self.trading.min_confidence) {
            bail!("trading.min_confidence must be in [0, 1]");
        }
        if self.trading.stop_loss_pct <= 0.0 || self.trading.stop_loss_pct >= 100.0 {
            bail!("trading.stop_loss_pct must be in (0, 100)");
        }
        if self.trading.take_profit_pct <= 0.0 {
            bail!("trading.take_profit_pct must be positive");
        }
        Ok(())
    }
}

/// Fluent construction of an [`EngineConfig`] with sensible defaults.
pub struct EngineBuilder {
    config: EngineConfig,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.config.admission.max_concurrent = max_concurrent;
        self
    }

    pub fn with_cooldown(mut self, cooldown_seconds: u64) -> Self {
        self.config.admission.cooldown_seconds = cooldown_seconds;
        self
    }

    pub fn with_initial_balance(mut self, balance_sol: f64) -> Self {
        self.config.risk.initial_balance_sol = balance_sol;
        self
    }

    pub fn with_position_limits(mut self, max_positions: usize, max_position_size_lamports: u64) -> Self {
        self.config.risk.max_positions = max_positions;
        self.config.risk.max_position_size_lamports = max_position_size_lamports;
        self
    }

    pub fn with_loss_limits(mut self, max_drawdown_pct: f64, max_daily_loss_pct: f64) -> Self {
        self.config.risk.max_drawdown_pct = max_drawdown_pct;
        self.config.risk.max_daily_loss_pct = max_daily_loss_pct;
        self
    }

    pub fn with_retry(mut self, max_attempts: u32, base_backoff_ms: u64) -> Self {
        self.config.execution.max_attempts = max_attempts;
        self.config.execution.base_backoff_ms = base_backoff_ms;
        self
    }

    pub fn with_confirmation(mut self, max_polls: u32, poll_interval_ms: u64) -> Self {
        self.config.execution.confirm_max_polls = max_polls;
        self.config.execution.confirm_poll_interval_ms = poll_interval_ms;
        self
    }

    pub fn with_call_timeout(mut self, call_timeout_ms: u64) -> Self {
        self.config.execution.call_timeout_ms = call_timeout_ms;
        self
    }

    pub fn with_min_confidence(mut self, min_confidence: f64) -> Self {
        self.config.trading.min_confidence = min_confidence;
        self
    }

    pub fn with_default_buy(mut self, lamports: u64) -> Self {
        self.config.trading.default_buy_lamports = lamports;
        self
    }

    pub fn with_exits(mut self, stop_loss_pct: f64, take_profit_pct: f64, max_hold_seconds: u64) -> Self {
        self.config.trading.stop_loss_pct = stop_loss_pct;
        self.config.trading.take_profit_pct = take_profit_pct;
        self.config.trading.max_hold_seconds = max_hold_seconds;
        self
    }

    pub fn with_position_check_interval(mut self, interval_ms: u64) -> Self {
        self.config.trading.position_check_interval_ms = interval_ms;
        self
    }

    pub fn with_rpc_endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.config.jupiter.rpc_endpoints = endpoints;
        self
    }

    pub fn with_keypair_path(mut self, path: impl Into<String>) -> Self {
        self.config.jupiter.keypair_path = Some(path.into());
        self
    }

    pub fn with_journal(mut self, url: impl Into<String>) -> Self {
        self.config.journal_url = Some(url.into());
        self
    }

    pub fn build_config(self) -> EngineConfig {
        self.config
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
