//! Core types and data structures for the H-5N1P3R execution engine.

use crate::error::ExecutionError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// A simple public key representation (base58 string)
pub type Pubkey = String;

/// Wrapped SOL mint. Every swap has SOL on one side.
pub const NATIVE_MINT: &str = "So11111111111111111111111111111111111111112";

/// Decimals of the native mint.
pub const NATIVE_DECIMALS: u8 = 9;

/// Lamports in one SOL.
pub const LAMPORTS_PER_SOL: u64 = 1_000_000_000;

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

/// Convert lamports to SOL.
pub fn lamports_to_sol(lamports: u64) -> f64 {
    lamports as f64 / LAMPORTS_PER_SOL as f64
}

/// A candidate token surfaced by discovery or pattern detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    /// The mint address of the token
    pub token_address: Pubkey,
    /// Liquidity pair the token was discovered on, if known
    pub pair_address: Option<Pubkey>,
    /// Suggested buy size in lamports
    pub suggested_size_hint: Option<u64>,
    /// Detector confidence in `0.0..=1.0`
    pub confidence: f64,
    /// Unix timestamp (ms) when discovered
    pub detected_at: u64,
}

impl Candidate {
    pub fn new(token_address: impl Into<Pubkey>, confidence: f64) -> Self {
        Self {
            token_address: token_address.into(),
            pair_address: None,
            suggested_size_hint: None,
            confidence,
            detected_at: now_millis(),
        }
    }

    pub fn with_pair(mut self, pair_address: impl Into<Pubkey>) -> Self {
        self.pair_address = Some(pair_address.into());
        self
    }

    pub fn with_size_hint(mut self, lamports: u64) -> Self {
        self.suggested_size_hint = Some(lamports);
        self
    }
}

/// Direction of a swap relative to the traded token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// SOL -> token
    Buy,
    /// token -> SOL
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single execution request. Created per attempt, consumed by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub token_address: Pubkey,
    pub side: Side,
    /// Amount in base units of the input asset (lamports for buys, raw token units for sells)
    pub size_native_units: u64,
    pub max_slippage_bps: u16,
}

impl Order {
    pub fn buy(token_address: impl Into<Pubkey>, lamports: u64, max_slippage_bps: u16) -> Self {
        Self {
            token_address: token_address.into(),
            side: Side::Buy,
            size_native_units: lamports,
            max_slippage_bps,
        }
    }

    pub fn sell(token_address: impl Into<Pubkey>, quantity: u64, max_slippage_bps: u16) -> Self {
        Self {
            token_address: token_address.into(),
            side: Side::Sell,
            size_native_units: quantity,
            max_slippage_bps,
        }
    }

    pub fn input_mint(&self) -> &str {
        match self.side {
            Side::Buy => NATIVE_MINT,
            Side::Sell => &self.token_address,
        }
    }

    pub fn output_mint(&self) -> &str {
        match self.side {
            Side::Buy => &self.token_address,
            Side::Sell => NATIVE_MINT,
        }
    }

    pub fn quote_request(&self) -> QuoteRequest {
        QuoteRequest {
            input_mint: self.input_mint().to_string(),
            output_mint: self.output_mint().to_string(),
            amount: self.size_native_units,
            slippage_bps: self.max_slippage_bps,
        }
    }
}

/// Parameters for a route request to the aggregator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteRequest {
    pub input_mint: Pubkey,
    pub output_mint: Pubkey,
    pub amount: u64,
    pub slippage_bps: u16,
}

/// A priced route. Only valid for a short time; the aggregator may reprice.
#[derive(Debug, Clone)]
pub struct QuoteResult {
    pub input_mint: Pubkey,
    pub output_mint: Pubkey,
    pub in_amount: u64,
    pub out_amount: u64,
    pub price_impact_pct: f64,
    /// Opaque route as returned by the aggregator, handed back when building the swap
    pub route: serde_json::Value,
    pub fetched_at: Instant,
}

impl QuoteResult {
    pub fn age(&self) -> Duration {
        self.fetched_at.elapsed()
    }

    pub fn is_stale(&self, ttl: Duration) -> bool {
        self.age() > ttl
    }
}

/// A signed swap transaction ready for simulation and submission.
///
/// The signature is fixed once the transaction is signed, so it is known
/// before the transaction ever reaches the network.
#[derive(Debug, Clone)]
pub struct SwapTransaction {
    pub signature: String,
    pub payload: Vec<u8>,
    pub last_valid_block_height: Option<u64>,
}

/// Result of a dry run against current ledger state.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationReport {
    pub success: bool,
    pub error: Option<String>,
    pub units_consumed: Option<u64>,
}

impl SimulationReport {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
            units_consumed: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(reason.into()),
            units_consumed: None,
        }
    }
}

/// What the ledger currently knows about a submitted signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureStatus {
    /// Not observed (yet) at the requested commitment
    Pending,
    /// Included without error
    Landed,
    /// Included, but the transaction itself failed
    Failed(String),
}

/// Terminal value returned by the execution pipeline. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub side: Side,
    pub token_address: Pubkey,
    pub signature: Option<String>,
    pub input_amount: Option<u64>,
    pub output_amount: Option<u64>,
    /// SOL per token, in UI units
    pub execution_price: Option<f64>,
    pub error: Option<ExecutionError>,
    pub attempts: u32,
    pub timestamp: u64,
}

impl ExecutionResult {
    pub fn filled(
        order: &Order,
        signature: String,
        input_amount: u64,
        output_amount: u64,
        execution_price: Option<f64>,
        attempts: u32,
    ) -> Self {
        Self {
            success: true,
            side: order.side,
            token_address: order.token_address.clone(),
            signature: Some(signature),
            input_amount: Some(input_amount),
            output_amount: Some(output_amount),
            execution_price,
            error: None,
            attempts,
            timestamp: now_millis(),
        }
    }

    pub fn failed(order: &Order, error: ExecutionError, attempts: u32) -> Self {
        let signature = error.signature().map(str::to_string);
        Self {
            success: false,
            side: order.side,
            token_address: order.token_address.clone(),
            signature,
            input_amount: None,
            output_amount: None,
            execution_price: None,
            error: Some(error),
            attempts,
            timestamp: now_millis(),
        }
    }

    /// A submission that was never observed. The amounts are those of the
    /// submitted quote, kept so the trade can be settled if it turns up.
    pub fn uncertain(order: &Order, error: ExecutionError, attempts: u32, quoted: Option<(u64, u64)>) -> Self {
        let (input_amount, output_amount) = match quoted {
            Some((input, output)) => (Some(input), Some(output)),
            None => (None, None),
        };
        Self {
            input_amount,
            output_amount,
            ..Self::failed(order, error, attempts)
        }
    }

    /// True when funds may have moved even though the result is not a success.
    pub fn is_uncertain(&self) -> bool {
        matches!(self.error, Some(ExecutionError::Uncertain { .. }))
    }
}

/// An open position created by a settled buy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub token_address: Pubkey,
    pub pair_address: Option<Pubkey>,
    /// SOL per token at entry
    pub entry_price: f64,
    /// Raw token units held
    pub quantity: u64,
    pub entry_timestamp: u64,
    pub stop_loss: f64,
    pub take_profit: f64,
    /// Lamports spent to open the position
    pub cost_basis_lamports: u64,
    pub last_price: f64,
    pub unrealized_pnl_sol: f64,
}
