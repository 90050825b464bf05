//! Domain error types.
//!
//! Infrastructure code (clients, journal, config loading) uses `anyhow`;
//! the values here are the ones callers branch on.

use crate::risk::TripReason;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Step of the swap protocol an error or timeout belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Quote,
    Build,
    Simulate,
    Submit,
    Confirm,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::Quote => "quote",
            Step::Build => "build",
            Step::Simulate => "simulate",
            Step::Submit => "submit",
            Step::Confirm => "confirm",
        };
        f.write_str(name)
    }
}

/// Why an execution attempt failed.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionError {
    #[error("no route for {input_mint} -> {output_mint}")]
    NoRoute { input_mint: String, output_mint: String },

    #[error("route implies zero output")]
    ZeroOutput,

    #[error("quote went stale after {age_ms}ms")]
    StaleQuote { age_ms: u64 },

    #[error("quote request failed: {message}")]
    Quote { message: String },

    #[error("transaction build failed: {message}")]
    Build { message: String },

    #[error("simulation failed: {message}")]
    Simulation { message: String },

    #[error("submission failed: {message}")]
    Submission { message: String },

    /// The transaction landed and failed on-chain. Funds did not move.
    #[error("transaction {signature} landed with error: {reason}")]
    Rejected { signature: String, reason: String },

    /// Submitted but never observed. Funds may have moved.
    #[error("outcome unknown for {signature} after {polls} confirmation polls")]
    Uncertain { signature: String, polls: u32 },

    #[error("{step} timed out after {after_ms}ms")]
    Timeout { step: Step, after_ms: u64 },
}

impl ExecutionError {
    /// Whether a fresh attempt (new quote, new transaction) is safe.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ExecutionError::Uncertain { .. })
    }

    pub fn signature(&self) -> Option<&str> {
        match self {
            ExecutionError::Rejected { signature, .. } | ExecutionError::Uncertain { signature, .. } => {
                Some(signature)
            }
            _ => None,
        }
    }
}

/// A normal "no" from the risk gate.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RiskRejection {
    #[error("emergency stop is active")]
    EmergencyStop,

    #[error("circuit breaker tripped ({0})")]
    CircuitBreakerTripped(TripReason),

    #[error("max open positions reached ({open}/{max})")]
    MaxPositions { open: usize, max: usize },

    #[error("position size {size} exceeds max {max}")]
    PositionTooLarge { size: u64, max: u64 },
}
