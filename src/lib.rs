//! H-5N1P3R execution engine
//!
//! Admission, risk-gating and order execution for sniping newly listed
//! Solana tokens through a swap aggregator.

pub mod admission;
pub mod config;
pub mod engine;
pub mod error;
pub mod execution;
pub mod journal;
pub mod metrics;
pub mod notify;
pub mod positions;
pub mod risk;
pub mod types;

// Re-export main types for convenience
pub use admission::{AdmissionCoordinator, Dispatch};
pub use config::{EngineBuilder, EngineConfig};
pub use engine::TradingEngine;
pub use error::{ExecutionError, RiskRejection};
pub use execution::{ExecutionPipeline, JupiterClient, PaperClient, SwapClient};
pub use notify::{Notification, Notifier};
pub use risk::{RiskGate, RiskState, TripReason};
pub use types::{Candidate, ExecutionResult, Order, Position, Side};
