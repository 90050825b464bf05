//! Best-effort notifications for the alerting collaborator.
//!
//! Delivery never blocks and never fails a trading decision: a full or
//! closed channel drops the notification with a log line.

use crate::positions::ExitReason;
use crate::risk::TripReason;
use crate::types::{ExecutionResult, Pubkey};
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// Events emitted by the risk gate and the engine.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum Notification {
    CircuitBreaker {
        reason: TripReason,
        message: String,
        timestamp: u64,
    },
    CircuitBreakerReset {
        timestamp: u64,
    },
    EmergencyStop {
        timestamp: u64,
    },
    EmergencyStopReset {
        timestamp: u64,
    },
    OrderFilled {
        result: ExecutionResult,
    },
    OrderFailed {
        result: ExecutionResult,
    },
    PositionClosed {
        token_address: Pubkey,
        reason: ExitReason,
        realized_pnl_sol: f64,
    },
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::CircuitBreaker { .. } => "circuitBreaker",
            Notification::CircuitBreakerReset { .. } => "circuitBreakerReset",
            Notification::EmergencyStop { .. } => "emergencyStop",
            Notification::EmergencyStopReset { .. } => "emergencyStopReset",
            Notification::OrderFilled { .. } => "orderFilled",
            Notification::OrderFailed { .. } => "orderFailed",
            Notification::PositionClosed { .. } => "positionClosed",
        }
    }
}

pub type NotificationReceiver = mpsc::Receiver<Notification>;

/// Sending half handed to every component that emits notifications.
#[derive(Debug, Clone, Default)]
pub struct Notifier {
    sender: Option<mpsc::Sender<Notification>>,
}

impl Notifier {
    pub fn new(sender: mpsc::Sender<Notification>) -> Self {
        Self { sender: Some(sender) }
    }

    /// A notifier that drops everything.
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    pub fn channel(buffer: usize) -> (Self, NotificationReceiver) {
        let (sender, receiver) = mpsc::channel(buffer);
        (Self::new(sender), receiver)
    }

    pub fn notify(&self, notification: Notification) {
        let Some(sender) = &self.sender else {
            return;
        };
        match sender.try_send(notification) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => {
                warn!("Notification channel full, dropping {}", dropped.kind());
            }
            Err(TrySendError::Closed(dropped)) => {
                debug!("Notification channel closed, dropping {}", dropped.kind());
            }
        }
    }
}
