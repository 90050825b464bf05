//! Admission coordinator.
//!
//! Decouples the rate at which candidates arrive from the rate at which the
//! engine can act on them. Tokens wait in an ordered queue and are dispatched
//! when a concurrency slot is free and their cooldown has run out.
//!
//! The coordinator never fails, it only delays. The caller must call
//! [`AdmissionCoordinator::complete`] for every dispatch it receives, on the
//! success path and on the failure path alike; a missing `complete` leaks a
//! concurrency slot for the lifetime of the coordinator.

use crate::config::AdmissionConfig;
use crate::types::Pubkey;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Lifecycle of a token inside the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Waiting in the queue
    Pending,
    /// Dispatched, `complete` not yet called
    InFlight,
    /// Completed; kept while its cooldown runs
    Idle,
}

/// Per-token bookkeeping, owned by the coordinator.
#[derive(Debug, Clone)]
pub struct DispatchSlot {
    pub token_address: Pubkey,
    pub enqueued_at: Instant,
    pub last_dispatch_at: Option<Instant>,
    pub state: SlotState,
}

/// Pushed to the caller when a token may be processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub token_address: Pubkey,
    pub dispatched_at: Instant,
}

pub type DispatchSender = mpsc::UnboundedSender<Dispatch>;
pub type DispatchReceiver = mpsc::UnboundedReceiver<Dispatch>;

pub struct AdmissionCoordinator {
    slots: HashMap<Pubkey, DispatchSlot>,
    queue: VecDeque<Pubkey>,
    in_flight: usize,
    max_concurrent: usize,
    cooldown: Duration,
    dispatch_sender: DispatchSender,
}

impl AdmissionCoordinator {
    pub fn new(config: &AdmissionConfig, dispatch_sender: DispatchSender) -> Self {
        info!(
            "Admission coordinator: max {} in flight, {}s cooldown",
            config.max_concurrent, config.cooldown_seconds
        );
        Self {
            slots: HashMap::new(),
            queue: VecDeque::new(),
            in_flight: 0,
            max_concurrent: config.max_concurrent,
            cooldown: config.cooldown(),
            dispatch_sender,
        }
    }

    /// Create a coordinator together with the receiving end of its dispatches.
    pub fn channel(config: &AdmissionConfig) -> (Self, DispatchReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self::new(config, sender), receiver)
    }

    /// Queue a token. Returns `false` if it was already pending or in flight.
    pub fn enqueue(&mut self, token_address: &str) -> bool {
        self.enqueue_at(token_address, Instant::now())
    }

    pub fn enqueue_at(&mut self, token_address: &str, now: Instant) -> bool {
        match self.slots.get_mut(token_address) {
            Some(slot) if slot.state != SlotState::Idle => {
                debug!("Token {} already {:?}, ignoring enqueue", token_address, slot.state);
                return false;
            }
            Some(slot) => {
                slot.state = SlotState::Pending;
                slot.enqueued_at = now;
            }
            None => {
                self.slots.insert(
                    token_address.to_string(),
                    DispatchSlot {
                        token_address: token_address.to_string(),
                        enqueued_at: now,
                        last_dispatch_at: None,
                        state: SlotState::Pending,
                    },
                );
            }
        }
        self.queue.push_back(token_address.to_string());
        debug!("Enqueued {} ({} pending)", token_address, self.queue.len());

        self.pump(now);
        true
    }

    /// Mark a dispatched token as finished, whatever the outcome.
    pub fn complete(&mut self, token_address: &str) {
        self.complete_at(token_address, Instant::now());
    }

    pub fn complete_at(&mut self, token_address: &str, now: Instant) {
        match self.slots.get_mut(token_address) {
            Some(slot) if slot.state == SlotState::InFlight => {
                slot.state = SlotState::Idle;
                slot.last_dispatch_at = Some(now);
                self.in_flight -= 1;
                debug!("Completed {} ({} in flight)", token_address, self.in_flight);
            }
            _ => {
                warn!("complete() called for {} which is not in flight", token_address);
                return;
            }
        }

        self.prune_idle(now);
        self.pump(now);
    }

    /// Dispatch every eligible queued token while slots are free.
    ///
    /// Tokens still cooling down are skipped and stay queued in order.
    pub fn pump(&mut self, now: Instant) -> usize {
        let mut dispatched = 0;
        let mut index = 0;

        while self.in_flight < self.max_concurrent && index < self.queue.len() {
            let eligible = self
                .slots
                .get(&self.queue[index])
                .map(|slot| self.cooldown_elapsed(slot, now))
                .unwrap_or(false);
            if !eligible {
                index += 1;
                continue;
            }

            let Some(token_address) = self.queue.remove(index) else {
                break;
            };
            if let Some(slot) = self.slots.get_mut(&token_address) {
                slot.state = SlotState::InFlight;
                slot.last_dispatch_at = Some(now);
            }
            self.in_flight += 1;
            dispatched += 1;

            info!("Dispatching {} ({}/{} in flight)", token_address, self.in_flight, self.max_concurrent);
            let dispatch = Dispatch {
                token_address,
                dispatched_at: now,
            };
            if self.dispatch_sender.send(dispatch).is_err() {
                warn!("Dispatch receiver dropped; dispatch not delivered");
            }
        }

        dispatched
    }

    /// Earliest instant at which `pump` could dispatch something new.
    ///
    /// `None` when nothing is queued or every slot is busy; a `complete`
    /// call is the only thing that can help in that case.
    pub fn next_wakeup(&self, now: Instant) -> Option<Instant> {
        if self.in_flight >= self.max_concurrent {
            return None;
        }
        self.queue
            .iter()
            .filter_map(|token| self.slots.get(token))
            .map(|slot| match slot.last_dispatch_at {
                Some(last) => (last + self.cooldown).max(now),
                None => now,
            })
            .min()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight
    }

    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn slot(&self, token_address: &str) -> Option<&DispatchSlot> {
        self.slots.get(token_address)
    }

    pub fn is_in_flight(&self, token_address: &str) -> bool {
        self.state_of(token_address) == Some(SlotState::InFlight)
    }

    pub fn is_pending(&self, token_address: &str) -> bool {
        self.state_of(token_address) == Some(SlotState::Pending)
    }

    fn state_of(&self, token_address: &str) -> Option<SlotState> {
        self.slots.get(token_address).map(|slot| slot.state)
    }

    fn cooldown_elapsed(&self, slot: &DispatchSlot, now: Instant) -> bool {
        slot.last_dispatch_at
            .map_or(true, |last| now.saturating_duration_since(last) >= self.cooldown)
    }

    /// Idle slots past their cooldown carry no information any more.
    fn prune_idle(&mut self, now: Instant) {
        let cooldown = self.cooldown;
        self.slots.retain(|_, slot| {
            slot.state != SlotState::Idle
                || slot
                    .last_dispatch_at
                    .map_or(false, |last| now.saturating_duration_since(last) < cooldown)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator(max_concurrent: usize, cooldown_seconds: u64) -> (AdmissionCoordinator, DispatchReceiver) {
        AdmissionCoordinator::channel(&AdmissionConfig {
            max_concurrent,
            cooldown_seconds,
        })
    }

    fn drain(receiver: &mut DispatchReceiver) -> Vec<String> {
        let mut tokens = Vec::new();
        while let Ok(dispatch) = receiver.try_recv() {
            tokens.push(dispatch.token_address);
        }
        tokens
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_abc_scenario() {
        let (mut coord, mut rx) = coordinator(2, 60);
        let t0 = Instant::now();

        coord.enqueue_at("A", t0);
        coord.enqueue_at("B", t0);
        coord.enqueue_at("C", t0);
        assert_eq!(drain(&mut rx), vec!["A", "B"]);
        assert!(coord.is_pending("C"));
        assert_eq!(coord.in_flight_count(), 2);

        coord.complete_at("A", t0 + secs(5));
        assert_eq!(drain(&mut rx), vec!["C"]);
        assert_eq!(coord.in_flight_count(), 2);
    }

    #[test]
    fn test_enqueue_is_idempotent() {
        let (mut coord, mut rx) = coordinator(1, 60);
        let t0 = Instant::now();

        coord.enqueue_at("busy", t0);
        assert!(coord.enqueue_at("T", t0));
        assert!(!coord.enqueue_at("T", t0));
        assert_eq!(coord.pending_count(), 1);

        coord.complete_at("busy", t0 + secs(1));
        assert_eq!(drain(&mut rx), vec!["busy", "T"]);
    }

    #[test]
    fn test_in_flight_token_is_never_redispatched() {
        let (mut coord, mut rx) = coordinator(3, 0);
        let t0 = Instant::now();

        coord.enqueue_at("T", t0);
        assert!(coord.is_in_flight("T"));
        assert!(!coord.enqueue_at("T", t0 + secs(100)));
        coord.pump(t0 + secs(200));

        assert_eq!(drain(&mut rx), vec!["T"]);
        assert_eq!(coord.in_flight_count(), 1);
    }

    #[test]
    fn test_cooldown_holds_until_expiry() {
        let (mut coord, mut rx) = coordinator(2, 60);
        let t0 = Instant::now();

        coord.enqueue_at("T", t0);
        coord.complete_at("T", t0 + secs(1));
        assert_eq!(drain(&mut rx), vec!["T"]);

        assert!(coord.enqueue_at("T", t0 + secs(2)));
        assert!(drain(&mut rx).is_empty());
        assert_eq!(coord.next_wakeup(t0 + secs(2)), Some(t0 + secs(61)));

        coord.pump(t0 + secs(60));
        assert!(drain(&mut rx).is_empty());

        coord.pump(t0 + secs(61));
        assert_eq!(drain(&mut rx), vec!["T"]);
    }

    #[test]
    fn test_ineligible_head_is_skipped_not_removed() {
        let (mut coord, mut rx) = coordinator(1, 60);
        let t0 = Instant::now();

        coord.enqueue_at("A", t0);
        coord.complete_at("A", t0 + secs(1));
        drain(&mut rx);

        coord.enqueue_at("B", t0 + secs(2));
        assert_eq!(drain(&mut rx), vec!["B"]);

        // A is at the head of the queue but cooling down; C jumps it.
        coord.enqueue_at("A", t0 + secs(3));
        coord.enqueue_at("C", t0 + secs(3));
        coord.complete_at("B", t0 + secs(4));
        assert_eq!(drain(&mut rx), vec!["C"]);
        assert!(coord.is_pending("A"));

        coord.complete_at("C", t0 + secs(70));
        assert_eq!(drain(&mut rx), vec!["A"]);
    }

    #[test]
    fn test_concurrency_bound_holds() {
        let (mut coord, mut rx) = coordinator(3, 0);
        let t0 = Instant::now();

        for i in 0..10 {
            coord.enqueue_at(&format!("T{}", i), t0);
            assert!(coord.in_flight_count() <= 3);
        }
        assert_eq!(drain(&mut rx).len(), 3);

        let mut completed = 0;
        let mut now = t0;
        while completed < 10 {
            now += secs(1);
            let in_flight: Vec<String> = (0..10)
                .map(|i| format!("T{}", i))
                .filter(|t| coord.is_in_flight(t))
                .collect();
            for token in in_flight {
                coord.complete_at(&token, now);
                completed += 1;
                assert!(coord.in_flight_count() <= 3);
            }
        }
        assert_eq!(coord.in_flight_count(), 0);
        assert_eq!(coord.pending_count(), 0);
        assert_eq!(drain(&mut rx).len(), 7);
    }

    #[test]
    fn test_complete_for_unknown_token_is_ignored() {
        let (mut coord, _rx) = coordinator(1, 60);
        coord.complete_at("ghost", Instant::now());
        assert_eq!(coord.in_flight_count(), 0);
    }

    #[test]
    fn test_next_wakeup_none_when_saturated() {
        let (mut coord, _rx) = coordinator(1, 60);
        let t0 = Instant::now();

        assert_eq!(coord.next_wakeup(t0), None);
        coord.enqueue_at("A", t0);
        coord.enqueue_at("B", t0);
        assert_eq!(coord.next_wakeup(t0), None);
    }

    #[test]
    fn test_idle_slots_are_pruned_after_cooldown() {
        let (mut coord, _rx) = coordinator(2, 10);
        let t0 = Instant::now();

        coord.enqueue_at("A", t0);
        coord.enqueue_at("B", t0);
        coord.complete_at("A", t0 + secs(1));
        assert!(coord.slot("A").is_some());

        coord.complete_at("B", t0 + secs(20));
        assert!(coord.slot("A").is_none());
        assert!(coord.slot("B").is_some());
    }
}
