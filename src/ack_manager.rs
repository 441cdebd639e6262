//! ACK Manager module - per-packet reliability over UDP
//!
//! Tracks every sent-but-unacknowledged announcement packet per
//! `(target, sequence)`, retransmits verbatim with truncated exponential
//! backoff, and resolves packets into acknowledged or failed outcomes.
//!
//! The manager never performs I/O and never reads the clock: callers pass
//! `now` in and perform the retransmissions it asks for. Retry checks are
//! driven by the scheduler's loop.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::contracts::{Acknowledgment, RecordId, TargetId};
use crate::errors::RecsyncError;
use crate::registry::RecordRegistry;

/// Calculate truncated exponential backoff
///
/// Formula: delay = min(base_ms * (multiplier ^ exponent), max_delay_ms)
pub fn calculate_backoff_ms(exponent: u32, base_ms: u64, multiplier: f64, max_delay_ms: u64) -> u64 {
    let exponent = exponent.min(i32::MAX as u32) as i32;
    let backoff = base_ms as f64 * multiplier.powi(exponent);
    if !backoff.is_finite() || backoff >= max_delay_ms as f64 {
        max_delay_ms
    } else {
        backoff.round() as u64
    }
}

/// Retransmission tuning
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Wait after the first send
    pub base_timeout: Duration,
    /// Growth factor between consecutive waits
    pub backoff_multiplier: f64,
    /// Upper bound for any single wait
    pub max_retry_interval: Duration,
    /// Total sends per packet before it is declared failed
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_timeout: Duration::from_millis(crate::ACK_TIMEOUT_MS),
            backoff_multiplier: crate::BACKOFF_MULTIPLIER,
            max_retry_interval: Duration::from_millis(crate::MAX_RETRY_INTERVAL_MS),
            max_attempts: crate::MAX_ANNOUNCE_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    /// How long to wait for an ACK after send attempt `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let ms = calculate_backoff_ms(
            attempt.saturating_sub(1),
            self.base_timeout.as_millis() as u64,
            self.backoff_multiplier,
            self.max_retry_interval.as_millis() as u64,
        );
        Duration::from_millis(ms)
    }
}

/// Retransmission state for one in-flight packet
#[derive(Debug, Clone)]
pub struct RetransmissionState {
    pub target: TargetId,
    pub address: SocketAddr,
    pub sequence: u32,
    /// Records carried by the packet
    pub records: Vec<RecordId>,
    /// Encoded datagram, resent verbatim
    pub bytes: Bytes,
    /// Sends so far (1 after the first transmission)
    pub attempt: u32,
    pub first_sent: Instant,
    pub last_sent: Instant,
    /// ACK deadline for the latest attempt
    pub next_retry: Instant,
}

impl RetransmissionState {
    fn new(
        target: TargetId,
        address: SocketAddr,
        sequence: u32,
        records: Vec<RecordId>,
        bytes: Bytes,
        policy: &RetryPolicy,
        now: Instant,
    ) -> Self {
        Self {
            target,
            address,
            sequence,
            records,
            bytes,
            attempt: 1,
            first_sent: now,
            last_sent: now,
            next_retry: now + policy.backoff(1),
        }
    }

    /// Check if the ACK deadline has passed
    pub fn is_ready_for_retry(&self, now: Instant) -> bool {
        now >= self.next_retry
    }

    /// Record another send and push the deadline out by the next backoff step
    pub fn schedule_next_retry(&mut self, policy: &RetryPolicy, now: Instant) {
        self.attempt += 1;
        self.last_sent = now;
        self.next_retry = now + policy.backoff(self.attempt);
    }

    /// Check if the send budget is spent
    pub fn is_exhausted(&self, policy: &RetryPolicy) -> bool {
        self.attempt >= policy.max_attempts
    }
}

/// Work produced by a timeout check
#[derive(Debug, Clone, PartialEq)]
pub enum RetryAction {
    /// Resend `bytes` to `target`; `attempt` is the number of this send
    Retransmit {
        target: TargetId,
        address: SocketAddr,
        sequence: u32,
        attempt: u32,
        records: usize,
        bytes: Bytes,
    },
    /// Packet failed; its records are pending again
    Failed(RecsyncError),
}

/// Result of handling one acknowledgment
#[derive(Debug, Clone, PartialEq)]
pub enum AckOutcome {
    /// Records are now acked for the target
    Acknowledged {
        records: Vec<RecordId>,
        attempts: u32,
        rtt: Duration,
    },
    /// Receiver refused the packet; its records are pending again
    Rejected(RecsyncError),
    /// Unknown, duplicate or late acknowledgment
    Ignored,
}

/// ACK Manager - in-flight packet table and retry state machine
#[derive(Debug)]
pub struct AckManager {
    policy: RetryPolicy,
    in_flight: HashMap<(TargetId, u32), RetransmissionState>,
}

impl AckManager {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            in_flight: HashMap::new(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }

    pub fn get(&self, target: TargetId, sequence: u32) -> Option<&RetransmissionState> {
        self.in_flight.get(&(target, sequence))
    }

    /// Start tracking a packet that has just been sent for the first time
    pub fn track(
        &mut self,
        target: TargetId,
        address: SocketAddr,
        sequence: u32,
        records: Vec<RecordId>,
        bytes: Bytes,
        now: Instant,
    ) {
        let state = RetransmissionState::new(target, address, sequence, records, bytes, &self.policy, now);
        trace!(%address, sequence, deadline_ms = self.policy.backoff(1).as_millis() as u64, "Tracking packet");
        self.in_flight.insert((target, sequence), state);
    }

    /// Earliest ACK deadline across all in-flight packets
    pub fn next_deadline(&self) -> Option<Instant> {
        self.in_flight.values().map(|s| s.next_retry).min()
    }

    /// Check deadlines at `now`
    ///
    /// Packets under budget are scheduled for retransmission; exhausted
    /// packets are dropped and their records returned to `Pending`. Actions
    /// come out in deadline order.
    pub fn poll_timeouts(&mut self, now: Instant, registry: &mut RecordRegistry) -> Vec<RetryAction> {
        let mut expired: Vec<(Instant, (TargetId, u32))> = self
            .in_flight
            .iter()
            .filter(|(_, state)| state.is_ready_for_retry(now))
            .map(|(key, state)| (state.next_retry, *key))
            .collect();
        expired.sort();

        let mut actions = Vec::with_capacity(expired.len());
        for (_, key) in expired {
            let exhausted = match self.in_flight.get(&key) {
                Some(state) => state.is_exhausted(&self.policy),
                None => continue,
            };

            if exhausted {
                if let Some(state) = self.in_flight.remove(&key) {
                    registry.mark_pending(&state.records, state.target, state.sequence);
                    warn!(
                        address = %state.address,
                        sequence = state.sequence,
                        attempts = state.attempt,
                        records = state.records.len(),
                        "Packet unacknowledged, giving up until next cycle"
                    );
                    actions.push(RetryAction::Failed(RecsyncError::RetryExhausted {
                        target: state.address,
                        sequence: state.sequence,
                        attempts: state.attempt,
                    }));
                }
            } else if let Some(state) = self.in_flight.get_mut(&key) {
                state.schedule_next_retry(&self.policy, now);
                debug!(
                    address = %state.address,
                    sequence = state.sequence,
                    attempt = state.attempt,
                    "Retransmitting packet"
                );
                actions.push(RetryAction::Retransmit {
                    target: state.target,
                    address: state.address,
                    sequence: state.sequence,
                    attempt: state.attempt,
                    records: state.records.len(),
                    bytes: state.bytes.clone(),
                });
            }
        }
        actions
    }

    /// Resolve an acknowledgment from `target`
    pub fn on_ack(
        &mut self,
        target: TargetId,
        ack: &Acknowledgment,
        now: Instant,
        registry: &mut RecordRegistry,
    ) -> AckOutcome {
        let Some(state) = self.in_flight.remove(&(target, ack.sequence)) else {
            trace!(target_id = %target, sequence = ack.sequence, "Ignoring unknown or duplicate acknowledgment");
            return AckOutcome::Ignored;
        };

        if ack.is_ok() {
            registry.mark_acked(&state.records, target);
            AckOutcome::Acknowledged {
                records: state.records,
                attempts: state.attempt,
                rtt: now.saturating_duration_since(state.last_sent),
            }
        } else {
            registry.mark_pending(&state.records, target, state.sequence);
            warn!(address = %state.address, sequence = state.sequence, "Packet rejected by receiver");
            AckOutcome::Rejected(RecsyncError::Rejected {
                target: state.address,
                sequence: state.sequence,
            })
        }
    }

    /// Drop every in-flight packet, returning its records to `Pending`
    ///
    /// Returns the number of packets abandoned.
    pub fn abandon_all(&mut self, registry: &mut RecordRegistry) -> usize {
        let count = self.in_flight.len();
        for (_, state) in self.in_flight.drain() {
            registry.mark_pending(&state.records, state.target, state.sequence);
        }
        count
    }
}
