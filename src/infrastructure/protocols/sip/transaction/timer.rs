//! Transaction timers
//!
//! Each timer is a one-shot tokio task that, when it expires, enqueues a
//! `TimerFired` event into the owning transaction's inbox. Timer callbacks
//! never touch transaction state directly.

use super::client::TransactionEvent;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::trace;

/// T1: RTT Estimate (RFC 3261 Section 17.1.1.1)
pub const T1: Duration = Duration::from_millis(500);

/// Timer types used by the REGISTER client transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerType {
    /// Timer A: request retransmit interval (default: T1, doubling)
    TimerA,
    /// Timer B: transaction timeout (default: 64*T1)
    TimerB,
    /// Timer D: wait time for response retransmits (default: 32s for UDP, 0s for TCP)
    TimerD,
}

impl TimerType {
    /// Get default duration for this timer
    pub fn default_duration(&self, t1: Duration, is_reliable: bool) -> Duration {
        match self {
            TimerType::TimerA => t1,
            TimerType::TimerB => t1 * 64,
            TimerType::TimerD => {
                if is_reliable {
                    Duration::from_secs(0)
                } else {
                    Duration::from_secs(32)
                }
            }
        }
    }
}

/// Timer configuration for one client transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerConfig {
    /// First Timer A interval; doubles on every fire
    pub initial_retransmit_interval: Duration,
    /// Timer B, absolute deadline for a final response
    pub transaction_timeout: Duration,
    /// Timer D, linger after a final response
    pub linger_duration: Duration,
    /// Reliable transports never arm Timer A and linger for zero time
    pub reliable_transport: bool,
    /// Restart Timer D when a duplicate final arrives while lingering
    pub restart_linger_on_duplicate: bool,
}

impl TimerConfig {
    /// RFC 3261 defaults derived from T1
    pub fn from_t1(t1: Duration, reliable_transport: bool) -> Self {
        Self {
            initial_retransmit_interval: TimerType::TimerA.default_duration(t1, reliable_transport),
            transaction_timeout: TimerType::TimerB.default_duration(t1, reliable_transport),
            linger_duration: TimerType::TimerD.default_duration(t1, reliable_transport),
            reliable_transport,
            restart_linger_on_duplicate: true,
        }
    }

    /// Effective Timer D duration
    pub fn linger(&self) -> Duration {
        if self.reliable_transport {
            Duration::ZERO
        } else {
            self.linger_duration
        }
    }
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self::from_t1(T1, false)
    }
}

/// A cancellable, resettable one-shot timer.
///
/// Every arm bumps a generation counter carried by the fired event. A fire
/// whose generation is no longer current (the timer was cancelled or rearmed
/// after the sleep completed but before the event was processed) is stale
/// and must be dropped by the transaction.
#[derive(Debug)]
pub struct TransactionTimer {
    kind: TimerType,
    interval: Duration,
    generation: u64,
    armed: bool,
    handle: Option<JoinHandle<()>>,
}

impl TransactionTimer {
    pub fn new(kind: TimerType, interval: Duration) -> Self {
        Self {
            kind,
            interval,
            generation: 0,
            armed: false,
            handle: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Arm with the current interval, replacing any pending fire
    pub fn arm(&mut self, inbox: &UnboundedSender<TransactionEvent>) {
        self.cancel();
        self.generation += 1;
        self.armed = true;

        let event = TransactionEvent::TimerFired {
            kind: self.kind,
            generation: self.generation,
        };

        if self.interval.is_zero() {
            let _ = inbox.send(event);
            return;
        }

        let inbox = inbox.clone();
        let interval = self.interval;
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let _ = inbox.send(event);
        }));

        trace!("Armed {:?} for {:?}", self.kind, interval);
    }

    /// Change the interval and arm again
    pub fn reset(&mut self, interval: Duration, inbox: &UnboundedSender<TransactionEvent>) {
        self.interval = interval;
        self.arm(inbox);
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        self.armed = false;
    }

    /// Whether a fire with this generation should be processed
    pub fn is_current(&self, generation: u64) -> bool {
        self.armed && generation == self.generation
    }

    /// Mark the pending fire as consumed
    pub fn expire(&mut self) {
        self.armed = false;
        self.handle = None;
    }
}

impl Drop for TransactionTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
