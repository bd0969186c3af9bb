//! Observability hooks for client transactions

use super::fsm::{ClientAction, ClientInput, ClientState};
use super::TransactionId;
use crate::infrastructure::protocols::sip::message::SipError;
use tracing::{debug, warn};

/// Receives transaction events as they happen.
///
/// Injected into every transaction at construction. All methods have no-op
/// defaults so implementations only pick what they need.
pub trait TransactionObserver: Send + Sync {
    /// Called after every transition, before its action runs
    fn on_transition(
        &self,
        _id: &TransactionId,
        _from: ClientState,
        _input: ClientInput,
        _to: ClientState,
        _action: ClientAction,
    ) {
    }

    /// A challenge could not be answered
    fn on_auth_failed(&self, _id: &TransactionId, _error: &SipError) {}

    /// A send attempted by an action failed
    fn on_send_failed(&self, _id: &TransactionId, _error: &SipError) {}
}

/// Default observer writing structured `tracing` events
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl TransactionObserver for TracingObserver {
    fn on_transition(
        &self,
        id: &TransactionId,
        from: ClientState,
        input: ClientInput,
        to: ClientState,
        action: ClientAction,
    ) {
        debug!(
            id = %id,
            from = from.name(),
            input = ?input,
            to = to.name(),
            action = ?action,
            "Transaction transition"
        );
    }

    fn on_auth_failed(&self, id: &TransactionId, error: &SipError) {
        warn!(id = %id, error = %error, "Cannot answer authentication challenge");
    }

    fn on_send_failed(&self, id: &TransactionId, error: &SipError) {
        warn!(id = %id, error = %error, "Send failed");
    }
}
