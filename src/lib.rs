//! sip-reg-client - SIP REGISTER client transactions built with Rust
//!
//! Implements the client side of the RFC 3261 non-INVITE transaction for
//! REGISTER, including digest challenge handling, over UDP or TCP.

pub mod config;
pub mod infrastructure;

// Re-export commonly used types
pub use infrastructure::protocols::sip::{
    ClientState, ClientTransactionHandle, SipError, SipRequest, SipResponse, TimerConfig,
    TransactionError, TransactionManager, UserCredentials,
};
