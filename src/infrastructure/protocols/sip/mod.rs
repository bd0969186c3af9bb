//! SIP protocol implementation
//!
//! Client side of a SIP stack based on RFC 3261, limited to REGISTER style
//! non-INVITE transactions.
//!
//! Architecture:
//! ```text
//! ┌─────────────────────────┐
//! │   Application Layer     │
//! │   (REGISTER client)     │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │   Transaction Layer     │
//! │  (Client TXN, digest)   │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │   Transport Layer       │
//! │      (UDP, TCP)         │
//! └─────────────────────────┘
//! ```

pub mod auth;
pub mod builder;
pub mod message;
pub mod transaction;
pub mod transport;

pub use auth::{DigestChallenge, DigestClient, UserCredentials};
pub use builder::{build_ack, build_register, RegisterParams, ResponseBuilder};
pub use message::{SipError, SipMessage, SipMethod, SipRequest, SipResponse};
pub use transaction::{
    ClientAction, ClientInput, ClientState, ClientTransactionHandle, TimerConfig, TimerType,
    TransactionError, TransactionId, TransactionManager, TransactionObserver, TransactionResult,
    TracingObserver,
};
pub use transport::{IncomingMessage, TcpTransport, Transport, TransportProtocol, UdpTransport};
