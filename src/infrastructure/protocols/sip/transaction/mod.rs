//! SIP Transaction Layer
//!
//! Client side of the non-INVITE transaction (RFC 3261 Section 17.1.2) as
//! used for REGISTER, including digest challenge handling.
//!
//! ## Pieces
//! - [`fsm`]: the state/input/action table, free of I/O
//! - [`timer`]: one-shot timers A, B and D feeding the transaction inbox
//! - [`client`]: one task per transaction, serializing every input
//! - [`manager`]: creates transactions and routes responses to them

pub mod client;
pub mod fsm;
pub mod manager;
pub mod observer;
pub mod timer;

pub use client::{ClientTransactionHandle, TransactionResult};
pub use fsm::{transition, ClientAction, ClientInput, ClientState};
pub use manager::{TransactionManager, TransactionTable};
pub use observer::{TracingObserver, TransactionObserver};
pub use timer::{TimerConfig, TimerType};

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Transaction ID - uniquely identifies a transaction
/// Based on branch parameter in Via header
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct TransactionId(pub String);

impl TransactionId {
    /// Create transaction ID from branch parameter
    pub fn from_branch(branch: &str) -> Self {
        Self(branch.to_string())
    }

    /// Generate a new transaction ID
    pub fn generate() -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let random: u64 = rng.gen();
        Self(format!("z9hG4bK{:x}", random))
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fatal outcomes reported to the caller before the transaction is deleted
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Transaction timed out after {0:?} without a final response")]
    Timeout(Duration),
}

#[cfg(test)]
pub(crate) mod testing {
    //! Test doubles shared by the transaction tests

    use super::super::message::{SipError, SipRequest, SipResponse};
    use super::super::transport::{OutgoingMessage, Transport, TransportProtocol};
    use super::super::builder::ResponseBuilder;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::Instant;

    /// Records every message handed to it
    pub struct RecordingTransport {
        protocol: TransportProtocol,
        sent: Mutex<Vec<(Instant, SipRequest)>>,
        fail: AtomicBool,
    }

    impl RecordingTransport {
        pub fn new(protocol: TransportProtocol) -> Self {
            Self {
                protocol,
                sent: Mutex::new(Vec::new()),
                fail: AtomicBool::new(false),
            }
        }

        pub fn fail_sends(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }

        pub fn sent(&self) -> Vec<SipRequest> {
            self.sent.lock().unwrap().iter().map(|(_, r)| r.clone()).collect()
        }

        pub fn sent_at(&self) -> Vec<Instant> {
            self.sent.lock().unwrap().iter().map(|(t, _)| *t).collect()
        }

        pub fn count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }

        pub fn acks(&self) -> usize {
            self.sent()
                .iter()
                .filter(|r| r.inner.method == rsip::Method::Ack)
                .count()
        }
    }

    #[async_trait::async_trait]
    impl Transport for RecordingTransport {
        async fn send(&self, message: OutgoingMessage) -> Result<(), SipError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(SipError::TransportError("connection refused".to_string()));
            }
            let request = SipRequest::parse(&message.data).expect("transaction sent a request");
            self.sent.lock().unwrap().push((Instant::now(), request));
            Ok(())
        }

        fn protocol(&self) -> TransportProtocol {
            self.protocol
        }
    }

    /// Every send hangs for `delay` and then fails, like a connect to a
    /// registrar that silently drops packets
    pub struct StalledTransport {
        delay: Duration,
        attempts: AtomicUsize,
    }

    impl StalledTransport {
        pub fn new(delay: Duration) -> Self {
            Self {
                delay,
                attempts: AtomicUsize::new(0),
            }
        }

        pub fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl Transport for StalledTransport {
        async fn send(&self, _message: OutgoingMessage) -> Result<(), SipError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Err(SipError::TransportError("connect timed out".to_string()))
        }

        fn protocol(&self) -> TransportProtocol {
            TransportProtocol::Tcp
        }
    }

    pub fn register(branch: &str) -> SipRequest {
        let request_str = format!(
            "REGISTER sip:example.com SIP/2.0\r\n\
            Via: SIP/2.0/UDP 127.0.0.1:5060;branch={}\r\n\
            From: Alice <sip:alice@example.com>;tag=1928301774\r\n\
            To: Alice <sip:alice@example.com>\r\n\
            Call-ID: reg-test-123\r\n\
            CSeq: 1 REGISTER\r\n\
            Contact: <sip:alice@127.0.0.1:5060>\r\n\
            Expires: 3600\r\n\
            Content-Length: 0\r\n\
            \r\n",
            branch
        );
        SipRequest::parse(request_str.as_bytes()).unwrap()
    }

    /// Response to `request` with `status`
    pub fn response(request: &SipRequest, status: u16) -> SipResponse {
        ResponseBuilder::new(status)
            .to_tag("reg-srv")
            .build_for_request(request)
            .unwrap()
    }

    /// 401 carrying a Digest challenge for `nonce`
    pub fn challenge(request: &SipRequest, nonce: &str) -> SipResponse {
        ResponseBuilder::unauthorized()
            .header(
                "WWW-Authenticate",
                &format!(r#"Digest realm="example.com", nonce="{}", qop="auth""#, nonce),
            )
            .build_for_request(request)
            .unwrap()
    }
}
