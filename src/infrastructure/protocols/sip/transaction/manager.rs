//! Transaction manager
//!
//! Creates client transactions and routes incoming responses to them by the
//! branch parameter of the topmost Via.

use super::client::{
    ClientTransaction, ClientTransactionHandle, TransactionContext, TransactionEvent,
    TransactionRoute,
};
use super::observer::{TracingObserver, TransactionObserver};
use super::timer::TimerConfig;
use super::TransactionId;
use crate::infrastructure::protocols::sip::auth::UserCredentials;
use crate::infrastructure::protocols::sip::message::{SipError, SipMethod, SipRequest, SipResponse};
use crate::infrastructure::protocols::sip::transport::{IncomingMessage, Transport};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

/// Branch -> transaction inbox.
///
/// A transaction that re-sent with credentials is registered under every
/// branch it used.
#[derive(Clone, Default)]
pub struct TransactionTable {
    routes: Arc<RwLock<HashMap<TransactionId, TransactionRoute>>>,
}

impl TransactionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, branch: TransactionId, route: TransactionRoute) {
        self.routes.write().await.insert(branch, route);
    }

    /// Insert unless `branch` is taken. Check and insert share one write lock.
    pub async fn try_insert(&self, branch: TransactionId, route: TransactionRoute) -> bool {
        match self.routes.write().await.entry(branch) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(route);
                true
            }
        }
    }

    pub async fn get(&self, branch: &TransactionId) -> Option<TransactionRoute> {
        self.routes.read().await.get(branch).cloned()
    }

    pub async fn remove(&self, branch: &TransactionId) -> Option<TransactionRoute> {
        self.routes.write().await.remove(branch)
    }

    pub async fn contains(&self, branch: &TransactionId) -> bool {
        self.routes.read().await.contains_key(branch)
    }

    /// Number of registered branches
    pub async fn len(&self) -> usize {
        self.routes.read().await.len()
    }

    /// Number of live transactions
    pub async fn distinct(&self) -> usize {
        self.routes
            .read()
            .await
            .values()
            .map(|route| &route.id)
            .collect::<HashSet<_>>()
            .len()
    }
}

/// Transaction manager - creates REGISTER client transactions and feeds them
pub struct TransactionManager {
    transport: Arc<dyn Transport>,
    config: TimerConfig,
    table: TransactionTable,
    observer: Arc<dyn TransactionObserver>,
    credentials: Option<UserCredentials>,
}

impl TransactionManager {
    /// Create a manager sending through `transport`.
    /// A reliable transport forces the reliable timer profile.
    pub fn new(transport: Arc<dyn Transport>, mut config: TimerConfig) -> Self {
        if transport.protocol().is_reliable() {
            config.reliable_transport = true;
        }

        Self {
            transport,
            config,
            table: TransactionTable::new(),
            observer: Arc::new(TracingObserver),
            credentials: None,
        }
    }

    /// Identity used to answer 401 challenges
    pub fn with_credentials(mut self, credentials: UserCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn TransactionObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &TimerConfig {
        &self.config
    }

    /// Start a client transaction for `request`.
    ///
    /// The request must carry a Via branch, which becomes the transaction id.
    pub async fn send(
        &self,
        request: SipRequest,
        destination: SocketAddr,
    ) -> Result<ClientTransactionHandle, SipError> {
        match request.method() {
            Some(SipMethod::Invite) | Some(SipMethod::Ack) => {
                return Err(SipError::TransactionError(format!(
                    "{} is not handled by non-INVITE client transactions",
                    request.inner.method
                )));
            }
            _ => {}
        }

        let branch = request
            .branch()
            .filter(|b| !b.is_empty())
            .ok_or_else(|| SipError::InvalidMessage("Request has no Via branch".to_string()))?;
        let id = TransactionId::from_branch(&branch);

        info!(
            "Creating client transaction {} for {} to {}",
            id, request.inner.method, destination
        );

        let ctx = TransactionContext {
            transport: self.transport.clone(),
            config: self.config,
            table: self.table.clone(),
            observer: self.observer.clone(),
            credentials: self.credentials.clone(),
        };

        ClientTransaction::spawn(id, request, destination, ctx).await
    }

    /// Route a response to its transaction. Returns false if none matched.
    pub async fn handle_response(&self, response: SipResponse) -> bool {
        let Some(branch) = response.branch() else {
            warn!("Dropping response without Via branch");
            return false;
        };

        let id = TransactionId::from_branch(&branch);
        match self.table.get(&id).await {
            Some(route) => {
                debug!(
                    "Routing {} response to transaction {}",
                    response.status_code(),
                    route.id
                );
                route.inbox.send(TransactionEvent::Response(response)).is_ok()
            }
            None => {
                warn!("No transaction found for response: {}", branch);
                false
            }
        }
    }

    /// Report a transport failure detected outside the transaction's own sends
    pub async fn handle_transport_error(&self, id: &TransactionId, error: SipError) -> bool {
        match self.table.get(id).await {
            Some(route) => route
                .inbox
                .send(TransactionEvent::TransportError(error))
                .is_ok(),
            None => false,
        }
    }

    /// Ask a transaction to delete itself
    pub async fn delete(&self, id: &TransactionId) -> bool {
        match self.table.get(id).await {
            Some(route) => route.inbox.send(TransactionEvent::Delete).is_ok(),
            None => false,
        }
    }

    pub async fn has_transaction(&self, id: &TransactionId) -> bool {
        self.table.contains(id).await
    }

    /// Number of live transactions
    pub async fn transaction_count(&self) -> usize {
        self.table.distinct().await
    }

    /// Dispatch messages from a transport until its channel closes
    pub async fn run(self: Arc<Self>, mut incoming: mpsc::Receiver<IncomingMessage>) {
        info!("Transaction manager dispatch loop started");

        while let Some(incoming) = incoming.recv().await {
            match incoming.message.as_response() {
                Some(response) => {
                    self.handle_response(response.clone()).await;
                }
                None => debug!(
                    "Ignoring request from {} via {}",
                    incoming.source,
                    incoming.protocol.as_str()
                ),
            }
        }

        info!("Transaction manager dispatch loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::protocols::sip::message::SipMessage;
    use crate::infrastructure::protocols::sip::transaction::testing::{
        register, response, RecordingTransport,
    };
    use crate::infrastructure::protocols::sip::transaction::{ClientState, TransactionError};
    use crate::infrastructure::protocols::sip::transport::TransportProtocol;
    use std::time::Duration;

    fn manager(protocol: TransportProtocol) -> (TransactionManager, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::new(protocol));
        let manager = TransactionManager::new(transport.clone(), TimerConfig::default());
        (manager, transport)
    }

    fn dest() -> SocketAddr {
        "127.0.0.1:5060".parse().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_and_route_response() {
        let (manager, transport) = manager(TransportProtocol::Udp);

        let mut handle = manager.send(register("z9hG4bKmgr1"), dest()).await.unwrap();
        assert_eq!(handle.id().0, "z9hG4bKmgr1");
        assert!(manager.has_transaction(handle.id()).await);
        assert_eq!(manager.transaction_count().await, 1);

        tokio::time::sleep(Duration::from_millis(1)).await;
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);

        assert!(manager.handle_response(response(&sent[0], 200)).await);
        assert_eq!(handle.recv().await.unwrap().unwrap().status_code(), 200);
        assert!(handle.recv().await.is_none());

        assert!(!manager.has_transaction(handle.id()).await);
        assert_eq!(manager.transaction_count().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_branch_is_dropped() {
        let (manager, _) = manager(TransportProtocol::Udp);
        let stray = response(&register("z9hG4bKnobody"), 200);

        assert!(!manager.handle_response(stray).await);
    }

    #[tokio::test]
    async fn test_send_rejects_invalid_requests() {
        let (manager, _) = manager(TransportProtocol::Udp);

        let no_branch = register("");
        assert!(matches!(
            manager.send(no_branch, dest()).await,
            Err(SipError::InvalidMessage(_))
        ));

        let invite = SipRequest::parse(
            b"INVITE sip:bob@example.com SIP/2.0\r\n\
              Via: SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bKinv\r\n\
              From: <sip:alice@example.com>;tag=1\r\n\
              To: <sip:bob@example.com>\r\n\
              Call-ID: inv-1\r\n\
              CSeq: 1 INVITE\r\n\
              Content-Length: 0\r\n\r\n",
        )
        .unwrap();
        assert!(matches!(
            manager.send(invite, dest()).await,
            Err(SipError::TransactionError(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_branch_rejected() {
        let (manager, _) = manager(TransportProtocol::Udp);

        let _first = manager.send(register("z9hG4bKdup"), dest()).await.unwrap();
        let second = manager.send(register("z9hG4bKdup"), dest()).await;

        assert!(matches!(second, Err(SipError::TransactionError(_))));
        assert_eq!(manager.transaction_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_transport_error_and_delete() {
        let (manager, _) = manager(TransportProtocol::Udp);

        let mut failing = manager.send(register("z9hG4bKfail"), dest()).await.unwrap();
        let mut deleted = manager.send(register("z9hG4bKgone"), dest()).await.unwrap();
        assert_eq!(manager.transaction_count().await, 2);

        let error = SipError::TransportError("ICMP port unreachable".to_string());
        assert!(manager.handle_transport_error(failing.id(), error).await);
        assert!(matches!(
            failing.recv().await,
            Some(Err(TransactionError::Transport(_)))
        ));

        assert!(manager.delete(deleted.id()).await);
        assert!(deleted.recv().await.is_none());
        deleted.wait_terminated().await;
        assert_eq!(deleted.state(), ClientState::Terminated);

        // Nothing left to route to
        assert!(failing.recv().await.is_none());
        assert_eq!(manager.transaction_count().await, 0);
        assert!(!manager.delete(deleted.id()).await);
    }

    #[tokio::test]
    async fn test_reliable_transport_forces_reliable_timers() {
        let (manager, _) = manager(TransportProtocol::Tcp);

        assert!(manager.config().reliable_transport);
        assert_eq!(manager.config().linger(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_dispatches_incoming_responses() {
        let (manager, transport) = manager(TransportProtocol::Udp);
        let manager = Arc::new(manager);
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(manager.clone().run(rx));

        let mut handle = manager.send(register("z9hG4bKrun"), dest()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        let request = transport.sent()[0].clone();
        for message in [
            SipMessage::Request(request.clone()),
            SipMessage::Response(response(&request, 404)),
        ] {
            tx.send(IncomingMessage {
                message,
                source: dest(),
                protocol: TransportProtocol::Udp,
            })
            .await
            .unwrap();
        }

        assert_eq!(handle.recv().await.unwrap().unwrap().status_code(), 404);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(transport.acks(), 1);
    }

    #[tokio::test]
    async fn test_try_insert_keeps_first_route() {
        let table = TransactionTable::new();
        let branch = TransactionId::from_branch("z9hG4bKtaken");
        let (first, _first_rx) = mpsc::unbounded_channel();
        let (second, _second_rx) = mpsc::unbounded_channel();

        let route = |id: &str, inbox| TransactionRoute {
            id: TransactionId::from_branch(id),
            inbox,
        };

        assert!(table.try_insert(branch.clone(), route("first", first)).await);
        assert!(!table.try_insert(branch.clone(), route("second", second)).await);

        assert_eq!(table.len().await, 1);
        assert_eq!(table.get(&branch).await.unwrap().id.0, "first");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_sends_on_one_branch() {
        let (manager, _) = manager(TransportProtocol::Udp);
        let manager = Arc::new(manager);

        for round in 0..20 {
            let branch = format!("z9hG4bKrace{}", round);
            let sends: Vec<_> = (0..4)
                .map(|_| {
                    let manager = manager.clone();
                    let request = register(&branch);
                    tokio::spawn(async move { manager.send(request, dest()).await })
                })
                .collect();

            let mut created = Vec::new();
            let mut rejected = 0;
            for send in sends {
                match send.await.unwrap() {
                    Ok(handle) => created.push(handle),
                    Err(SipError::TransactionError(_)) => rejected += 1,
                    Err(e) => panic!("unexpected error {:?}", e),
                }
            }
            assert_eq!(created.len(), 1, "round {}", round);
            assert_eq!(rejected, 3);

            // The surviving handle owns the route
            let mut handle = created.pop().unwrap();
            assert!(manager.delete(handle.id()).await);
            assert!(handle.recv().await.is_none());
            assert_eq!(manager.transaction_count().await, 0);
        }
    }
}
