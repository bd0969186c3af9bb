//! Client transaction actor
//!
//! Every transaction runs as its own tokio task that owns the FSM state, the
//! timers and the response sink. Responses, transport failures, timer fires
//! and delete requests all arrive through one unbounded inbox and are handled
//! strictly one at a time, so no two transitions ever overlap.
//!
//! Outgoing messages are handed to a per-transaction `Outbox` task. The
//! actor never awaits the transport; a failed send comes back as a
//! `TransportError` event like any other input.

use super::fsm::{self, ClientAction, ClientInput, ClientState};
use super::manager::TransactionTable;
use super::observer::TransactionObserver;
use super::timer::{TimerConfig, TimerType, TransactionTimer};
use super::{TransactionError, TransactionId};
use crate::infrastructure::protocols::sip::auth::{DigestChallenge, DigestClient, UserCredentials};
use crate::infrastructure::protocols::sip::builder::build_ack;
use crate::infrastructure::protocols::sip::message::{SipError, SipRequest, SipResponse};
use crate::infrastructure::protocols::sip::transport::{OutgoingMessage, Transport};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn, Instrument};

/// Item delivered on a transaction's response sink
pub type TransactionResult = Result<SipResponse, TransactionError>;

/// Everything that can be fed into a running transaction
#[derive(Debug)]
pub enum TransactionEvent {
    Response(SipResponse),
    TransportError(SipError),
    TimerFired { kind: TimerType, generation: u64 },
    Delete,
}

/// Table entry pointing at a running transaction's inbox
#[derive(Debug, Clone)]
pub struct TransactionRoute {
    pub id: TransactionId,
    pub inbox: mpsc::UnboundedSender<TransactionEvent>,
}

/// Ordered writer for one transaction's outgoing messages
struct Outbox {
    tx: mpsc::UnboundedSender<OutgoingMessage>,
}

impl Outbox {
    fn spawn(
        id: TransactionId,
        transport: Arc<dyn Transport>,
        observer: Arc<dyn TransactionObserver>,
        inbox: mpsc::UnboundedSender<TransactionEvent>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let span = tracing::debug_span!("outbox", id = %id);
        tokio::spawn(Self::write_loop(id, transport, observer, inbox, rx).instrument(span));
        Self { tx }
    }

    /// Drains until the transaction drops its sender, so an ACK queued right
    /// before a delete still goes out.
    async fn write_loop(
        id: TransactionId,
        transport: Arc<dyn Transport>,
        observer: Arc<dyn TransactionObserver>,
        inbox: mpsc::UnboundedSender<TransactionEvent>,
        mut rx: mpsc::UnboundedReceiver<OutgoingMessage>,
    ) {
        while let Some(message) = rx.recv().await {
            if let Err(e) = transport.send(message).await {
                observer.on_send_failed(&id, &e);
                if inbox.send(TransactionEvent::TransportError(e)).is_err() {
                    debug!("Transaction gone, dropping send failure");
                }
            }
        }
    }

    fn push(&self, message: OutgoingMessage) {
        if self.tx.send(message).is_err() {
            warn!("Outbox closed, message not sent");
        }
    }
}

/// Collaborators shared by every transaction of one manager
#[derive(Clone)]
pub(crate) struct TransactionContext {
    pub transport: Arc<dyn Transport>,
    pub config: TimerConfig,
    pub table: TransactionTable,
    pub observer: Arc<dyn TransactionObserver>,
    pub credentials: Option<UserCredentials>,
}

/// Caller side of a transaction
#[derive(Debug)]
pub struct ClientTransactionHandle {
    id: TransactionId,
    inbox: mpsc::UnboundedSender<TransactionEvent>,
    state: watch::Receiver<ClientState>,
    responses: mpsc::UnboundedReceiver<TransactionResult>,
}

impl ClientTransactionHandle {
    pub fn id(&self) -> &TransactionId {
        &self.id
    }

    /// Last published state
    pub fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    /// Next passed-up response or terminal error; `None` once the sink is closed
    pub async fn recv(&mut self) -> Option<TransactionResult> {
        self.responses.recv().await
    }

    pub fn responses(&mut self) -> &mut mpsc::UnboundedReceiver<TransactionResult> {
        &mut self.responses
    }

    /// Resolves once the transaction has reached `Terminated`
    pub async fn wait_terminated(&mut self) {
        let _ = self.state.wait_for(|state| state.is_terminated()).await;
    }

    /// Request teardown. Safe to call any number of times.
    pub fn delete(&self) {
        let _ = self.inbox.send(TransactionEvent::Delete);
    }
}

/// Per-transaction state owned by the actor task
pub(crate) struct ClientTransaction {
    id: TransactionId,
    ctx: TransactionContext,
    /// Request currently being (re)transmitted
    current: SipRequest,
    destination: SocketAddr,
    state: ClientState,
    timer_a: TransactionTimer,
    timer_b: TransactionTimer,
    timer_d: TransactionTimer,
    responses: Option<mpsc::UnboundedSender<TransactionResult>>,
    last_response: Option<SipResponse>,
    last_error: Option<SipError>,
    /// 401 received but not answered yet
    pending_challenge: Option<SipResponse>,
    digest: Option<DigestClient>,
    outbox: Outbox,
    inbox: mpsc::UnboundedSender<TransactionEvent>,
    state_tx: watch::Sender<ClientState>,
    /// Every branch registered in the table for this transaction
    keys: Vec<TransactionId>,
    deleted: bool,
}

impl ClientTransaction {
    fn new(
        id: TransactionId,
        request: SipRequest,
        destination: SocketAddr,
        ctx: TransactionContext,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<TransactionEvent>,
        ClientTransactionHandle,
    ) {
        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        let (responses_tx, responses_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ClientState::Init);

        let config = ctx.config;
        let digest = ctx.credentials.clone().map(DigestClient::new);
        let outbox = Outbox::spawn(
            id.clone(),
            ctx.transport.clone(),
            ctx.observer.clone(),
            inbox.clone(),
        );

        let txn = Self {
            id: id.clone(),
            current: request,
            destination,
            state: ClientState::Init,
            timer_a: TransactionTimer::new(TimerType::TimerA, config.initial_retransmit_interval),
            timer_b: TransactionTimer::new(TimerType::TimerB, config.transaction_timeout),
            timer_d: TransactionTimer::new(TimerType::TimerD, config.linger()),
            responses: Some(responses_tx),
            last_response: None,
            last_error: None,
            pending_challenge: None,
            digest,
            outbox,
            inbox: inbox.clone(),
            state_tx,
            keys: vec![id.clone()],
            deleted: false,
            ctx,
        };

        let handle = ClientTransactionHandle {
            id,
            inbox,
            state: state_rx,
            responses: responses_rx,
        };

        (txn, inbox_rx, handle)
    }

    fn route(&self) -> TransactionRoute {
        TransactionRoute {
            id: self.id.clone(),
            inbox: self.inbox.clone(),
        }
    }

    /// Register the transaction under its branch and start its task.
    /// Fails if the branch already belongs to a live transaction.
    pub(crate) async fn spawn(
        id: TransactionId,
        request: SipRequest,
        destination: SocketAddr,
        ctx: TransactionContext,
    ) -> Result<ClientTransactionHandle, SipError> {
        let table = ctx.table.clone();
        let (txn, inbox_rx, handle) = Self::new(id.clone(), request, destination, ctx);

        if !table.try_insert(id.clone(), txn.route()).await {
            return Err(SipError::TransactionError(format!(
                "Transaction {} already exists",
                id
            )));
        }

        let span = tracing::info_span!("transaction", id = %id);
        tokio::spawn(txn.run(inbox_rx).instrument(span));

        Ok(handle)
    }

    async fn run(mut self, mut inbox_rx: mpsc::UnboundedReceiver<TransactionEvent>) {
        self.start();

        while let Some(event) = inbox_rx.recv().await {
            if let Some(input) = self.admit(event) {
                self.spin(input).await;
            }
            if self.deleted {
                break;
            }
        }

        debug!("Transaction task finished");
    }

    fn start(&mut self) {
        if !self.ctx.config.reliable_transport {
            self.timer_a.arm(&self.inbox);
        }
        self.timer_b.arm(&self.inbox);

        info!(
            destination = %self.destination,
            reliable = self.ctx.config.reliable_transport,
            "Sending request"
        );
        self.transmit(&self.current);
    }

    /// Translate an event into an FSM input, dropping what is not one
    fn admit(&mut self, event: TransactionEvent) -> Option<ClientInput> {
        match event {
            TransactionEvent::Response(response) => {
                let status = response.status_code();
                let Some(input) = ClientInput::from_status(status) else {
                    debug!(status, "Ignoring provisional response");
                    return None;
                };

                let pending = matches!(self.state, ClientState::Init | ClientState::Unauthorized);
                if pending && response.branch() != self.current.branch() {
                    // Answer to a request we already replaced with a credentialed one
                    debug!(status, "Dropping response for superseded request");
                    return None;
                }

                if pending && input == ClientInput::Response401 {
                    self.pending_challenge = Some(response.clone());
                }
                self.last_response = Some(response);
                Some(input)
            }
            TransactionEvent::TransportError(error) => {
                self.last_error = Some(error);
                Some(ClientInput::TransportError)
            }
            TransactionEvent::TimerFired { kind, generation } => {
                let timer = match kind {
                    TimerType::TimerA => &mut self.timer_a,
                    TimerType::TimerB => &mut self.timer_b,
                    TimerType::TimerD => &mut self.timer_d,
                };
                if !timer.is_current(generation) {
                    trace!(?kind, generation, "Dropping stale timer fire");
                    return None;
                }
                timer.expire();

                Some(match kind {
                    TimerType::TimerA => ClientInput::TimerA,
                    TimerType::TimerB => ClientInput::TimerB,
                    TimerType::TimerD => ClientInput::TimerD,
                })
            }
            TransactionEvent::Delete => Some(ClientInput::Delete),
        }
    }

    /// Run one input to completion, including follow-up inputs produced by
    /// actions. Nothing queued in the inbox is looked at until this returns.
    async fn spin(&mut self, input: ClientInput) {
        let mut next = Some(input);

        while let Some(input) = next.take() {
            let from = self.state;
            let (to, action) =
                fsm::transition(from, input, self.ctx.config.restart_linger_on_duplicate);
            self.state = to;
            self.ctx
                .observer
                .on_transition(&self.id, from, input, to, action);

            next = self.execute(action).await;
        }

        self.state_tx.send_replace(self.state);
    }

    async fn execute(&mut self, action: ClientAction) -> Option<ClientInput> {
        match action {
            ClientAction::None => None,
            ClientAction::Resend => {
                self.resend();
                None
            }
            ClientAction::Authenticate => self.authenticate_and_resend().await,
            ClientAction::Accept => {
                self.pass_up();
                self.stop_retransmission();
                self.arm_linger();
                None
            }
            ClientAction::PassUpAndAck => {
                self.pass_up();
                self.stop_retransmission();
                self.send_ack();
                self.arm_linger();
                None
            }
            ClientAction::RestartLinger => {
                self.arm_linger();
                None
            }
            ClientAction::ReportTimeout => {
                warn!("Transaction timed out");
                self.deliver(Err(TransactionError::Timeout(
                    self.ctx.config.transaction_timeout,
                )));
                Some(ClientInput::Delete)
            }
            ClientAction::ReportTransportError => {
                let reason = self
                    .last_error
                    .take()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "transport failure".to_string());
                warn!(reason = %reason, "Transaction failed on transport error");
                self.deliver(Err(TransactionError::Transport(reason)));
                Some(ClientInput::Delete)
            }
            ClientAction::PassUpAndDelete => {
                self.pass_up();
                self.delete().await;
                None
            }
            ClientAction::Delete => {
                self.delete().await;
                None
            }
        }
    }

    /// Send the current request again with a doubled Timer A
    fn resend(&mut self) {
        if !self.ctx.config.reliable_transport {
            let interval = self.timer_a.interval() * 2;
            self.timer_a.reset(interval, &self.inbox);
            trace!(?interval, "Timer A rearmed");
        }

        self.transmit(&self.current);
    }

    /// Answer the pending challenge if one arrived, then resend.
    ///
    /// Without a new challenge the current, already credentialed request is
    /// retransmitted unchanged. A challenge that cannot be answered turns into
    /// `ResponseOther` so the 401 is passed up instead of retried.
    async fn authenticate_and_resend(&mut self) -> Option<ClientInput> {
        match self.authorize_pending() {
            Ok(Some(request)) => {
                let branch = request.branch().map(|b| TransactionId::from_branch(&b));
                if let Some(branch) = branch {
                    self.ctx.table.insert(branch.clone(), self.route()).await;
                    self.keys.push(branch);
                }
                debug!(cseq = ?request.cseq(), "Resending with credentials");
                self.current = request;
            }
            Ok(None) => {}
            Err(e) => {
                self.ctx.observer.on_auth_failed(&self.id, &e);
                return Some(ClientInput::ResponseOther);
            }
        }

        self.resend();
        None
    }

    fn authorize_pending(&mut self) -> Result<Option<SipRequest>, SipError> {
        let Some(response) = self.pending_challenge.take() else {
            return Ok(None);
        };

        let digest = self
            .digest
            .as_mut()
            .ok_or_else(|| SipError::Authentication("No credentials configured".to_string()))?;
        let challenge = DigestChallenge::from_response(&response)?;

        let branch = TransactionId::generate();
        let request = digest
            .authorize(&self.current, &challenge)?
            .with_branch(&branch.0)?;

        Ok(Some(request))
    }

    fn pass_up(&mut self) {
        match self.last_response.clone() {
            Some(response) => {
                info!(status = response.status_code(), "Passing response up");
                self.deliver(Ok(response));
            }
            None => warn!("No response to pass up"),
        }
    }

    /// Write to the sink without blocking. Nothing is written once closed.
    fn deliver(&self, result: TransactionResult) {
        match &self.responses {
            Some(tx) => {
                if tx.send(result).is_err() {
                    debug!("Response receiver dropped, discarding result");
                }
            }
            None => warn!("Response sink already closed"),
        }
    }

    fn send_ack(&self) {
        let Some(response) = self.last_response.as_ref() else {
            return;
        };

        match build_ack(&self.current, response) {
            Ok(ack) => {
                debug!(status = response.status_code(), "Sending ACK");
                self.transmit(&ack);
            }
            Err(e) => warn!(error = %e, "Failed to build ACK"),
        }
    }

    fn stop_retransmission(&mut self) {
        self.timer_a.cancel();
        self.timer_b.cancel();
    }

    fn arm_linger(&mut self) {
        self.timer_d.arm(&self.inbox);
    }

    /// Queue a message for the outbox. Failures come back through the inbox.
    fn transmit(&self, request: &SipRequest) {
        self.outbox.push(OutgoingMessage {
            data: request.to_bytes(),
            destination: self.destination,
        });
    }

    /// Close the sink, cancel timers, unregister. Idempotent.
    async fn delete(&mut self) {
        if self.deleted {
            return;
        }

        self.timer_a.cancel();
        self.timer_b.cancel();
        self.timer_d.cancel();

        for key in self.keys.drain(..) {
            self.ctx.table.remove(&key).await;
        }
        self.responses = None;

        self.deleted = true;
        info!("Transaction deleted");
    }
}
