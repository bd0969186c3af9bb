//! REGISTER client transaction state machine
//!
//! Pure transition table: `(state, input) -> (next state, action)`. Executing
//! the action is the job of [`super::client`]; nothing here performs I/O.
//!
//! ```text
//!                 401 / auth+resend        401, TimerA / auth+resend
//!   ┌──────┐ ─────────────────────────► ┌──────────────┐ ◄─┐
//!   │ Init │                            │ Unauthorized │ ──┘
//!   └──────┘ ◄─┐ TimerA / resend        └──────────────┘
//!     │  │ ────┘                           │   │
//!     │  │ 200 / pass up, delete       200 │   │ ≥300, TimerB, transport error
//!     │  │ ≥300 / pass up, ACK, TimerD     ▼   │
//!     │  │ TimerB / timeout          ┌─────────┐
//!     │  │ transport error           │ Success │ TimerD / delete
//!     │  ▼                           └─────────┘ ──────────────┐
//!     │ ┌────────────┐                                          │
//!     └►│ Terminated │ ◄────────────────────────────────────────┘
//!       └────────────┘
//! ```

/// Client transaction states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    /// Request sent, awaiting first response
    Init,
    /// A 401 challenge was received; resending with credentials
    Unauthorized,
    /// 2xx accepted after authentication; lingering for duplicates
    Success,
    /// Transaction fully retired
    Terminated,
}

impl ClientState {
    pub const ALL: [ClientState; 4] = [
        ClientState::Init,
        ClientState::Unauthorized,
        ClientState::Success,
        ClientState::Terminated,
    ];

    pub fn is_terminated(&self) -> bool {
        matches!(self, ClientState::Terminated)
    }

    /// Get state name for debugging
    pub fn name(&self) -> &'static str {
        match self {
            ClientState::Init => "REG-Init",
            ClientState::Unauthorized => "REG-Unauthorized",
            ClientState::Success => "REG-Success",
            ClientState::Terminated => "REG-Terminated",
        }
    }
}

/// Inputs accepted by the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientInput {
    /// 2xx final response
    Response200,
    /// 401 challenge
    Response401,
    /// Any other final response (>= 300)
    ResponseOther,
    TimerA,
    TimerB,
    TimerD,
    TransportError,
    /// Explicit teardown
    Delete,
}

impl ClientInput {
    pub const ALL: [ClientInput; 8] = [
        ClientInput::Response200,
        ClientInput::Response401,
        ClientInput::ResponseOther,
        ClientInput::TimerA,
        ClientInput::TimerB,
        ClientInput::TimerD,
        ClientInput::TransportError,
        ClientInput::Delete,
    ];

    /// Classify a response status. Provisional responses are not inputs.
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            200..=299 => Some(ClientInput::Response200),
            401 => Some(ClientInput::Response401),
            300..=699 => Some(ClientInput::ResponseOther),
            _ => None,
        }
    }

    pub fn is_response(&self) -> bool {
        matches!(
            self,
            ClientInput::Response200 | ClientInput::Response401 | ClientInput::ResponseOther
        )
    }
}

/// Side effects attached to transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientAction {
    None,
    /// Resend the current request, double and rearm Timer A
    Resend,
    /// Answer the pending challenge (if any) and resend
    Authenticate,
    /// Pass the 2xx up, stop A and B, start Timer D
    Accept,
    /// Pass the final response up, send ACK, stop A and B, start Timer D
    PassUpAndAck,
    /// Start Timer D again
    RestartLinger,
    /// Report timeout, then delete
    ReportTimeout,
    /// Report transport failure, then delete
    ReportTransportError,
    /// Pass the 2xx up and delete in one step
    PassUpAndDelete,
    /// Close the response sink, cancel timers, unregister
    Delete,
}

/// The transition table.
///
/// Total over every `(state, input)` pair. Actions that report an error
/// yield a follow-up `Delete` input from the executor, which lands here as
/// `Terminated x Delete`.
pub fn transition(
    state: ClientState,
    input: ClientInput,
    restart_linger_on_duplicate: bool,
) -> (ClientState, ClientAction) {
    use ClientState as S;
    use ClientInput as I;
    use ClientAction as A;

    match (state, input) {
        (S::Init, I::Response401) => (S::Unauthorized, A::Authenticate),
        (S::Init, I::Response200) => (S::Terminated, A::PassUpAndDelete),
        (S::Init, I::ResponseOther) => (S::Terminated, A::PassUpAndAck),
        (S::Init, I::TimerA) => (S::Init, A::Resend),

        (S::Unauthorized, I::Response401) => (S::Unauthorized, A::Authenticate),
        (S::Unauthorized, I::Response200) => (S::Success, A::Accept),
        (S::Unauthorized, I::ResponseOther) => (S::Terminated, A::PassUpAndAck),
        (S::Unauthorized, I::TimerA) => (S::Unauthorized, A::Authenticate),

        (S::Init | S::Unauthorized, I::TimerB) => (S::Terminated, A::ReportTimeout),
        (S::Init | S::Unauthorized, I::TimerD) => (state, A::None),

        (S::Success, I::Response200 | I::Response401 | I::ResponseOther) => {
            if restart_linger_on_duplicate {
                (S::Success, A::RestartLinger)
            } else {
                (S::Success, A::None)
            }
        }
        (S::Success, I::TimerA | I::TimerB) => (S::Success, A::None),
        (S::Success, I::TimerD) => (S::Terminated, A::Delete),

        (S::Init | S::Unauthorized | S::Success, I::TransportError) => {
            (S::Terminated, A::ReportTransportError)
        }
        (S::Init | S::Unauthorized | S::Success, I::Delete) => (S::Terminated, A::Delete),

        // Timer D completes the linger started by a non-2xx final
        (S::Terminated, I::TimerD | I::Delete) => (S::Terminated, A::Delete),
        (S::Terminated, _) => (S::Terminated, A::None),
    }
}
