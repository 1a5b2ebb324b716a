//! User-interaction states for one WebAuthn request
//!
//! A registration or assertion call blocks while the authenticator waits
//! for the user. [`OperationFlow`] turns keepalives and client errors into
//! the prompt a UI should currently be showing, so calling code renders
//! states instead of interpreting error codes.

use ykey_core::state::KeepAliveStatus;
use ykey_ctap::status;

use super::ClientError;

/// Why a flow ended without a result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// The user never acted and the authenticator gave up
    Timeout,
    /// PIN retries are exhausted; the device needs a reset or power cycle
    PinBlocked,
    /// No credential on the device matches the request
    NoCredentials,
    /// The device cannot satisfy the request, e.g. it already holds an
    /// excluded credential
    Ineligible,
    /// The request itself was invalid or unsupported
    Rejected,
    /// Any other device-level failure
    Device,
}

/// What the user should be doing right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    /// Waiting for a device to act on
    WaitingForKey,
    /// The authenticator wants a touch
    TouchKey,
    /// The authenticator wants the PIN; `retries` is known after a wrong
    /// attempt
    PinEntry { retries: Option<u8> },
    /// Built-in verification failed and can be retried
    UvEntry { attempts_remaining: Option<u8> },
    /// The request is with the authenticator
    Processing,
    Success,
    Failed(FailureReason),
}

impl Default for FlowState {
    fn default() -> Self {
        FlowState::WaitingForKey
    }
}

/// One observed step of the operation
#[derive(Debug, Clone, Copy)]
pub enum FlowEvent<'a> {
    /// The request was sent to the authenticator
    Started,
    KeepAlive(KeepAliveStatus),
    /// The user entered a PIN and the request was resubmitted
    PinSubmitted,
    /// The user retried built-in verification
    UvRetried,
    Succeeded,
    Errored(&'a ClientError),
    /// Start over after a failure
    Retry,
}

/// Tracks the prompt state across retries of a single logical operation
///
/// Once built-in verification is blocked the flow stays on the PIN path
/// until [`FlowEvent::Retry`] resets it.
#[derive(Debug, Default)]
pub struct OperationFlow {
    state: FlowState,
    uv_fallback: bool,
}

impl OperationFlow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    /// Whether the flow has permanently switched from built-in verification
    /// to the PIN
    pub fn uv_fallback(&self) -> bool {
        self.uv_fallback
    }

    /// Apply one event and return the resulting state
    pub fn on_event(&mut self, event: FlowEvent<'_>) -> FlowState {
        let (state, uv_fallback) = transition(self.state, self.uv_fallback, event);
        self.state = state;
        self.uv_fallback = uv_fallback;
        state
    }
}

fn transition(state: FlowState, uv_fallback: bool, event: FlowEvent<'_>) -> (FlowState, bool) {
    match event {
        FlowEvent::Retry => match state {
            FlowState::Failed(_) => (FlowState::WaitingForKey, false),
            other => (other, uv_fallback),
        },
        FlowEvent::Started => match state {
            FlowState::WaitingForKey => (FlowState::Processing, uv_fallback),
            other => (other, uv_fallback),
        },
        FlowEvent::KeepAlive(status) => match (state, status) {
            (FlowState::Processing | FlowState::TouchKey, KeepAliveStatus::UpNeeded) => {
                (FlowState::TouchKey, uv_fallback)
            }
            (FlowState::Processing | FlowState::TouchKey, KeepAliveStatus::Processing) => {
                (FlowState::Processing, uv_fallback)
            }
            (other, _) => (other, uv_fallback),
        },
        FlowEvent::PinSubmitted => match state {
            FlowState::PinEntry { .. } => (FlowState::Processing, uv_fallback),
            other => (other, uv_fallback),
        },
        FlowEvent::UvRetried => match state {
            FlowState::UvEntry { .. } => (FlowState::Processing, uv_fallback),
            other => (other, uv_fallback),
        },
        FlowEvent::Succeeded => match state {
            FlowState::Failed(_) => (state, uv_fallback),
            _ => (FlowState::Success, uv_fallback),
        },
        FlowEvent::Errored(error) => match state {
            // Terminal states hold; late errors change nothing
            FlowState::Success | FlowState::Failed(_) => (state, uv_fallback),
            // A selection screen, not a failure; the flow resumes on select
            _ if matches!(error, ClientError::MultipleAssertions(_)) => (state, uv_fallback),
            _ => classify_error(error, uv_fallback),
        },
    }
}

fn classify_error(error: &ClientError, uv_fallback: bool) -> (FlowState, bool) {
    match error {
        ClientError::PinRequired => (FlowState::PinEntry { retries: None }, uv_fallback),
        ClientError::PinInvalid { retries } => {
            (FlowState::PinEntry { retries: Some(*retries) }, uv_fallback)
        }
        ClientError::PinBlocked => (FlowState::Failed(FailureReason::PinBlocked), uv_fallback),
        ClientError::UvInvalid { attempts_remaining } if !uv_fallback => (
            FlowState::UvEntry { attempts_remaining: Some(*attempts_remaining) },
            uv_fallback,
        ),
        ClientError::Ctap(code) if *code == status::UV_INVALID && !uv_fallback => {
            (FlowState::UvEntry { attempts_remaining: None }, uv_fallback)
        }
        // Once fallen back, UV failures reprompt for the PIN instead
        ClientError::UvInvalid { .. } => (FlowState::PinEntry { retries: None }, uv_fallback),
        ClientError::Ctap(code) if *code == status::UV_INVALID => {
            (FlowState::PinEntry { retries: None }, uv_fallback)
        }
        // Built-in verification is out for the rest of the session
        ClientError::UvBlocked => (FlowState::PinEntry { retries: None }, true),
        ClientError::Timeout => (FlowState::Failed(FailureReason::Timeout), uv_fallback),
        ClientError::NoCredentials => {
            (FlowState::Failed(FailureReason::NoCredentials), uv_fallback)
        }
        ClientError::DeviceIneligible => {
            (FlowState::Failed(FailureReason::Ineligible), uv_fallback)
        }
        ClientError::BadRequest(_) | ClientError::Unsupported(_) => {
            (FlowState::Failed(FailureReason::Rejected), uv_fallback)
        }
        _ => (FlowState::Failed(FailureReason::Device), uv_fallback),
    }
}
