//! Per-request dispatch state machine.

use std::fmt;

use tracing::trace;

use super::status::ErrorStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Received,
    Validated,
    PoolsMapped,
    InputsMarshaled,
    LocalInfer,
    RemoteInfer,
    OutputsMarshaled,
    PoolsUnmapped,
    Completed,
    Failed(ErrorStatus),
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestState::Completed | RequestState::Failed(_))
    }

    fn can_advance_to(self, next: RequestState) -> bool {
        use RequestState::*;
        match (self, next) {
            (s, Failed(_)) => !s.is_terminal(),
            (Received, Validated)
            | (Validated, PoolsMapped)
            | (PoolsMapped, InputsMarshaled)
            | (InputsMarshaled, LocalInfer)
            | (InputsMarshaled, RemoteInfer)
            | (RemoteInfer, LocalInfer)
            | (RemoteInfer, OutputsMarshaled)
            | (LocalInfer, OutputsMarshaled)
            | (OutputsMarshaled, PoolsUnmapped)
            | (PoolsUnmapped, Completed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestState::Received => f.write_str("RECEIVED"),
            RequestState::Validated => f.write_str("VALIDATED"),
            RequestState::PoolsMapped => f.write_str("POOLS_MAPPED"),
            RequestState::InputsMarshaled => f.write_str("INPUTS_MARSHALED"),
            RequestState::LocalInfer => f.write_str("LOCAL_INFER"),
            RequestState::RemoteInfer => f.write_str("REMOTE_INFER"),
            RequestState::OutputsMarshaled => f.write_str("OUTPUTS_MARSHALED"),
            RequestState::PoolsUnmapped => f.write_str("POOLS_UNMAPPED"),
            RequestState::Completed => f.write_str("COMPLETED"),
            RequestState::Failed(status) => write!(f, "FAILED({status})"),
        }
    }
}

/// Tracks the current state and traces each transition.
#[derive(Debug)]
pub(crate) struct StateTracker {
    state: RequestState,
}

impl StateTracker {
    pub fn new() -> Self {
        Self {
            state: RequestState::Received,
        }
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn advance(&mut self, next: RequestState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal transition {} -> {}",
            self.state,
            next
        );
        trace!(from = %self.state, to = %next, "Request state");
        self.state = next;
    }

    /// Enter `Failed` and hand the status back for reporting.
    pub fn fail(&mut self, status: ErrorStatus) -> ErrorStatus {
        self.advance(RequestState::Failed(status));
        status
    }
}
