use std::fmt;
use std::sync::PoisonError;

use crate::call::types::{CallId, ParticipantId};

/// Validation errors returned synchronously by call operations.
///
/// Timeouts are never reported through this type; they surface as state
/// changes on the event bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    NotFound(CallId),
    AlreadyJoined {
        participant_id: ParticipantId,
        active_call: CallId,
    },
    CallFull {
        call_id: CallId,
        capacity: usize,
    },
    InvalidRoute {
        from: ParticipantId,
        to: ParticipantId,
    },
    NotMember {
        call_id: CallId,
        participant_id: ParticipantId,
    },
    Poisoned,
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(call_id) => write!(f, "call {call_id} not found"),
            Self::AlreadyJoined {
                participant_id,
                active_call,
            } => write!(
                f,
                "participant {participant_id} is already in call {active_call}"
            ),
            Self::CallFull { call_id, capacity } => {
                write!(f, "call {call_id} is full (capacity {capacity})")
            }
            Self::InvalidRoute { from, to } => {
                write!(f, "no route from {from} to {to} within one call")
            }
            Self::NotMember {
                call_id,
                participant_id,
            } => write!(f, "participant {participant_id} is not in call {call_id}"),
            Self::Poisoned => write!(f, "call state lock poisoned"),
        }
    }
}

impl std::error::Error for CallError {}

impl<T> From<PoisonError<T>> for CallError {
    fn from(_: PoisonError<T>) -> Self {
        Self::Poisoned
    }
}
