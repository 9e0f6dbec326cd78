use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};

use crate::call::types::{CallId, ConnectionState, MediaFlags, NegotiationExchange, ParticipantId};

/// Outbound notifications for the transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    ParticipantStateChanged {
        call_id: CallId,
        participant_id: ParticipantId,
        state: ConnectionState,
    },
    /// Delivered to `exchange.to`.
    NegotiationMessage(NegotiationExchange),
    CallEnded {
        call_id: CallId,
    },
    ParticipantTimedOut {
        call_id: CallId,
        participant_id: ParticipantId,
    },
    /// The participant's active media flags changed.
    MediaChanged {
        call_id: CallId,
        participant_id: ParticipantId,
        flags: MediaFlags,
    },
    /// A renegotiation was abandoned; the prior media flags stay active.
    RenegotiationFailed {
        call_id: CallId,
        participant_id: ParticipantId,
    },
}

impl CallEvent {
    pub fn call_id(&self) -> &str {
        match self {
            CallEvent::ParticipantStateChanged { call_id, .. }
            | CallEvent::CallEnded { call_id }
            | CallEvent::ParticipantTimedOut { call_id, .. }
            | CallEvent::MediaChanged { call_id, .. }
            | CallEvent::RenegotiationFailed { call_id, .. } => call_id,
            CallEvent::NegotiationMessage(exchange) => &exchange.call_id,
        }
    }
}

/// Fan-out of `CallEvent`s to any number of channel subscribers.
///
/// Subscribers whose receiver was dropped are pruned on the next publish.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Sender<CallEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<CallEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub fn publish(&self, event: CallEvent) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn state_changed(&self, call_id: &str, participant_id: &str, state: ConnectionState) {
        self.publish(CallEvent::ParticipantStateChanged {
            call_id: call_id.to_owned(),
            participant_id: participant_id.to_owned(),
            state,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
