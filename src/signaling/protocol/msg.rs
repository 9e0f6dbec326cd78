// ---- Public message enum --------------------------------------------------

use bytes::Bytes;

use crate::call::{
    CallId, CallKind, ConnectionState, ExchangeId, ExchangeKind, MediaFlag, MediaFlags,
    NegotiationExchange, ParticipantId,
};

/// One line of a `Roster` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterEntry {
    pub participant_id: ParticipantId,
    pub state: ConnectionState,
    pub media: MediaFlags,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingMsg {
    // Handshake / identity
    Hello {
        client_version: String,
    },
    /// Binds this connection to a participant. The identity is trusted.
    Identify {
        participant_id: ParticipantId,
    },
    IdentifyOk {
        participant_id: ParticipantId,
    },
    Error {
        code: u16, // maps from ErrorCode
        detail: String,
    },

    // Call control
    AllocateCall,
    CallAllocated {
        call_id: CallId,
    },
    Join {
        call_id: CallId,
        kind: CallKind,
    },
    /// Reply to `Join`: the state the joiner is in and the peers it must
    /// complete an offer/answer with before it becomes Connected.
    JoinPending {
        call_id: CallId,
        state: ConnectionState,
        peers: Vec<ParticipantId>,
    },
    Leave {
        call_id: CallId,
    },
    ListParticipants {
        call_id: CallId,
    },
    Roster {
        call_id: CallId,
        entries: Vec<RosterEntry>,
    },
    StateChanged {
        call_id: CallId,
        participant_id: ParticipantId,
        state: ConnectionState,
    },
    CallEnded {
        call_id: CallId,
    },
    ParticipantTimedOut {
        call_id: CallId,
        participant_id: ParticipantId,
    },

    // Media
    ToggleMedia {
        call_id: CallId,
        flag: MediaFlag,
        value: bool,
    },
    MediaChanged {
        call_id: CallId,
        participant_id: ParticipantId,
        flags: MediaFlags,
    },
    RenegotiationFailed {
        call_id: CallId,
        participant_id: ParticipantId,
    },

    // Negotiation relay
    /// Client -> server. `in_reply_to == 0` means "not a reply".
    Negotiate {
        call_id: CallId,
        to: ParticipantId,
        kind: ExchangeKind,
        in_reply_to: ExchangeId,
        payload: Bytes,
    },
    /// Server -> client, delivered to the exchange's destination only.
    Negotiation {
        exchange_id: ExchangeId,
        call_id: CallId,
        from: ParticipantId,
        kind: ExchangeKind,
        in_reply_to: ExchangeId,
        payload: Bytes,
    },

    // Liveness
    Ping {
        nonce: u64,
    },
    Pong {
        nonce: u64,
    },
    Heartbeat {
        call_id: CallId,
    },
}

impl From<NegotiationExchange> for SignalingMsg {
    fn from(exchange: NegotiationExchange) -> Self {
        SignalingMsg::Negotiation {
            exchange_id: exchange.exchange_id,
            call_id: exchange.call_id,
            from: exchange.from,
            kind: exchange.kind,
            in_reply_to: exchange.in_reply_to.unwrap_or(0),
            payload: exchange.payload,
        }
    }
}
