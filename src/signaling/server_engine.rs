use std::collections::BTreeSet;
use std::sync::Arc;

use crate::call::{
    CallError, CallEvent, CallStateMachine, ConnectionState, Delivery, NegotiationMessage,
    ParticipantId,
};
use crate::log::NoopLogSink;
use crate::log::log_sink::LogSink;
use crate::signaling::clients::ClientDirectory;
use crate::signaling::errors::ErrorCode;
use crate::signaling::protocol::{RosterEntry, SignalingMsg};
use crate::signaling::types::{ClientId, OutgoingMsg};
use crate::{sink_debug, sink_info, sink_trace, sink_warn};

/// Translates wire requests into call operations and call events into
/// wire messages. Owned by the server loop thread.
pub struct ServerEngine {
    machine: Arc<CallStateMachine>,
    clients: ClientDirectory,
    log: Arc<dyn LogSink>,
}

impl ServerEngine {
    pub fn new(machine: Arc<CallStateMachine>) -> Self {
        Self::with_log(machine, Arc::new(NoopLogSink))
    }

    pub fn with_log(machine: Arc<CallStateMachine>, log: Arc<dyn LogSink>) -> Self {
        Self {
            machine,
            clients: ClientDirectory::new(),
            log,
        }
    }

    pub fn machine(&self) -> &Arc<CallStateMachine> {
        &self.machine
    }

    /// Main entrypoint: handle a message from a client.
    ///
    /// Returns direct replies. Effects on other participants arrive later as
    /// call events through `handle_call_event`.
    pub fn handle(&mut self, from_cid: ClientId, msg: SignalingMsg) -> Vec<OutgoingMsg> {
        match msg {
            SignalingMsg::Hello { client_version } => {
                sink_trace!(
                    self.log,
                    "client {} HELLO (version {})",
                    from_cid,
                    client_version
                );
                Vec::new()
            }
            SignalingMsg::Identify { participant_id } => {
                self.handle_identify(from_cid, participant_id)
            }
            SignalingMsg::Ping { nonce } => {
                vec![OutgoingMsg::new(from_cid, SignalingMsg::Pong { nonce })]
            }
            SignalingMsg::Pong { .. } => Vec::new(),

            SignalingMsg::AllocateCall
            | SignalingMsg::Join { .. }
            | SignalingMsg::Leave { .. }
            | SignalingMsg::ListParticipants { .. }
            | SignalingMsg::ToggleMedia { .. }
            | SignalingMsg::Negotiate { .. }
            | SignalingMsg::Heartbeat { .. } => {
                let Some(pid) = self.clients.participant_of(from_cid).cloned() else {
                    sink_debug!(self.log, "client {} sent a request before Identify", from_cid);
                    return vec![error_reply(
                        from_cid,
                        ErrorCode::NotIdentified,
                        "identify first",
                    )];
                };
                self.handle_call_request(from_cid, pid, msg)
            }

            SignalingMsg::IdentifyOk { .. }
            | SignalingMsg::Error { .. }
            | SignalingMsg::CallAllocated { .. }
            | SignalingMsg::JoinPending { .. }
            | SignalingMsg::Roster { .. }
            | SignalingMsg::StateChanged { .. }
            | SignalingMsg::CallEnded { .. }
            | SignalingMsg::ParticipantTimedOut { .. }
            | SignalingMsg::MediaChanged { .. }
            | SignalingMsg::RenegotiationFailed { .. }
            | SignalingMsg::Negotiation { .. } => {
                sink_warn!(
                    self.log,
                    "client {} sent a server-only message {:?}; rejecting",
                    from_cid,
                    msg
                );
                vec![error_reply(
                    from_cid,
                    ErrorCode::BadRequest,
                    "server-only message",
                )]
            }
        }
    }

    fn handle_identify(&mut self, client_id: ClientId, participant_id: ParticipantId) -> Vec<OutgoingMsg> {
        if participant_id.is_empty() {
            return vec![error_reply(
                client_id,
                ErrorCode::BadRequest,
                "empty participant id",
            )];
        }
        if let Some(old) = self.clients.bind(client_id, participant_id.clone()) {
            sink_info!(
                self.log,
                "participant {} moved from client {} to client {}",
                participant_id,
                old,
                client_id
            );
        } else {
            sink_info!(
                self.log,
                "client {} identified as {}",
                client_id,
                participant_id
            );
        }
        vec![OutgoingMsg::new(
            client_id,
            SignalingMsg::IdentifyOk { participant_id },
        )]
    }

    fn handle_call_request(
        &mut self,
        from_cid: ClientId,
        pid: ParticipantId,
        msg: SignalingMsg,
    ) -> Vec<OutgoingMsg> {
        let reply = |msg| vec![OutgoingMsg::new(from_cid, msg)];

        let result = match msg {
            SignalingMsg::AllocateCall => self
                .machine
                .allocate_call_id()
                .map(|call_id| reply(SignalingMsg::CallAllocated { call_id })),

            SignalingMsg::Join { call_id, kind } => {
                self.machine
                    .request_join(&call_id, &pid, kind)
                    .map(|ticket| {
                        self.clients.subscribe(&ticket.call_id, &pid);
                        reply(SignalingMsg::JoinPending {
                            call_id: ticket.call_id,
                            state: ticket.state,
                            peers: ticket.handshake_peers.into_iter().collect(),
                        })
                    })
            }

            // The Left notification reaches the leaver through the event
            // fan-out, so there is no direct reply.
            SignalingMsg::Leave { call_id } => self
                .machine
                .request_leave(&call_id, &pid)
                .map(|_| Vec::new()),

            SignalingMsg::ListParticipants { call_id } => self
                .machine
                .list_participants(&call_id)
                .map(|participants| {
                    let entries = participants
                        .into_iter()
                        .map(|p| RosterEntry {
                            participant_id: p.participant_id,
                            state: p.state,
                            media: p.media_flags,
                        })
                        .collect();
                    reply(SignalingMsg::Roster { call_id, entries })
                }),

            SignalingMsg::ToggleMedia {
                call_id,
                flag,
                value,
            } => self
                .machine
                .toggle_media(&call_id, &pid, flag, value)
                .map(|outcome| {
                    sink_debug!(
                        self.log,
                        "toggle {:?}={} by {} in {}: {:?}",
                        flag,
                        value,
                        pid,
                        call_id,
                        outcome
                    );
                    Vec::new()
                }),

            SignalingMsg::Negotiate {
                call_id,
                to,
                kind,
                in_reply_to,
                payload,
            } => {
                let mut nm = NegotiationMessage::new(call_id, pid.clone(), to, kind, payload);
                if in_reply_to != 0 {
                    nm = nm.in_reply_to(in_reply_to);
                }
                self.machine
                    .submit_negotiation_message(nm)
                    .map(|delivery| {
                        if let Delivery::Dropped = delivery {
                            sink_debug!(self.log, "negotiation from {} was dropped", pid);
                        }
                        Vec::new()
                    })
            }

            SignalingMsg::Heartbeat { call_id } => {
                let outcome = self.machine.heartbeat(&call_id, &pid);
                sink_trace!(self.log, "heartbeat {} in {}: {:?}", pid, call_id, outcome);
                Ok(Vec::new())
            }

            other => {
                sink_warn!(self.log, "unexpected call request {:?}", other);
                Ok(Vec::new())
            }
        };

        result.unwrap_or_else(|e| {
            sink_info!(self.log, "request from {} ({}) rejected: {}", pid, from_cid, e);
            vec![call_error_reply(from_cid, &e)]
        })
    }

    /// Fans one call event out to the connections that should see it.
    ///
    /// Negotiation messages go to their destination only; everything else
    /// goes to the call's current audience.
    pub fn handle_call_event(&mut self, event: CallEvent) -> Vec<OutgoingMsg> {
        let (recipients, msg): (BTreeSet<ParticipantId>, SignalingMsg) = match event {
            CallEvent::NegotiationMessage(exchange) => {
                let to = exchange.to.clone();
                (BTreeSet::from([to]), SignalingMsg::from(exchange))
            }

            CallEvent::ParticipantStateChanged {
                call_id,
                participant_id,
                state,
            } => {
                if state == ConnectionState::Joining {
                    self.clients.subscribe(&call_id, &participant_id);
                }
                let mut recipients = self.audience_of(&call_id);
                recipients.insert(participant_id.clone());
                if state == ConnectionState::Left {
                    self.clients.unsubscribe(&call_id, &participant_id);
                }
                (
                    recipients,
                    SignalingMsg::StateChanged {
                        call_id,
                        participant_id,
                        state,
                    },
                )
            }

            CallEvent::CallEnded { call_id } => {
                let recipients = self.clients.end_call(&call_id);
                sink_debug!(self.log, "call {} ended; notifying {:?}", call_id, recipients);
                (recipients, SignalingMsg::CallEnded { call_id })
            }

            CallEvent::ParticipantTimedOut {
                call_id,
                participant_id,
            } => (
                self.audience_of(&call_id),
                SignalingMsg::ParticipantTimedOut {
                    call_id,
                    participant_id,
                },
            ),

            CallEvent::MediaChanged {
                call_id,
                participant_id,
                flags,
            } => (
                self.audience_of(&call_id),
                SignalingMsg::MediaChanged {
                    call_id,
                    participant_id,
                    flags,
                },
            ),

            CallEvent::RenegotiationFailed {
                call_id,
                participant_id,
            } => (
                self.audience_of(&call_id),
                SignalingMsg::RenegotiationFailed {
                    call_id,
                    participant_id,
                },
            ),
        };

        recipients
            .iter()
            .filter_map(|pid| match self.clients.client_of(pid) {
                Some(cid) => Some(OutgoingMsg::new(cid, msg.clone())),
                None => {
                    sink_trace!(self.log, "no connection for {}; event not delivered", pid);
                    None
                }
            })
            .collect()
    }

    /// A connection closed. Its participant stays in its call: without
    /// heartbeats the presence sweep decides what happens next.
    pub fn handle_disconnect(&mut self, client: ClientId) -> Vec<OutgoingMsg> {
        match self.clients.unbind(client) {
            Some(pid) => {
                sink_info!(
                    self.log,
                    "client {} ({}) disconnected; membership left to presence",
                    client,
                    pid
                );
            }
            None => {
                sink_debug!(self.log, "client {} closed before identifying", client);
            }
        }
        Vec::new()
    }

    fn audience_of(&self, call_id: &str) -> BTreeSet<ParticipantId> {
        self.clients.audience(call_id).cloned().collect()
    }
}

fn error_reply(client: ClientId, code: ErrorCode, detail: &str) -> OutgoingMsg {
    OutgoingMsg::new(
        client,
        SignalingMsg::Error {
            code: code.as_u16(),
            detail: detail.to_owned(),
        },
    )
}

fn call_error_reply(client: ClientId, e: &CallError) -> OutgoingMsg {
    error_reply(client, ErrorCode::from(e), &e.to_string())
}
