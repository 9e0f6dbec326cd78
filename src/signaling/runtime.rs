use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender};
use std::thread::{self, JoinHandle};

use crate::call::CallEvent;
use crate::log::log_sink::LogSink;
use crate::signaling::protocol::{Msg, SignalingMsg};
use crate::signaling::server_engine::ServerEngine;
use crate::signaling::server_event::ServerEvent;
use crate::signaling::types::{ClientId, OutgoingMsg};
use crate::{sink_debug, sink_info, sink_trace, sink_warn};

/// Central server loop: owns the engine + maps client_id -> Sender<Msg>.
pub fn run_server_loop(mut engine: ServerEngine, log: Arc<dyn LogSink>, rx: Receiver<ServerEvent>) {
    use ServerEvent::*;

    let mut clients: HashMap<ClientId, Sender<Msg>> = HashMap::new();

    while let Ok(ev) = rx.recv() {
        let outgoing = match ev {
            RegisterClient {
                client_id,
                to_client,
            } => {
                clients.insert(client_id, to_client);
                sink_info!(
                    log,
                    "registered client {} in server loop (now {} clients)",
                    client_id,
                    clients.len()
                );
                Vec::new()
            }

            MsgFromClient { client_id, msg } => {
                sink_debug!(log, "MsgFromClient from {}: {}", client_id, msg_name(&msg));
                engine.handle(client_id, msg)
            }

            Disconnected { client_id } => {
                // Reader and writer may both report the same connection.
                if clients.remove(&client_id).is_none() {
                    continue;
                }
                sink_info!(log, "client {} disconnected (transport)", client_id);
                engine.handle_disconnect(client_id)
            }

            Call(event) => {
                sink_trace!(log, "call event {:?}", event);
                engine.handle_call_event(event)
            }
        };

        deliver(&clients, outgoing, log.as_ref());
    }

    sink_info!(
        log,
        "ServerEvent channel closed; server loop shutting down ({} clients left)",
        clients.len()
    );
}

fn deliver(clients: &HashMap<ClientId, Sender<Msg>>, outgoing: Vec<OutgoingMsg>, log: &dyn LogSink) {
    for OutgoingMsg {
        client_id_target,
        msg,
    } in outgoing
    {
        match clients.get(&client_id_target) {
            Some(tx) => {
                if tx.send(msg).is_err() {
                    sink_warn!(
                        log,
                        "failed to deliver message to client {} (channel closed)",
                        client_id_target
                    );
                }
            }
            None => {
                sink_warn!(
                    log,
                    "no client {} to deliver outgoing message",
                    client_id_target
                );
            }
        }
    }
}

/// Pumps call-core events into the server loop until either side goes away.
pub fn spawn_event_forwarder(
    events: Receiver<CallEvent>,
    server_tx: Sender<ServerEvent>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("call-events".into())
        .spawn(move || {
            while let Ok(event) = events.recv() {
                if server_tx.send(ServerEvent::Call(event)).is_err() {
                    break;
                }
            }
        })
}

/// Helper: short variant name for logging.
/// We avoid logging full session descriptions here.
fn msg_name(msg: &Msg) -> &'static str {
    use SignalingMsg::*;
    match msg {
        Hello { .. } => "Hello",
        Identify { .. } => "Identify",
        IdentifyOk { .. } => "IdentifyOk",
        Error { .. } => "Error",
        AllocateCall => "AllocateCall",
        CallAllocated { .. } => "CallAllocated",
        Join { .. } => "Join",
        JoinPending { .. } => "JoinPending",
        Leave { .. } => "Leave",
        ListParticipants { .. } => "ListParticipants",
        Roster { .. } => "Roster",
        StateChanged { .. } => "StateChanged",
        CallEnded { .. } => "CallEnded",
        ParticipantTimedOut { .. } => "ParticipantTimedOut",
        ToggleMedia { .. } => "ToggleMedia",
        MediaChanged { .. } => "MediaChanged",
        RenegotiationFailed { .. } => "RenegotiationFailed",
        Negotiate { .. } => "Negotiate",
        Negotiation { .. } => "Negotiation",
        Ping { .. } => "Ping",
        Pong { .. } => "Pong",
        Heartbeat { .. } => "Heartbeat",
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    use crate::call::{CallKind, CallStateMachine, ConnectionState};
    use crate::config::CallConfig;
    use crate::log::NoopLogSink;

    const WAIT: Duration = Duration::from_millis(500);

    #[test]
    fn server_loop_forwards_call_events_to_members() {
        let (ev_tx, ev_rx) = mpsc::channel::<ServerEvent>();
        let machine = Arc::new(CallStateMachine::new(CallConfig::default()));
        spawn_event_forwarder(machine.subscribe(), ev_tx.clone()).unwrap();

        let engine = ServerEngine::new(machine);
        thread::spawn(move || run_server_loop(engine, Arc::new(NoopLogSink), ev_rx));

        let (to_client_tx, to_client_rx) = mpsc::channel::<Msg>();
        let client_id: ClientId = 1;
        ev_tx
            .send(ServerEvent::RegisterClient {
                client_id,
                to_client: to_client_tx,
            })
            .unwrap();
        for msg in [
            Msg::Identify {
                participant_id: "alice".into(),
            },
            Msg::Join {
                call_id: "room".into(),
                kind: CallKind::OneToOne,
            },
        ] {
            ev_tx
                .send(ServerEvent::MsgFromClient { client_id, msg })
                .unwrap();
        }

        let mut seen = Vec::new();
        while let Ok(msg) = to_client_rx.recv_timeout(WAIT) {
            let done = matches!(
                msg,
                Msg::StateChanged {
                    state: ConnectionState::Connected,
                    ..
                }
            );
            seen.push(msg);
            if done {
                break;
            }
        }
        assert!(matches!(seen.first(), Some(Msg::IdentifyOk { .. })));
        assert!(matches!(seen.get(1), Some(Msg::JoinPending { .. })));
        assert!(matches!(
            seen.last(),
            Some(Msg::StateChanged {
                state: ConnectionState::Connected,
                ..
            })
        ));
    }

    #[test]
    fn disconnect_is_handled_once() {
        let (ev_tx, ev_rx) = mpsc::channel::<ServerEvent>();
        let engine = ServerEngine::new(Arc::new(CallStateMachine::new(CallConfig::default())));
        let log = Arc::new(crate::log::MemoryLogSink::new());
        let log_for_loop = log.clone();
        let handle = thread::spawn(move || run_server_loop(engine, log_for_loop, ev_rx));

        let (to_client_tx, _to_client_rx) = mpsc::channel::<Msg>();
        ev_tx
            .send(ServerEvent::RegisterClient {
                client_id: 3,
                to_client: to_client_tx,
            })
            .unwrap();
        ev_tx.send(ServerEvent::Disconnected { client_id: 3 }).unwrap();
        ev_tx.send(ServerEvent::Disconnected { client_id: 3 }).unwrap();
        drop(ev_tx);
        handle.join().unwrap();

        let disconnects = log
            .lines()
            .iter()
            .filter(|(_, line)| line.contains("client 3 disconnected"))
            .count();
        assert_eq!(disconnects, 1);
    }
}
