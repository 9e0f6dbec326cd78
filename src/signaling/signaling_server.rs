use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, mpsc};
use std::{io, thread};

use crate::call::CallStateMachine;
use crate::log::log_sink::LogSink;
use crate::signaling::runtime::{run_server_loop, spawn_event_forwarder};
use crate::signaling::server_engine::ServerEngine;
use crate::signaling::server_event::ServerEvent;
use crate::signaling::transport::{spawn_connection_threads, spawn_tls_connection};
use crate::signaling::types::ClientId;
use crate::{sink_info, sink_warn};

/// Top-level runtime object for the signaling service.
///
/// This owns:
/// - the bound listener
/// - the call core
/// - the optional TLS configuration
///
/// and knows how to spin up the central server loop, the event forwarder,
/// the presence sweeper and per-connection threads.
pub struct SignalingServer {
    listener: TcpListener,
    machine: Arc<CallStateMachine>,
    tls: Option<Arc<rustls::ServerConfig>>,
    log: Arc<dyn LogSink>,
}

impl SignalingServer {
    /// Binds right away so callers can learn the port before `run`.
    pub fn bind(
        addr: &str,
        machine: Arc<CallStateMachine>,
        log: Arc<dyn LogSink>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        Ok(Self {
            listener,
            machine,
            tls: None,
            log,
        })
    }

    #[must_use]
    pub fn with_tls(mut self, tls: Arc<rustls::ServerConfig>) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Blocking main loop: spawn the central server loop, then accept clients.
    pub fn run(self) -> io::Result<()> {
        let Self {
            listener,
            machine,
            tls,
            log,
        } = self;

        // Events from all connections and from the call core -> server loop
        let (server_tx, server_rx) = mpsc::channel::<ServerEvent>();
        spawn_event_forwarder(machine.subscribe(), server_tx.clone())?;
        let _sweeper = machine.spawn_sweeper()?;

        {
            let log_for_loop = log.clone();
            let engine = ServerEngine::with_log(machine.clone(), log.clone());
            thread::Builder::new()
                .name("signaling-loop".into())
                .spawn(move || {
                    sink_info!(log_for_loop, "[signaling] server loop started");
                    run_server_loop(engine, log_for_loop, server_rx);
                })?;
        }

        let mut next_client_id: ClientId = 1;
        sink_info!(
            log,
            "signaling server listening on {} ({})",
            listener.local_addr()?,
            if tls.is_some() { "tls" } else { "plain tcp" }
        );

        for stream in listener.incoming() {
            let stream = match stream {
                Ok(s) => s,
                Err(e) => {
                    sink_warn!(
                        log,
                        "incoming TCP accept failed: {:?} (continuing to accept)",
                        e
                    );
                    continue;
                }
            };

            let client_id = next_client_id;
            next_client_id += 1;

            if let Err(e) = stream.set_nodelay(true) {
                sink_warn!(log, "set_nodelay failed for client {}: {}", client_id, e);
            }
            sink_info!(
                log,
                "accepted TCP connection from {:?} as client_id={}",
                stream.peer_addr().ok(),
                client_id
            );

            let spawned = match &tls {
                Some(cfg) => spawn_tls_connection(
                    client_id,
                    stream,
                    cfg.clone(),
                    server_tx.clone(),
                    log.clone(),
                ),
                None => spawn_connection_threads(client_id, stream, server_tx.clone(), log.clone()),
            };
            if let Err(e) = spawned {
                sink_warn!(
                    log,
                    "failed to spawn connection threads for client {}: {:?}",
                    client_id,
                    e
                );
            }
        }

        Ok(())
    }
}
