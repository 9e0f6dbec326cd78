use std::io;
use std::sync::Arc;

use crate::call::CallStateMachine;
use crate::config::{CallConfig, ServerConfig};
use crate::log::log_sink::LogSink;
use crate::signaling::signaling_server::SignalingServer;
use crate::signaling::tls::build_signaling_server_config;
use crate::sink_info;

/// Run the signaling server described by `server` with a fresh call core.
/// Blocks for the lifetime of the listener.
pub fn run_signaling_server(
    server: &ServerConfig,
    calls: CallConfig,
    log: Arc<dyn LogSink>,
) -> io::Result<()> {
    let machine = Arc::new(CallStateMachine::with_log(calls, log.clone()));
    let mut signaling = SignalingServer::bind(&server.bind_addr, machine, log.clone())?;

    if server.tls {
        sink_info!(
            log,
            "loading TLS material from {} / {}",
            server.cert_path,
            server.key_path
        );
        signaling = signaling.with_tls(build_signaling_server_config(server)?);
    }
    signaling.run()
}
