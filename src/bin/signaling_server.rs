use std::path::Path;
use std::sync::Arc;
use std::{env, process};

use roomcall::config::{CallConfig, Config, ServerConfig};
use roomcall::log::MemoryLogSink;
use roomcall::log::log_sink::LogSink;
use roomcall::log::logger::Logger;
use roomcall::signaling::run::run_signaling_server;

const DEFAULT_CONFIG: &str = "signaling.conf";

fn main() -> std::io::Result<()> {
    // --- Parse CLI args ----------------------------------------------------
    //
    // Supported:
    //   signaling_server
    //      -> reads ./signaling.conf if present, else built-in defaults
    //
    //   signaling_server server.conf
    //      -> reads server.conf
    //
    //   signaling_server server.conf 127.0.0.1:7000
    //      -> reads server.conf, listens on 127.0.0.1:7000

    let args: Vec<String> = env::args().collect();

    let (config_path, addr_override) = match args.len() {
        1 => (None, None),
        2 => (Some(args[1].as_str()), None),
        3 => (Some(args[1].as_str()), Some(args[2].clone())),
        _ => {
            eprintln!("Usage:");
            eprintln!("  {}                    # ./{DEFAULT_CONFIG} or defaults", args[0]);
            eprintln!("  {} [CONFIG]           # e.g. server.conf", args[0]);
            eprintln!("  {} [CONFIG] [ADDR]    # e.g. server.conf 0.0.0.0:6000", args[0]);
            process::exit(1);
        }
    };

    let config = match config_path {
        Some(path) => Config::load(path).unwrap_or_else(|e| {
            eprintln!("[signaling_server] {e}");
            process::exit(1);
        }),
        None if Path::new(DEFAULT_CONFIG).exists() => {
            Config::load(DEFAULT_CONFIG).unwrap_or_else(|e| {
                eprintln!("[signaling_server] {e}");
                process::exit(1);
            })
        }
        None => Config::empty(),
    };

    // Config warnings are buffered until the logger exists.
    let early = MemoryLogSink::new();
    let mut server = ServerConfig::from_config(&config, &early);
    if let Some(addr) = addr_override {
        server.bind_addr = addr;
    }
    let calls = CallConfig::from_config(&config, &early);

    // --- Start process logger ----------------------------------------------
    let logger = Logger::start_server(1024, &server);
    let log_sink: Arc<dyn LogSink> = Arc::new(logger.handle());
    for (level, line) in early.lines() {
        log_sink.log(level, &line, module_path!());
    }

    eprintln!(
        "[signaling_server] starting on {} (log: {})",
        server.bind_addr,
        logger.file_path().display()
    );

    // --- Run signaling server (blocks) -------------------------------------
    // The logger stays alive for as long as the server runs.
    let result = run_signaling_server(&server, calls, log_sink);
    if let Err(e) = &result {
        eprintln!("[signaling_server] stopped: {e}");
    }
    drop(logger);
    result
}
