use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::mpsc::{self, Sender, TryRecvError};
use std::thread;
use std::time::Duration;

use rustls::{ServerConnection, StreamOwned};

use crate::log::log_sink::LogSink;
use crate::signaling::protocol::{FrameDecoder, FrameError, Msg, read_msg, write_msg};
use crate::signaling::server_event::ServerEvent;
use crate::signaling::types::ClientId;
use crate::{sink_debug, sink_warn};

/// How long the TLS connection thread blocks on a read before it checks
/// for outgoing messages again.
const TLS_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Thin wrapper over a blocking stream that speaks in `Msg`.
pub struct Connection<S> {
    pub client_id: ClientId,
    stream: S,
}

impl<S> Connection<S>
where
    S: Read + Write,
{
    pub fn new(id: ClientId, stream: S) -> Self {
        Self {
            client_id: id,
            stream,
        }
    }

    pub fn recv(&mut self) -> Result<Msg, FrameError> {
        read_msg(&mut self.stream)
    }

    pub fn send(&mut self, msg: &Msg) -> Result<(), FrameError> {
        write_msg(&mut self.stream, msg)
    }
}

fn register(
    client_id: ClientId,
    server_tx: &Sender<ServerEvent>,
) -> io::Result<mpsc::Receiver<Msg>> {
    let (to_client_tx, to_client_rx) = mpsc::channel::<Msg>();
    server_tx
        .send(ServerEvent::RegisterClient {
            client_id,
            to_client: to_client_tx,
        })
        .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "server loop is gone"))?;
    Ok(to_client_rx)
}

fn is_clean_close(e: &FrameError) -> bool {
    matches!(e, FrameError::Io(io_e) if io_e.kind() == io::ErrorKind::UnexpectedEof)
}

/// Spawn reader + writer threads for a single plain TcpStream client.
///
/// `server_tx` is the Sender<ServerEvent> that talks to the central server loop.
pub fn spawn_connection_threads(
    client_id: ClientId,
    stream: TcpStream,
    server_tx: Sender<ServerEvent>,
    log: Arc<dyn LogSink>,
) -> io::Result<()> {
    let read_stream = stream.try_clone()?;
    let write_stream = stream;
    let to_client_rx = register(client_id, &server_tx)?;

    // READER THREAD: socket -> ServerEvent::MsgFromClient
    {
        let server_tx = server_tx.clone();
        let log = log.clone();
        thread::Builder::new()
            .name(format!("conn-{client_id}-rx"))
            .spawn(move || {
                let mut conn = Connection::new(client_id, read_stream);
                loop {
                    match conn.recv() {
                        Ok(msg) => {
                            if server_tx
                                .send(ServerEvent::MsgFromClient { client_id, msg })
                                .is_err()
                            {
                                break;
                            }
                        }
                        Err(e) => {
                            if is_clean_close(&e) {
                                sink_debug!(log, "[conn {}] closed by peer", client_id);
                            } else {
                                sink_warn!(log, "[conn {}] reader stopped: {}", client_id, e);
                            }
                            let _ = server_tx.send(ServerEvent::Disconnected { client_id });
                            break;
                        }
                    }
                }
            })?;
    }

    // WRITER THREAD: to_client_rx -> socket
    thread::Builder::new()
        .name(format!("conn-{client_id}-tx"))
        .spawn(move || {
            let mut conn = Connection::new(client_id, write_stream);
            while let Ok(msg) = to_client_rx.recv() {
                if let Err(e) = conn.send(&msg) {
                    sink_warn!(log, "[conn {}] error sending msg: {}", client_id, e);
                    let _ = server_tx.send(ServerEvent::Disconnected { client_id });
                    break;
                }
            }
        })?;

    Ok(())
}

/// Spawn one thread serving a TLS client.
///
/// A rustls stream cannot be split into reader and writer halves, so the
/// thread alternates between flushing queued outgoing messages and reading
/// with a short timeout.
pub fn spawn_tls_connection(
    client_id: ClientId,
    stream: TcpStream,
    tls_config: Arc<rustls::ServerConfig>,
    server_tx: Sender<ServerEvent>,
    log: Arc<dyn LogSink>,
) -> io::Result<()> {
    stream.set_read_timeout(Some(TLS_POLL_INTERVAL))?;
    let tls_conn = ServerConnection::new(tls_config)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("TLS setup: {e}")))?;
    let to_client_rx = register(client_id, &server_tx)?;

    thread::Builder::new()
        .name(format!("conn-{client_id}-tls"))
        .spawn(move || {
            let mut tls = StreamOwned::new(tls_conn, stream);
            let mut decoder = FrameDecoder::new();
            let mut buf = [0u8; 4096];

            let reason = 'conn: loop {
                loop {
                    match to_client_rx.try_recv() {
                        Ok(msg) => {
                            if let Err(e) = write_msg(&mut tls, &msg) {
                                break 'conn format!("error sending msg: {e}");
                            }
                        }
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Disconnected) => break 'conn "server loop gone".into(),
                    }
                }

                match tls.read(&mut buf) {
                    Ok(0) => break 'conn "closed by peer".into(),
                    Ok(n) => decoder.push(&buf[..n]),
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                        ) =>
                    {
                        continue;
                    }
                    Err(e) => break 'conn format!("read error: {e}"),
                }

                loop {
                    match decoder.next_msg() {
                        Ok(Some(msg)) => {
                            if server_tx
                                .send(ServerEvent::MsgFromClient { client_id, msg })
                                .is_err()
                            {
                                break 'conn "server loop gone".into();
                            }
                        }
                        Ok(None) => break,
                        Err(e) => break 'conn format!("frame error: {e}"),
                    }
                }
            };

            sink_debug!(log, "[conn {}] TLS connection ended: {}", client_id, reason);
            let _ = server_tx.send(ServerEvent::Disconnected { client_id });
        })?;

    Ok(())
}
