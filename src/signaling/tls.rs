use rustls::ServerConfig as TlsServerConfig;
use std::{io, sync::Arc};

use crate::config::ServerConfig;
use crate::tls_utils::{load_certs, load_private_key};

/// ServerConfig for the signaling server, using *no* client auth, with the
/// certificate and key named in the `[TLS]` section.
///
/// Built once at startup; every accepted TCP connection wraps it in a
/// `ServerConnection`.
pub fn build_signaling_server_config(server: &ServerConfig) -> io::Result<Arc<TlsServerConfig>> {
    let certs = load_certs(&server.cert_path)?;
    let key = load_private_key(&server.key_path)?;

    let config = TlsServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| {
            io::Error::new(io::ErrorKind::InvalidData, format!("TLS config error: {e}"))
        })?;

    Ok(Arc::new(config))
}
