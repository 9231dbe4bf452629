//! TLS client transport (C3, §4.3), layered directly on top of the plain
//! TCP framing logic via `tokio_rustls`.
//!
//! `rustls` has no PKCS12 loader, so [`playhouse_core::config::TlsConfig`]'s
//! `pkcs12_path`/`pkcs12_password` fields are read pragmatically here as a
//! combined PEM file (leaf certificate followed by its private key) and the
//! password is ignored; a deployment that genuinely needs PKCS12 containers
//! converts them to PEM ahead of time with `openssl pkcs12`.

use std::io::BufReader;
use std::sync::Arc;

use rustls_pemfile::Item;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use playhouse_core::config::TlsConfig;
use protocol::pool::BufferPool;

use crate::framing::FrameReader;
use crate::gateway::{GatewayContext, SessionRegistry};

/// Builds a `TlsAcceptor` from the combined PEM file named by `config`.
pub async fn build_acceptor(config: &TlsConfig) -> Result<TlsAcceptor, String> {
    let pem = tokio::fs::read(&config.pkcs12_path)
        .await
        .map_err(|e| format!("failed to read tls pem file {}: {e}", config.pkcs12_path))?;
    let mut reader = BufReader::new(pem.as_slice());

    let mut certs: Vec<CertificateDer<'static>> = Vec::new();
    let mut key: Option<PrivateKeyDer<'static>> = None;
    for item in std::iter::from_fn(|| rustls_pemfile::read_one(&mut reader).transpose()) {
        match item.map_err(|e| format!("malformed pem item: {e}"))? {
            Item::X509Certificate(cert) => certs.push(cert),
            Item::Pkcs8Key(k) => key = Some(PrivateKeyDer::Pkcs8(k)),
            Item::Pkcs1Key(k) => key = Some(PrivateKeyDer::Pkcs1(k)),
            Item::Sec1Key(k) => key = Some(PrivateKeyDer::Sec1(k)),
            _ => {}
        }
    }
    let key = key.ok_or_else(|| format!("no private key found in {}", config.pkcs12_path))?;
    if certs.is_empty() {
        return Err(format!("no certificate found in {}", config.pkcs12_path));
    }

    let mut server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| format!("invalid tls certificate/key: {e}"))?;
    server_config.alpn_protocols = vec![];

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

/// Accepts the TLS handshake on an already-accepted TCP socket, then drives
/// the connection exactly like the plain TCP transport once the handshake
/// completes.
pub async fn handle_connection(
    acceptor: TlsAcceptor,
    stream: TcpStream,
    peer: std::net::SocketAddr,
    registry: Arc<SessionRegistry>,
    context: GatewayContext,
    pool: BufferPool,
) {
    let tls_stream = match acceptor.accept(stream).await {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, %peer, "tls handshake failed");
            return;
        }
    };

    let (mut read_half, mut write_half) = tokio::io::split(tls_stream);
    let (outbound_tx, mut outbound_rx) = tokio::sync::mpsc::unbounded_channel();
    let session = registry.register(outbound_tx);

    debug!(sid = session.sid, %peer, "tls session connected");

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if let Err(e) = write_half.write_all(&frame).await {
                warn!(error = %e, "tls write failed, closing session");
                break;
            }
        }
    });

    let mut reader = FrameReader::new(context.config.max_packet_bytes);
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = match read_half.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, sid = session.sid, "tls read failed");
                break;
            }
        };
        reader.feed(&buf[..n]);
        loop {
            match reader.next_frame(&pool) {
                Ok(Some((header, payload))) => context.handle_frame(&session, header, payload).await,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, sid = session.sid, "malformed frame, closing session");
                    registry.unregister(session.sid);
                    context.notify_disconnect(&session);
                    writer.abort();
                    return;
                }
            }
        }
    }

    registry.unregister(session.sid);
    context.notify_disconnect(&session);
    writer.abort();
    info!(sid = session.sid, %peer, "tls session disconnected");
}
