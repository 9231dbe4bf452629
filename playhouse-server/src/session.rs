//! Plain TCP client transport (C3, §4.3). The simplest of the three
//! transports: raw bytes in, raw bytes out, framing handled entirely by
//! [`crate::framing::FrameReader`].

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use protocol::pool::BufferPool;

use crate::framing::FrameReader;
use crate::gateway::{GatewayContext, SessionRegistry};

/// Drives one accepted TCP connection until either side closes it. Spawned
/// once per accepted socket by the listener.
pub async fn handle_connection(
    stream: TcpStream,
    peer: std::net::SocketAddr,
    registry: Arc<SessionRegistry>,
    context: GatewayContext,
    pool: BufferPool,
) {
    let _ = stream.set_nodelay(true);
    let (mut read_half, mut write_half) = stream.into_split();
    let (outbound_tx, mut outbound_rx) = tokio::sync::mpsc::unbounded_channel();
    let session = registry.register(outbound_tx);

    debug!(sid = session.sid, %peer, "tcp session connected");

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if let Err(e) = write_half.write_all(&frame).await {
                warn!(error = %e, "tcp write failed, closing session");
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
                warn!(error = %e, sid = session.sid, "tcp read failed");
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
    info!(sid = session.sid, %peer, "tcp session disconnected");
}
