//! WebSocket client transport (C3, §4.3), used by browser/WASM clients that
//! cannot open a raw TCP socket. A single binary message may carry more than
//! one concatenated client frame, so both directions are driven through the
//! same [`crate::framing::FrameReader`] the TCP transport uses.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use protocol::pool::BufferPool;

use crate::framing::FrameReader;
use crate::gateway::{GatewayContext, SessionRegistry};

/// Drives one upgraded WebSocket connection until it closes. The write half
/// is wrapped for sharing because the read loop and the outbound-drain task
/// both need to send: the read loop sends a close frame on a codec error,
/// the drain task sends every encoded reply/push frame.
pub async fn handle_connection(stream: WebSocket, registry: Arc<SessionRegistry>, context: GatewayContext, pool: BufferPool) {
    let (sender, mut receiver) = stream.split();
    let wrapped_sender = Arc::new(Mutex::new(sender));
    let (outbound_tx, mut outbound_rx) = tokio::sync::mpsc::unbounded_channel();
    let session = registry.register(outbound_tx);

    debug!(sid = session.sid, "ws session connected");

    let writer_sender = wrapped_sender.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let mut guard = writer_sender.lock().await;
            if let Err(e) = guard.send(Message::Binary(frame)).await {
                warn!(error = %e, "ws write failed, closing session");
                break;
            }
        }
    });

    let mut reader = FrameReader::new(context.config.max_packet_bytes);
    'outer: while let Some(msg) = receiver.next().await {
        let data = match msg {
            Ok(Message::Binary(data)) => data,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!(error = %e, sid = session.sid, "ws read failed");
                break;
            }
        };
        reader.feed(&data);
        loop {
            match reader.next_frame(&pool) {
                Ok(Some((header, payload))) => context.handle_frame(&session, header, payload).await,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, sid = session.sid, "malformed frame, closing session");
                    close(&wrapped_sender).await;
                    break 'outer;
                }
            }
        }
    }

    registry.unregister(session.sid);
    context.notify_disconnect(&session);
    writer.abort();
    info!(sid = session.sid, "ws session disconnected");
}

async fn close(sender: &Arc<Mutex<SplitSink<WebSocket, Message>>>) {
    let mut guard = sender.lock().await;
    let _ = guard.send(Message::Close(None)).await;
}
