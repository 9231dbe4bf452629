//! ZMQ-based mesh socket (C5, §4.5). Each server binds one ROUTER socket
//! to receive from peers and keeps a second ROUTER socket, never bound,
//! used only to connect out and send. A zmq socket must only ever be
//! touched from a single thread, so send and receive each get their own
//! dedicated OS thread and never share a socket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::mpsc as tokio_mpsc;
use tracing::{debug, error, info, warn};

use protocol::header::Header;
use protocol::mesh_frame::{decode_mesh_frame, encode_mesh_frame, MeshFrame};
use protocol::payload::Payload;

use crate::error::CoreError;

/// A route packet as delivered by the receive thread, ready to be handed
/// to C10/C12/C13.
pub struct InboundMeshFrame {
    pub from: String,
    pub to: String,
    pub header: Header,
    pub payload: Payload,
}

enum SendCommand {
    Connect { peer_id: String, endpoint: String },
    Send { to: String, header: Header, body: Vec<u8> },
    Shutdown,
}

/// How long `recv_multipart`/the send-command channel blocks before
/// re-checking the running flag, so shutdown doesn't need to wait forever
/// on an idle socket.
const POLL_TIMEOUT_MS: i32 = 200;

pub struct MeshSocket {
    server_id: String,
    cmd_tx: std_mpsc::Sender<SendCommand>,
    inbound_rx: Mutex<Option<tokio_mpsc::UnboundedReceiver<InboundMeshFrame>>>,
    running: Arc<AtomicBool>,
    send_handle: Mutex<Option<JoinHandle<()>>>,
    recv_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MeshSocket {
    /// Binds the receive socket at `bind_endpoint` and starts the send and
    /// receive threads. Both sockets identify themselves as `server_id` so
    /// peers can address replies back to us by that name.
    pub fn bind(server_id: impl Into<String>, bind_endpoint: &str) -> Result<Arc<Self>, CoreError> {
        let server_id = server_id.into();
        let context = zmq::Context::new();

        let recv_socket = context
            .socket(zmq::ROUTER)
            .map_err(|e| CoreError::Mesh(format!("create recv socket: {e}")))?;
        recv_socket
            .set_identity(server_id.as_bytes())
            .map_err(|e| CoreError::Mesh(format!("set recv identity: {e}")))?;
        recv_socket
            .set_rcvtimeo(POLL_TIMEOUT_MS)
            .map_err(|e| CoreError::Mesh(format!("set rcvtimeo: {e}")))?;
        recv_socket
            .bind(bind_endpoint)
            .map_err(|e| CoreError::Mesh(format!("bind {bind_endpoint}: {e}")))?;

        let send_socket = context
            .socket(zmq::ROUTER)
            .map_err(|e| CoreError::Mesh(format!("create send socket: {e}")))?;
        send_socket
            .set_identity(server_id.as_bytes())
            .map_err(|e| CoreError::Mesh(format!("set send identity: {e}")))?;
        send_socket
            .set_sndtimeo(POLL_TIMEOUT_MS)
            .map_err(|e| CoreError::Mesh(format!("set sndtimeo: {e}")))?;

        let running = Arc::new(AtomicBool::new(true));
        let (cmd_tx, cmd_rx) = std_mpsc::channel::<SendCommand>();
        let (inbound_tx, inbound_rx) = tokio_mpsc::unbounded_channel();

        let send_running = running.clone();
        let send_server_id = server_id.clone();
        let send_handle = std::thread::Builder::new()
            .name(format!("mesh-send-{send_server_id}"))
            .spawn(move || send_loop(send_socket, cmd_rx, send_running))
            .map_err(|e| CoreError::Mesh(format!("spawn send thread: {e}")))?;

        let recv_running = running.clone();
        let recv_server_id = server_id.clone();
        let recv_handle = std::thread::Builder::new()
            .name(format!("mesh-recv-{recv_server_id}"))
            .spawn(move || recv_loop(recv_socket, inbound_tx, recv_running))
            .map_err(|e| CoreError::Mesh(format!("spawn recv thread: {e}")))?;

        Ok(Arc::new(MeshSocket {
            server_id,
            cmd_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            running,
            send_handle: Mutex::new(Some(send_handle)),
            recv_handle: Mutex::new(Some(recv_handle)),
        }))
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Opens an outbound connection to a newly discovered peer. Safe to
    /// call more than once for the same peer; zmq treats a duplicate
    /// connect as a no-op.
    pub fn connect_peer(&self, peer_id: impl Into<String>, endpoint: impl Into<String>) {
        let _ = self.cmd_tx.send(SendCommand::Connect {
            peer_id: peer_id.into(),
            endpoint: endpoint.into(),
        });
    }

    /// Sends a route packet to `to` on the dedicated send thread. Returns
    /// once the command is enqueued, not once the socket has flushed it.
    pub fn send(&self, to: impl Into<String>, header: Header, body: Vec<u8>) -> Result<(), CoreError> {
        self.cmd_tx
            .send(SendCommand::Send {
                to: to.into(),
                header,
                body,
            })
            .map_err(|_| CoreError::Mesh("send thread has shut down".into()))
    }

    /// Takes ownership of the inbound frame stream. Only one caller may
    /// hold it at a time; intended to be taken once by C10/C12's routing
    /// loop during bootstrap.
    pub fn take_inbound(&self) -> Option<tokio_mpsc::UnboundedReceiver<InboundMeshFrame>> {
        self.inbound_rx.lock().expect("inbound_rx poisoned").take()
    }

    /// Stops both threads and joins them. Idempotent.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.cmd_tx.send(SendCommand::Shutdown);
        if let Some(handle) = self.send_handle.lock().expect("poisoned").take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.recv_handle.lock().expect("poisoned").take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MeshSocket {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn send_loop(socket: zmq::Socket, cmd_rx: std_mpsc::Receiver<SendCommand>, running: Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) {
        let cmd = match cmd_rx.recv_timeout(Duration::from_millis(POLL_TIMEOUT_MS as u64)) {
            Ok(cmd) => cmd,
            Err(std_mpsc::RecvTimeoutError::Timeout) => continue,
            Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
        };
        match cmd {
            SendCommand::Shutdown => break,
            SendCommand::Connect { peer_id, endpoint } => {
                if let Err(e) = socket.connect(&endpoint) {
                    error!(peer_id, endpoint, error = %e, "failed to connect mesh peer");
                } else {
                    debug!(peer_id, endpoint, "connected mesh peer");
                }
            }
            SendCommand::Send { to, header, body } => {
                let from = header.from().to_string();
                let frame = MeshFrame::new(to.clone(), from, header, body);
                match encode_mesh_frame(&frame) {
                    Ok(parts) => {
                        let mut full: Vec<&[u8]> = Vec::with_capacity(5);
                        full.push(to.as_bytes());
                        for part in &parts {
                            full.push(part.as_slice());
                        }
                        if let Err(e) = socket.send_multipart(full, 0) {
                            warn!(to, error = %e, "mesh send failed");
                        }
                    }
                    Err(e) => warn!(to, error = %e, "failed to encode mesh frame"),
                }
            }
        }
    }
}

fn recv_loop(
    socket: zmq::Socket,
    inbound_tx: tokio_mpsc::UnboundedSender<InboundMeshFrame>,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::SeqCst) {
        let parts = match socket.recv_multipart(0) {
            Ok(parts) => parts,
            Err(zmq::Error::EAGAIN) => continue,
            Err(e) => {
                error!(error = %e, "mesh recv failed");
                continue;
            }
        };
        // parts[0] is the zmq-assigned sender identity; parts[1..] is our
        // own [to, from, header, body] application frame.
        if parts.len() < 5 {
            warn!(parts = parts.len(), "dropped undersized mesh frame");
            continue;
        }
        match decode_mesh_frame(&parts[1..]) {
            Ok(frame) => {
                if inbound_tx
                    .send(InboundMeshFrame {
                        from: frame.from,
                        to: frame.to,
                        header: frame.header,
                        payload: Payload::from_vec(frame.body),
                    })
                    .is_err()
                {
                    info!("inbound mesh receiver dropped, stopping recv loop");
                    break;
                }
            }
            Err(e) => warn!(error = %e, "dropped malformed mesh frame"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn two_nodes_exchange_a_frame() {
        let node_a = MeshSocket::bind("node-a", "tcp://127.0.0.1:28801").unwrap();
        let node_b = MeshSocket::bind("node-b", "tcp://127.0.0.1:28802").unwrap();

        node_a.connect_peer("node-b", "tcp://127.0.0.1:28802");
        // Give zmq's background I/O thread a moment to establish the TCP
        // connection before the first send.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let header = Header::new("Ping", 0, 0, 0).unwrap().with_from("node-a");
        node_a.send("node-b", header, b"hello".to_vec()).unwrap();

        let mut inbound = node_b.take_inbound().unwrap();
        let received = tokio::time::timeout(Duration::from_secs(5), inbound.recv())
            .await
            .expect("timed out waiting for mesh frame")
            .expect("channel closed");

        assert_eq!(received.from, "node-a");
        assert_eq!(received.to, "node-b");
        assert_eq!(received.header.msg_id(), "Ping");
        assert_eq!(received.payload.span(), b"hello");

        node_a.shutdown();
        node_b.shutdown();
    }
}
