//! TCP transport.
//!
//! Each frame travels with a small envelope so that one connection can carry both
//! request/reply and one-way traffic:
//!
//! ```text
//! ┌──────────┬──────────┬──────────────────┐
//! │ len: u32 │ mode: u8 │ frame (len bytes)│
//! └──────────┴──────────┴──────────────────┘
//! ```
//!
//! A reply is written back as `len: u32, frame` and only for request mode.

use crate::error::{NetworkError, Result};
use crate::network::codec::MAX_BODY_LEN;
use crate::network::transport::{FrameHandler, Transport};
use crate::types::NodeId;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const MODE_REQUEST: u8 = 0;
const MODE_ONE_WAY: u8 = 1;

/// Largest frame accepted on a connection.
const MAX_FRAME_LEN: usize = MAX_BODY_LEN + 64;

async fn read_len(stream: &mut TcpStream) -> std::io::Result<Option<usize>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => Ok(Some(u32::from_be_bytes(len_buf) as usize)),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e),
    }
}

async fn read_exact_bytes(stream: &mut TcpStream, len: usize) -> Result<Bytes> {
    if len > MAX_FRAME_LEN {
        return Err(NetworkError::Deserialization(format!("frame of {} bytes too large", len)).into());
    }
    let mut data = vec![0u8; len];
    stream.read_exact(&mut data).await.map_err(NetworkError::Io)?;
    Ok(Bytes::from(data))
}

/// TCP server feeding incoming frames to a [`FrameHandler`].
pub struct NetworkServer {
    /// Address to bind to.
    bind_addr: SocketAddr,

    /// This node's ID.
    node_id: NodeId,

    handler: Arc<dyn FrameHandler>,

    shutdown: CancellationToken,
}

impl NetworkServer {
    /// Create a new network server. Cancel the returned token to stop it.
    pub fn new(
        bind_addr: SocketAddr,
        node_id: NodeId,
        handler: Arc<dyn FrameHandler>,
    ) -> (Self, CancellationToken) {
        let shutdown = CancellationToken::new();
        let server = Self {
            bind_addr,
            node_id,
            handler,
            shutdown: shutdown.clone(),
        };
        (server, shutdown)
    }

    /// Bind and serve until shut down.
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .map_err(NetworkError::Io)?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shut down.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        info!(
            node_id = self.node_id,
            addr = ?listener.local_addr().ok(),
            "Network server listening"
        );

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            debug!(peer = %peer_addr, "Accepted connection");
                            let handler = self.handler.clone();
                            let shutdown = self.shutdown.clone();
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, handler, shutdown).await {
                                    debug!(error = %e, "Connection handler error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = self.shutdown.cancelled() => {
                    info!(node_id = self.node_id, "Network server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn handle_connection(
        mut stream: TcpStream,
        handler: Arc<dyn FrameHandler>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        loop {
            let len = tokio::select! {
                len = read_len(&mut stream) => len.map_err(NetworkError::Io)?,
                _ = shutdown.cancelled() => return Ok(()),
            };
            let Some(len) = len else {
                // Connection closed
                return Ok(());
            };

            let mode = stream.read_u8().await.map_err(NetworkError::Io)?;
            let frame = read_exact_bytes(&mut stream, len).await?;

            match mode {
                MODE_REQUEST => {
                    let reply = handler.handle_frame(frame).await.unwrap_or_default();
                    stream
                        .write_all(&(reply.len() as u32).to_be_bytes())
                        .await
                        .map_err(NetworkError::Io)?;
                    stream.write_all(&reply).await.map_err(NetworkError::Io)?;
                }
                MODE_ONE_WAY => {
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        handler.handle_frame(frame).await;
                    });
                }
                other => {
                    return Err(
                        NetworkError::Deserialization(format!("unknown mode {}", other)).into(),
                    )
                }
            }
        }
    }
}

/// Transport over TCP connections, one per peer.
///
/// Requests on a connection are serialized; a failed connection is dropped and
/// re-established on the next send.
#[derive(Default)]
pub struct TcpTransport {
    peers: DashMap<NodeId, SocketAddr>,
    connections: DashMap<NodeId, Arc<Mutex<TcpStream>>>,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the address of a peer.
    pub fn add_peer(&self, node_id: NodeId, addr: SocketAddr) {
        self.peers.insert(node_id, addr);
        self.connections.remove(&node_id);
    }

    pub fn remove_peer(&self, node_id: NodeId) {
        self.peers.remove(&node_id);
        self.connections.remove(&node_id);
    }

    async fn connection(&self, target: NodeId) -> Result<Arc<Mutex<TcpStream>>> {
        if let Some(conn) = self.connections.get(&target) {
            return Ok(Arc::clone(conn.value()));
        }

        let addr = self
            .peers
            .get(&target)
            .map(|a| *a.value())
            .ok_or(NetworkError::UnknownNode(target))?;
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| NetworkError::ConnectionFailed {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true).map_err(NetworkError::Io)?;
        debug!(target, %addr, "Connected to peer");

        let conn = Arc::new(Mutex::new(stream));
        self.connections.insert(target, Arc::clone(&conn));
        Ok(conn)
    }

    async fn write_frame(stream: &mut TcpStream, mode: u8, frame: &Bytes) -> Result<()> {
        stream
            .write_all(&(frame.len() as u32).to_be_bytes())
            .await
            .map_err(NetworkError::Io)?;
        stream.write_u8(mode).await.map_err(NetworkError::Io)?;
        stream.write_all(frame).await.map_err(NetworkError::Io)?;
        Ok(())
    }

    async fn exchange(conn: &Mutex<TcpStream>, frame: &Bytes) -> Result<Bytes> {
        let mut stream = conn.lock().await;
        Self::write_frame(&mut stream, MODE_REQUEST, frame).await?;
        let len = read_len(&mut stream)
            .await
            .map_err(NetworkError::Io)?
            .ok_or(NetworkError::ConnectionClosed)?;
        read_exact_bytes(&mut stream, len).await
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, target: NodeId, frame: Bytes) -> Result<Bytes> {
        let conn = self.connection(target).await?;
        let result = Self::exchange(&conn, &frame).await;
        if result.is_err() {
            self.connections.remove(&target);
        }
        let reply = result?;
        if reply.is_empty() {
            return Err(NetworkError::ConnectionClosed.into());
        }
        Ok(reply)
    }

    async fn send_one_way(&self, target: NodeId, frame: Bytes) -> Result<()> {
        let conn = self.connection(target).await?;
        let result = {
            let mut stream = conn.lock().await;
            Self::write_frame(&mut stream, MODE_ONE_WAY, &frame).await
        };
        if result.is_err() {
            self.connections.remove(&target);
        }
        result
    }
}
