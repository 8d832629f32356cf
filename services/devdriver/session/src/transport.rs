//! Message transports carrying session traffic between clients.
//!
//! A [`MsgChannel`] only moves whole messages and never blocks: a full queue
//! reports [`SessionError::NotReady`] and a vanished peer reports
//! [`SessionError::Unavailable`]. Inbound messages surface on a tokio channel
//! that [`dispatch_inbound`] feeds into a [`SessionManager`].

use crate::error::SessionError;
use crate::manager::SessionManager;
use anyhow::Context;
use bytes::{Bytes, BytesMut};
use dd_wire::{ClientId, MessageBuffer, MessageDecoder};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

/// Outbound half of a message transport
pub trait MsgChannel: Send + Sync + std::fmt::Debug {
    /// Client id of the local endpoint
    fn client_id(&self) -> ClientId;

    /// Queue a message for delivery without blocking
    fn forward(&self, message: &MessageBuffer) -> Result<(), SessionError>;
}

fn map_send_error<T>(err: TrySendError<T>) -> SessionError {
    match err {
        TrySendError::Full(_) => SessionError::NotReady,
        TrySendError::Closed(_) => SessionError::Unavailable,
    }
}

/// In-process transport backed by a bounded tokio channel
#[derive(Debug)]
pub struct LocalChannel {
    client_id: ClientId,
    tx: mpsc::Sender<MessageBuffer>,
}

/// One side of a [`LocalChannel::pair`]
#[derive(Debug)]
pub struct LocalEndpoint {
    /// Outbound channel towards the other side
    pub channel: Arc<LocalChannel>,
    /// Messages sent by the other side
    pub inbound: mpsc::Receiver<MessageBuffer>,
}

impl LocalChannel {
    /// Connect two in-process endpoints with queues of `capacity` messages each
    pub fn pair(a: ClientId, b: ClientId, capacity: usize) -> (LocalEndpoint, LocalEndpoint) {
        let (a_tx, b_rx) = mpsc::channel(capacity.max(1));
        let (b_tx, a_rx) = mpsc::channel(capacity.max(1));
        (
            LocalEndpoint {
                channel: Arc::new(LocalChannel { client_id: a, tx: a_tx }),
                inbound: a_rx,
            },
            LocalEndpoint {
                channel: Arc::new(LocalChannel { client_id: b, tx: b_tx }),
                inbound: b_rx,
            },
        )
    }
}

impl MsgChannel for LocalChannel {
    fn client_id(&self) -> ClientId {
        self.client_id
    }

    fn forward(&self, message: &MessageBuffer) -> Result<(), SessionError> {
        self.tx.try_send(message.clone()).map_err(map_send_error)
    }
}

/// Stream transport framing messages over a TCP connection
#[derive(Debug)]
pub struct TcpChannel {
    client_id: ClientId,
    tx: mpsc::Sender<Bytes>,
}

impl TcpChannel {
    /// Start the reader and writer tasks for `stream`.
    ///
    /// Returns the outbound channel and the stream of decoded inbound
    /// messages; the latter ends when the connection closes.
    pub fn spawn(
        stream: TcpStream,
        client_id: ClientId,
        capacity: usize,
    ) -> (Arc<TcpChannel>, mpsc::Receiver<MessageBuffer>) {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }

        let (read_half, write_half) = stream.into_split();
        let (out_tx, out_rx) = mpsc::channel(capacity.max(1));
        let (in_tx, in_rx) = mpsc::channel(capacity.max(1));

        let writer_peer = peer.clone();
        tokio::spawn(async move {
            if let Err(e) = write_loop(write_half, out_rx).await {
                warn!("Writer for {} stopped: {:#}", writer_peer, e);
            }
        });
        tokio::spawn(async move {
            match read_loop(read_half, in_tx).await {
                Ok(()) => info!("Connection to {} closed", peer),
                Err(e) => warn!("Reader for {} stopped: {:#}", peer, e),
            }
        });

        (Arc::new(TcpChannel { client_id, tx: out_tx }), in_rx)
    }
}

impl MsgChannel for TcpChannel {
    fn client_id(&self) -> ClientId {
        self.client_id
    }

    fn forward(&self, message: &MessageBuffer) -> Result<(), SessionError> {
        self.tx.try_send(message.to_bytes()).map_err(map_send_error)
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<Bytes>) -> anyhow::Result<()> {
    while let Some(bytes) = rx.recv().await {
        writer.write_all(&bytes).await.context("failed to write message")?;
    }
    writer.shutdown().await.context("failed to shut down writer")?;
    Ok(())
}

async fn read_loop(mut reader: OwnedReadHalf, tx: mpsc::Sender<MessageBuffer>) -> anyhow::Result<()> {
    let mut decoder = MessageDecoder::new();
    let mut buf = BytesMut::with_capacity(8 * 1024);

    loop {
        while let Some(message) = decoder.decode(&mut buf).context("malformed message")? {
            if tx.send(message).await.is_err() {
                // Nobody is dispatching anymore
                return Ok(());
            }
        }

        let n = reader.read_buf(&mut buf).await.context("failed to read")?;
        if n == 0 {
            return Ok(());
        }
    }
}

/// Feed inbound messages into `manager` until the transport closes, then
/// report every client seen on it as disconnected.
pub async fn dispatch_inbound(mut inbound: mpsc::Receiver<MessageBuffer>, manager: Arc<SessionManager>) {
    let mut remotes = BTreeSet::new();

    while let Some(message) = inbound.recv().await {
        remotes.insert(message.header.src_client_id);
        manager.handle_received_session_message(&message);
    }

    for client_id in remotes {
        debug!("Transport to client {} closed", client_id);
        manager.handle_client_disconnection(client_id);
    }
}
