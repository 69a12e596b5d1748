use std::{fmt, net::SocketAddr, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::mpsc::{self, error::SendTimeoutError},
    task::JoinHandle,
    time::timeout,
};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, warn};

use crate::{
    config::RelayConfig,
    message::{ServerToClient, write_message},
};

pub type Frame = Arc<ServerToClient>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of a session. States only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    /// Channel accepted, not yet in the registry.
    Joining,
    /// Registered and receiving.
    Active,
    /// Receive loop ended; membership is being released.
    Closing,
    /// Unregistered and outbound writer finished.
    Closed,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("client outbound queue is closed")]
    Closed,
    #[error("client outbound queue stayed full for {0:?}")]
    TimedOut(Duration),
}

/// Cheap, cloneable send side of a session.
///
/// This is what the registry stores: it can push frames towards the client
/// but does not own the connection. Once the session's writer stops, every
/// delivery through a stale handle fails with [`DeliveryError::Closed`].
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    peer: Option<SocketAddr>,
    outbound: mpsc::Sender<Frame>,
    send_timeout: Duration,
}

impl SessionHandle {
    /// Creates a handle together with the receiving end of its outbound queue.
    pub fn with_queue(
        id: SessionId,
        peer: Option<SocketAddr>,
        config: &RelayConfig,
    ) -> (Self, mpsc::Receiver<Frame>) {
        let (outbound, rx) = mpsc::channel(config.outbound_capacity.max(1));
        let handle = Self {
            id,
            peer,
            outbound,
            send_timeout: config.send_timeout,
        };
        (handle, rx)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Queues a frame for this client, waiting at most the configured send
    /// timeout for room in the queue.
    pub async fn deliver(&self, frame: Frame) -> Result<(), DeliveryError> {
        self.outbound
            .send_timeout(frame, self.send_timeout)
            .await
            .map_err(|err| match err {
                SendTimeoutError::Timeout(_) => DeliveryError::TimedOut(self.send_timeout),
                SendTimeoutError::Closed(_) => DeliveryError::Closed,
            })
    }
}

/// Server-side state for one connected client.
///
/// Owned by the connection handler for the lifetime of the channel. The
/// outbound half of the connection is moved into a writer task that drains
/// the session's queue; it stops once every [`SessionHandle`] is gone or a
/// write fails or stalls.
pub struct Session {
    handle: SessionHandle,
    state: SessionState,
    writer: JoinHandle<()>,
    writer_stopped: CancellationToken,
}

impl Session {
    pub fn open<W>(id: SessionId, peer: Option<SocketAddr>, writer: W, config: &RelayConfig) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (handle, rx) = SessionHandle::with_queue(id, peer, config);
        let writer_stopped = CancellationToken::new();
        let writer = tokio::spawn(drain_outbound(
            id,
            rx,
            writer,
            config.send_timeout,
            writer_stopped.clone(),
        ));
        Self {
            handle,
            state: SessionState::Joining,
            writer,
            writer_stopped,
        }
    }

    pub fn id(&self) -> SessionId {
        self.handle.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Resolves once the outbound writer has exited. While the session is
    /// registered that only happens after a failed or stalled write.
    pub fn writer_stopped(&self) -> WaitForCancellationFuture<'_> {
        self.writer_stopped.cancelled()
    }

    pub fn transition(&mut self, next: SessionState) {
        debug_assert!(next > self.state, "{:?} -> {:?}", self.state, next);
        debug!(session = %self.handle.id, from = ?self.state, to = ?next, "session state change");
        self.state = next;
    }

    /// Sends a frame to this client only, bypassing the dispatcher.
    pub async fn reply(&self, frame: ServerToClient) -> Result<(), DeliveryError> {
        self.handle.deliver(Arc::new(frame)).await
    }

    /// Drops this session's own send handle and waits for the writer to
    /// flush what is queued and close the outbound half.
    ///
    /// Callers must release the registry membership first, otherwise the
    /// registry's handle keeps the writer alive.
    pub async fn close(self) -> SessionState {
        let Session {
            handle,
            state,
            writer,
            ..
        } = self;
        let id = handle.id;
        drop(handle);

        if let Err(err) = writer.await {
            warn!(session = %id, error = ?err, "session writer task failed");
        }
        debug!(session = %id, from = ?state, to = ?SessionState::Closed, "session state change");
        SessionState::Closed
    }
}

async fn drain_outbound<W>(
    id: SessionId,
    mut rx: mpsc::Receiver<Frame>,
    mut writer: W,
    send_timeout: Duration,
    stopped: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    let _stopped = stopped.drop_guard();
    while let Some(frame) = rx.recv().await {
        match timeout(send_timeout, write_message(&mut writer, frame.as_ref())).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(session = %id, error = ?err, "failed to write to client");
                return;
            }
            Err(_) => {
                warn!(session = %id, timeout = ?send_timeout, "client write stalled; dropping session writer");
                return;
            }
        }
    }

    if let Err(err) = writer.shutdown().await {
        debug!(session = %id, error = ?err, "failed to shut down client writer cleanly");
    }
}
