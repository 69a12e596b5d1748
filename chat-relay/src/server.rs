use std::{
    future::Future,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncBufRead, AsyncWrite, BufReader},
    net::{TcpListener, TcpStream},
    select,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

use crate::{
    config::RelayConfig,
    dispatcher::Dispatcher,
    greeting::greet,
    message::{ClientToServer, read_message},
    registry::Registry,
    session::{Session, SessionId, SessionState},
};

pub struct RelayServer {
    listener: TcpListener,
    state: Arc<RelayState>,
}

impl RelayServer {
    pub fn new(listener: TcpListener, config: RelayConfig) -> Self {
        Self {
            listener,
            state: Arc::new(RelayState::new(config)),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Shared membership of this server, mostly useful for observing it.
    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.state.registry)
    }

    /// Serves connections until `shutdown` resolves, then closes every live
    /// session and waits for their handlers to finish.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let RelayServer { listener, state } = self;
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => break,
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state, &cancel, &tracker);
                }
            }
        }

        drop(listener);
        info!(sessions = state.registry.len(), "relay shutting down");
        cancel.cancel();
        tracker.close();
        tracker.wait().await;
        info!("relay stopped");

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    state: &Arc<RelayState>,
    cancel: &CancellationToken,
    tracker: &TaskTracker,
) {
    match result {
        Ok((stream, peer)) => spawn_connection_handler(stream, peer, state, cancel, tracker),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection_handler(
    stream: TcpStream,
    peer: SocketAddr,
    state: &Arc<RelayState>,
    cancel: &CancellationToken,
    tracker: &TaskTracker,
) {
    let state = Arc::clone(state);
    let shutdown = cancel.child_token();
    tracker.spawn(async move {
        let (reader, writer) = stream.into_split();
        let reader = BufReader::new(reader);
        if let Err(err) = serve_session(reader, writer, Some(peer), &state, &shutdown).await {
            warn!(peer = %peer, error = ?err, "client connection closed with error");
        }
    });
}

struct RelayState {
    registry: Arc<Registry>,
    dispatcher: Dispatcher,
    config: RelayConfig,
    next_id: AtomicU64,
}

impl RelayState {
    fn new(config: RelayConfig) -> Self {
        let registry = Arc::new(Registry::new());
        Self {
            dispatcher: Dispatcher::new(Arc::clone(&registry)),
            registry,
            config,
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> SessionId {
        SessionId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

/// Drives one client from registration to teardown.
///
/// Membership is held by a guard for exactly the span of the receive loop,
/// so the session is unregistered on every way out of it.
async fn serve_session<R, W>(
    mut reader: R,
    writer: W,
    peer: Option<SocketAddr>,
    state: &RelayState,
    shutdown: &CancellationToken,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut session = Session::open(state.next_id(), peer, writer, &state.config);
    let membership = state.registry.join(session.handle());
    session.transition(SessionState::Active);
    info!(?peer, session = %session.id(), members = state.registry.len(), "client joined");

    let outcome = run_receive_loop(&session, &mut reader, state, shutdown).await;

    session.transition(SessionState::Closing);
    drop(membership);
    let id = session.id();
    session.close().await;
    info!(?peer, session = %id, members = state.registry.len(), "client disconnected");

    outcome
}

async fn run_receive_loop<R>(
    session: &Session,
    reader: &mut R,
    state: &RelayState,
    shutdown: &CancellationToken,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let received = select! {
            biased;
            _ = shutdown.cancelled() => {
                debug!(session = %session.id(), "closing session for shutdown");
                return Ok(());
            }
            _ = session.writer_stopped() => {
                anyhow::bail!("client stopped accepting messages");
            }
            received = read_message::<_, ClientToServer>(reader) => received,
        };

        match received.context("failed to receive from client")? {
            Some(ClientToServer::Chat(message)) => {
                debug!(session = %session.id(), sender = %message.sender, "received message");
                state.dispatcher.broadcast(message).await;
            }
            Some(ClientToServer::Join { display_name }) => {
                if let Err(error) = session.reply(greet(&display_name)).await {
                    debug!(session = %session.id(), %error, "failed to answer join");
                }
            }
            None => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{
        io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf, split},
        time::timeout,
    };

    use super::*;
    use crate::message::{ChatMessage, ServerToClient, write_message};

    const WAIT: Duration = Duration::from_secs(1);

    struct Peer {
        reader: BufReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
    }

    fn connect(
        state: &Arc<RelayState>,
        shutdown: &CancellationToken,
    ) -> (Peer, tokio::task::JoinHandle<Result<()>>) {
        connect_with_buffer(state, shutdown, 8192)
    }

    fn connect_with_buffer(
        state: &Arc<RelayState>,
        shutdown: &CancellationToken,
        buffer: usize,
    ) -> (Peer, tokio::task::JoinHandle<Result<()>>) {
        let (client, server) = tokio::io::duplex(buffer);
        let (server_read, server_write) = split(server);
        let (client_read, client_write) = split(client);
        let state = Arc::clone(state);
        let shutdown = shutdown.clone();
        let task = tokio::spawn(async move {
            serve_session(BufReader::new(server_read), server_write, None, &state, &shutdown).await
        });
        let peer = Peer {
            reader: BufReader::new(client_read),
            writer: client_write,
        };
        (peer, task)
    }

    async fn wait_for_members(state: &RelayState, expected: usize) {
        timeout(WAIT, async {
            while state.registry.len() != expected {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("registry never reached expected size");
    }

    async fn next_frame(peer: &mut Peer) -> Option<ServerToClient> {
        timeout(WAIT, read_message::<_, ServerToClient>(&mut peer.reader))
            .await
            .expect("timed out reading frame")
            .expect("read frame")
    }

    #[tokio::test]
    async fn join_is_answered_only_to_requester() {
        let state = Arc::new(RelayState::new(RelayConfig::default()));
        let shutdown = CancellationToken::new();
        let (mut alice, _a) = connect(&state, &shutdown);
        let (mut bob, _b) = connect(&state, &shutdown);
        wait_for_members(&state, 2).await;

        write_message(
            &mut alice.writer,
            &ClientToServer::Join {
                display_name: "alice".into(),
            },
        )
        .await
        .expect("send join");
        assert_eq!(next_frame(&mut alice).await, Some(greet("alice")));

        let chat = ChatMessage {
            sender: "bob".into(),
            text: "ping".into(),
            timestamp: 5,
        };
        write_message(&mut bob.writer, &ClientToServer::Chat(chat.clone()))
            .await
            .expect("send chat");
        // Bob's first frame is his own echo, not alice's greeting.
        assert_eq!(next_frame(&mut bob).await, Some(ServerToClient::Chat(chat)));
    }

    #[tokio::test]
    async fn clean_eof_unregisters_without_error() {
        let state = Arc::new(RelayState::new(RelayConfig::default()));
        let shutdown = CancellationToken::new();
        let (mut peer, task) = connect(&state, &shutdown);
        wait_for_members(&state, 1).await;

        peer.writer.shutdown().await.expect("shutdown");
        let outcome = timeout(WAIT, task).await.expect("handler finished").expect("join");
        assert!(outcome.is_ok());
        assert!(state.registry.is_empty());
    }

    #[tokio::test]
    async fn receive_error_unregisters_and_surfaces() {
        let state = Arc::new(RelayState::new(RelayConfig::default()));
        let shutdown = CancellationToken::new();
        let (mut peer, task) = connect(&state, &shutdown);
        let (_other, _o) = connect(&state, &shutdown);
        wait_for_members(&state, 2).await;

        peer.writer.write_all(b"{broken\n").await.expect("write");
        let outcome = timeout(WAIT, task).await.expect("handler finished").expect("join");
        assert!(outcome.is_err());
        assert_eq!(state.registry.len(), 1);
    }

    #[tokio::test]
    async fn cancellation_closes_the_client_channel() {
        let state = Arc::new(RelayState::new(RelayConfig::default()));
        let shutdown = CancellationToken::new();
        let (mut peer, task) = connect(&state, &shutdown);
        wait_for_members(&state, 1).await;

        shutdown.cancel();
        let outcome = timeout(WAIT, task).await.expect("handler finished").expect("join");
        assert!(outcome.is_ok());
        assert!(state.registry.is_empty());
        assert_eq!(next_frame(&mut peer).await, None);
    }

    #[tokio::test]
    async fn unresponsive_client_is_unregistered() {
        let state = Arc::new(RelayState::new(RelayConfig {
            outbound_capacity: RelayConfig::DEFAULT_OUTBOUND_CAPACITY,
            send_timeout: Duration::from_millis(30),
        }));
        let shutdown = CancellationToken::new();
        // Never reads, so its echo cannot fit through the 64-byte pipe.
        let (mut mute, task) = connect_with_buffer(&state, &shutdown, 64);
        let (mut other, _o) = connect(&state, &shutdown);
        wait_for_members(&state, 2).await;

        let chat = ChatMessage {
            sender: "mute".into(),
            text: "x".repeat(200),
            timestamp: 9,
        };
        write_message(&mut mute.writer, &ClientToServer::Chat(chat.clone()))
            .await
            .expect("send chat");
        assert_eq!(next_frame(&mut other).await, Some(ServerToClient::Chat(chat)));

        let outcome = timeout(WAIT, task).await.expect("handler finished").expect("join");
        assert!(outcome.is_err());
        assert_eq!(state.registry.len(), 1);

        let report = state
            .dispatcher
            .broadcast(ChatMessage {
                sender: "other".into(),
                text: "still here".into(),
                timestamp: 10,
            })
            .await;
        assert_eq!(report.failed, 0);
        assert_eq!(report.delivered, 1);
    }
}
