//! The server reactor.
//!
//! One event loop owns every piece of mutable server state — mesh, sessions,
//! observers — so no handler ever races another and no locking is needed.
//! Socket I/O lives in per-connection tasks that feed decoded lines into the
//! loop's event queue and drain per-connection output queues; a 1-second
//! interval drives cache rotation and observer ticks.
//!
//! [`ServerState::handle_event`] is deliberately synchronous: the tests
//! drive whole multi-server meshes through it over channel-backed links
//! without opening a socket.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use crate::client::{self, ClientHandle, ClientSession, SessionId};
use crate::config::ServerConfig;
use crate::mesh::{LinkId, Mesh, PeerLink};
use crate::plane::{self, login::Login, topology::Topology, who::Who};

/// Everything the reactor loop feeds the state machine.
#[derive(Debug)]
pub enum Event {
    ClientOpen { handle: ClientHandle },
    ClientLine { session: SessionId, line: String },
    ClientClosed { session: SessionId },
    PeerOpen { link: PeerLink },
    PeerLine { link: LinkId, line: String },
    PeerClosed { link: LinkId },
}

/// Side effects the state machine asks the I/O driver to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoAction {
    /// Open a listening socket that accepts peer links.
    PeerListen { host: String, port: u16 },
    /// Dial out to a peer's listening socket. A refused connection is
    /// logged and forgotten; no link ever registers.
    PeerConnect { host: String, port: u16 },
}

/// All mutable state of one server, confined to the reactor loop.
pub struct ServerState {
    pub auth: bool,
    pub mesh: Mesh,
    pub sessions: HashMap<SessionId, ClientSession>,
    /// Sessions registered as speakers: login complete (or an open server).
    pub speakers: BTreeSet<SessionId>,
    pub topology: Topology,
    pub who: Who,
    pub login: Login,
}

impl ServerState {
    pub fn new(peer_id: String, auth: bool, now: Instant) -> Self {
        Self {
            auth,
            topology: Topology::new(&peer_id),
            mesh: Mesh::new(peer_id, now),
            sessions: HashMap::new(),
            speakers: BTreeSet::new(),
            who: Who::new(now),
            login: Login::new(now),
        }
    }

    pub fn handle_event(&mut self, event: Event, now: Instant) -> Vec<IoAction> {
        match event {
            Event::ClientOpen { handle } => {
                client::on_connect(self, handle, now);
                Vec::new()
            }
            Event::ClientLine { session, line } => client::on_line(self, session, &line, now),
            Event::ClientClosed { session } => {
                client::on_disconnect(self, session);
                Vec::new()
            }
            Event::PeerOpen { link } => {
                let id = link.id();
                self.mesh.register(link);
                plane::peer_added(self, id, now);
                Vec::new()
            }
            Event::PeerLine { link, line } => {
                if let Some(frame) = self.mesh.receive(link, &line) {
                    plane::demux(
                        self,
                        Some(link),
                        frame.source,
                        frame.message_id,
                        frame.body,
                        now,
                    );
                }
                self.mesh.maybe_rotate(now);
                Vec::new()
            }
            Event::PeerClosed { link } => {
                if self.mesh.unregister(link).is_some() {
                    plane::peer_removed(self, link, now);
                }
                Vec::new()
            }
        }
    }

    /// Reactor tick, roughly once per second.
    pub fn tick(&mut self, now: Instant) {
        self.mesh.maybe_rotate(now);
        plane::tick(self, now);
    }

    /// Emit a line to every registered speaker.
    pub fn tell_speakers(&self, message: &str, exclude: Option<SessionId>) {
        for id in &self.speakers {
            if Some(*id) == exclude {
                continue;
            }
            if let Some(session) = self.sessions.get(id) {
                session.send_line(message);
            }
        }
    }

    /// Display names of the local speakers, for WHO responses.
    pub fn speaker_names(&self) -> Vec<String> {
        self.speakers
            .iter()
            .filter_map(|id| self.sessions.get(id))
            .map(|session| session.name.clone())
            .collect()
    }

    pub fn find_speaker(&self, name: &str) -> Option<SessionId> {
        self.speakers
            .iter()
            .copied()
            .find(|id| self.sessions.get(id).is_some_and(|s| s.name == name))
    }

    /// Begin closing a session. The session stays in the map, discarding
    /// input, until its connection task reports the socket closed.
    pub fn close_session(&mut self, id: SessionId) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.state = client::SessionState::Closing;
            session.handle.close();
        }
    }
}

/// A 20-hex-char peer id from 10 random bytes.
pub fn random_peer_id() -> String {
    let bytes: [u8; 10] = rand::random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// The running server: a bound client listener plus the reactor loop.
pub struct Server {
    config: ServerConfig,
    peer_id: String,
    listener: TcpListener,
}

impl Server {
    /// Bind the client listener. Split from [`run`](Self::run) so callers
    /// can learn the bound address when the configured port is 0.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let peer_id = config.id.clone().unwrap_or_else(random_peer_id);
        let listener = TcpListener::bind((config.host.as_str(), config.port))
            .await
            .with_context(|| format!("binding {}:{}", config.host, config.port))?;
        tracing::info!(%peer_id, addr = %listener.local_addr()?, "talker listening for clients");
        Ok(Self {
            config,
            peer_id,
            listener,
        })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub async fn run(self) -> Result<()> {
        let Server {
            config,
            peer_id,
            listener,
        } = self;
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let ids = Arc::new(AtomicU64::new(1));

        // Client accept loop.
        {
            let event_tx = event_tx.clone();
            let ids = Arc::clone(&ids);
            tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, _)) => spawn_client(stream, &ids, &event_tx),
                        Err(error) => {
                            tracing::warn!(%error, "client accept failed");
                            break;
                        }
                    }
                }
            });
        }

        let mut state = ServerState::new(peer_id, config.auth, Instant::now());
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => state.tick(Instant::now()),
                event = event_rx.recv() => {
                    let Some(event) = event else { break };
                    for action in state.handle_event(event, Instant::now()) {
                        execute(action, &ids, &event_tx);
                    }
                }
            }
        }
        Ok(())
    }
}

fn execute(action: IoAction, ids: &Arc<AtomicU64>, event_tx: &mpsc::UnboundedSender<Event>) {
    match action {
        IoAction::PeerListen { host, port } => {
            let ids = Arc::clone(ids);
            let event_tx = event_tx.clone();
            tokio::spawn(async move {
                let listener = match TcpListener::bind((host.as_str(), port)).await {
                    Ok(listener) => listener,
                    Err(error) => {
                        tracing::warn!(%host, port, %error, "peer listen failed");
                        return;
                    }
                };
                tracing::info!(%host, port, "listening for peers");
                loop {
                    match listener.accept().await {
                        Ok((stream, remote)) => {
                            spawn_peer(stream, remote.to_string(), &ids, &event_tx);
                        }
                        Err(error) => {
                            tracing::warn!(%error, "peer accept failed");
                            break;
                        }
                    }
                }
            });
        }
        IoAction::PeerConnect { host, port } => {
            let ids = Arc::clone(ids);
            let event_tx = event_tx.clone();
            tokio::spawn(async move {
                match TcpStream::connect((host.as_str(), port)).await {
                    Ok(stream) => spawn_peer(stream, format!("{host}:{port}"), &ids, &event_tx),
                    Err(error) => tracing::warn!(%host, port, %error, "peer connect failed"),
                }
            });
        }
    }
}

#[derive(Clone, Copy)]
enum ConnKind {
    Client(SessionId),
    Peer(LinkId),
}

fn spawn_client(stream: TcpStream, ids: &Arc<AtomicU64>, event_tx: &mpsc::UnboundedSender<Event>) {
    let id = SessionId(ids.fetch_add(1, Ordering::Relaxed));
    let addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = ClientHandle::new(id, addr, out_tx, shutdown_tx);
    let _ = event_tx.send(Event::ClientOpen { handle });
    tokio::spawn(connection_io(
        stream,
        ConnKind::Client(id),
        out_rx,
        shutdown_rx,
        event_tx.clone(),
    ));
}

fn spawn_peer(
    stream: TcpStream,
    addr: String,
    ids: &Arc<AtomicU64>,
    event_tx: &mpsc::UnboundedSender<Event>,
) {
    let id = LinkId(ids.fetch_add(1, Ordering::Relaxed));
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let link = PeerLink::new(id, addr, out_tx, shutdown_tx);
    let _ = event_tx.send(Event::PeerOpen { link });
    tokio::spawn(connection_io(
        stream,
        ConnKind::Peer(id),
        out_rx,
        shutdown_rx,
        event_tx.clone(),
    ));
}

/// One task per socket, both directions: queued output is written as CRLF
/// lines, inbound lines are forwarded to the reactor, and a shutdown signal
/// (or the state machine dropping the handle) drains the queue and closes
/// the socket.
async fn connection_io(
    stream: TcpStream,
    kind: ConnKind,
    mut out_rx: mpsc::UnboundedReceiver<String>,
    mut shutdown_rx: watch::Receiver<bool>,
    event_tx: mpsc::UnboundedSender<Event>,
) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            queued = out_rx.recv() => {
                let Some(line) = queued else { break };
                if write_line(&mut writer, &line).await.is_err() {
                    break;
                }
            }
            read = lines.next_line() => {
                match read {
                    Ok(Some(line)) => {
                        let event = match kind {
                            ConnKind::Client(session) => Event::ClientLine { session, line },
                            ConnKind::Peer(link) => Event::PeerLine { link, line },
                        };
                        if event_tx.send(event).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(error) => {
                        tracing::debug!(%error, "connection read failed");
                        break;
                    }
                }
            }
        }
    }

    // Deliver anything still queued (final prompts, rejection notices)
    // before the socket goes away.
    while let Ok(line) = out_rx.try_recv() {
        if write_line(&mut writer, &line).await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;

    let event = match kind {
        ConnKind::Client(session) => Event::ClientClosed { session },
        ConnKind::Peer(link) => Event::PeerClosed { link },
    };
    let _ = event_tx.send(event);
}

async fn write_line(
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
    line: &str,
) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\r\n").await
}
