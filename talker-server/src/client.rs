//! Client sessions: the login state machine and slash-command handling.
//!
//! A session starts life as a bare connection. Without `--auth` it becomes
//! a speaker immediately, named after its socket address until `/nick`.
//! With `--auth` it walks the login states below, driven by line input and
//! by the CHECK_USER scatter resuming it, and only registers as a speaker
//! once greeted.
//!
//! Command failures never take the server down: they are caught and
//! reported inline to the session.

use std::fmt;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::plane::{self, login, speech, who};
use crate::server::{IoAction, ServerState};

/// Local identifier for one client session. Never reused within a server's
/// lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Handle to one client connection, mirroring [`crate::mesh::PeerLink`].
#[derive(Debug)]
pub struct ClientHandle {
    id: SessionId,
    addr: String,
    outgoing: mpsc::UnboundedSender<String>,
    shutdown: watch::Sender<bool>,
}

impl ClientHandle {
    pub fn new(
        id: SessionId,
        addr: String,
        outgoing: mpsc::UnboundedSender<String>,
        shutdown: watch::Sender<bool>,
    ) -> Self {
        Self {
            id,
            addr,
            outgoing,
            shutdown,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn send_line(&self, line: &str) {
        if self.outgoing.send(line.to_string()).is_err() {
            tracing::debug!(session = %self.id, "client write queue closed");
        }
    }

    /// Ask the connection task to drain queued output and close the socket.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for a username line.
    UserName,
    /// CHECK_USER scatter in flight; input is discarded until it resolves.
    CheckingUser,
    /// Known user; counting down password attempts.
    CheckPassword {
        username: String,
        digest: String,
        attempts: u8,
    },
    /// New user; waiting for a first password.
    NewPassword { username: String },
    /// Waiting for the password to be typed again.
    ConfirmPassword { username: String, digest: String },
    /// Logged in (or on an open server) and registered as a speaker.
    Active,
    /// Rejected; input is discarded while the socket drains shut.
    Closing,
}

pub struct ClientSession {
    pub handle: ClientHandle,
    /// Display name: the socket address until login or `/nick` changes it.
    pub name: String,
    pub state: SessionState,
}

impl ClientSession {
    pub fn send_line(&self, line: &str) {
        self.handle.send_line(line);
    }
}

#[derive(Debug, Error)]
enum CommandError {
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("bad port {0:?}")]
    BadPort(String),
    #[error("no such user: {0}")]
    NoSuchUser(String),
}

fn send_to(state: &ServerState, id: SessionId, line: &str) {
    if let Some(session) = state.sessions.get(&id) {
        session.send_line(line);
    }
}

pub fn on_connect(state: &mut ServerState, handle: ClientHandle, _now: Instant) {
    let id = handle.id();
    let addr = handle.addr.clone();
    tracing::info!(session = %id, %addr, "new client connection");

    if state.auth {
        handle.send_line(&format!("Enter your username, {addr}:"));
        state.sessions.insert(
            id,
            ClientSession {
                handle,
                name: addr,
                state: SessionState::UserName,
            },
        );
    } else {
        handle.send_line(&format!("Welcome, {addr}"));
        state.sessions.insert(
            id,
            ClientSession {
                handle,
                name: addr.clone(),
                state: SessionState::Active,
            },
        );
        state.speakers.insert(id);
        state.tell_speakers(&format!("{addr} has joined"), None);
    }
}

pub fn on_disconnect(state: &mut ServerState, id: SessionId) {
    let Some(session) = state.sessions.remove(&id) else {
        return;
    };
    tracing::info!(session = %id, name = %session.name, "client connection closed");
    if state.speakers.remove(&id) {
        state.tell_speakers(&format!("{} has left", session.name), None);
    }
}

pub fn on_line(state: &mut ServerState, id: SessionId, line: &str, now: Instant) -> Vec<IoAction> {
    let Some(session) = state.sessions.get_mut(&id) else {
        return Vec::new();
    };

    match session.state.clone() {
        SessionState::UserName => {
            username_entered(state, id, line.trim(), now);
            Vec::new()
        }
        SessionState::CheckingUser | SessionState::Closing => Vec::new(),
        SessionState::CheckPassword {
            username,
            digest,
            attempts,
        } => {
            if login::digest(line) == digest {
                greet(state, id, &username);
            } else if attempts > 1 {
                session.state = SessionState::CheckPassword {
                    username,
                    digest,
                    attempts: attempts - 1,
                };
                session.send_line("Enter password:");
            } else {
                reject(state, id, "Incorrect password.");
            }
            Vec::new()
        }
        SessionState::NewPassword { username } => {
            session.state = SessionState::ConfirmPassword {
                username,
                digest: login::digest(line),
            };
            session.send_line("Confirm your password:");
            Vec::new()
        }
        SessionState::ConfirmPassword { username, digest } => {
            if login::digest(line) == digest {
                login::new_user(state, &username, &digest, now);
                greet(state, id, &username);
            } else {
                reject(state, id, "Passwords do not match.");
            }
            Vec::new()
        }
        SessionState::Active => {
            if line.starts_with('/') {
                handle_command(state, id, line, now)
            } else {
                let name = session.name.clone();
                speech::say(state, &name, line, now);
                Vec::new()
            }
        }
    }
}

fn username_entered(state: &mut ServerState, id: SessionId, username: &str, now: Instant) {
    let Some(session) = state.sessions.get_mut(&id) else {
        return;
    };
    if username.is_empty() || !username.chars().all(|c| c.is_ascii_alphanumeric()) {
        session.send_line("Usernames must be alphanumeric. Try again:");
        return;
    }
    session.state = SessionState::CheckingUser;
    let username = username.to_string();
    login::check_user(state, id, &username, now);
}

/// The CHECK_USER scatter found an existing record.
pub fn have_username(state: &mut ServerState, id: SessionId, username: String, digest: String) {
    let Some(session) = state.sessions.get_mut(&id) else {
        return;
    };
    if session.state != SessionState::CheckingUser {
        return;
    }
    session.state = SessionState::CheckPassword {
        username,
        digest,
        attempts: 3,
    };
    session.send_line("Enter password:");
}

/// The CHECK_USER scatter came back empty: a new user.
pub fn no_username(state: &mut ServerState, id: SessionId, username: String) {
    let Some(session) = state.sessions.get_mut(&id) else {
        return;
    };
    if session.state != SessionState::CheckingUser {
        return;
    }
    session.state = SessionState::NewPassword { username };
    session.send_line("A new user! Enter your password:");
}

fn greet(state: &mut ServerState, id: SessionId, username: &str) {
    let Some(session) = state.sessions.get_mut(&id) else {
        return;
    };
    session.name = username.to_string();
    session.state = SessionState::Active;
    session.send_line(&format!("Welcome, {username}"));
    state.speakers.insert(id);
    state.tell_speakers(&format!("{username} has joined"), None);
}

fn reject(state: &mut ServerState, id: SessionId, message: &str) {
    if let Some(session) = state.sessions.get_mut(&id) {
        session.send_line(message);
        session.state = SessionState::Closing;
        session.handle.close();
    }
}

fn handle_command(state: &mut ServerState, id: SessionId, line: &str, now: Instant) -> Vec<IoAction> {
    let mut words = line.split_whitespace();
    let command = words.next().unwrap_or(line);
    let args: Vec<&str> = words.collect();

    let result = match command {
        "/help" => cmd_help(state, id),
        "/quit" => {
            state.close_session(id);
            Ok(Vec::new())
        }
        "/who" => {
            who::request(state, id, now);
            Ok(Vec::new())
        }
        "/nick" => cmd_nick(state, id, &args),
        "/tell" => cmd_tell(state, id, &args),
        "/kill" => cmd_kill(state, &args),
        "/peers" => cmd_peers(state, id),
        "/peer-listen" => parse_endpoint(&args, "/peer-listen HOST PORT")
            .map(|(host, port)| vec![IoAction::PeerListen { host, port }]),
        "/peer-connect" => parse_endpoint(&args, "/peer-connect HOST PORT")
            .map(|(host, port)| vec![IoAction::PeerConnect { host, port }]),
        "/peer-kill" => cmd_peer_kill(state, id, &args),
        "/broadcast" => cmd_broadcast(state, &args, now),
        "/reachable" => cmd_reachable(state, id),
        _ => {
            send_to(state, id, &format!("Unknown command: {command}"));
            Ok(Vec::new())
        }
    };

    match result {
        Ok(actions) => actions,
        Err(error) => {
            send_to(
                state,
                id,
                &format!("Something went wrong trying to do that: {error}"),
            );
            Vec::new()
        }
    }
}

const HELP: &[&str] = &[
    "Available commands:",
    "  /help                    this listing",
    "  /quit                    disconnect",
    "  /who                     list users on every reachable server",
    "  /nick NAME               change your display name",
    "  /tell NAME TEXT...       whisper to a local user",
    "  /kill NAME               disconnect a local user",
    "  /peers                   list directly-connected peer links",
    "  /peer-listen HOST PORT   accept peer connections on HOST:PORT",
    "  /peer-connect HOST PORT  link this server to another",
    "  /peer-kill HOST PORT     drop the link dialled to HOST:PORT",
    "  /broadcast TEXT...       flood a raw line across the mesh",
    "  /reachable               list every reachable server id",
];

fn cmd_help(state: &ServerState, id: SessionId) -> Result<Vec<IoAction>, CommandError> {
    for line in HELP {
        send_to(state, id, line);
    }
    Ok(Vec::new())
}

fn cmd_nick(
    state: &mut ServerState,
    id: SessionId,
    args: &[&str],
) -> Result<Vec<IoAction>, CommandError> {
    let [name] = args else {
        return Err(CommandError::Usage("/nick NAME"));
    };
    if let Some(session) = state.sessions.get_mut(&id) {
        session.name = name.to_string();
    }
    Ok(Vec::new())
}

fn cmd_tell(
    state: &mut ServerState,
    id: SessionId,
    args: &[&str],
) -> Result<Vec<IoAction>, CommandError> {
    let [name, text @ ..] = args else {
        return Err(CommandError::Usage("/tell NAME TEXT..."));
    };
    if text.is_empty() {
        return Err(CommandError::Usage("/tell NAME TEXT..."));
    }
    let target = state
        .find_speaker(name)
        .ok_or_else(|| CommandError::NoSuchUser(name.to_string()))?;
    let from = state
        .sessions
        .get(&id)
        .map(|session| session.name.clone())
        .unwrap_or_default();
    send_to(
        state,
        target,
        &format!("{from} tells you: {}", text.join(" ")),
    );
    Ok(Vec::new())
}

fn cmd_kill(state: &mut ServerState, args: &[&str]) -> Result<Vec<IoAction>, CommandError> {
    let [name] = args else {
        return Err(CommandError::Usage("/kill NAME"));
    };
    let target = state
        .find_speaker(name)
        .ok_or_else(|| CommandError::NoSuchUser(name.to_string()))?;
    state.close_session(target);
    Ok(Vec::new())
}

fn cmd_peers(state: &ServerState, id: SessionId) -> Result<Vec<IoAction>, CommandError> {
    send_to(
        state,
        id,
        &format!(
            "There are {} peers directly connected",
            state.mesh.peer_count()
        ),
    );
    for link in state.mesh.links() {
        send_to(state, id, &format!("Peer({})", link.addr()));
    }
    Ok(Vec::new())
}

fn cmd_peer_kill(
    state: &mut ServerState,
    id: SessionId,
    args: &[&str],
) -> Result<Vec<IoAction>, CommandError> {
    let (host, port) = parse_endpoint(args, "/peer-kill HOST PORT")?;
    let addr = format!("{host}:{port}");
    for link in state.mesh.links() {
        if link.addr() == addr {
            send_to(state, id, &format!("Shutting down Peer({addr})"));
            link.close();
        }
    }
    Ok(Vec::new())
}

fn cmd_broadcast(
    state: &mut ServerState,
    args: &[&str],
    now: Instant,
) -> Result<Vec<IoAction>, CommandError> {
    let body = args.join(" ");
    tracing::info!(%body, "flooding raw broadcast");
    let message_id = state.mesh.broadcast(&body);
    let source = state.mesh.peer_id().to_string();
    plane::demux(state, None, &source, message_id, &body, now);
    Ok(Vec::new())
}

fn cmd_reachable(state: &ServerState, id: SessionId) -> Result<Vec<IoAction>, CommandError> {
    let mut reachable: Vec<String> = state.topology.reachable().into_iter().collect();
    reachable.sort_unstable();
    send_to(
        state,
        id,
        &format!("There are {} reachable peers:", reachable.len()),
    );
    for node in reachable {
        send_to(state, id, &node);
    }
    Ok(Vec::new())
}

fn parse_endpoint(args: &[&str], usage: &'static str) -> Result<(String, u16), CommandError> {
    let [host, port] = args else {
        return Err(CommandError::Usage(usage));
    };
    let port = port
        .parse()
        .map_err(|_| CommandError::BadPort(port.to_string()))?;
    Ok((host.to_string(), port))
}
