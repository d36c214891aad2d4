//! Flood-routed messaging between peer servers.
//!
//! The mesh owns the set of live peer links, originates frames on behalf of
//! the observers, and runs the receive algorithm on every inbound line:
//! duplicate suppression against a two-generation seen cache, verbatim
//! re-forwarding of broadcasts to every other link, then local demux.
//!
//! Duplicate suppression is a sliding window: the current generation
//! accumulates keys and the previous one is discarded every
//! [`MESSAGE_CACHE_EXPIRY`]. A broadcast replayed after a full expiry period
//! will be re-delivered; within the window it is dropped.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};

use crate::frame::{self, Frame};

/// Width of one seen-cache generation.
pub const MESSAGE_CACHE_EXPIRY: Duration = Duration::from_secs(1);

/// Local identifier for one live peer link. Ids are never reused within a
/// server's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

/// Handle to one live peer connection. Lines queued here are written by the
/// link's connection task; `shutdown` tears the socket down.
#[derive(Debug)]
pub struct PeerLink {
    id: LinkId,
    addr: String,
    outgoing: mpsc::UnboundedSender<String>,
    shutdown: watch::Sender<bool>,
}

impl PeerLink {
    pub fn new(
        id: LinkId,
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

    pub fn id(&self) -> LinkId {
        self.id
    }

    /// The dialled `host:port` for outgoing links, the remote socket
    /// address for accepted ones.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn send_line(&self, line: &str) {
        if self.outgoing.send(line.to_string()).is_err() {
            tracing::debug!(link = %self.id, "peer write queue closed");
        }
    }

    /// Ask the connection task to drain queued output and close the socket.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// The distributed event plane's routing core.
#[derive(Debug)]
pub struct Mesh {
    peer_id: String,
    peers: HashMap<LinkId, PeerLink>,
    message_id: u64,
    seen: [HashSet<(String, u64)>; 2],
    last_rotation: Instant,
}

impl Mesh {
    pub fn new(peer_id: String, now: Instant) -> Self {
        Self {
            peer_id,
            peers: HashMap::new(),
            message_id: 0,
            seen: [HashSet::new(), HashSet::new()],
            last_rotation: now,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn register(&mut self, link: PeerLink) {
        tracing::info!(link = %link.id, addr = %link.addr, "peer link added");
        self.peers.insert(link.id, link);
    }

    pub fn unregister(&mut self, id: LinkId) -> Option<PeerLink> {
        let link = self.peers.remove(&id);
        if let Some(link) = &link {
            tracing::info!(link = %id, addr = %link.addr, "peer link removed");
        }
        link
    }

    pub fn link(&self, id: LinkId) -> Option<&PeerLink> {
        self.peers.get(&id)
    }

    pub fn links(&self) -> impl Iterator<Item = &PeerLink> {
        self.peers.values()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Originate a flooded frame. Returns the message id so the caller can
    /// hand the same frame to local observers.
    pub fn broadcast(&mut self, body: &str) -> u64 {
        self.message_id += 1;
        let line = frame::format(&self.peer_id, self.message_id, body, true);
        self.propagate(&line, None);
        self.message_id
    }

    /// Send a direct frame on one link. Not delivered locally and never
    /// re-forwarded by the receiver.
    pub fn unicast(&mut self, link: LinkId, body: &str) {
        self.message_id += 1;
        let line = frame::format(&self.peer_id, self.message_id, body, false);
        match self.peers.get(&link) {
            Some(peer) => peer.send_line(&line),
            None => tracing::debug!(%link, "unicast to unknown link dropped"),
        }
    }

    fn propagate(&self, line: &str, exclude: Option<LinkId>) {
        for peer in self.peers.values() {
            if Some(peer.id) != exclude {
                peer.send_line(line);
            }
        }
    }

    /// Run the receive algorithm on one inbound line. Returns the frame for
    /// local demux, or `None` if the line was malformed, our own frame come
    /// back around, or a duplicate within the seen window. Broadcasts are
    /// re-forwarded verbatim to every link except the arrival one.
    pub fn receive<'a>(&mut self, from: LinkId, line: &'a str) -> Option<Frame<'a>> {
        let frame = match frame::parse(line) {
            Ok(frame) => frame,
            Err(error) => {
                tracing::warn!(link = %from, %error, line, "dropping malformed peer line");
                return None;
            }
        };

        if frame.source == self.peer_id {
            // Our own frame completed a cycle; it was handled at origination.
            return None;
        }

        if frame.broadcast {
            let key = (frame.source.to_string(), frame.message_id);
            if self.seen.iter().any(|generation| generation.contains(&key)) {
                tracing::debug!(source = %frame.source, id = frame.message_id, "duplicate broadcast dropped");
                return None;
            }
            self.seen[0].insert(key);
            self.propagate(line, Some(from));
        }

        Some(frame)
    }

    /// Discard the older seen generation once per expiry interval. Invoked
    /// after every processed line and on every reactor tick.
    pub fn maybe_rotate(&mut self, now: Instant) {
        if now.duration_since(self.last_rotation) >= MESSAGE_CACHE_EXPIRY {
            self.seen.swap(0, 1);
            self.seen[0].clear();
            self.last_rotation = now;
        }
    }
}
