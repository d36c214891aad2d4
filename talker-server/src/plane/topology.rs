//! Connectivity gossip and the reachability map.
//!
//! Two methods: `i-am`, sent directly down every freshly-registered link to
//! bind that link to the remote server's peer id, and `i-see`, a flooded
//! list of a server's directly-connected peer ids. Every server collates
//! `i-see` frames — versioned by their message id, newest wins — into a map
//! of who sees whom, and derives the reachability set as the closure from
//! itself. Entries that fall out of the closure are pruned; a dead server
//! disappears once every live neighbour has stopped listing it.
//!
//! Our own entry is refreshed through local delivery of the `i-see` frames
//! we originate, and can never be pruned because the closure starts there.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Instant;

use crate::mesh::LinkId;
use crate::server::ServerState;

use super::split_method;

pub const NAME: &str = "Topology";
const I_AM: &str = "i-am";
const I_SEE: &str = "i-see";

#[derive(Debug)]
pub struct Topology {
    /// Peer ids of directly-connected links, learned from `i-am`.
    direct: HashMap<LinkId, String>,
    /// peer id → (latest `i-see` version, that server's direct neighbours).
    map: HashMap<String, (u64, BTreeSet<String>)>,
}

impl Topology {
    pub fn new(self_id: &str) -> Self {
        let mut map = HashMap::new();
        map.insert(self_id.to_string(), (0, BTreeSet::new()));
        Self {
            direct: HashMap::new(),
            map,
        }
    }

    /// Every server id connected to us through zero or more hops.
    pub fn reachable(&self) -> HashSet<String> {
        self.map.keys().cloned().collect()
    }

    pub fn direct_id(&self, link: LinkId) -> Option<&str> {
        self.direct.get(&link).map(String::as_str)
    }

    fn direct_payload(&self) -> String {
        let ids: Vec<&str> = self.direct.values().map(String::as_str).collect();
        ids.join(";")
    }

    /// Recompute the closure from ourselves and prune everything outside it.
    fn recompute(&mut self, self_id: &str) {
        let mut closure: HashSet<String> = HashSet::new();
        let mut frontier: HashSet<String> = HashSet::from([self_id.to_string()]);
        while !frontier.is_empty() {
            closure.extend(frontier.iter().cloned());
            let mut next = HashSet::new();
            for node in &frontier {
                if let Some((_, neighbours)) = self.map.get(node) {
                    next.extend(neighbours.iter().cloned());
                }
            }
            next.retain(|node| !closure.contains(node));
            frontier = next;
        }
        self.map.retain(|id, _| closure.contains(id));
        tracing::debug!(reachable = self.map.len(), "topology recomputed");
    }
}

pub fn notify(
    state: &mut ServerState,
    from: Option<LinkId>,
    source: &str,
    message_id: u64,
    payload: &str,
    now: Instant,
) {
    let (method, args) = split_method(payload);
    match method {
        I_AM => recv_i_am(state, from, source, now),
        I_SEE => recv_i_see(state, source, message_id, args, now),
        _ => tracing::warn!(%source, method, "unknown topology method"),
    }
}

/// A new link joined the peer set: introduce ourselves on it.
pub fn peer_added(state: &mut ServerState, link: LinkId, _now: Instant) {
    super::unicast(state, link, NAME, I_AM, "");
}

/// A link left the peer set: forget its id and gossip the new edge set.
pub fn peer_removed(state: &mut ServerState, link: LinkId, now: Instant) {
    if state.topology.direct.remove(&link).is_some() {
        broadcast_neighbours(state, now);
    }
}

fn broadcast_neighbours(state: &mut ServerState, now: Instant) {
    let payload = state.topology.direct_payload();
    super::broadcast(state, NAME, I_SEE, &payload, now);
}

fn recv_i_am(state: &mut ServerState, from: Option<LinkId>, source: &str, now: Instant) {
    let Some(link) = from else {
        return;
    };
    tracing::info!(%link, peer = %source, "direct peer identified");
    state.topology.direct.insert(link, source.to_string());
    broadcast_neighbours(state, now);
}

fn recv_i_see(state: &mut ServerState, source: &str, version: u64, args: &str, now: Instant) {
    let neighbours: BTreeSet<String> = if args.is_empty() {
        BTreeSet::new()
    } else {
        args.split(';').map(str::to_string).collect()
    };
    let self_id = state.mesh.peer_id().to_string();

    match state.topology.map.get(source) {
        None => {
            tracing::info!(peer = %source, version, "new server appeared in gossip");
            state
                .topology
                .map
                .insert(source.to_string(), (version, neighbours));
            state.topology.recompute(&self_id);
            // A server we had never heard of joined; gossip our own edges so
            // it learns about us in turn.
            broadcast_neighbours(state, now);
        }
        Some(&(have, _)) if have < version => {
            let previous = state
                .topology
                .map
                .insert(source.to_string(), (version, neighbours.clone()));
            if previous.map(|(_, n)| n) != Some(neighbours) {
                state.topology.recompute(&self_id);
            }
        }
        Some(_) => {
            tracing::debug!(peer = %source, version, "stale i-see dropped");
        }
    }
}
