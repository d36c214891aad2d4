//! The observers of the distributed event plane.
//!
//! Each feature of the plane is an observer bound to the mesh under a fixed
//! name — the first field of a frame body. Within an observer the payload
//! leads with a method name, so a full broadcast body reads
//! `Observer|METHOD|args`. The registry is the closed dispatch below:
//! frames naming anything else are dropped with a warning, as are unknown
//! methods inside each observer.
//!
//! Observers receive `peer_added`/`peer_removed` transitions and a
//! once-per-second tick in addition to frame notifications; only the
//! observers that keep per-peer or time-bounded state implement them.

pub mod login;
pub mod scatter;
pub mod speech;
pub mod topology;
pub mod who;

use std::time::Instant;

use crate::frame;
use crate::mesh::LinkId;
use crate::server::ServerState;

/// Split an observer payload into `(method, args)`.
pub fn split_method(payload: &str) -> (&str, &str) {
    match payload.split_once('|') {
        Some((method, args)) => (method, args),
        None => (payload, ""),
    }
}

/// Deliver a frame body to the observer it names. `from` is the link the
/// frame arrived on; `None` marks locally-originated frames.
pub fn demux(
    state: &mut ServerState,
    from: Option<LinkId>,
    source: &str,
    message_id: u64,
    body: &str,
    now: Instant,
) {
    let (target, payload) = frame::split_target(body);
    match target {
        topology::NAME => topology::notify(state, from, source, message_id, payload, now),
        speech::NAME => speech::notify(state, from, source, message_id, payload, now),
        who::NAME => who::notify(state, from, source, message_id, payload, now),
        login::NAME => login::notify(state, from, source, message_id, payload, now),
        _ => {
            tracing::warn!(%source, message_id, target, "dropping frame for unknown observer");
        }
    }
}

/// Originate a flooded frame under `observer` and deliver it to the local
/// observer as well, as if received from a null link.
pub fn broadcast(state: &mut ServerState, observer: &str, method: &str, payload: &str, now: Instant) {
    let body = format!("{observer}|{method}|{payload}");
    let message_id = state.mesh.broadcast(&body);
    let source = state.mesh.peer_id().to_string();
    demux(state, None, &source, message_id, &body, now);
}

/// Send a direct frame under `observer` on one link. No local delivery.
pub fn unicast(state: &mut ServerState, link: LinkId, observer: &str, method: &str, payload: &str) {
    let body = format!("{observer}|{method}|{payload}");
    state.mesh.unicast(link, &body);
}

/// A handshake-complete link joined the peer set.
pub fn peer_added(state: &mut ServerState, link: LinkId, now: Instant) {
    topology::peer_added(state, link, now);
}

/// A link left the peer set (socket closed or errored).
pub fn peer_removed(state: &mut ServerState, link: LinkId, now: Instant) {
    topology::peer_removed(state, link, now);
}

/// Reactor tick, roughly once per second.
pub fn tick(state: &mut ServerState, now: Instant) {
    who::tick(state, now);
    login::tick(state, now);
}
