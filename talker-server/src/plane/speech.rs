//! Chat lines, flooded to every server.
//!
//! One method: `SAY`, payload `nick|text`. Every server — the speaker's own
//! included, via local delivery — renders the line to its local speakers, so
//! there is no separate echo path.

use std::time::Instant;

use crate::mesh::LinkId;
use crate::server::ServerState;

use super::split_method;

pub const NAME: &str = "Speech";
const SAY: &str = "SAY";

/// Flood one utterance across the mesh.
pub fn say(state: &mut ServerState, who: &str, what: &str, now: Instant) {
    super::broadcast(state, NAME, SAY, &format!("{who}|{what}"), now);
}

pub fn notify(
    state: &mut ServerState,
    _from: Option<LinkId>,
    source: &str,
    _message_id: u64,
    payload: &str,
    _now: Instant,
) {
    let (method, args) = split_method(payload);
    match method {
        SAY => {
            let Some((name, line)) = args.split_once('|') else {
                tracing::warn!(%source, "malformed SAY payload");
                return;
            };
            state.tell_speakers(&format!("{name}: {line}"), None);
        }
        _ => tracing::warn!(%source, method, "unknown speech method"),
    }
}
