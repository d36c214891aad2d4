//! The distributed `/who` roster.
//!
//! `WHO` scatters a roster request; every server answers with its local
//! speaker names joined by `;`. The originator renders one consolidated
//! listing to the asking session once every reachable server has answered,
//! or with whatever arrived when the request times out.

use std::time::Instant;

use crate::client::SessionId;
use crate::mesh::LinkId;
use crate::server::ServerState;

use super::scatter::{self, Outcome, Responses, ScatterGather};
use super::split_method;

pub const NAME: &str = "Who";
const WHO: &str = "WHO";

/// Continuation for an in-flight roster request.
#[derive(Debug)]
pub struct PendingWho {
    session: SessionId,
}

#[derive(Debug)]
pub struct Who {
    requests: ScatterGather<PendingWho>,
}

impl Who {
    pub fn new(now: Instant) -> Self {
        Self {
            requests: ScatterGather::new(now),
        }
    }
}

/// Client command entry point: ask every reachable server for its speakers.
pub fn request(state: &mut ServerState, session: SessionId, now: Instant) {
    let request_id = state.who.requests.begin(PendingWho { session });
    super::broadcast(
        state,
        NAME,
        WHO,
        &scatter::request_payload(request_id, ""),
        now,
    );
}

pub fn notify(
    state: &mut ServerState,
    _from: Option<LinkId>,
    source: &str,
    _message_id: u64,
    payload: &str,
    now: Instant,
) {
    let (method, args) = split_method(payload);
    match method {
        WHO => {
            let (request_id, _) = match scatter::parse_request(args) {
                Ok(request) => request,
                Err(error) => {
                    tracing::warn!(%source, %error, "malformed WHO request");
                    return;
                }
            };
            let roster = state.speaker_names().join(";");
            super::broadcast(
                state,
                NAME,
                scatter::GATHER,
                &scatter::response_payload(source, request_id, &roster),
                now,
            );
        }
        scatter::GATHER => {
            let reachable = state.topology.reachable();
            let self_id = state.mesh.peer_id().to_string();
            match state
                .who
                .requests
                .recv_gather(&self_id, source, args, &reachable, now)
            {
                Ok(outcome) => finish(state, outcome),
                Err(error) => tracing::warn!(%source, %error, "malformed WHO response"),
            }
        }
        _ => tracing::warn!(%source, method, "unknown who method"),
    }
}

pub fn tick(state: &mut ServerState, now: Instant) {
    let expired = state.who.requests.tick(now);
    for (pending, responses) in expired {
        render(state, pending, responses);
    }
}

fn finish(state: &mut ServerState, outcome: Outcome<PendingWho>) {
    if let Some((pending, responses)) = outcome.completed {
        render(state, pending, responses);
    }
    for (pending, responses) in outcome.expired {
        render(state, pending, responses);
    }
}

fn render(state: &mut ServerState, pending: PendingWho, responses: Responses) {
    // The asking session may have disconnected mid-request.
    let Some(session) = state.sessions.get(&pending.session) else {
        return;
    };

    let rosters: Vec<(&String, Vec<&str>)> = responses
        .iter()
        .map(|(server, roster)| {
            let mut names: Vec<&str> = if roster.is_empty() {
                Vec::new()
            } else {
                roster.split(';').collect()
            };
            names.sort_unstable();
            (server, names)
        })
        .collect();
    let count: usize = rosters.iter().map(|(_, names)| names.len()).sum();

    if rosters.len() <= 1 {
        session.send_line(&format!("There are {count} users online:"));
        for (_, names) in &rosters {
            for name in names {
                session.send_line(name);
            }
        }
    } else {
        session.send_line(&format!(
            "There are {count} users online on {} servers:",
            rosters.len()
        ));
        for (server, names) in &rosters {
            session.send_line(&format!("  Server: {server}"));
            for name in names {
                session.send_line(&format!("    {name}"));
            }
        }
    }
}
