//! Replicated account records and the username lookup scatter.
//!
//! `CHECK_USER` scatters a username; servers that know it answer
//! `timestamp;username;digest`, everyone else answers empty. The originator
//! keeps the freshest record (or concludes the user is new) and resumes the
//! asking session's login state machine. `NEW_USER` floods a freshly
//! created record so every server can answer future lookups; newer
//! timestamps win on merge.
//!
//! Only password digests travel the wire or sit in the account map, never
//! cleartext.

use std::collections::HashMap;
use std::time::Instant;

use sha2::{Digest, Sha256};

use crate::client::{self, SessionId};
use crate::mesh::LinkId;
use crate::server::ServerState;

use super::scatter::{self, Outcome, Responses, ScatterGather};
use super::split_method;

pub const NAME: &str = "Login";
const CHECK_USER: &str = "CHECK_USER";
const NEW_USER: &str = "NEW_USER";

/// Hex digest stored and replicated in place of the password.
pub fn digest(password: &str) -> String {
    Sha256::digest(password.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// One replicated account record.
#[derive(Debug, Clone)]
pub struct Account {
    /// Creation time in unix milliseconds; newest wins on merge.
    pub timestamp: i64,
    /// Hex sha-256 of the password.
    pub digest: String,
}

/// Continuation for an in-flight username lookup.
#[derive(Debug)]
pub struct PendingCheck {
    session: SessionId,
    username: String,
}

#[derive(Debug)]
pub struct Login {
    accounts: HashMap<String, Account>,
    requests: ScatterGather<PendingCheck>,
}

impl Login {
    pub fn new(now: Instant) -> Self {
        Self {
            accounts: HashMap::new(),
            requests: ScatterGather::new(now),
        }
    }

    pub fn account(&self, username: &str) -> Option<&Account> {
        self.accounts.get(username)
    }

    /// Keep the record with the newest timestamp.
    fn merge(&mut self, username: &str, timestamp: i64, digest: &str) {
        match self.accounts.get(username) {
            Some(existing) if existing.timestamp >= timestamp => {}
            _ => {
                self.accounts.insert(
                    username.to_string(),
                    Account {
                        timestamp,
                        digest: digest.to_string(),
                    },
                );
            }
        }
    }
}

/// Ask every reachable server whether it knows this username.
pub fn check_user(state: &mut ServerState, session: SessionId, username: &str, now: Instant) {
    let request_id = state.login.requests.begin(PendingCheck {
        session,
        username: username.to_string(),
    });
    super::broadcast(
        state,
        NAME,
        CHECK_USER,
        &scatter::request_payload(request_id, username),
        now,
    );
}

/// Replicate a freshly created account across the mesh. Local delivery of
/// the broadcast records it here too.
pub fn new_user(state: &mut ServerState, username: &str, digest: &str, now: Instant) {
    let stamp = chrono::Utc::now().timestamp_millis();
    super::broadcast(
        state,
        NAME,
        NEW_USER,
        &format!("{stamp};{username};{digest}"),
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
        CHECK_USER => recv_check_user(state, source, args, now),
        NEW_USER => recv_new_user(state, source, args),
        scatter::GATHER => {
            let reachable = state.topology.reachable();
            let self_id = state.mesh.peer_id().to_string();
            match state
                .login
                .requests
                .recv_gather(&self_id, source, args, &reachable, now)
            {
                Ok(outcome) => finish(state, outcome, now),
                Err(error) => tracing::warn!(%source, %error, "malformed login response"),
            }
        }
        _ => tracing::warn!(%source, method, "unknown login method"),
    }
}

pub fn tick(state: &mut ServerState, now: Instant) {
    let expired = state.login.requests.tick(now);
    for (pending, responses) in expired {
        resolve(state, pending, responses, now);
    }
}

fn recv_check_user(state: &mut ServerState, source: &str, args: &str, now: Instant) {
    let (request_id, username) = match scatter::parse_request(args) {
        Ok(request) => request,
        Err(error) => {
            tracing::warn!(%source, %error, "malformed CHECK_USER request");
            return;
        }
    };
    let result = match state.login.accounts.get(username) {
        Some(account) => format!("{};{};{}", account.timestamp, username, account.digest),
        None => String::new(),
    };
    super::broadcast(
        state,
        NAME,
        scatter::GATHER,
        &scatter::response_payload(source, request_id, &result),
        now,
    );
}

fn recv_new_user(state: &mut ServerState, source: &str, args: &str) {
    let mut fields = args.splitn(3, ';');
    let (Some(stamp), Some(username), Some(digest)) =
        (fields.next(), fields.next(), fields.next())
    else {
        tracing::warn!(%source, "malformed NEW_USER payload");
        return;
    };
    let Ok(stamp) = stamp.parse::<i64>() else {
        tracing::warn!(%source, stamp, "bad NEW_USER timestamp");
        return;
    };
    state.login.merge(username, stamp, digest);
}

fn finish(state: &mut ServerState, outcome: Outcome<PendingCheck>, now: Instant) {
    if let Some((pending, responses)) = outcome.completed {
        resolve(state, pending, responses, now);
    }
    for (pending, responses) in outcome.expired {
        resolve(state, pending, responses, now);
    }
}

/// Pick the freshest record any server holds for the username and resume
/// the session's login flow.
fn resolve(state: &mut ServerState, pending: PendingCheck, responses: Responses, _now: Instant) {
    let mut best: Option<(i64, String)> = None;
    for reply in responses.values() {
        if reply.is_empty() {
            continue;
        }
        let mut fields = reply.splitn(3, ';');
        let (Some(stamp), Some(username), Some(digest)) =
            (fields.next(), fields.next(), fields.next())
        else {
            tracing::warn!("malformed CHECK_USER response");
            continue;
        };
        if username != pending.username {
            continue;
        }
        let Ok(stamp) = stamp.parse::<i64>() else {
            continue;
        };
        if best.as_ref().is_none_or(|(current, _)| stamp > *current) {
            best = Some((stamp, digest.to_string()));
        }
    }

    match best {
        Some((stamp, digest)) => {
            state.login.merge(&pending.username, stamp, &digest);
            client::have_username(state, pending.session, pending.username, digest);
        }
        None => client::no_username(state, pending.session, pending.username),
    }
}
