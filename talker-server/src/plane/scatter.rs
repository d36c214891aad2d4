//! Scatter-gather request plumbing.
//!
//! An observer that wants one consolidated answer from every reachable
//! server embeds a [`ScatterGather`] table. A request floods
//! `METHOD|request_id|payload` under the observer's name; every server
//! (the originator included) answers with a flooded `GATHER` frame whose
//! payload is `destination|request_id|result`, and the destination collates
//! results until the responder set covers the reachability set.
//!
//! The outstanding table is two generations wide, rotated every
//! [`CALLBACK_CACHE_EXPIRY`] on tick and on every inbound `GATHER`: an
//! unanswered request survives into the second generation — so a late
//! response still finds it — and is surrendered as expired on the rotation
//! after that. Completion compares against the reachability set at the
//! moment the last response arrives, not at origination; a peer leaving
//! mid-request ages the entry out instead.
//!
//! Continuations are plain data: the embedding observer stores whatever it
//! needs to resume (a session id, a username) and acts when the table hands
//! the entry back, complete or not.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

use thiserror::Error;

/// Lifetime of one outstanding-table generation.
pub const CALLBACK_CACHE_EXPIRY: Duration = Duration::from_secs(1);

/// Method name for response frames, shared by every embedding observer.
pub const GATHER: &str = "GATHER";

/// Responses collected so far, keyed by responder peer id.
pub type Responses = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum GatherError {
    #[error("malformed gather payload")]
    Malformed,
    #[error("bad request id {0:?}")]
    BadRequestId(String),
}

/// What one inbound `GATHER` frame or tick produced.
#[derive(Debug)]
pub struct Outcome<P> {
    /// A request whose responder set now equals the reachability set.
    pub completed: Option<(P, Responses)>,
    /// Requests that aged out of the older generation.
    pub expired: Vec<(P, Responses)>,
}

impl<P> Outcome<P> {
    fn empty() -> Self {
        Self {
            completed: None,
            expired: Vec::new(),
        }
    }
}

/// Outstanding requests for one embedding observer.
#[derive(Debug)]
pub struct ScatterGather<P> {
    next_request: u64,
    outstanding: [HashMap<u64, (Responses, P)>; 2],
    last_rotation: Instant,
}

impl<P> ScatterGather<P> {
    pub fn new(now: Instant) -> Self {
        Self {
            next_request: 0,
            outstanding: [HashMap::new(), HashMap::new()],
            last_rotation: now,
        }
    }

    /// Allocate a request id and park the continuation. The caller floods
    /// the request frame itself.
    pub fn begin(&mut self, pending: P) -> u64 {
        self.next_request += 1;
        self.outstanding[0].insert(self.next_request, (Responses::new(), pending));
        self.next_request
    }

    /// Handle a `GATHER` payload. Responses for other destinations and
    /// duplicates are dropped; responses to unknown (usually expired)
    /// requests are logged and dropped.
    pub fn recv_gather(
        &mut self,
        self_id: &str,
        source: &str,
        payload: &str,
        reachable: &HashSet<String>,
        now: Instant,
    ) -> Result<Outcome<P>, GatherError> {
        let mut fields = payload.splitn(3, '|');
        let destination = fields.next().ok_or(GatherError::Malformed)?;
        let request_id = fields.next().ok_or(GatherError::Malformed)?;
        let result = fields.next().ok_or(GatherError::Malformed)?;
        let request_id: u64 = request_id
            .parse()
            .map_err(|_| GatherError::BadRequestId(request_id.to_string()))?;

        let mut outcome = Outcome::empty();
        if destination != self_id {
            outcome.expired = self.rollover(now);
            return Ok(outcome);
        }

        let mut completed_in = None;
        let mut known = false;
        for (index, generation) in self.outstanding.iter_mut().enumerate() {
            let Some((responses, _)) = generation.get_mut(&request_id) else {
                continue;
            };
            known = true;
            if responses.contains_key(source) {
                tracing::info!(request_id, %source, "dropping duplicate scatter response");
            } else {
                responses.insert(source.to_string(), result.to_string());
                if responses.len() == reachable.len()
                    && responses.keys().all(|id| reachable.contains(id))
                {
                    completed_in = Some(index);
                }
            }
            break;
        }

        if let Some(index) = completed_in {
            if let Some((responses, pending)) = self.outstanding[index].remove(&request_id) {
                outcome.completed = Some((pending, responses));
            }
        } else if !known {
            tracing::info!(request_id, %source, "dropping response to unknown request");
        }

        outcome.expired = self.rollover(now);
        Ok(outcome)
    }

    /// Rotate on the reactor tick, handing back any entries that expired.
    pub fn tick(&mut self, now: Instant) -> Vec<(P, Responses)> {
        self.rollover(now)
    }

    fn rollover(&mut self, now: Instant) -> Vec<(P, Responses)> {
        if now.duration_since(self.last_rotation) < CALLBACK_CACHE_EXPIRY {
            return Vec::new();
        }
        self.last_rotation = now;
        let current = std::mem::take(&mut self.outstanding[0]);
        let expired = std::mem::replace(&mut self.outstanding[1], current);
        expired
            .into_values()
            .map(|(responses, pending)| (pending, responses))
            .collect()
    }
}

/// Split a scatter request payload (`request_id|payload`) received under an
/// observer method. The receiver answers with [`response_payload`].
pub fn parse_request(args: &str) -> Result<(u64, &str), GatherError> {
    let (id, rest) = args.split_once('|').ok_or(GatherError::Malformed)?;
    let id = id
        .parse()
        .map_err(|_| GatherError::BadRequestId(id.to_string()))?;
    Ok((id, rest))
}

/// Payload of a request frame under the owning observer's method.
pub fn request_payload(request_id: u64, payload: &str) -> String {
    format!("{request_id}|{payload}")
}

/// Payload of a `GATHER` response addressed back to `destination`.
pub fn response_payload(destination: &str, request_id: u64, result: &str) -> String {
    format!("{destination}|{request_id}|{result}")
}
