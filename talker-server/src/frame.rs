//! Peer wire format.
//!
//! Each frame is one UTF-8 line, fields separated by `|`:
//!
//! ```text
//! SOURCE|MESSAGE_ID|TARGET|PAYLOAD      flooded to every server
//! !SOURCE|MESSAGE_ID|TARGET|PAYLOAD     delivered on one link only
//! ```
//!
//! `SOURCE` and `TARGET` contain no `|`; the payload may. Parsing splits on
//! `|` a bounded number of times so payload bytes pass through untouched,
//! and forwarding re-uses the received line verbatim — fields added by newer
//! servers survive transit through older ones.

use thiserror::Error;

/// Why an inbound peer line could not be decoded.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("missing {0} field")]
    MissingField(&'static str),
    #[error("empty source id")]
    EmptySource,
    #[error("bad message id {0:?}")]
    BadMessageId(String),
}

/// A decoded peer frame, borrowing from the received line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    /// Peer id of the originating server.
    pub source: &'a str,
    /// Monotonic per-originator counter; `(source, message_id)` identifies
    /// a broadcast for duplicate suppression.
    pub message_id: u64,
    /// Flood to every peer (true) or deliver on this link only (false).
    pub broadcast: bool,
    /// Everything after the message id: `TARGET|PAYLOAD`, or a bare payload.
    pub body: &'a str,
}

pub fn parse(line: &str) -> Result<Frame<'_>, FrameError> {
    let (broadcast, rest) = match line.strip_prefix('!') {
        Some(rest) => (false, rest),
        None => (true, line),
    };
    let (source, rest) = rest
        .split_once('|')
        .ok_or(FrameError::MissingField("message id"))?;
    let (id, body) = rest
        .split_once('|')
        .ok_or(FrameError::MissingField("payload"))?;
    if source.is_empty() {
        return Err(FrameError::EmptySource);
    }
    let message_id = id
        .parse()
        .map_err(|_| FrameError::BadMessageId(id.to_string()))?;
    Ok(Frame {
        source,
        message_id,
        broadcast,
        body,
    })
}

pub fn format(source: &str, message_id: u64, body: &str, broadcast: bool) -> String {
    if broadcast {
        format!("{source}|{message_id}|{body}")
    } else {
        format!("!{source}|{message_id}|{body}")
    }
}

/// Split a frame body into `(target, payload)`. A body with no separator
/// demuxes to a target no observer claims, which drops it with a warning.
pub fn split_target(body: &str) -> (&str, &str) {
    match body.split_once('|') {
        Some((target, payload)) => (target, payload),
        None => (body, ""),
    }
}
