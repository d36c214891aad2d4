//! A distributed talker: peer servers flood-route chat over an arbitrary
//! mesh, gossip their topology, and answer roster and login queries with
//! one consolidated response from every reachable server.
//!
//! Module map:
//! - [`server`] — the reactor loop that owns all state
//! - [`mesh`] — peer links, duplicate suppression, flood routing
//! - [`frame`] — the peer wire format
//! - [`plane`] — the observers: topology, scatter-gather, speech, who, login
//! - [`client`] — client sessions, login state machine, slash commands
//! - [`config`] — CLI configuration

pub mod client;
pub mod config;
pub mod frame;
pub mod mesh;
pub mod plane;
pub mod server;
