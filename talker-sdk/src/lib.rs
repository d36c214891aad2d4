//! Minimal line-protocol client for talker servers.
//!
//! This is the entry point for test harnesses and bots: it manages the TCP
//! connection and hands decoded server lines to the consumer as a stream of
//! [`Event`]s. Reconnection is the consumer's business.

pub mod client;

pub use client::{Event, TalkerClient, connect};
