//! Real-time chat relay: every message a client sends is fanned out to all
//! connected clients, the sender included.
//!
//! - [`cli`] parses the command-line interface for server and client modes.
//! - [`config`] holds the relay's outbound tunables.
//! - [`server`] accepts TCP connections and runs one session per client.
//! - [`session`] owns a client's channel and its bounded outbound queue.
//! - [`registry`] tracks which sessions are currently connected.
//! - [`dispatcher`] broadcasts a message to every registered session.
//! - [`greeting`] answers the one-shot join request.
//! - [`client`] is the terminal client.
//! - [`message`] defines the JSON line protocol and its async framing.

pub mod cli;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod greeting;
pub mod message;
pub mod registry;
pub mod server;
pub mod session;
