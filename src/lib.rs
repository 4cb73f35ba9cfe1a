//! Line-protocol TCP chat relay.
//!
//! Clients connect over TCP, claim a display name, and exchange chat lines
//! broadcast to everyone else connected. Each module covers one concern:
//!
//! - [`cli`] parses the command-line interface for server and client modes.
//! - [`protocol`] defines the newline-delimited JSON wire messages and the
//!   frame buffer that splits a byte stream into them.
//! - [`session`] wraps one peer's transport: atomic frame writes and
//!   timeout-bounded frame reads.
//! - [`registry`] is the concurrency-safe membership table that enforces
//!   display-name uniqueness.
//! - [`broadcast`] fans messages out to the membership and evicts peers
//!   that can no longer be written to.
//! - [`connection`] runs the per-connection dispatcher from join handshake
//!   to disconnect cleanup.
//! - [`server`] binds the listener and spawns one task per connection.
//! - [`client`] is the terminal client, multiplexing stdin and server
//!   messages.
//!
//! Integration tests exercise the server over real sockets; the e2e test
//! drives the compiled binary in both modes.

pub mod broadcast;
pub mod cli;
pub mod client;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
