//! Hidden C-node server: a single-threaded reactor that authenticates peer
//! nodes, decodes `{call, From, {Function, Argument}}` requests and answers
//! them from a table of local functions.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Listen socket, handshake tasks and admission callbacks.
pub mod acceptor;
/// CLI argument parsing and server configuration.
pub mod config;
/// Per-connection receive, classify and reply.
pub mod dispatcher;
/// Error types for node operations.
pub mod error;
/// Server side of the distribution handshake.
pub mod handshake;
/// Prometheus metrics collection and HTTP endpoint.
pub mod metrics;
/// Port mapper registration.
pub mod publish;
/// Readiness reactor.
pub mod reactor;
/// Function-name call routing.
pub mod router;
/// Server context and run loop.
pub mod server;
/// Bounded connection table.
pub mod table;

pub use error::NodeError;
pub use server::{run, run_with_shutdown, Node};
