//! Wire-level building blocks for a hidden C-node style server.
//!
//! This crate provides:
//! - External term format encoding and decoding ([`term`])
//! - Distribution frames and their stream codec ([`frame`])
//! - The call/reply envelope ([`rpc`])
//! - Handshake messages ([`handshake`]) and cookie digests ([`crypto`])
//! - Port mapper registration messages ([`epmd`])
//! - Node names and protocol constants ([`types`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod crypto;
pub mod epmd;
pub mod frame;
pub mod handshake;
pub mod rpc;
pub mod term;
pub mod types;

pub use frame::{Frame, FrameError};
pub use handshake::HandshakeError;
pub use rpc::{Reply, RpcRequest};
pub use term::{Pid, Term, TermError};
pub use types::NodeName;
