//! Node naming and distribution protocol constants.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Distribution handshake version spoken by this node.
pub const DIST_VERSION: u16 = 5;

/// Node type announced to EPMD: a hidden node.
pub const HIDDEN_NODE: u8 = 72;

/// Capability flags exchanged during the handshake.
pub mod flags {
    /// The node publishes itself.
    pub const PUBLISHED: u32 = 0x01;
    /// Extended references are supported.
    pub const EXTENDED_REFERENCES: u32 = 0x04;
    /// Distribution monitoring of names.
    pub const DIST_MONITOR: u32 = 0x08;
    /// Extended pids and ports are supported.
    pub const EXTENDED_PIDS_PORTS: u32 = 0x100;
    /// Atoms may be sent as UTF-8.
    pub const UTF8_ATOMS: u32 = 0x10000;
    /// Creation values are 32 bits wide.
    pub const BIG_CREATION: u32 = 0x40000;
}

/// Flags this node advertises.
pub const DEFAULT_FLAGS: u32 = flags::EXTENDED_REFERENCES
    | flags::DIST_MONITOR
    | flags::EXTENDED_PIDS_PORTS
    | flags::UTF8_ATOMS
    | flags::BIG_CREATION;

/// Longest alive name EPMD accepts.
pub const MAX_ALIVE_LEN: usize = 255;

/// Errors from parsing a node name.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NodeNameError {
    /// The name has no `@` separator.
    #[error("node name {0:?} is missing '@'")]
    MissingAt(String),
    /// The alive part is empty or too long.
    #[error("invalid alive name {0:?}")]
    InvalidAlive(String),
    /// The host part is empty.
    #[error("node name {0:?} has an empty host")]
    EmptyHost(String),
}

/// A full node name, `alive@host`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeName {
    /// Short name registered with EPMD.
    pub alive: String,
    /// Host the node runs on.
    pub host: String,
}

impl NodeName {
    /// Builds a node name from its parts.
    ///
    /// # Errors
    ///
    /// Returns [`NodeNameError`] if either part is empty, the alive part
    /// contains `@`, or it exceeds [`MAX_ALIVE_LEN`] bytes.
    ///
    /// # Examples
    ///
    /// ```
    /// use cnode_common::types::NodeName;
    /// let name = NodeName::new("c1", "localhost").unwrap();
    /// assert_eq!(name.to_string(), "c1@localhost");
    /// ```
    pub fn new(alive: impl Into<String>, host: impl Into<String>) -> Result<Self, NodeNameError> {
        let alive = alive.into();
        let host = host.into();
        if alive.is_empty() || alive.len() > MAX_ALIVE_LEN || alive.contains('@') {
            return Err(NodeNameError::InvalidAlive(alive));
        }
        if host.is_empty() {
            return Err(NodeNameError::EmptyHost(format!("{alive}@")));
        }
        Ok(Self { alive, host })
    }
}

impl FromStr for NodeName {
    type Err = NodeNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (alive, host) = s
            .split_once('@')
            .ok_or_else(|| NodeNameError::MissingAt(s.to_owned()))?;
        if host.is_empty() {
            return Err(NodeNameError::EmptyHost(s.to_owned()));
        }
        Self::new(alive, host)
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.alive, self.host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_name() {
        let name: NodeName = "e1@localhost".parse().unwrap();
        assert_eq!(name.alive, "e1");
        assert_eq!(name.host, "localhost");
    }

    #[test]
    fn rejects_missing_at() {
        assert!(matches!(
            "e1".parse::<NodeName>(),
            Err(NodeNameError::MissingAt(_))
        ));
    }

    #[test]
    fn rejects_empty_parts() {
        assert!(matches!(
            "@host".parse::<NodeName>(),
            Err(NodeNameError::InvalidAlive(_))
        ));
        assert!(matches!(
            "e1@".parse::<NodeName>(),
            Err(NodeNameError::EmptyHost(_))
        ));
    }

    #[test]
    fn rejects_overlong_alive() {
        let alive = "a".repeat(MAX_ALIVE_LEN + 1);
        assert!(NodeName::new(alive, "h").is_err());
    }

    #[test]
    fn hidden_flags_do_not_publish() {
        assert_eq!(DEFAULT_FLAGS & flags::PUBLISHED, 0);
    }
}
