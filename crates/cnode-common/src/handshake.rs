//! Distribution handshake messages.
//!
//! Every handshake message travels in a packet with a 2-byte big-endian
//! length prefix. The first body byte identifies the message:
//!
//! | tag | message           | body after the tag                      |
//! |-----|-------------------|-----------------------------------------|
//! | `n` | send_name         | version u16, flags u32, name            |
//! | `s` | status            | status text (`ok`, `nok`, ...)          |
//! | `n` | challenge         | version u16, flags u32, challenge u32, name |
//! | `r` | challenge_reply   | challenge u32, digest                   |
//! | `a` | challenge_ack     | digest                                  |
//!
//! `send_name` and `challenge` share a tag, so parsing takes the expected
//! message type from the position in the exchange.

use crate::crypto::DIGEST_LEN;
use crate::types::NodeNameError;
use std::io;
use thiserror::Error;

/// Tag of `send_name` and `challenge`.
pub const TAG_NAME: u8 = b'n';
/// Tag of `status`.
pub const TAG_STATUS: u8 = b's';
/// Tag of `challenge_reply`.
pub const TAG_REPLY: u8 = b'r';
/// Tag of `challenge_ack`.
pub const TAG_ACK: u8 = b'a';

/// Length of the packet header.
pub const PACKET_HEADER_LEN: usize = 2;

/// Errors raised while running the handshake.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// Socket failure.
    #[error("handshake I/O: {0}")]
    Io(#[from] io::Error),
    /// The whole exchange did not finish in time.
    #[error("handshake timed out")]
    TimedOut,
    /// A packet did not have the expected layout.
    #[error("malformed handshake message: {0}")]
    Malformed(&'static str),
    /// A packet carried the wrong message tag.
    #[error("expected handshake tag {expected:?}, got {actual:?}")]
    UnexpectedTag {
        /// Tag required at this step.
        expected: char,
        /// Tag received.
        actual: char,
    },
    /// The peer speaks another handshake version.
    #[error("unsupported distribution version {0}")]
    UnsupportedVersion(u16),
    /// The peer's digest does not match our cookie.
    #[error("challenge digest mismatch")]
    BadCookie,
    /// The other side answered with a status other than `ok`.
    #[error("handshake refused with status {0:?}")]
    Refused(String),
    /// The announced node name is not `alive@host`.
    #[error(transparent)]
    InvalidName(#[from] NodeNameError),
}

/// First message of the initiating peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendName {
    /// Handshake version the peer speaks.
    pub version: u16,
    /// Capability flags.
    pub flags: u32,
    /// Full node name of the peer.
    pub name: String,
}

impl SendName {
    /// Serializes the packet body.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(7 + self.name.len());
        out.push(TAG_NAME);
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(&self.flags.to_be_bytes());
        out.extend_from_slice(self.name.as_bytes());
        out
    }

    /// Parses a packet body.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError`] on a wrong tag or short body.
    pub fn parse(body: &[u8]) -> Result<Self, HandshakeError> {
        let mut cur = Cursor::tagged(body, TAG_NAME)?;
        Ok(Self {
            version: cur.u16()?,
            flags: cur.u32()?,
            name: cur.rest_str()?,
        })
    }
}

/// Status answer to `send_name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status(pub String);

impl Status {
    /// Status accepting the connection.
    #[must_use]
    pub fn ok() -> Self {
        Self("ok".to_owned())
    }

    /// Whether the status lets the handshake continue.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.0 == "ok" || self.0 == "ok_simultaneous"
    }

    /// Serializes the packet body.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.0.len());
        out.push(TAG_STATUS);
        out.extend_from_slice(self.0.as_bytes());
        out
    }

    /// Parses a packet body.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError`] on a wrong tag or non-UTF-8 text.
    pub fn parse(body: &[u8]) -> Result<Self, HandshakeError> {
        let mut cur = Cursor::tagged(body, TAG_STATUS)?;
        Ok(Self(cur.rest_str()?))
    }
}

/// The accepting node's challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    /// Handshake version the node speaks.
    pub version: u16,
    /// Capability flags.
    pub flags: u32,
    /// Random challenge the peer must answer.
    pub challenge: u32,
    /// Full node name of the accepting node.
    pub name: String,
}

impl Challenge {
    /// Serializes the packet body.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(11 + self.name.len());
        out.push(TAG_NAME);
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(&self.flags.to_be_bytes());
        out.extend_from_slice(&self.challenge.to_be_bytes());
        out.extend_from_slice(self.name.as_bytes());
        out
    }

    /// Parses a packet body.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError`] on a wrong tag or short body.
    pub fn parse(body: &[u8]) -> Result<Self, HandshakeError> {
        let mut cur = Cursor::tagged(body, TAG_NAME)?;
        Ok(Self {
            version: cur.u16()?,
            flags: cur.u32()?,
            challenge: cur.u32()?,
            name: cur.rest_str()?,
        })
    }
}

/// The peer's answer plus its own challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeReply {
    /// Challenge the accepting node must answer.
    pub challenge: u32,
    /// Digest of the node's challenge.
    pub digest: [u8; DIGEST_LEN],
}

impl ChallengeReply {
    /// Serializes the packet body.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(5 + DIGEST_LEN);
        out.push(TAG_REPLY);
        out.extend_from_slice(&self.challenge.to_be_bytes());
        out.extend_from_slice(&self.digest);
        out
    }

    /// Parses a packet body.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError`] on a wrong tag or a body that is not
    /// exactly one challenge and one digest long.
    pub fn parse(body: &[u8]) -> Result<Self, HandshakeError> {
        let mut cur = Cursor::tagged(body, TAG_REPLY)?;
        Ok(Self {
            challenge: cur.u32()?,
            digest: cur.digest()?,
        })
    }
}

/// Final message of the accepting node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeAck {
    /// Digest of the peer's challenge.
    pub digest: [u8; DIGEST_LEN],
}

impl ChallengeAck {
    /// Serializes the packet body.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + DIGEST_LEN);
        out.push(TAG_ACK);
        out.extend_from_slice(&self.digest);
        out
    }

    /// Parses a packet body.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError`] on a wrong tag or a wrong digest length.
    pub fn parse(body: &[u8]) -> Result<Self, HandshakeError> {
        let mut cur = Cursor::tagged(body, TAG_ACK)?;
        Ok(Self {
            digest: cur.digest()?,
        })
    }
}

/// Prefixes a body with its 2-byte length.
///
/// # Errors
///
/// Returns [`HandshakeError::Malformed`] if the body exceeds `u16::MAX`.
///
/// # Examples
///
/// ```
/// use cnode_common::handshake::{packet, Status};
/// assert_eq!(packet(&Status::ok().encode()).unwrap(), b"\x00\x03sok");
/// ```
pub fn packet(body: &[u8]) -> Result<Vec<u8>, HandshakeError> {
    let len = u16::try_from(body.len()).map_err(|_| HandshakeError::Malformed("packet too long"))?;
    let mut out = Vec::with_capacity(PACKET_HEADER_LEN + body.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(body);
    Ok(out)
}

/// Reads the body length from a packet header, rejecting empty packets.
///
/// # Errors
///
/// Returns [`HandshakeError::Malformed`] for a zero length.
pub fn body_len(header: [u8; PACKET_HEADER_LEN]) -> Result<usize, HandshakeError> {
    match u16::from_be_bytes(header) {
        0 => Err(HandshakeError::Malformed("empty packet")),
        len => Ok(usize::from(len)),
    }
}

struct Cursor<'a> {
    data: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn tagged(body: &'a [u8], expected: u8) -> Result<Self, HandshakeError> {
        let (&tag, data) = body
            .split_first()
            .ok_or(HandshakeError::Malformed("empty packet"))?;
        if tag != expected {
            return Err(HandshakeError::UnexpectedTag {
                expected: char::from(expected),
                actual: char::from(tag),
            });
        }
        Ok(Self { data })
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], HandshakeError> {
        if self.data.len() < N {
            return Err(HandshakeError::Malformed("packet too short"));
        }
        let (head, tail) = self.data.split_at(N);
        self.data = tail;
        let mut out = [0u8; N];
        out.copy_from_slice(head);
        Ok(out)
    }

    fn u16(&mut self) -> Result<u16, HandshakeError> {
        self.take().map(u16::from_be_bytes)
    }

    fn u32(&mut self) -> Result<u32, HandshakeError> {
        self.take().map(u32::from_be_bytes)
    }

    fn digest(&mut self) -> Result<[u8; DIGEST_LEN], HandshakeError> {
        let digest = self.take()?;
        if !self.data.is_empty() {
            return Err(HandshakeError::Malformed("trailing bytes after digest"));
        }
        Ok(digest)
    }

    fn rest_str(&mut self) -> Result<String, HandshakeError> {
        let text = std::str::from_utf8(self.data)
            .map_err(|_| HandshakeError::Malformed("text is not UTF-8"))?;
        self.data = &[];
        Ok(text.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::gen_digest;
    use crate::types::{DEFAULT_FLAGS, DIST_VERSION};

    #[test]
    fn send_name_layout() {
        let msg = SendName {
            version: DIST_VERSION,
            flags: 0x0102_0304,
            name: "e1@h".into(),
        };
        assert_eq!(msg.encode(), b"n\x00\x05\x01\x02\x03\x04e1@h");
        assert_eq!(SendName::parse(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn challenge_parses_back() {
        let msg = Challenge {
            version: DIST_VERSION,
            flags: DEFAULT_FLAGS,
            challenge: 0xDEAD_BEEF,
            name: "c1@localhost".into(),
        };
        assert_eq!(Challenge::parse(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn reply_and_ack_carry_full_digest() {
        let reply = ChallengeReply {
            challenge: 17,
            digest: gen_digest(3, "c"),
        };
        assert_eq!(reply.encode().len(), 1 + 4 + 16);
        assert_eq!(ChallengeReply::parse(&reply.encode()).unwrap(), reply);

        let ack = ChallengeAck {
            digest: gen_digest(17, "c"),
        };
        assert_eq!(ChallengeAck::parse(&ack.encode()).unwrap(), ack);
    }

    #[test]
    fn short_digest_is_malformed() {
        let mut body = vec![TAG_ACK];
        body.extend_from_slice(&[0u8; DIGEST_LEN - 1]);
        assert!(matches!(
            ChallengeAck::parse(&body),
            Err(HandshakeError::Malformed(_))
        ));
    }

    #[test]
    fn oversized_digest_is_malformed() {
        let mut body = vec![TAG_REPLY, 0, 0, 0, 1];
        body.extend_from_slice(&[0u8; 32]);
        assert!(matches!(
            ChallengeReply::parse(&body),
            Err(HandshakeError::Malformed("trailing bytes after digest"))
        ));
    }

    #[test]
    fn wrong_tag_is_reported() {
        let err = SendName::parse(&Status::ok().encode()).unwrap_err();
        assert!(matches!(
            err,
            HandshakeError::UnexpectedTag {
                expected: 'n',
                actual: 's'
            }
        ));
    }

    #[test]
    fn status_ok_variants() {
        assert!(Status::ok().is_ok());
        assert!(Status("ok_simultaneous".into()).is_ok());
        assert!(!Status("nok".into()).is_ok());
        assert_eq!(Status::parse(b"snot_allowed").unwrap().0, "not_allowed");
    }

    #[test]
    fn header_gives_body_length() {
        assert_eq!(body_len([0, 3]).unwrap(), 3);
        assert_eq!(body_len([1, 0]).unwrap(), 256);
        assert!(matches!(
            body_len([0, 0]),
            Err(HandshakeError::Malformed("empty packet"))
        ));
    }

    #[test]
    fn oversized_body_is_rejected() {
        let body = vec![0u8; usize::from(u16::MAX) + 1];
        assert!(packet(&body).is_err());
    }
}
