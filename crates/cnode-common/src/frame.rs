//! Distribution protocol framing.
//!
//! After the handshake every unit on the wire is a 4-byte big-endian length
//! followed by that many bytes. A zero length is a tick (keepalive). Any other
//! body starts with [`PASS_THROUGH`] and carries a control term, optionally
//! followed by a message term.
//!
//! Splitting the byte stream ([`FrameCodec`]) is kept apart from parsing a
//! body ([`Frame::parse`]) so a receiver can tell a broken stream, which is
//! fatal to the connection, from one malformed message, which is not.

use crate::term::{Pid, Term, TermError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Leading byte of every non-tick body.
pub const PASS_THROUGH: u8 = 112;

/// Size of the length prefix.
pub const HEADER_LEN: usize = 4;

/// Default upper bound on a single frame body (1 MiB).
pub const DEFAULT_MAX_FRAME: usize = 1 << 20;

/// `SEND` control operation: `{2, Unused, ToPid}`.
pub const OP_SEND: i64 = 2;
/// `REG_SEND` control operation: `{6, FromPid, Unused, ToName}`.
pub const OP_REG_SEND: i64 = 6;

/// The tick frame as it appears on the wire.
pub const TICK: [u8; HEADER_LEN] = [0; HEADER_LEN];

/// A decoded control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    /// Message addressed to a process identifier.
    Send {
        /// Destination process.
        to: Pid,
    },
    /// Message addressed to a registered name.
    RegSend {
        /// Sending process.
        from: Pid,
        /// Registered name of the destination.
        to_name: String,
    },
    /// Any other control operation (link, exit, monitor, ...).
    Other(i64),
}

impl Control {
    /// Returns `true` for operations that are followed by a message term.
    #[must_use]
    pub const fn has_message(&self) -> bool {
        matches!(self, Self::Send { .. } | Self::RegSend { .. })
    }

    /// Builds the control term for this operation.
    ///
    /// `Other` operations are emitted as a bare 1-tuple `{Op}`.
    #[must_use]
    pub fn to_term(&self) -> Term {
        match self {
            Self::Send { to } => Term::tuple(vec![
                Term::Integer(OP_SEND),
                Term::atom(""),
                Term::Pid(to.clone()),
            ]),
            Self::RegSend { from, to_name } => Term::tuple(vec![
                Term::Integer(OP_REG_SEND),
                Term::Pid(from.clone()),
                Term::atom(""),
                Term::atom(to_name.clone()),
            ]),
            Self::Other(op) => Term::tuple(vec![Term::Integer(*op)]),
        }
    }

    /// Interprets a control term.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::BadControl`] if the term is not a tuple headed by
    /// an integer, or if a `SEND`/`REG_SEND` tuple has the wrong shape.
    pub fn from_term(term: &Term) -> Result<Self, FrameError> {
        let elements = term
            .as_tuple()
            .ok_or_else(|| FrameError::BadControl(format!("expected tuple, got {term}")))?;
        let op = elements
            .first()
            .and_then(Term::as_integer)
            .ok_or_else(|| FrameError::BadControl(format!("missing operation in {term}")))?;
        match op {
            OP_SEND => match elements {
                [_, _, Term::Pid(to)] => Ok(Self::Send { to: to.clone() }),
                _ => Err(FrameError::BadControl(format!("malformed SEND {term}"))),
            },
            OP_REG_SEND => match elements {
                [_, Term::Pid(from), _, Term::Atom(to_name)] => Ok(Self::RegSend {
                    from: from.clone(),
                    to_name: to_name.clone(),
                }),
                _ => Err(FrameError::BadControl(format!("malformed REG_SEND {term}"))),
            },
            other => Ok(Self::Other(other)),
        }
    }
}

/// A parsed distribution frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Keepalive; carries nothing.
    Tick,
    /// Control message with its optional payload term.
    Message {
        /// The control operation.
        control: Control,
        /// Message term, present for `SEND` and `REG_SEND`.
        message: Option<Term>,
    },
}

/// Errors from framing or parsing distribution frames.
#[derive(Debug, Error)]
pub enum FrameError {
    /// A frame announced more bytes than the receiver accepts.
    #[error("frame too large: max {max}, got {actual}")]
    TooLarge {
        /// Configured maximum body size.
        max: usize,
        /// Announced body size.
        actual: usize,
    },
    /// The body did not start with [`PASS_THROUGH`].
    #[error("unexpected frame type {0}")]
    UnknownType(u8),
    /// The control term had an unexpected shape.
    #[error("bad control message: {0}")]
    BadControl(String),
    /// A message-carrying control operation arrived without a message.
    #[error("control message is missing its payload")]
    MissingMessage,
    /// A term inside the frame failed to decode.
    #[error("term error: {0}")]
    Term(#[from] TermError),
    /// Transport failure while framing.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Frame {
    /// Creates a `SEND` frame delivering `message` to `to`.
    #[must_use]
    pub const fn send(to: Pid, message: Term) -> Self {
        Self::Message {
            control: Control::Send { to },
            message: Some(message),
        }
    }

    /// Creates a `REG_SEND` frame delivering `message` to the name `to_name`.
    #[must_use]
    pub fn reg_send(from: Pid, to_name: impl Into<String>, message: Term) -> Self {
        Self::Message {
            control: Control::RegSend {
                from,
                to_name: to_name.into(),
            },
            message: Some(message),
        }
    }

    /// Returns `true` for a tick.
    #[must_use]
    pub const fn is_tick(&self) -> bool {
        matches!(self, Self::Tick)
    }

    /// Serializes the frame body (without the length prefix).
    #[must_use]
    pub fn body(&self) -> Vec<u8> {
        match self {
            Self::Tick => Vec::new(),
            Self::Message { control, message } => {
                let mut body = Vec::with_capacity(64);
                body.push(PASS_THROUGH);
                body.extend_from_slice(&control.to_term().encode());
                if let Some(message) = message {
                    body.extend_from_slice(&message.encode());
                }
                body
            }
        }
    }

    /// Serializes the frame including its length prefix.
    ///
    /// # Examples
    ///
    /// ```
    /// use cnode_common::frame::{Frame, TICK};
    /// assert_eq!(Frame::Tick.serialize(), TICK.to_vec());
    /// ```
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let body = self.body();
        let mut out = Vec::with_capacity(HEADER_LEN + body.len());
        #[allow(clippy::cast_possible_truncation)]
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(&body);
        out
    }

    /// Parses a frame body as produced by [`FrameCodec`].
    ///
    /// # Errors
    ///
    /// Returns [`FrameError`] if the body is not a pass-through frame with a
    /// well-formed control term and, where required, a message term.
    ///
    /// # Examples
    ///
    /// ```
    /// use cnode_common::frame::Frame;
    /// use cnode_common::term::{Pid, Term};
    /// let frame = Frame::reg_send(Pid::new("e1@host", 1, 0, 1), "any", Term::Integer(1));
    /// assert_eq!(Frame::parse(&frame.body()).unwrap(), frame);
    /// ```
    pub fn parse(body: &[u8]) -> Result<Self, FrameError> {
        let Some((&kind, rest)) = body.split_first() else {
            return Ok(Self::Tick);
        };
        if kind != PASS_THROUGH {
            return Err(FrameError::UnknownType(kind));
        }
        let (control_term, used) = Term::decode_prefix(rest)?;
        let control = Control::from_term(&control_term)?;
        let rest = &rest[used..];
        let message = if control.has_message() {
            if rest.is_empty() {
                return Err(FrameError::MissingMessage);
            }
            Some(Term::decode(rest)?)
        } else {
            None
        };
        Ok(Self::Message { control, message })
    }
}

/// Splits a byte stream into frame bodies and writes frames back out.
///
/// Decoded items are raw bodies: an empty body is a tick.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame: usize,
}

impl FrameCodec {
    /// Creates a codec that rejects bodies larger than `max_frame` bytes.
    #[must_use]
    pub const fn new(max_frame: usize) -> Self {
        Self { max_frame }
    }

    /// Largest accepted body size.
    #[must_use]
    pub const fn max_frame(&self) -> usize {
        self.max_frame
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME)
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > self.max_frame {
            return Err(FrameError::TooLarge {
                max: self.max_frame,
                actual: len,
            });
        }
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }
        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(len).freeze()))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = item.body();
        if body.len() > self.max_frame {
            return Err(FrameError::TooLarge {
                max: self.max_frame,
                actual: body.len(),
            });
        }
        dst.reserve(HEADER_LEN + body.len());
        #[allow(clippy::cast_possible_truncation)]
        dst.put_u32(body.len() as u32);
        dst.extend_from_slice(&body);
        Ok(())
    }
}
