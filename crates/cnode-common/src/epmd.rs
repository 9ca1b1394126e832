//! Port mapper (EPMD) registration messages.
//!
//! A node publishes its alive name and listen port with `ALIVE2_REQ`; the
//! registration lasts as long as that TCP connection stays open.

use crate::types::{DIST_VERSION, HIDDEN_NODE};
use thiserror::Error;

/// Well-known EPMD port.
pub const DEFAULT_EPMD_PORT: u16 = 4369;

/// Registration request.
pub const ALIVE2_REQ: u8 = 120;
/// Registration response with a 16-bit creation.
pub const ALIVE2_RESP: u8 = 121;
/// Registration response with a 32-bit creation.
pub const ALIVE2_X_RESP: u8 = 118;

/// Protocol byte for TCP/IPv4.
pub const PROTOCOL_TCP: u8 = 0;

/// Errors from the name-service exchange.
#[derive(Debug, Error)]
pub enum EpmdError {
    /// Socket failure or timeout.
    #[error("epmd I/O: {0}")]
    Io(#[from] std::io::Error),
    /// The port mapper refused the registration.
    #[error("epmd refused registration (result {0})")]
    Refused(u8),
    /// The reply was not a registration response.
    #[error("unexpected epmd response tag {0}")]
    UnexpectedResponse(u8),
    /// The reply was cut short.
    #[error("truncated epmd response")]
    Truncated,
    /// The request does not fit the 2-byte length field.
    #[error("epmd request too long")]
    RequestTooLong,
}

/// `ALIVE2_REQ` contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alive2Request {
    /// Listen port of the node.
    pub port: u16,
    /// Node type (72 hidden, 77 normal).
    pub node_type: u8,
    /// Transport protocol.
    pub protocol: u8,
    /// Highest handshake version supported.
    pub highest_version: u16,
    /// Lowest handshake version supported.
    pub lowest_version: u16,
    /// Alive name (the part before `@`).
    pub name: String,
    /// Opaque extra data.
    pub extra: Vec<u8>,
}

impl Alive2Request {
    /// Request for a hidden node speaking the local handshake version.
    #[must_use]
    pub fn hidden(name: impl Into<String>, port: u16) -> Self {
        Self {
            port,
            node_type: HIDDEN_NODE,
            protocol: PROTOCOL_TCP,
            highest_version: DIST_VERSION,
            lowest_version: DIST_VERSION,
            name: name.into(),
            extra: Vec::new(),
        }
    }

    /// Serializes the request including its 2-byte length prefix.
    ///
    /// # Errors
    ///
    /// Returns [`EpmdError::RequestTooLong`] if the name or extra data do not
    /// fit their length fields.
    ///
    /// # Examples
    ///
    /// ```
    /// use cnode_common::epmd::Alive2Request;
    /// let wire = Alive2Request::hidden("c1", 3456).encode().unwrap();
    /// assert_eq!(&wire[..3], &[0, 15, 120]);
    /// ```
    pub fn encode(&self) -> Result<Vec<u8>, EpmdError> {
        let name_len = u16::try_from(self.name.len()).map_err(|_| EpmdError::RequestTooLong)?;
        let extra_len = u16::try_from(self.extra.len()).map_err(|_| EpmdError::RequestTooLong)?;
        let mut body = Vec::with_capacity(13 + self.name.len() + self.extra.len());
        body.push(ALIVE2_REQ);
        body.extend_from_slice(&self.port.to_be_bytes());
        body.push(self.node_type);
        body.push(self.protocol);
        body.extend_from_slice(&self.highest_version.to_be_bytes());
        body.extend_from_slice(&self.lowest_version.to_be_bytes());
        body.extend_from_slice(&name_len.to_be_bytes());
        body.extend_from_slice(self.name.as_bytes());
        body.extend_from_slice(&extra_len.to_be_bytes());
        body.extend_from_slice(&self.extra);

        let len = u16::try_from(body.len()).map_err(|_| EpmdError::RequestTooLong)?;
        let mut out = Vec::with_capacity(2 + body.len());
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }
}

/// Successful registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alive2Response {
    /// Creation number assigned to this incarnation of the node.
    pub creation: u32,
}

impl Alive2Response {
    /// Number of bytes following the tag byte for a response tag.
    ///
    /// # Errors
    ///
    /// Returns [`EpmdError::UnexpectedResponse`] for any other tag.
    pub fn body_len(tag: u8) -> Result<usize, EpmdError> {
        match tag {
            ALIVE2_RESP => Ok(3),
            ALIVE2_X_RESP => Ok(5),
            other => Err(EpmdError::UnexpectedResponse(other)),
        }
    }

    /// Parses a complete response, tag included.
    ///
    /// # Errors
    ///
    /// Returns [`EpmdError::Refused`] for a non-zero result, and the other
    /// variants for malformed input.
    ///
    /// # Examples
    ///
    /// ```
    /// use cnode_common::epmd::Alive2Response;
    /// let resp = Alive2Response::parse(&[118, 0, 0, 0, 0, 7]).unwrap();
    /// assert_eq!(resp.creation, 7);
    /// ```
    pub fn parse(data: &[u8]) -> Result<Self, EpmdError> {
        let (&tag, rest) = data.split_first().ok_or(EpmdError::Truncated)?;
        let len = Self::body_len(tag)?;
        if rest.len() < len {
            return Err(EpmdError::Truncated);
        }
        if rest[0] != 0 {
            return Err(EpmdError::Refused(rest[0]));
        }
        let creation = match tag {
            ALIVE2_RESP => u32::from(u16::from_be_bytes([rest[1], rest[2]])),
            _ => u32::from_be_bytes([rest[1], rest[2], rest[3], rest[4]]),
        };
        Ok(Self { creation })
    }
}
