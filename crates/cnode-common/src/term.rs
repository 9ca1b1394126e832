//! Erlang external term format (subset).
//!
//! Every encoded term starts with the version byte [`VERSION_MAGIC`]; the
//! remaining bytes are a tag followed by tag-specific data. Only the shapes a
//! C node needs to exchange RPC envelopes are supported: atoms, integers up
//! to 64 bits, tuples, proper lists, binaries and pids.

use std::fmt;
use thiserror::Error;

/// Version byte prefixing every top-level encoded term.
pub const VERSION_MAGIC: u8 = 131;

/// 8-bit unsigned integer.
pub const SMALL_INTEGER_EXT: u8 = 97;
/// 32-bit signed big-endian integer.
pub const INTEGER_EXT: u8 = 98;
/// Latin-1 atom with a 2-byte length.
pub const ATOM_EXT: u8 = 100;
/// Pid with an 8-bit creation.
pub const PID_EXT: u8 = 103;
/// Tuple with an 8-bit arity.
pub const SMALL_TUPLE_EXT: u8 = 104;
/// Tuple with a 32-bit arity.
pub const LARGE_TUPLE_EXT: u8 = 105;
/// The empty list.
pub const NIL_EXT: u8 = 106;
/// List of bytes packed as a string.
pub const STRING_EXT: u8 = 107;
/// List with a 32-bit length and an explicit tail.
pub const LIST_EXT: u8 = 108;
/// Binary with a 32-bit length.
pub const BINARY_EXT: u8 = 109;
/// Bignum with an 8-bit digit count.
pub const SMALL_BIG_EXT: u8 = 110;
/// Latin-1 atom with a 1-byte length.
pub const SMALL_ATOM_EXT: u8 = 115;
/// UTF-8 atom with a 2-byte length.
pub const ATOM_UTF8_EXT: u8 = 118;
/// UTF-8 atom with a 1-byte length.
pub const SMALL_ATOM_UTF8_EXT: u8 = 119;
/// Pid with a 32-bit creation.
pub const NEW_PID_EXT: u8 = 88;

/// Deepest tuple/list nesting accepted by the decoder.
pub const MAX_DEPTH: usize = 64;

/// Errors produced while decoding a term.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TermError {
    /// The input was empty.
    #[error("term is empty")]
    Empty,
    /// The leading byte was not [`VERSION_MAGIC`].
    #[error("bad version byte {0}")]
    BadVersion(u8),
    /// The input ended before the term did.
    #[error("term truncated: needed {needed} more bytes")]
    Truncated {
        /// Bytes missing at the point decoding stopped.
        needed: usize,
    },
    /// The tag byte is not part of the supported subset.
    #[error("unsupported term tag {0}")]
    UnsupportedTag(u8),
    /// An atom was not valid UTF-8.
    #[error("atom is not valid utf-8")]
    InvalidAtom,
    /// A list had a tail other than the empty list.
    #[error("improper lists are not supported")]
    ImproperList,
    /// A bignum does not fit in 64 bits.
    #[error("integer does not fit in 64 bits")]
    IntegerOverflow,
    /// Nesting exceeded [`MAX_DEPTH`].
    #[error("term nested deeper than {MAX_DEPTH}")]
    TooDeep,
    /// Bytes remained after a complete term.
    #[error("{0} trailing bytes after term")]
    TrailingBytes(usize),
}

/// Process identifier of a remote (or local) process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pid {
    /// Name of the node the process lives on.
    pub node: String,
    /// Process number.
    pub id: u32,
    /// Serial number.
    pub serial: u32,
    /// Node incarnation.
    pub creation: u32,
}

impl Pid {
    /// Creates a pid on `node`.
    #[must_use]
    pub fn new(node: impl Into<String>, id: u32, serial: u32, creation: u32) -> Self {
        Self {
            node: node.into(),
            id,
            serial,
            creation,
        }
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}.{}.{}>", self.node, self.id, self.serial)
    }
}

/// A decoded term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Term {
    /// An atom.
    Atom(String),
    /// An integer.
    Integer(i64),
    /// A tuple.
    Tuple(Vec<Term>),
    /// A proper list; the empty list is `List(vec![])`.
    List(Vec<Term>),
    /// A binary.
    Binary(Vec<u8>),
    /// A process identifier.
    Pid(Pid),
}

impl Term {
    /// Creates an atom.
    #[must_use]
    pub fn atom(name: impl Into<String>) -> Self {
        Self::Atom(name.into())
    }

    /// Creates a tuple.
    #[must_use]
    pub fn tuple(elements: Vec<Term>) -> Self {
        Self::Tuple(elements)
    }

    /// Returns the atom name, if this is an atom.
    #[must_use]
    pub fn as_atom(&self) -> Option<&str> {
        match self {
            Self::Atom(name) => Some(name),
            _ => None,
        }
    }

    /// Returns the integer value, if this is an integer.
    #[must_use]
    pub const fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns the tuple elements, if this is a tuple.
    #[must_use]
    pub fn as_tuple(&self) -> Option<&[Term]> {
        match self {
            Self::Tuple(elements) => Some(elements),
            _ => None,
        }
    }

    /// Returns the pid, if this is a pid.
    #[must_use]
    pub const fn as_pid(&self) -> Option<&Pid> {
        match self {
            Self::Pid(pid) => Some(pid),
            _ => None,
        }
    }

    /// Encodes this term with a leading version byte.
    ///
    /// # Examples
    ///
    /// ```
    /// use cnode_common::term::{Term, VERSION_MAGIC, SMALL_INTEGER_EXT};
    /// assert_eq!(Term::Integer(7).encode(), vec![VERSION_MAGIC, SMALL_INTEGER_EXT, 7]);
    /// ```
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16);
        buf.push(VERSION_MAGIC);
        self.encode_into(&mut buf);
        buf
    }

    /// Appends this term to `buf` without a version byte.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Self::Atom(name) => encode_atom(name, buf),
            Self::Integer(value) => encode_integer(*value, buf),
            Self::Tuple(elements) => {
                if let Ok(arity) = u8::try_from(elements.len()) {
                    buf.push(SMALL_TUPLE_EXT);
                    buf.push(arity);
                } else {
                    buf.push(LARGE_TUPLE_EXT);
                    buf.extend_from_slice(&len_u32(elements.len()).to_be_bytes());
                }
                for element in elements {
                    element.encode_into(buf);
                }
            }
            Self::List(elements) => {
                if !elements.is_empty() {
                    buf.push(LIST_EXT);
                    buf.extend_from_slice(&len_u32(elements.len()).to_be_bytes());
                    for element in elements {
                        element.encode_into(buf);
                    }
                }
                buf.push(NIL_EXT);
            }
            Self::Binary(data) => {
                buf.push(BINARY_EXT);
                buf.extend_from_slice(&len_u32(data.len()).to_be_bytes());
                buf.extend_from_slice(data);
            }
            Self::Pid(pid) => {
                buf.push(NEW_PID_EXT);
                encode_atom(&pid.node, buf);
                buf.extend_from_slice(&pid.id.to_be_bytes());
                buf.extend_from_slice(&pid.serial.to_be_bytes());
                buf.extend_from_slice(&pid.creation.to_be_bytes());
            }
        }
    }

    /// Decodes exactly one versioned term, rejecting trailing bytes.
    ///
    /// # Errors
    ///
    /// Returns [`TermError`] if the input is not a single well-formed term.
    ///
    /// # Examples
    ///
    /// ```
    /// use cnode_common::term::Term;
    /// let term = Term::tuple(vec![Term::atom("foo"), Term::Integer(3)]);
    /// assert_eq!(Term::decode(&term.encode()).unwrap(), term);
    /// ```
    pub fn decode(data: &[u8]) -> Result<Self, TermError> {
        let (term, used) = Self::decode_prefix(data)?;
        match data.len() - used {
            0 => Ok(term),
            rest => Err(TermError::TrailingBytes(rest)),
        }
    }

    /// Decodes one versioned term from the front of `data`, returning it and
    /// the number of bytes consumed.
    ///
    /// # Errors
    ///
    /// Returns [`TermError`] if the prefix is not a well-formed term.
    pub fn decode_prefix(data: &[u8]) -> Result<(Self, usize), TermError> {
        let mut reader = Reader::new(data);
        match reader.u8() {
            Ok(VERSION_MAGIC) => {}
            Ok(other) => return Err(TermError::BadVersion(other)),
            Err(_) => return Err(TermError::Empty),
        }
        let term = reader.term(0)?;
        Ok((term, reader.pos))
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Atom(name) => {
                let plain = name
                    .chars()
                    .next()
                    .is_some_and(|c| c.is_ascii_lowercase())
                    && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '@');
                if plain {
                    f.write_str(name)
                } else {
                    write!(f, "'{}'", name.replace('\'', "\\'"))
                }
            }
            Self::Integer(value) => write!(f, "{value}"),
            Self::Tuple(elements) => write_seq(f, '{', elements, '}'),
            Self::List(elements) => write_seq(f, '[', elements, ']'),
            Self::Binary(data) => {
                f.write_str("<<")?;
                for (i, byte) in data.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{byte}")?;
                }
                f.write_str(">>")
            }
            Self::Pid(pid) => write!(f, "{pid}"),
        }
    }
}

fn write_seq(f: &mut fmt::Formatter<'_>, open: char, elements: &[Term], close: char) -> fmt::Result {
    write!(f, "{open}")?;
    for (i, element) in elements.iter().enumerate() {
        if i > 0 {
            f.write_str(",")?;
        }
        write!(f, "{element}")?;
    }
    write!(f, "{close}")
}

#[allow(clippy::cast_possible_truncation)]
fn len_u32(len: usize) -> u32 {
    len.min(u32::MAX as usize) as u32
}

fn encode_atom(name: &str, buf: &mut Vec<u8>) {
    let bytes = name.as_bytes();
    if let Ok(len) = u8::try_from(bytes.len()) {
        buf.push(SMALL_ATOM_UTF8_EXT);
        buf.push(len);
        buf.extend_from_slice(bytes);
    } else {
        // Atoms are capped at 255 characters by the runtime; u16 covers it.
        let len = u16::try_from(bytes.len()).unwrap_or(u16::MAX);
        buf.push(ATOM_UTF8_EXT);
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&bytes[..usize::from(len)]);
    }
}

fn encode_integer(value: i64, buf: &mut Vec<u8>) {
    if let Ok(small) = u8::try_from(value) {
        buf.push(SMALL_INTEGER_EXT);
        buf.push(small);
    } else if let Ok(int) = i32::try_from(value) {
        buf.push(INTEGER_EXT);
        buf.extend_from_slice(&int.to_be_bytes());
    } else {
        let magnitude = value.unsigned_abs();
        let digits = magnitude.to_le_bytes();
        let len = 8 - magnitude.leading_zeros() as usize / 8;
        buf.push(SMALL_BIG_EXT);
        #[allow(clippy::cast_possible_truncation)]
        buf.push(len as u8);
        buf.push(u8::from(value < 0));
        buf.extend_from_slice(&digits[..len]);
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    const fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], TermError> {
        let remaining = self.data.len() - self.pos;
        if remaining < n {
            return Err(TermError::Truncated {
                needed: n - remaining,
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, TermError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, TermError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, TermError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn term(&mut self, depth: usize) -> Result<Term, TermError> {
        if depth > MAX_DEPTH {
            return Err(TermError::TooDeep);
        }
        let tag = self.u8()?;
        match tag {
            SMALL_INTEGER_EXT => Ok(Term::Integer(i64::from(self.u8()?))),
            INTEGER_EXT => {
                #[allow(clippy::cast_possible_wrap)]
                let value = self.u32()? as i32;
                Ok(Term::Integer(i64::from(value)))
            }
            SMALL_BIG_EXT => {
                let n = usize::from(self.u8()?);
                let negative = self.u8()? != 0;
                self.big(n, negative).map(Term::Integer)
            }
            ATOM_EXT | SMALL_ATOM_EXT | ATOM_UTF8_EXT | SMALL_ATOM_UTF8_EXT => {
                self.atom_body(tag).map(Term::Atom)
            }
            SMALL_TUPLE_EXT => {
                let arity = usize::from(self.u8()?);
                self.elements(arity, depth).map(Term::Tuple)
            }
            LARGE_TUPLE_EXT => {
                let arity = self.u32()? as usize;
                self.elements(arity, depth).map(Term::Tuple)
            }
            NIL_EXT => Ok(Term::List(Vec::new())),
            STRING_EXT => {
                let len = usize::from(self.u16()?);
                let bytes = self.take(len)?;
                Ok(Term::List(
                    bytes.iter().map(|b| Term::Integer(i64::from(*b))).collect(),
                ))
            }
            LIST_EXT => {
                let len = self.u32()? as usize;
                let elements = self.elements(len, depth)?;
                match self.u8()? {
                    NIL_EXT => Ok(Term::List(elements)),
                    _ => Err(TermError::ImproperList),
                }
            }
            BINARY_EXT => {
                let len = self.u32()? as usize;
                Ok(Term::Binary(self.take(len)?.to_vec()))
            }
            PID_EXT | NEW_PID_EXT => {
                let node_tag = self.u8()?;
                let node = match node_tag {
                    ATOM_EXT | SMALL_ATOM_EXT | ATOM_UTF8_EXT | SMALL_ATOM_UTF8_EXT => {
                        self.atom_body(node_tag)?
                    }
                    other => return Err(TermError::UnsupportedTag(other)),
                };
                let id = self.u32()?;
                let serial = self.u32()?;
                let creation = if tag == PID_EXT {
                    u32::from(self.u8()?)
                } else {
                    self.u32()?
                };
                Ok(Term::Pid(Pid {
                    node,
                    id,
                    serial,
                    creation,
                }))
            }
            other => Err(TermError::UnsupportedTag(other)),
        }
    }

    fn elements(&mut self, count: usize, depth: usize) -> Result<Vec<Term>, TermError> {
        // Every element takes at least one byte; cap the preallocation by what is left.
        let mut elements = Vec::with_capacity(count.min(self.data.len() - self.pos));
        for _ in 0..count {
            elements.push(self.term(depth + 1)?);
        }
        Ok(elements)
    }

    fn atom_body(&mut self, tag: u8) -> Result<String, TermError> {
        let len = match tag {
            SMALL_ATOM_EXT | SMALL_ATOM_UTF8_EXT => usize::from(self.u8()?),
            _ => usize::from(self.u16()?),
        };
        let bytes = self.take(len)?;
        match tag {
            ATOM_EXT | SMALL_ATOM_EXT => Ok(bytes.iter().map(|b| char::from(*b)).collect()),
            _ => std::str::from_utf8(bytes)
                .map(str::to_owned)
                .map_err(|_| TermError::InvalidAtom),
        }
    }

    fn big(&mut self, n: usize, negative: bool) -> Result<i64, TermError> {
        let digits = self.take(n)?;
        if digits[8.min(n)..].iter().any(|d| *d != 0) {
            return Err(TermError::IntegerOverflow);
        }
        let mut le = [0u8; 8];
        let used = n.min(8);
        le[..used].copy_from_slice(&digits[..used]);
        let magnitude = u64::from_le_bytes(le);
        if negative {
            if magnitude > i64::MIN.unsigned_abs() {
                return Err(TermError::IntegerOverflow);
            }
            Ok(0i64.wrapping_sub_unsigned(magnitude))
        } else {
            i64::try_from(magnitude).map_err(|_| TermError::IntegerOverflow)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid() -> Pid {
        Pid::new("e1@localhost", 85, 0, 3)
    }

    #[test]
    fn small_integer_encoding() {
        assert_eq!(Term::Integer(0).encode(), vec![131, 97, 0]);
        assert_eq!(Term::Integer(255).encode(), vec![131, 97, 255]);
    }

    #[test]
    fn negative_and_large_integers_use_integer_ext() {
        assert_eq!(Term::Integer(-1).encode(), vec![131, 98, 255, 255, 255, 255]);
        assert_eq!(Term::Integer(256).encode(), vec![131, 98, 0, 0, 1, 0]);
    }

    #[test]
    fn integers_beyond_i32_use_small_big() {
        let value = i64::from(i32::MAX) + 1;
        let bytes = Term::Integer(value).encode();
        assert_eq!(bytes[1], SMALL_BIG_EXT);
        assert_eq!(bytes[2], 4);
        assert_eq!(bytes[3], 0);
        assert_eq!(Term::decode(&bytes).unwrap(), Term::Integer(value));
    }

    #[test]
    fn extreme_integers_survive() {
        for value in [i64::MIN, i64::MAX, i64::from(i32::MIN) - 1] {
            let bytes = Term::Integer(value).encode();
            assert_eq!(Term::decode(&bytes).unwrap(), Term::Integer(value));
        }
    }

    #[test]
    fn big_wider_than_64_bits_overflows() {
        let bytes = [131, SMALL_BIG_EXT, 9, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1];
        assert_eq!(Term::decode(&bytes), Err(TermError::IntegerOverflow));
    }

    #[test]
    fn big_with_zero_padding_is_accepted() {
        let bytes = [131, SMALL_BIG_EXT, 9, 1, 5, 0, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(Term::decode(&bytes).unwrap(), Term::Integer(-5));
    }

    #[test]
    fn latin1_atoms_decode() {
        let bytes = [131, ATOM_EXT, 0, 3, b'f', b'o', b'o'];
        assert_eq!(Term::decode(&bytes).unwrap(), Term::atom("foo"));
        let bytes = [131, SMALL_ATOM_EXT, 1, 0xE9];
        assert_eq!(Term::decode(&bytes).unwrap(), Term::atom("é"));
    }

    #[test]
    fn invalid_utf8_atom_is_rejected() {
        let bytes = [131, SMALL_ATOM_UTF8_EXT, 1, 0xFF];
        assert_eq!(Term::decode(&bytes), Err(TermError::InvalidAtom));
    }

    #[test]
    fn call_envelope_round_trips() {
        let term = Term::tuple(vec![
            Term::atom("call"),
            Term::Pid(pid()),
            Term::tuple(vec![Term::atom("foo"), Term::Integer(3)]),
        ]);
        assert_eq!(Term::decode(&term.encode()).unwrap(), term);
    }

    #[test]
    fn old_pid_ext_decodes() {
        let mut bytes = vec![131, PID_EXT, SMALL_ATOM_UTF8_EXT, 1, b'a'];
        bytes.extend_from_slice(&7u32.to_be_bytes());
        bytes.extend_from_slice(&1u32.to_be_bytes());
        bytes.push(2);
        let term = Term::decode(&bytes).unwrap();
        assert_eq!(term, Term::Pid(Pid::new("a", 7, 1, 2)));
    }

    #[test]
    fn string_ext_decodes_to_list_of_integers() {
        let bytes = [131, STRING_EXT, 0, 2, b'h', b'i'];
        assert_eq!(
            Term::decode(&bytes).unwrap(),
            Term::List(vec![Term::Integer(104), Term::Integer(105)])
        );
    }

    #[test]
    fn empty_list_is_nil() {
        assert_eq!(Term::List(vec![]).encode(), vec![131, NIL_EXT]);
    }

    #[test]
    fn improper_list_is_rejected() {
        let bytes = [131, LIST_EXT, 0, 0, 0, 1, 97, 1, 97, 2];
        assert_eq!(Term::decode(&bytes), Err(TermError::ImproperList));
    }

    #[test]
    fn empty_input_is_error() {
        assert_eq!(Term::decode(&[]), Err(TermError::Empty));
    }

    #[test]
    fn bad_version_is_error() {
        assert_eq!(Term::decode(&[130, 97, 1]), Err(TermError::BadVersion(130)));
    }

    #[test]
    fn truncated_tuple_is_error() {
        let bytes = [131, SMALL_TUPLE_EXT, 2, 97, 1];
        assert!(matches!(
            Term::decode(&bytes),
            Err(TermError::Truncated { .. })
        ));
    }

    #[test]
    fn trailing_bytes_are_rejected_by_full_decode() {
        let bytes = [131, 97, 1, 0, 0];
        assert_eq!(Term::decode(&bytes), Err(TermError::TrailingBytes(2)));
        assert_eq!(
            Term::decode_prefix(&bytes).unwrap(),
            (Term::Integer(1), 3)
        );
    }

    #[test]
    fn unsupported_tag_is_rejected() {
        assert_eq!(Term::decode(&[131, 70, 0]), Err(TermError::UnsupportedTag(70)));
    }

    #[test]
    fn deep_nesting_is_rejected() {
        let mut bytes = vec![131];
        for _ in 0..=MAX_DEPTH {
            bytes.extend_from_slice(&[SMALL_TUPLE_EXT, 1]);
        }
        bytes.extend_from_slice(&[97, 0]);
        assert_eq!(Term::decode(&bytes), Err(TermError::TooDeep));
    }

    #[test]
    fn huge_declared_arity_does_not_preallocate() {
        let bytes = [131, LARGE_TUPLE_EXT, 0xFF, 0xFF, 0xFF, 0xFF];
        assert!(matches!(
            Term::decode(&bytes),
            Err(TermError::Truncated { .. })
        ));
    }

    #[test]
    fn display_uses_erlang_syntax() {
        let term = Term::tuple(vec![
            Term::atom("cnode"),
            Term::Integer(42),
            Term::atom("Quoted"),
            Term::List(vec![Term::Integer(1)]),
        ]);
        assert_eq!(term.to_string(), "{cnode,42,'Quoted',[1]}");
        assert_eq!(Term::Pid(pid()).to_string(), "<e1@localhost.85.0>");
    }
}
