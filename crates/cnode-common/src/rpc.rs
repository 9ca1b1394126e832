//! The RPC envelope exchanged with a C node.
//!
//! A request is the message term `{call, From, {Function, Argument}}`; the
//! outer tag must be an atom but its value is not checked. Replies are sent to
//! `From` as a tagged pair: `{cnode, Result}` on success and
//! `{error, {undef, Function}}` when no handler matches.

use crate::term::{Pid, Term};
use thiserror::Error;

/// Tag of a request's outer tuple when built by [`RpcRequest::to_term`].
pub const CALL_TAG: &str = "call";
/// Tag of a successful reply.
pub const REPLY_TAG: &str = "cnode";
/// Tag of an error reply.
pub const ERROR_TAG: &str = "error";
/// Reason inside an error reply for an unknown function.
pub const UNDEF: &str = "undef";

/// Errors from interpreting a term as an RPC request or reply.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RpcError {
    /// The term was not a tuple.
    #[error("expected a tuple, got {0}")]
    NotATuple(String),
    /// A tuple had the wrong number of elements.
    #[error("expected {expected} elements, got {actual}")]
    WrongArity {
        /// Required arity.
        expected: usize,
        /// Arity found.
        actual: usize,
    },
    /// An element had the wrong type.
    #[error("expected {expected} at position {position}, got {actual}")]
    UnexpectedElement {
        /// Human-readable description of the required type.
        expected: &'static str,
        /// 1-based position in the enclosing tuple.
        position: usize,
        /// The offending term.
        actual: String,
    },
}

/// A decoded call request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcRequest {
    /// Process the reply is sent to.
    pub from: Pid,
    /// Name of the function to invoke.
    pub function: String,
    /// Single integer argument.
    pub argument: i64,
}

impl RpcRequest {
    /// Creates a request.
    #[must_use]
    pub fn new(from: Pid, function: impl Into<String>, argument: i64) -> Self {
        Self {
            from,
            function: function.into(),
            argument,
        }
    }

    /// Interprets a message term as a call request.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError`] unless the term is a 3-tuple of atom, pid and a
    /// 2-tuple of atom and integer.
    ///
    /// # Examples
    ///
    /// ```
    /// use cnode_common::rpc::RpcRequest;
    /// use cnode_common::term::Pid;
    /// let request = RpcRequest::new(Pid::new("e1@host", 1, 0, 1), "foo", 3);
    /// assert_eq!(RpcRequest::from_term(&request.to_term()).unwrap(), request);
    /// ```
    pub fn from_term(term: &Term) -> Result<Self, RpcError> {
        let outer = tuple_of(term, 3)?;
        if outer[0].as_atom().is_none() {
            return Err(unexpected("atom", 1, &outer[0]));
        }
        let from = outer[1]
            .as_pid()
            .ok_or_else(|| unexpected("pid", 2, &outer[1]))?
            .clone();
        let call = tuple_of(&outer[2], 2)?;
        let function = call[0]
            .as_atom()
            .ok_or_else(|| unexpected("atom", 1, &call[0]))?
            .to_owned();
        let argument = call[1]
            .as_integer()
            .ok_or_else(|| unexpected("integer", 2, &call[1]))?;
        Ok(Self {
            from,
            function,
            argument,
        })
    }

    /// Builds the message term for this request.
    #[must_use]
    pub fn to_term(&self) -> Term {
        Term::tuple(vec![
            Term::atom(CALL_TAG),
            Term::Pid(self.from.clone()),
            Term::tuple(vec![
                Term::atom(self.function.clone()),
                Term::Integer(self.argument),
            ]),
        ])
    }
}

/// The answer to one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// The function ran and returned this value.
    Ok(i64),
    /// No function with this name is registered.
    UnknownFunction(String),
}

impl Reply {
    /// Builds the reply term.
    ///
    /// # Examples
    ///
    /// ```
    /// use cnode_common::rpc::Reply;
    /// assert_eq!(Reply::Ok(42).to_term().to_string(), "{cnode,42}");
    /// assert_eq!(
    ///     Reply::UnknownFunction("baz".into()).to_term().to_string(),
    ///     "{error,{undef,baz}}"
    /// );
    /// ```
    #[must_use]
    pub fn to_term(&self) -> Term {
        match self {
            Self::Ok(result) => Term::tuple(vec![Term::atom(REPLY_TAG), Term::Integer(*result)]),
            Self::UnknownFunction(name) => Term::tuple(vec![
                Term::atom(ERROR_TAG),
                Term::tuple(vec![Term::atom(UNDEF), Term::atom(name.clone())]),
            ]),
        }
    }

    /// Interprets a reply term.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError`] if the term is neither reply shape.
    pub fn from_term(term: &Term) -> Result<Self, RpcError> {
        let pair = tuple_of(term, 2)?;
        match pair[0].as_atom() {
            Some(REPLY_TAG) => pair[1]
                .as_integer()
                .map(Self::Ok)
                .ok_or_else(|| unexpected("integer", 2, &pair[1])),
            Some(ERROR_TAG) => {
                let reason = tuple_of(&pair[1], 2)?;
                match (reason[0].as_atom(), reason[1].as_atom()) {
                    (Some(UNDEF), Some(name)) => Ok(Self::UnknownFunction(name.to_owned())),
                    _ => Err(unexpected("{undef, Name}", 2, &pair[1])),
                }
            }
            _ => Err(unexpected("reply tag", 1, &pair[0])),
        }
    }
}

fn tuple_of(term: &Term, arity: usize) -> Result<&[Term], RpcError> {
    let elements = term
        .as_tuple()
        .ok_or_else(|| RpcError::NotATuple(term.to_string()))?;
    if elements.len() != arity {
        return Err(RpcError::WrongArity {
            expected: arity,
            actual: elements.len(),
        });
    }
    Ok(elements)
}

fn unexpected(expected: &'static str, position: usize, actual: &Term) -> RpcError {
    RpcError::UnexpectedElement {
        expected,
        position,
        actual: actual.to_string(),
    }
}
