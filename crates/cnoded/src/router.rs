use crate::error::NodeError;
use cnode_common::rpc::{Reply, RpcRequest};
use cnode_common::term::Term;
use std::collections::HashMap;

/// A local function callable by peers.
pub type Handler = fn(i64) -> i64;

/// `foo(x) = x + 1`, wrapping on overflow.
#[must_use]
pub const fn foo(x: i64) -> i64 {
    x.wrapping_add(1)
}

/// `bar(y) = y * 2`, wrapping on overflow.
#[must_use]
pub const fn bar(y: i64) -> i64 {
    y.wrapping_mul(2)
}

/// Function name → handler table.
#[derive(Debug, Clone)]
pub struct CallRouter {
    handlers: HashMap<String, Handler>,
}

impl CallRouter {
    /// Create a router with no functions.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Builder form of [`register`](Self::register).
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, handler: Handler) -> Self {
        self.register(name, handler);
        self
    }

    /// Register `handler` under `name`, returning any handler it replaces.
    pub fn register(&mut self, name: impl Into<String>, handler: Handler) -> Option<Handler> {
        self.handlers.insert(name.into(), handler)
    }

    /// Invoke the function `name`.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::UnknownFunction`] if nothing is registered under
    /// `name`.
    pub fn route(&self, name: &str, argument: i64) -> Result<i64, NodeError> {
        let handler = self
            .handlers
            .get(name)
            .ok_or_else(|| NodeError::UnknownFunction(name.to_owned()))?;
        Ok(handler(argument))
    }

    /// Answer a decoded request with the reply term to send back.
    #[must_use]
    pub fn respond(&self, request: &RpcRequest) -> (Reply, Term) {
        let reply = match self.route(&request.function, request.argument) {
            Ok(result) => Reply::Ok(result),
            Err(_) => Reply::UnknownFunction(request.function.clone()),
        };
        let term = reply.to_term();
        (reply, term)
    }

    /// Registered function names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of registered functions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns `true` if no function is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for CallRouter {
    /// The stock capabilities: `foo` and `bar`.
    fn default() -> Self {
        Self::new().with("foo", foo).with("bar", bar)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cnode_common::term::Pid;

    fn request(function: &str, argument: i64) -> RpcRequest {
        RpcRequest::new(Pid::new("e1@host", 1, 0, 1), function, argument)
    }

    #[test]
    fn default_router_has_foo_and_bar() {
        let router = CallRouter::default();
        assert_eq!(router.names(), vec!["bar", "foo"]);
        assert_eq!(router.route("foo", 3).unwrap(), 4);
        assert_eq!(router.route("bar", 21).unwrap(), 42);
    }

    #[test]
    fn handlers_wrap_instead_of_panicking() {
        assert_eq!(foo(i64::MAX), i64::MIN);
        assert_eq!(bar(i64::MAX), -2);
    }

    #[test]
    fn unknown_function_is_an_explicit_outcome() {
        let router = CallRouter::default();
        let err = router.route("baz", 1).unwrap_err();
        assert!(matches!(err, NodeError::UnknownFunction(ref name) if name == "baz"));
    }

    #[test]
    fn custom_router() {
        let router = CallRouter::new().with("double", |x| x * 2);
        assert_eq!(router.len(), 1);
        assert_eq!(router.route("double", 21).unwrap(), 42);
        assert!(router.route("foo", 1).is_err());
    }

    #[test]
    fn register_replaces_handler() {
        let mut router = CallRouter::default();
        assert!(router.register("foo", bar).is_some());
        assert_eq!(router.route("foo", 5).unwrap(), 10);
        assert!(router.register("neg", |x| -x).is_none());
        assert_eq!(router.len(), 3);
    }

    #[test]
    fn respond_builds_reply_terms() {
        let router = CallRouter::default();
        let (reply, term) = router.respond(&request("foo", 41));
        assert_eq!(reply, Reply::Ok(42));
        assert_eq!(term.to_string(), "{cnode,42}");

        let (reply, term) = router.respond(&request("nope", 0));
        assert_eq!(reply, Reply::UnknownFunction("nope".into()));
        assert_eq!(term.to_string(), "{error,{undef,nope}}");
    }

    #[test]
    fn empty_router() {
        let router = CallRouter::new();
        assert!(router.is_empty());
        assert!(router.names().is_empty());
    }
}
