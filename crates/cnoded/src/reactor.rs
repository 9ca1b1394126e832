//! Single-threaded readiness reactor.
//!
//! Sources are registered with a persistent read interest and a callback.
//! [`Reactor::run`] waits until at least one source is readable, then invokes
//! the callbacks of every ready source in token order, one at a time, each
//! running to completion with exclusive access to the shared context. The
//! reactor holds sources weakly: it never keeps a socket open, and a
//! registration whose source was dropped is discarded on the next poll.

use std::collections::BTreeMap;
use std::fmt;
use std::future::poll_fn;
use std::io;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::trace;

/// Opaque handle for one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub u64);

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Readiness a registration waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    /// Data (or a pending connection) is available.
    Readable,
}

/// Something whose read readiness can be polled.
pub trait Source {
    /// Polls for read readiness, registering the task waker when pending.
    ///
    /// # Errors
    ///
    /// An error is reported as readiness; the callback discovers it on its
    /// next read.
    fn poll_read_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>>;
}

impl Source for TcpStream {
    fn poll_read_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        TcpStream::poll_read_ready(self, cx)
    }
}

/// Callback invoked when a registered source is ready.
pub type Handler<C> = Rc<dyn Fn(&mut C, &mut Reactor<C>, Token)>;

struct Registration<C> {
    source: Weak<dyn Source>,
    interest: Interest,
    handler: Handler<C>,
}

/// Event demultiplexer over a context type `C`.
pub struct Reactor<C> {
    registrations: BTreeMap<Token, Registration<C>>,
    next_token: u64,
    stopped: bool,
}

impl<C> Default for Reactor<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> Reactor<C> {
    /// Creates an empty reactor.
    #[must_use]
    pub fn new() -> Self {
        Self {
            registrations: BTreeMap::new(),
            next_token: 0,
            stopped: false,
        }
    }

    /// Starts watching `source`; `handler` fires on every readiness event
    /// until the token is deregistered or the source is dropped.
    pub fn register<S, F>(&mut self, source: &Rc<S>, interest: Interest, handler: F) -> Token
    where
        S: Source + 'static,
        F: Fn(&mut C, &mut Self, Token) + 'static,
    {
        let token = Token(self.next_token);
        self.next_token += 1;
        let source: Weak<S> = Rc::downgrade(source);
        let source: Weak<dyn Source> = source;
        self.registrations.insert(
            token,
            Registration {
                source,
                interest,
                handler: Rc::new(handler),
            },
        );
        trace!(%token, "registered");
        token
    }

    /// Stops watching `token`. Unknown tokens are ignored, so this is safe to
    /// call from any callback, including the one currently running.
    pub fn deregister(&mut self, token: Token) {
        if self.registrations.remove(&token).is_some() {
            trace!(%token, "deregistered");
        }
    }

    /// Returns `true` while `token` is registered.
    #[must_use]
    pub fn is_registered(&self, token: Token) -> bool {
        self.registrations.contains_key(&token)
    }

    /// Number of live registrations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    /// Returns `true` if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Makes [`run`](Self::run) return once the current callback completes.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    /// Returns `true` once [`stop`](Self::stop) has been called.
    #[must_use]
    pub const fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Delivers readiness callbacks until [`stop`](Self::stop) is called or
    /// `shutdown` fires or is closed.
    pub async fn run(&mut self, ctx: &mut C, mut shutdown: watch::Receiver<()>) {
        self.stopped = false;
        while !self.stopped {
            let ready = tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    trace!("shutdown signalled");
                    break;
                }
                ready = poll_fn(|cx| self.poll_ready(cx)) => ready,
            };
            for token in ready {
                self.dispatch(ctx, token);
                if self.stopped {
                    break;
                }
            }
        }
    }

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Vec<Token>> {
        let mut ready = Vec::new();
        self.registrations.retain(|token, reg| {
            let Some(source) = reg.source.upgrade() else {
                trace!(%token, "source dropped, discarding registration");
                return false;
            };
            match reg.interest {
                Interest::Readable => {
                    if source.poll_read_ready(cx).is_ready() {
                        ready.push(*token);
                    }
                }
            }
            true
        });
        if ready.is_empty() {
            Poll::Pending
        } else {
            Poll::Ready(ready)
        }
    }

    fn dispatch(&mut self, ctx: &mut C, token: Token) {
        let Some(handler) = self.registrations.get(&token).map(|r| Rc::clone(&r.handler)) else {
            return;
        };
        handler(ctx, self, token);
    }
}
