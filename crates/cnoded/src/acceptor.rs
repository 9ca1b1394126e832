//! Listen socket, handshake tasks and the callbacks that admit peers.
//!
//! Accepting and admitting are split: the accept callback only hands the new
//! socket to a handshake task, so a slow or silent peer never holds up the
//! reactor. The task's outcome comes back through [`HandshakeInbox`], itself a
//! reactor source, and the peer is inserted and registered from there.

use crate::config::LISTEN_BACKLOG;
use crate::dispatcher;
use crate::handshake;
use crate::metrics::histograms;
use crate::reactor::{Interest, Reactor, Source, Token};
use crate::server::Node;
use crate::table::CapacityError;
use cnode_common::handshake::HandshakeError;
use cnode_common::types::NodeName;
use std::cell::{Cell, RefCell};
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

type Accepted = io::Result<(TcpStream, SocketAddr)>;

/// A listening socket usable as a reactor [`Source`].
///
/// Readiness is reported by accepting: a completed accept is parked until the
/// callback collects it with [`take_accepted`](Self::take_accepted).
#[derive(Debug)]
pub struct ListenSocket {
    listener: TcpListener,
    accepted: RefCell<Option<Accepted>>,
}

impl ListenSocket {
    /// Wraps a bound listener.
    #[must_use]
    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            accepted: RefCell::new(None),
        }
    }

    /// Collects the parked accept result; `Ok(None)` means no connection was
    /// ready.
    ///
    /// # Errors
    ///
    /// Returns the transport error the accept produced.
    pub fn take_accepted(&self) -> io::Result<Option<(TcpStream, SocketAddr)>> {
        self.accepted.borrow_mut().take().transpose()
    }

    /// Address the socket is bound to.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be queried.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

impl Source for ListenSocket {
    fn poll_read_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut slot = self.accepted.borrow_mut();
        if slot.is_some() {
            return Poll::Ready(Ok(()));
        }
        match self.listener.poll_accept(cx) {
            Poll::Ready(result) => {
                *slot = Some(result);
                Poll::Ready(Ok(()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Outcome of one handshake task.
#[derive(Debug)]
pub struct Handshaken {
    /// Remote address of the socket.
    pub addr: SocketAddr,
    /// Time from accept to the end of the exchange.
    pub elapsed: Duration,
    /// The authenticated stream and peer name, or why the peer was refused.
    pub result: Result<(TcpStream, NodeName), HandshakeError>,
}

/// Handshakes in flight and the channel their outcomes return on.
///
/// As a [`Source`] it is readable while an outcome is waiting; outcomes are
/// collected one per readiness event with [`take`](Self::take).
#[derive(Debug)]
pub struct HandshakeInbox {
    tx: mpsc::UnboundedSender<Handshaken>,
    rx: RefCell<mpsc::UnboundedReceiver<Handshaken>>,
    parked: RefCell<Option<Handshaken>>,
    pending: Cell<usize>,
}

impl Default for HandshakeInbox {
    fn default() -> Self {
        Self::new()
    }
}

impl HandshakeInbox {
    /// Creates an inbox with nothing in flight.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: RefCell::new(rx),
            parked: RefCell::new(None),
            pending: Cell::new(0),
        }
    }

    /// Starts the accepting side of the handshake on `stream` as a separate
    /// task, bounded as a whole by `limit`. Must be called from within a
    /// tokio runtime.
    pub fn spawn(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        local: NodeName,
        cookie: String,
        limit: Duration,
    ) {
        let tx = self.tx.clone();
        self.pending.set(self.pending.get() + 1);
        tokio::spawn(async move {
            let started = Instant::now();
            let mut stream = stream;
            let outcome = handshake::accept_within(&mut stream, &local, &cookie, limit).await;
            let done = Handshaken {
                addr,
                elapsed: started.elapsed(),
                result: outcome.map(|peer| (stream, peer)),
            };
            if tx.send(done).is_err() {
                debug!(%addr, "node stopped before the handshake finished");
            }
        });
    }

    /// Collects the parked outcome, if any.
    pub fn take(&self) -> Option<Handshaken> {
        let done = self.parked.borrow_mut().take();
        if done.is_some() {
            self.pending.set(self.pending.get().saturating_sub(1));
        }
        done
    }

    /// Handshakes started and not yet collected.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.get()
    }
}

impl Source for HandshakeInbox {
    fn poll_read_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut slot = self.parked.borrow_mut();
        if slot.is_some() {
            return Poll::Ready(Ok(()));
        }
        match self.rx.borrow_mut().poll_recv(cx) {
            Poll::Ready(Some(done)) => {
                *slot = Some(done);
                Poll::Ready(Ok(()))
            }
            // The inbox owns a sender, so the channel never closes.
            Poll::Ready(None) | Poll::Pending => Poll::Pending,
        }
    }
}

/// Binds a reusable listening socket on `addr`.
///
/// Must be called from within a tokio runtime.
///
/// # Errors
///
/// Returns an error if the socket cannot be created, bound, or put into
/// listening mode.
pub fn bind(addr: SocketAddr) -> io::Result<ListenSocket> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    let listener = socket.listen(LISTEN_BACKLOG)?;
    Ok(ListenSocket::new(listener))
}

/// Registers the node's listen socket and handshake inbox with the reactor.
pub fn register(node: &Node, reactor: &mut Reactor<Node>) {
    let token = reactor.register(&node.listener, Interest::Readable, on_readable);
    debug!(%token, "listen socket registered");
    let token = reactor.register(&node.handshakes, Interest::Readable, on_handshake);
    debug!(%token, "handshake inbox registered");
}

/// Accept callback: takes at most one connection per readiness event and
/// starts its handshake.
pub fn on_readable(node: &mut Node, reactor: &mut Reactor<Node>, _token: Token) {
    let (stream, addr) = match node.listener.take_accepted() {
        Ok(Some(accepted)) => accepted,
        Ok(None) => return,
        Err(e) => {
            error!(error = %e, "accept failed");
            node.fatal = Some(e);
            reactor.stop();
            return;
        }
    };

    node.handshakes.spawn(
        stream,
        addr,
        node.name.clone(),
        node.config.cookie.clone(),
        node.config.handshake_timeout(),
    );
    debug!(%addr, pending = node.handshakes.pending(), "handshake started");
}

/// Handshake callback: admits or refuses one finished handshake.
pub fn on_handshake(node: &mut Node, reactor: &mut Reactor<Node>, _token: Token) {
    let Some(Handshaken {
        addr,
        elapsed,
        result,
    }) = node.handshakes.take()
    else {
        return;
    };

    let (stream, peer) = match result {
        Ok(authenticated) => authenticated,
        Err(e) => {
            warn!(%addr, ?elapsed, error = %e, "handshake failed");
            let status = match e {
                HandshakeError::TimedOut => "handshake_timeout",
                _ => "handshake_failed",
            };
            node.stats.connection_rejected(status);
            return;
        }
    };
    histograms::handshake_seconds(elapsed.as_secs_f64());
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%addr, error = %e, "could not set TCP_NODELAY");
    }

    let id = match node.table.insert(stream, peer.to_string(), addr) {
        Ok(id) => id,
        Err(CapacityError { stream, capacity }) => {
            warn!(%addr, %peer, capacity, "connection table full, closing");
            node.stats.connection_rejected("rejected_capacity");
            drop(stream);
            return;
        }
    };

    let Some(conn) = node.table.get_mut(id) else {
        return;
    };
    let source = Rc::clone(&conn.stream);
    let token = reactor.register(&source, Interest::Readable, move |node, reactor, token| {
        dispatcher::on_readable(node, reactor, token, id);
    });
    conn.token = Some(token);
    node.stats.connection_opened();
    info!(conn = %id, %peer, %addr, active = node.table.len(), "peer connected");
}
