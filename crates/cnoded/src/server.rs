use crate::acceptor::{self, HandshakeInbox, ListenSocket};
use crate::config::ServerConfig;
use crate::dispatcher;
use crate::error::NodeError;
use crate::metrics::NodeStats;
use crate::reactor::Reactor;
use crate::router::CallRouter;
use crate::table::ConnectionTable;
use cnode_common::frame::FrameCodec;
use cnode_common::types::NodeName;
use std::io;
use std::rc::Rc;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{error, info};

/// Server context handed to every reactor callback.
pub struct Node {
    /// Full node name announced in the handshake.
    pub name: NodeName,
    /// Runtime configuration.
    pub config: ServerConfig,
    /// Listening socket.
    pub listener: Rc<ListenSocket>,
    /// Handshakes running outside the reactor.
    pub handshakes: Rc<HandshakeInbox>,
    /// Live peer connections.
    pub table: ConnectionTable<TcpStream>,
    /// Function dispatch table.
    pub router: CallRouter,
    /// Stream framing with the configured size limit.
    pub codec: FrameCodec,
    /// Counters shared with the health endpoint.
    pub stats: NodeStats,
    pub(crate) fatal: Option<io::Error>,
}

impl Node {
    /// Builds the server context.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Config`] if the configuration is invalid.
    pub fn new(
        config: ServerConfig,
        listener: ListenSocket,
        router: CallRouter,
        stats: NodeStats,
    ) -> Result<Self, NodeError> {
        config.validate().map_err(NodeError::Config)?;
        let name = config.node_name().map_err(NodeError::Config)?;
        Ok(Self {
            name,
            table: ConnectionTable::new(config.max_conns),
            codec: FrameCodec::new(config.max_frame),
            config,
            listener: Rc::new(listener),
            handshakes: Rc::new(HandshakeInbox::new()),
            router,
            stats,
            fatal: None,
        })
    }

    /// Tears down every remaining connection.
    pub fn close_all(&mut self, reactor: &mut Reactor<Self>) {
        for id in self.table.ids() {
            dispatcher::teardown(self, reactor, id, &NodeError::ConnectionClosed);
        }
    }
}

/// # Errors
///
/// Returns an error if the configuration is invalid or accepting fails.
pub async fn run(
    listener: ListenSocket,
    config: ServerConfig,
    router: CallRouter,
    stats: NodeStats,
) -> Result<(), NodeError> {
    let (_shutdown_tx, shutdown_rx) = watch::channel(());
    run_with_shutdown(listener, config, router, stats, shutdown_rx).await
}

/// Run the reactor with an externally-controlled shutdown signal.
///
/// The loop ends when `shutdown` receives a value or its sender is dropped;
/// remaining connections are then closed. Must run on a current-thread
/// runtime (or inside a `LocalSet`) since the server state is not `Send`.
///
/// # Errors
///
/// Returns an error if the configuration is invalid or the listening socket
/// fails to accept.
pub async fn run_with_shutdown(
    listener: ListenSocket,
    config: ServerConfig,
    router: CallRouter,
    stats: NodeStats,
    shutdown: watch::Receiver<()>,
) -> Result<(), NodeError> {
    let local_addr = listener.local_addr()?;
    let mut node = Node::new(config, listener, router, stats)?;
    let mut reactor = Reactor::new();
    acceptor::register(&node, &mut reactor);
    info!(
        node = %node.name,
        %local_addr,
        capacity = node.table.capacity(),
        functions = ?node.router.names(),
        "node listening"
    );

    reactor.run(&mut node, shutdown).await;

    let remaining = node.table.len();
    let abandoned = node.handshakes.pending();
    node.close_all(&mut reactor);
    if let Some(e) = node.fatal.take() {
        error!(error = %e, "server stopped on accept failure");
        return Err(e.into());
    }
    info!(closed = remaining, abandoned, "node shut down gracefully");
    Ok(())
}
