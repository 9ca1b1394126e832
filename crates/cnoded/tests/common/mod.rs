#![allow(dead_code)]

use bytes::Bytes;
use cnode_common::frame::{Control, Frame, FrameCodec};
use cnode_common::handshake::HandshakeError;
use cnode_common::rpc::{Reply, RpcRequest};
use cnode_common::term::{Pid, Term};
use cnode_common::types::NodeName;
use cnoded::acceptor;
use cnoded::config::ServerConfig;
use cnoded::handshake;
use cnoded::metrics::NodeStats;
use cnoded::router::CallRouter;
use cnoded::run_with_shutdown;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::watch;
use tokio_util::codec::Framed;

pub const COOKIE: &str = "secretcookie";

/// Router used by most tests: the stock functions plus `double`.
pub fn test_router() -> CallRouter {
    CallRouter::default().with("double", |x| x.wrapping_mul(2))
}

/// A node running on its own thread with a current-thread runtime, the way
/// the binary runs it. Dropping it closes the shutdown channel and joins the
/// thread.
pub struct TestServer {
    pub addr: SocketAddr,
    pub stats: NodeStats,
    shutdown: Option<watch::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl TestServer {
    pub fn start() -> Self {
        Self::start_with(test_router(), |_| {})
    }

    pub fn start_with(
        router: CallRouter,
        configure: impl FnOnce(&mut ServerConfig) + Send + 'static,
    ) -> Self {
        let (addr_tx, addr_rx) = std::sync::mpsc::channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let stats = NodeStats::new();
        let server_stats = stats.clone();

        let thread = std::thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async move {
                let listener = acceptor::bind("127.0.0.1:0".parse().unwrap()).unwrap();
                let addr = listener.local_addr().unwrap();
                let mut config = ServerConfig::local(addr);
                configure(&mut config);
                addr_tx.send(addr).unwrap();
                if let Err(e) =
                    run_with_shutdown(listener, config, router, server_stats, shutdown_rx).await
                {
                    eprintln!("server error in test: {e}");
                }
            });
        });

        let addr = addr_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("server did not start");
        Self {
            addr,
            stats,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        }
    }

    /// Stops the node and waits for its thread.
    pub fn stop(mut self) {
        self.shutdown_and_join();
    }

    fn shutdown_and_join(&mut self) {
        drop(self.shutdown.take());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}

/// Polls `cond` until it holds or five seconds pass.
pub async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A peer node that completed the handshake.
pub struct TestPeer {
    pub pid: Pid,
    pub remote: NodeName,
    framed: Framed<TcpStream, FrameCodec>,
}

impl TestPeer {
    pub async fn connect(addr: SocketAddr) -> Self {
        Self::connect_as(addr, "e1", COOKIE).await.unwrap()
    }

    pub async fn connect_as(
        addr: SocketAddr,
        alive: &str,
        cookie: &str,
    ) -> Result<Self, HandshakeError> {
        let stream = TcpStream::connect(addr).await?;
        Self::handshake(stream, alive, cookie).await
    }

    /// Connects with a tiny receive buffer, so replies the peer does not read
    /// back up into the node quickly.
    pub async fn connect_with_recv_buffer(
        addr: SocketAddr,
        alive: &str,
        size: u32,
    ) -> Result<Self, HandshakeError> {
        let socket = TcpSocket::new_v4()?;
        socket.set_recv_buffer_size(size)?;
        let stream = socket.connect(addr).await?;
        Self::handshake(stream, alive, COOKIE).await
    }

    async fn handshake(
        mut stream: TcpStream,
        alive: &str,
        cookie: &str,
    ) -> Result<Self, HandshakeError> {
        let local = NodeName::new(alive, "localhost").unwrap();
        let pid = Pid::new(local.to_string(), 85, 0, 3);
        let remote = tokio::time::timeout(
            Duration::from_secs(5),
            handshake::initiate(&mut stream, &local, cookie),
        )
        .await
        .map_err(|_| HandshakeError::TimedOut)??;
        Ok(Self {
            pid,
            remote,
            framed: Framed::new(stream, FrameCodec::default()),
        })
    }

    pub async fn send_frame(&mut self, frame: Frame) {
        self.framed.send(frame).await.unwrap();
    }

    pub async fn send_message(&mut self, message: Term) {
        let frame = Frame::reg_send(self.pid.clone(), "any", message);
        self.send_frame(frame).await;
    }

    pub async fn send_request(&mut self, function: &str, argument: i64) {
        let request = RpcRequest::new(self.pid.clone(), function, argument);
        self.send_message(request.to_term()).await;
    }

    pub async fn send_tick(&mut self) {
        self.send_frame(Frame::Tick).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.try_send_raw(bytes).await.unwrap();
    }

    pub async fn try_send_raw(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        let stream = self.framed.get_mut();
        stream.write_all(bytes).await?;
        stream.flush().await
    }

    pub fn request_bytes(&self, function: &str, argument: i64) -> Vec<u8> {
        let request = RpcRequest::new(self.pid.clone(), function, argument);
        Frame::reg_send(self.pid.clone(), "any", request.to_term()).serialize()
    }

    pub async fn call(&mut self, function: &str, argument: i64) -> Reply {
        self.send_request(function, argument).await;
        self.recv_reply().await
    }

    pub async fn recv_body(&mut self) -> Bytes {
        tokio::time::timeout(Duration::from_secs(5), self.framed.next())
            .await
            .expect("timeout waiting for frame")
            .expect("connection closed")
            .unwrap()
    }

    pub async fn recv_frame(&mut self) -> Frame {
        let body = self.recv_body().await;
        Frame::parse(&body).unwrap()
    }

    /// Receives the next reply, skipping ticks.
    pub async fn recv_reply(&mut self) -> Reply {
        loop {
            match self.recv_frame().await {
                Frame::Tick => continue,
                Frame::Message {
                    control: Control::Send { to },
                    message: Some(message),
                } => {
                    assert_eq!(to, self.pid, "reply addressed to the caller");
                    return Reply::from_term(&message).unwrap();
                }
                other => panic!("expected a reply, got {other:?}"),
            }
        }
    }

    /// Asserts that nothing but ticks arrives within `window`.
    pub async fn expect_no_reply(&mut self, window: Duration) {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            match tokio::time::timeout_at(deadline, self.framed.next()).await {
                Err(_) => return,
                Ok(Some(Ok(body))) if body.is_empty() => continue,
                Ok(other) => panic!("expected silence, got {other:?}"),
            }
        }
    }

    /// Asserts the node closes the connection.
    pub async fn expect_closed(&mut self) {
        loop {
            let next = tokio::time::timeout(Duration::from_secs(5), self.framed.next())
                .await
                .expect("timeout waiting for close");
            match next {
                None | Some(Err(_)) => return,
                Some(Ok(body)) if body.is_empty() => continue,
                Some(Ok(body)) => panic!("expected close, got frame {body:?}"),
            }
        }
    }
}
