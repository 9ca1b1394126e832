//! Per-connection read callback: receive, classify, answer.

use crate::error::NodeError;
use crate::metrics::counters;
use crate::reactor::{Reactor, Token};
use crate::server::Node;
use crate::table::ConnId;
use bytes::Bytes;
use cnode_common::frame::{Control, Frame};
use cnode_common::rpc::{Reply, RpcRequest};
use std::io;
use tokio_util::codec::Decoder;
use tracing::{debug, info, trace, warn};

/// Bytes reserved in the inbound buffer before each receive.
const READ_CHUNK: usize = 4096;

/// What one unit of inbound traffic turned out to be.
#[derive(Debug)]
pub enum Inbound {
    /// Keepalive tick.
    Signal,
    /// A non-empty frame body.
    Payload(Bytes),
    /// The connection cannot be used any further.
    ConnectionError(NodeError),
}

/// Read callback for connection `id`.
pub fn on_readable(node: &mut Node, reactor: &mut Reactor<Node>, token: Token, id: ConnId) {
    trace!(conn = %id, %token, "readable");
    for event in receive(node, id) {
        match event {
            Inbound::Signal => {
                counters::ticks_total();
                trace!(conn = %id, "tick");
                if let Err(e) = send_frame(node, id, &Frame::Tick) {
                    debug!(conn = %id, error = %e, "tick reply failed");
                }
            }
            Inbound::Payload(body) => {
                if let Err(e) = handle_payload(node, id, &body) {
                    teardown(node, reactor, id, &e);
                    return;
                }
            }
            Inbound::ConnectionError(reason) => {
                teardown(node, reactor, id, &reason);
                return;
            }
        }
    }
}

/// Performs one receive on the connection and splits everything buffered
/// into classified events, in arrival order. A connection error, if any, is
/// always the last event.
pub fn receive(node: &mut Node, id: ConnId) -> Vec<Inbound> {
    let mut codec = node.codec;
    let Some(conn) = node.table.get_mut(id) else {
        return Vec::new();
    };

    conn.inbound.reserve(READ_CHUNK);
    match conn.stream.try_read_buf(&mut conn.inbound) {
        Ok(0) => return vec![Inbound::ConnectionError(NodeError::ConnectionClosed)],
        Ok(n) => trace!(conn = %id, bytes = n, "received"),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return vec![Inbound::ConnectionError(e.into())],
    }

    let mut events = Vec::new();
    loop {
        match codec.decode(&mut conn.inbound) {
            Ok(Some(body)) if body.is_empty() => events.push(Inbound::Signal),
            Ok(Some(body)) => events.push(Inbound::Payload(body)),
            Ok(None) => break,
            Err(e) => {
                events.push(Inbound::ConnectionError(e.into()));
                break;
            }
        }
    }
    events
}

/// Decodes one payload and answers it if it is a call.
///
/// Undecodable payloads are dropped and leave the connection open; the only
/// error returned is a failed reply write.
fn handle_payload(node: &mut Node, id: ConnId, body: &[u8]) -> Result<(), NodeError> {
    let frame = match Frame::parse(body) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(conn = %id, error = %e, "dropping undecodable frame");
            node.stats.frame_dropped("bad_frame");
            return Ok(());
        }
    };

    let message = match frame {
        Frame::Message {
            control: Control::RegSend { ref to_name, .. },
            message: Some(ref message),
        } => {
            trace!(conn = %id, to = %to_name, "reg_send");
            message
        }
        Frame::Message { ref control, .. } => {
            debug!(conn = %id, ?control, "ignoring control message");
            return Ok(());
        }
        Frame::Tick => return Ok(()),
    };

    let request = match RpcRequest::from_term(message) {
        Ok(request) => request,
        Err(e) => {
            warn!(conn = %id, error = %e, %message, "dropping malformed request");
            node.stats.frame_dropped("bad_request");
            return Ok(());
        }
    };

    let (reply, term) = node.router.respond(&request);
    let outcome = match reply {
        Reply::Ok(result) => {
            debug!(conn = %id, function = %request.function, argument = request.argument, result, "call");
            "ok"
        }
        Reply::UnknownFunction(ref name) => {
            warn!(conn = %id, function = %name, "call to unknown function");
            "undef"
        }
    };
    send_frame(node, id, &Frame::send(request.from, term))?;
    node.stats.call_answered(outcome);
    Ok(())
}

/// Writes a whole frame without blocking.
///
/// # Errors
///
/// Returns [`NodeError::SendBufferFull`] if the socket cannot take the frame
/// right now, or the write error.
pub fn send_frame(node: &Node, id: ConnId, frame: &Frame) -> Result<(), NodeError> {
    let conn = node
        .table
        .lookup(id)
        .map_err(|_| NodeError::ConnectionClosed)?;
    let bytes = frame.serialize();
    let mut written = 0;
    while written < bytes.len() {
        match conn.stream.try_write(&bytes[written..]) {
            Ok(0) => return Err(NodeError::ConnectionClosed),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Err(NodeError::SendBufferFull)
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Removes `id` from the table and the reactor and closes its socket.
/// Tearing down a connection that is already gone is a no-op.
pub fn teardown(node: &mut Node, reactor: &mut Reactor<Node>, id: ConnId, reason: &NodeError) {
    let Some(conn) = node.table.remove(id) else {
        return;
    };
    if let Some(token) = conn.token {
        reactor.deregister(token);
    }
    node.stats.connection_closed();
    let lifetime = conn.connected_at.elapsed();
    match reason {
        NodeError::ConnectionClosed => {
            info!(conn = %id, peer = %conn.peer, ?lifetime, "peer disconnected");
        }
        other => {
            warn!(conn = %id, peer = %conn.peer, ?lifetime, error = %other, "connection dropped");
        }
    }
}
