use cnode_common::crypto;
use cnode_common::handshake::{
    body_len, packet, Challenge, ChallengeAck, ChallengeReply, HandshakeError, SendName, Status,
    PACKET_HEADER_LEN,
};
use cnode_common::types::{NodeName, DEFAULT_FLAGS, DIST_VERSION};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::debug;

async fn write_packet<S>(stream: &mut S, body: &[u8]) -> Result<(), HandshakeError>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&packet(body)?).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_packet<S>(stream: &mut S) -> Result<Vec<u8>, HandshakeError>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; PACKET_HEADER_LEN];
    stream.read_exact(&mut header).await?;
    let mut body = vec![0u8; body_len(header)?];
    stream.read_exact(&mut body).await?;
    Ok(body)
}

/// Runs the accepting side of the handshake and returns the authenticated
/// peer name.
///
/// # Errors
///
/// Returns [`HandshakeError`] on I/O failure, a malformed or out-of-order
/// message, a version other than [`DIST_VERSION`], or a digest that does not
/// match `cookie`.
pub async fn accept<S>(
    stream: &mut S,
    local: &NodeName,
    cookie: &str,
) -> Result<NodeName, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let hello = SendName::parse(&read_packet(stream).await?)?;
    if hello.version != DIST_VERSION {
        write_packet(stream, &Status("not_allowed".to_owned()).encode()).await?;
        return Err(HandshakeError::UnsupportedVersion(hello.version));
    }
    let peer: NodeName = hello.name.parse()?;
    debug!(%peer, flags = hello.flags, "send_name received");
    write_packet(stream, &Status::ok().encode()).await?;

    let challenge = crypto::gen_challenge();
    let offer = Challenge {
        version: DIST_VERSION,
        flags: DEFAULT_FLAGS,
        challenge,
        name: local.to_string(),
    };
    write_packet(stream, &offer.encode()).await?;

    let reply = ChallengeReply::parse(&read_packet(stream).await?)?;
    if !crypto::verify_digest(challenge, cookie, &reply.digest) {
        return Err(HandshakeError::BadCookie);
    }
    let ack = ChallengeAck {
        digest: crypto::gen_digest(reply.challenge, cookie),
    };
    write_packet(stream, &ack.encode()).await?;
    Ok(peer)
}

/// [`accept`] with the whole exchange bounded by `limit`.
///
/// # Errors
///
/// Returns [`HandshakeError::TimedOut`] if the peer has not finished within
/// `limit`, however the time was spent, or any error of [`accept`].
pub async fn accept_within<S>(
    stream: &mut S,
    local: &NodeName,
    cookie: &str,
    limit: Duration,
) -> Result<NodeName, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match timeout(limit, accept(stream, local, cookie)).await {
        Ok(result) => result,
        Err(_) => Err(HandshakeError::TimedOut),
    }
}

/// Runs the initiating side of the handshake and returns the name of the
/// accepting node.
///
/// # Errors
///
/// Returns [`HandshakeError`] if the node refuses the connection or its
/// acknowledgement does not prove knowledge of `cookie`.
pub async fn initiate<S>(
    stream: &mut S,
    local: &NodeName,
    cookie: &str,
) -> Result<NodeName, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let hello = SendName {
        version: DIST_VERSION,
        flags: DEFAULT_FLAGS,
        name: local.to_string(),
    };
    write_packet(stream, &hello.encode()).await?;

    let status = Status::parse(&read_packet(stream).await?)?;
    if !status.is_ok() {
        return Err(HandshakeError::Refused(status.0));
    }

    let offer = Challenge::parse(&read_packet(stream).await?)?;
    if offer.version != DIST_VERSION {
        return Err(HandshakeError::UnsupportedVersion(offer.version));
    }
    let remote: NodeName = offer.name.parse()?;

    let challenge = crypto::gen_challenge();
    let reply = ChallengeReply {
        challenge,
        digest: crypto::gen_digest(offer.challenge, cookie),
    };
    write_packet(stream, &reply.encode()).await?;

    let ack = ChallengeAck::parse(&read_packet(stream).await?)?;
    if !crypto::verify_digest(challenge, cookie, &ack.digest) {
        return Err(HandshakeError::BadCookie);
    }
    Ok(remote)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, DuplexStream};

    fn node(name: &str) -> NodeName {
        name.parse().unwrap()
    }

    fn pair() -> (DuplexStream, DuplexStream) {
        duplex(1024)
    }

    #[tokio::test]
    async fn matching_cookies_authenticate_both_sides() {
        let (mut client, mut server) = pair();
        let local = node("c1@localhost");
        let peer = node("e1@host");
        let (accepted, remote) = tokio::join!(
            accept(&mut server, &local, "cookie"),
            initiate(&mut client, &peer, "cookie"),
        );
        assert_eq!(accepted.unwrap().to_string(), "e1@host");
        assert_eq!(remote.unwrap().to_string(), "c1@localhost");
    }

    #[tokio::test]
    async fn wrong_cookie_is_rejected() {
        let (mut client, mut server) = pair();
        let server_side = async move {
            let result = accept(&mut server, &node("c1@localhost"), "cookie").await;
            drop(server);
            result
        };
        let peer = node("e1@host");
        let (accepted, remote) = tokio::join!(
            server_side,
            initiate(&mut client, &peer, "wrong"),
        );
        assert!(matches!(accepted, Err(HandshakeError::BadCookie)));
        assert!(remote.is_err());
    }

    #[tokio::test]
    async fn old_version_is_refused() {
        let (mut client, mut server) = pair();
        let hello = SendName {
            version: 4,
            flags: 0,
            name: "e1@host".into(),
        };
        write_packet(&mut client, &hello.encode()).await.unwrap();
        let err = accept(&mut server, &node("c1@localhost"), "cookie")
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::UnsupportedVersion(4)));
        let status = Status::parse(&read_packet(&mut client).await.unwrap()).unwrap();
        assert!(!status.is_ok());
    }

    #[tokio::test]
    async fn bad_peer_name_is_rejected() {
        let (mut client, mut server) = pair();
        let hello = SendName {
            version: DIST_VERSION,
            flags: 0,
            name: "no-host".into(),
        };
        write_packet(&mut client, &hello.encode()).await.unwrap();
        let err = accept(&mut server, &node("c1@localhost"), "cookie")
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::InvalidName(_)));
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let (_client, mut server) = pair();
        let limit = Duration::from_millis(50);
        let err = accept_within(&mut server, &node("c1@localhost"), "cookie", limit)
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::TimedOut));
    }

    #[tokio::test]
    async fn trickling_peer_is_cut_off_at_the_overall_limit() {
        let (mut client, mut server) = pair();
        let trickle = tokio::spawn(async move {
            client.write_all(&[0, 200]).await.unwrap();
            for _ in 0..40 {
                tokio::time::sleep(Duration::from_millis(25)).await;
                if client.write_all(b"x").await.is_err() {
                    break;
                }
            }
        });

        let started = std::time::Instant::now();
        let limit = Duration::from_millis(200);
        let err = accept_within(&mut server, &node("c1@localhost"), "cookie", limit)
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::TimedOut));
        assert!(started.elapsed() < Duration::from_millis(900));
        drop(server);
        trickle.await.unwrap();
    }

    #[tokio::test]
    async fn garbage_is_malformed() {
        let (mut client, mut server) = pair();
        client.write_all(&[0, 2, b'x', b'y']).await.unwrap();
        let err = accept(&mut server, &node("c1@localhost"), "cookie")
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::UnexpectedTag { .. }));
    }

    #[tokio::test]
    async fn empty_packet_is_malformed() {
        let (mut client, mut server) = pair();
        client.write_all(&[0, 0]).await.unwrap();
        let err = accept(&mut server, &node("c1@localhost"), "cookie")
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::Malformed("empty packet")));
    }
}
