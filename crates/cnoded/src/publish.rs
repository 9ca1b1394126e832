use cnode_common::epmd::{Alive2Request, Alive2Response, EpmdError};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time;
use tracing::info;

/// Bound on the whole registration exchange.
pub const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// A live port mapper registration. Dropping it closes the socket, which
/// unregisters the node.
#[derive(Debug)]
pub struct Publication {
    stream: TcpStream,
    creation: u32,
}

impl Publication {
    /// Creation number the port mapper assigned.
    #[must_use]
    pub const fn creation(&self) -> u32 {
        self.creation
    }

    /// Address of the port mapper.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket has been shut down.
    pub fn epmd_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }
}

/// Registers `alive` on `port` with the port mapper at `epmd`.
///
/// # Errors
///
/// Returns [`EpmdError`] if the port mapper is unreachable, refuses the
/// name, answers malformed data, or does not answer within
/// [`PUBLISH_TIMEOUT`].
pub async fn publish(epmd: SocketAddr, alive: &str, port: u16) -> Result<Publication, EpmdError> {
    let request = Alive2Request::hidden(alive, port).encode()?;
    let exchange = async {
        let mut stream = TcpStream::connect(epmd).await?;
        stream.write_all(&request).await?;

        let tag = stream.read_u8().await?;
        let mut response = vec![0u8; 1 + Alive2Response::body_len(tag)?];
        response[0] = tag;
        stream.read_exact(&mut response[1..]).await?;
        let resp = Alive2Response::parse(&response)?;
        Ok::<_, EpmdError>(Publication {
            stream,
            creation: resp.creation,
        })
    };
    let publication = time::timeout(PUBLISH_TIMEOUT, exchange)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "epmd did not answer"))??;
    info!(%epmd, alive, port, creation = publication.creation, "published");
    Ok(publication)
}
