//! Transport Abstraction
//!
//! The radio layer the supervisor drives: one long-lived acceptor, outbound
//! dials, and bidirectional byte streams. RFCOMM hands us the remote hardware
//! address with every socket; the TCP transport here reproduces that by
//! having the dialler announce its advertised address in the first frame.

use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::RwLock;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::framing::{read_frame, write_frame};
use crate::types::LinkAddress;

/// How long an accepted TCP peer has to announce its address
const ADDRESS_PREAMBLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest address preamble accepted from a TCP peer
const MAX_ADDRESS_LEN: usize = 256;

/// Peers that finished their preamble and wait for `accept`
const ACCEPT_BACKLOG: usize = 32;

pub trait LinkStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> LinkStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedStream = Box<dyn LinkStream>;

#[async_trait]
pub trait Acceptor: Send {
    /// Wait for the next inbound connection and the remote's link address
    async fn accept(&mut self) -> io::Result<(BoxedStream, LinkAddress)>;
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn bind(&self) -> io::Result<Box<dyn Acceptor>>;

    /// Blocks until the connection is established or fails; no timeout
    async fn dial(&self, address: &LinkAddress) -> io::Result<BoxedStream>;

    /// This endpoint's own link address, once known
    fn local_address(&self) -> Option<LinkAddress>;
}

/// TCP stand-in for an RFCOMM radio
pub struct TcpTransport {
    listen_address: String,
    advertised: RwLock<Option<LinkAddress>>,
}

impl TcpTransport {
    pub fn new(listen_address: impl Into<String>, advertised: Option<String>) -> Self {
        Self {
            listen_address: listen_address.into(),
            advertised: RwLock::new(advertised.map(LinkAddress::new)),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn bind(&self) -> io::Result<Box<dyn Acceptor>> {
        let listener = TcpListener::bind(&self.listen_address).await?;
        let bound = listener.local_addr()?;
        info!("TCP acceptor bound on {}", bound);

        {
            let mut advertised = self.advertised.write();
            if advertised.is_none() {
                if bound.ip().is_unspecified() {
                    warn!("Advertising unspecified address {}; set advertised_address", bound);
                }
                *advertised = Some(LinkAddress::new(bound.to_string()));
            }
        }

        Ok(Box::new(TcpAcceptor::spawn(listener)))
    }

    async fn dial(&self, address: &LinkAddress) -> io::Result<BoxedStream> {
        let local = self.local_address().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "no advertised address; listen first or configure one",
            )
        })?;

        let mut stream = TcpStream::connect(address.as_str()).await?;
        stream.set_nodelay(true)?;
        write_frame(&mut stream, local.as_str().as_bytes()).await?;

        debug!("Dialled {} as {}", address, local);
        Ok(Box::new(stream))
    }

    fn local_address(&self) -> Option<LinkAddress> {
        self.advertised.read().clone()
    }
}

type Accepted = io::Result<(BoxedStream, LinkAddress)>;

/// Accepts sockets on a background task and reads each peer's address
/// preamble on its own task, so a silent peer only delays itself.
struct TcpAcceptor {
    ready: mpsc::Receiver<Accepted>,
    listener_task: JoinHandle<()>,
}

impl TcpAcceptor {
    fn spawn(listener: TcpListener) -> Self {
        let (tx, ready) = mpsc::channel(ACCEPT_BACKLOG);

        let listener_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let tx = tx.clone();
                        tokio::spawn(async move {
                            if let Some(accepted) = Self::handshake(stream, peer).await {
                                let _ = tx.send(Ok(accepted)).await;
                            }
                        });
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                }
            }
        });

        Self {
            ready,
            listener_task,
        }
    }

    /// A misbehaving peer is dropped here; it never fails the acceptor.
    async fn handshake(mut stream: TcpStream, peer: SocketAddr) -> Option<(BoxedStream, LinkAddress)> {
        let address = match Self::read_preamble(&mut stream).await {
            Ok(address) => address,
            Err(e) => {
                warn!("Rejected connection from {}: {}", peer, e);
                return None;
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            warn!("Rejected connection from {}: {}", peer, e);
            return None;
        }

        debug!("Accepted {} from socket {}", address, peer);
        let stream: BoxedStream = Box::new(stream);
        Some((stream, address))
    }

    async fn read_preamble(stream: &mut TcpStream) -> io::Result<LinkAddress> {
        let frame = tokio::time::timeout(
            ADDRESS_PREAMBLE_TIMEOUT,
            read_frame(stream, MAX_ADDRESS_LEN),
        )
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no address preamble"))??
        .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "closed before preamble"))?;

        let address = String::from_utf8(frame)
            .map(LinkAddress::new)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "preamble is not UTF-8"))?;

        if !address.is_wire_safe() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unusable peer address {:?}", address.as_str()),
            ));
        }

        Ok(address)
    }
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&mut self) -> io::Result<(BoxedStream, LinkAddress)> {
        match self.ready.recv().await {
            Some(accepted) => accepted,
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "listener stopped")),
        }
    }
}

impl Drop for TcpAcceptor {
    fn drop(&mut self) {
        self.listener_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tcp_peers_learn_advertised_addresses() {
        let server = TcpTransport::new("127.0.0.1:0", None);
        let mut acceptor = server.bind().await.unwrap();
        let server_address = server.local_address().unwrap();

        let client = TcpTransport::new("127.0.0.1:0", Some("client-node:1".to_string()));
        let dial = tokio::spawn(async move { client.dial(&server_address).await.map(|_| ()) });

        let (_stream, remote) = acceptor.accept().await.unwrap();
        assert_eq!(remote, LinkAddress::from("client-node:1"));
        dial.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_silent_client_does_not_hold_up_others() {
        let server = TcpTransport::new("127.0.0.1:0", None);
        let mut acceptor = server.bind().await.unwrap();
        let server_address = server.local_address().unwrap();

        let _silent = TcpStream::connect(server_address.as_str()).await.unwrap();

        let client = TcpTransport::new("127.0.0.1:0", Some("client-node:2".to_string()));
        let dial = tokio::spawn(async move { client.dial(&server_address).await.map(|_| ()) });

        let (_stream, remote) = tokio::time::timeout(Duration::from_secs(1), acceptor.accept())
            .await
            .expect("silent peer blocked the acceptor")
            .unwrap();
        assert_eq!(remote, LinkAddress::from("client-node:2"));
        dial.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_dial_without_address_fails() {
        let client = TcpTransport::new("127.0.0.1:0", None);
        let err = client
            .dial(&LinkAddress::from("127.0.0.1:1"))
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::AddrNotAvailable);
    }
}
