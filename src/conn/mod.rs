//! Protocol adapters.
//!
//! A [`Connection`] is the owned channel to one wire connection: the
//! hyper HTTP/1.1 or HTTP/2 request sender plus the attributes the pool
//! and the execution chain care about. The on-wire codecs themselves are
//! external collaborators (hyper's `client::conn` handshakes); TLS is
//! behind the [`TlsHandshake`] trait and never implemented here.

use std::{fmt, net::SocketAddr, time::Instant};

use futures_util::future::BoxFuture;
use http::Version;
use hyper::body::Incoming;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    body::Body,
    error::BoxError,
    pool::{Poolable, Reservation},
};

mod connector;

pub(crate) use self::connector::Connector;

/// Byte-stream I/O as the connector and TLS layers see it.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

/// A boxed byte stream handed across the TLS seam.
pub type BoxIo = Box<dyn Io>;

/// The protocol negotiated by ALPN.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlpnProtocol {
    /// `http/1.1`
    Http1,
    /// `h2`
    Http2,
}

/// A completed TLS handshake: the encrypted stream plus the negotiated
/// application protocol.
pub struct TlsSession {
    /// The encrypted byte stream.
    pub io: BoxIo,
    /// What ALPN agreed on; drives the wire codec choice.
    pub alpn: AlpnProtocol,
}

impl fmt::Debug for TlsSession {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TlsSession").field("alpn", &self.alpn).finish()
    }
}

/// The TLS seam.
///
/// TLS itself is an external collaborator: implementations wrap the plain
/// stream, perform the handshake for `host`, and report the ALPN result.
/// Secure routes on a client without a handshaker fail with the TLS error
/// kind.
pub trait TlsHandshake: Send + Sync {
    /// Perform the client handshake over `io` for `host`, offering
    /// `h2` and `http/1.1` via ALPN.
    fn handshake<'a>(
        &'a self,
        host: &'a str,
        io: BoxIo,
    ) -> BoxFuture<'a, Result<TlsSession, BoxError>>;
}

/// Details of the connection that served a response.
#[derive(Clone, Debug)]
pub struct EndpointInfo {
    /// Local socket address.
    pub local_addr: Option<SocketAddr>,
    /// Remote socket address of the first hop.
    pub peer_addr: Option<SocketAddr>,
    /// Negotiated HTTP version.
    pub version: Version,
    /// Whether the exchange rode a reused pooled connection.
    pub reused: bool,
}

/// An owned channel to one wire connection.
pub(crate) struct Connection {
    tx: Tx,
    created_at: Instant,
    info: EndpointInfo,
}

enum Tx {
    Http1(hyper::client::conn::http1::SendRequest<Body>),
    Http2(hyper::client::conn::http2::SendRequest<Body>),
}

impl Connection {
    pub(crate) fn http1(
        tx: hyper::client::conn::http1::SendRequest<Body>,
        local_addr: Option<SocketAddr>,
        peer_addr: Option<SocketAddr>,
    ) -> Connection {
        Connection {
            tx: Tx::Http1(tx),
            created_at: Instant::now(),
            info: EndpointInfo {
                local_addr,
                peer_addr,
                version: Version::HTTP_11,
                reused: false,
            },
        }
    }

    pub(crate) fn http2(
        tx: hyper::client::conn::http2::SendRequest<Body>,
        local_addr: Option<SocketAddr>,
        peer_addr: Option<SocketAddr>,
    ) -> Connection {
        Connection {
            tx: Tx::Http2(tx),
            created_at: Instant::now(),
            info: EndpointInfo {
                local_addr,
                peer_addr,
                version: Version::HTTP_2,
                reused: false,
            },
        }
    }

    pub(crate) fn version(&self) -> Version {
        self.info.version
    }

    pub(crate) fn info(&self) -> &EndpointInfo {
        &self.info
    }

    #[allow(unused)]
    pub(crate) fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Dispatch one request. HTTP/1.1 exchanges serialize on the
    /// connection; HTTP/2 sends ride independent streams.
    pub(crate) async fn send_request(
        &mut self,
        req: http::Request<Body>,
    ) -> hyper::Result<http::Response<Incoming>> {
        match self.tx {
            Tx::Http1(ref mut tx) => {
                tx.ready().await?;
                tx.send_request(req).await
            }
            Tx::Http2(ref mut tx) => {
                tx.ready().await?;
                tx.send_request(req).await
            }
        }
    }
}

impl Poolable for Connection {
    fn is_open(&self) -> bool {
        match self.tx {
            // An h1 sender is reusable once the previous exchange fully
            // completed; mid-response it reports not ready.
            Tx::Http1(ref tx) => !tx.is_closed() && tx.is_ready(),
            Tx::Http2(ref tx) => !tx.is_closed(),
        }
    }

    fn reserve(self) -> Reservation<Self> {
        match self.tx {
            Tx::Http2(tx) => {
                let clone = Connection {
                    tx: Tx::Http2(tx.clone()),
                    created_at: self.created_at,
                    info: self.info.clone(),
                };
                let keep = Connection {
                    tx: Tx::Http2(tx),
                    created_at: self.created_at,
                    info: self.info,
                };
                Reservation::Shared(keep, clone)
            }
            Tx::Http1(_) => Reservation::Unique(self),
        }
    }

    fn can_share(&self) -> bool {
        matches!(self.tx, Tx::Http2(_))
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Connection")
            .field("version", &self.info.version)
            .field("peer_addr", &self.info.peer_addr)
            .finish()
    }
}
