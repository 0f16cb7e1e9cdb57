use std::{io, sync::Arc, time::Duration};

use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpStream;

use crate::{
    error::Error,
    route::Route,
};

use super::{AlpnProtocol, BoxIo, Connection, TlsHandshake};

/// Opens connections for a route: DNS, TCP, optional TLS, then the wire
/// codec handshake.
#[derive(Clone)]
pub(crate) struct Connector {
    connect_timeout: Option<Duration>,
    nodelay: bool,
    http2_prior_knowledge: bool,
    tls: Option<Arc<dyn TlsHandshake>>,
}

impl Connector {
    pub(crate) fn new(
        connect_timeout: Option<Duration>,
        nodelay: bool,
        http2_prior_knowledge: bool,
        tls: Option<Arc<dyn TlsHandshake>>,
    ) -> Connector {
        Connector {
            connect_timeout,
            nodelay,
            http2_prior_knowledge,
            tls,
        }
    }

    /// Open a connection on `route`. `timeout` overrides the connector's
    /// default connect timeout; lapsing it fails with the connect-timeout
    /// error kind. The whole sequence (resolve, TCP, TLS, codec
    /// handshake) counts against the budget.
    pub(crate) async fn connect(
        &self,
        route: &Route,
        timeout: Option<Duration>,
    ) -> Result<Connection, Error> {
        let deadline = timeout.or(self.connect_timeout);
        match deadline {
            Some(dur) => tokio::time::timeout(dur, self.connect_inner(route))
                .await
                .map_err(|_elapsed| Error::connect_timeout())?,
            None => self.connect_inner(route).await,
        }
    }

    async fn connect_inner(&self, route: &Route) -> Result<Connection, Error> {
        let hop = route.first_hop();
        debug!("connecting to {:?}", hop);

        let addrs = tokio::net::lookup_host((hop.host(), hop.port()))
            .await
            .map_err(Error::io)?;

        let mut last_err: Option<io::Error> = None;
        let mut stream: Option<TcpStream> = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(tcp) => {
                    stream = Some(tcp);
                    break;
                }
                Err(err) => last_err = Some(err),
            }
        }
        let stream = match stream {
            Some(stream) => stream,
            None => {
                let err = last_err.unwrap_or_else(|| {
                    io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses")
                });
                return Err(Error::io(err));
            }
        };

        if self.nodelay {
            let _ = stream.set_nodelay(true);
        }
        let local_addr = stream.local_addr().ok();
        let peer_addr = stream.peer_addr().ok();

        let (io, alpn): (BoxIo, AlpnProtocol) = if route.is_secure() {
            let tls = self
                .tls
                .as_ref()
                .ok_or_else(|| Error::tls("no TLS backend configured for https"))?;
            let session = tls
                .handshake(route.target().host(), Box::new(stream))
                .await
                .map_err(Error::tls)?;
            (session.io, session.alpn)
        } else if self.http2_prior_knowledge {
            (Box::new(stream), AlpnProtocol::Http2)
        } else {
            (Box::new(stream), AlpnProtocol::Http1)
        };

        match alpn {
            AlpnProtocol::Http1 => {
                let (tx, conn) = hyper::client::conn::http1::Builder::new()
                    .handshake(TokioIo::new(io))
                    .await
                    .map_err(Error::io)?;
                tokio::spawn(async move {
                    if let Err(err) = conn.await {
                        debug!("http1 connection task ended: {err}");
                    }
                });
                Ok(Connection::http1(tx, local_addr, peer_addr))
            }
            AlpnProtocol::Http2 => {
                let (tx, conn) = hyper::client::conn::http2::Builder::new(TokioExecutor::new())
                    .handshake(TokioIo::new(io))
                    .await
                    .map_err(Error::io)?;
                tokio::spawn(async move {
                    if let Err(err) = conn.await {
                        debug!("http2 connection task ended: {err}");
                    }
                });
                Ok(Connection::http2(tx, local_addr, peer_addr))
            }
        }
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("connect_timeout", &self.connect_timeout)
            .field("nodelay", &self.nodelay)
            .field("http2_prior_knowledge", &self.http2_prior_knowledge)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}
