//! Route planning.
//!
//! A [`Route`] is the ordered tuple of network hops a request must
//! traverse: the origin target, an optional proxy in front of it, and
//! whether TLS is layered on the connection. Route equality is what keys
//! the connection pool, so two requests share a pooled connection exactly
//! when their routes compare equal.

use std::fmt;

use http::{uri::Scheme, Uri};

use crate::{error::Error, into_uri::IntoUri};

/// One network hop: a host, a port, and the scheme used to reach it.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Hop {
    scheme: Scheme,
    host: String,
    port: u16,
}

impl Hop {
    fn from_uri(uri: &Uri) -> Result<Hop, Error> {
        let scheme = uri.scheme().cloned().ok_or_else(|| {
            Error::uri_bad_scheme(uri.clone())
        })?;
        if scheme != Scheme::HTTP && scheme != Scheme::HTTPS {
            return Err(Error::uri_bad_scheme(uri.clone()));
        }
        let host = uri
            .host()
            .ok_or_else(|| Error::builder(MissingHost))?
            // Normalized so `EXAMPLE.com` and `example.com` share a subpool.
            .to_ascii_lowercase();
        let port = uri.port_u16().unwrap_or_else(|| {
            if scheme == Scheme::HTTPS {
                443
            } else {
                80
            }
        });
        Ok(Hop { scheme, host, port })
    }

    /// The hop's host, lowercased.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The hop's port, with scheme defaults applied.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The scheme used to reach this hop.
    pub fn scheme(&self) -> &Scheme {
        &self.scheme
    }
}

impl fmt::Debug for Hop {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// The planned path from the client to the origin server.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Route {
    target: Hop,
    proxy: Option<Hop>,
    secure: bool,
}

impl Route {
    /// The origin target of this route.
    pub fn target(&self) -> &Hop {
        &self.target
    }

    /// The proxy hop, if the route goes through one.
    pub fn proxy(&self) -> Option<&Hop> {
        self.proxy.as_ref()
    }

    /// Whether TLS is layered on this route.
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// The hop the transport actually connects to: the proxy when
    /// present, the target otherwise.
    pub(crate) fn first_hop(&self) -> &Hop {
        self.proxy.as_ref().unwrap_or(&self.target)
    }

    /// Whether requests on this route use absolute-form request targets
    /// (plain HTTP relayed through a proxy).
    pub(crate) fn absolute_form(&self) -> bool {
        self.proxy.is_some() && !self.secure
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut d = f.debug_struct("Route");
        d.field("target", &self.target);
        if let Some(ref proxy) = self.proxy {
            d.field("proxy", proxy);
        }
        d.field("secure", &self.secure);
        d.finish()
    }
}

/// A proxy rule for the client.
///
/// Rules are scheme-keyed: a rule created by [`Proxy::http`] only applies
/// to plain-text requests, [`Proxy::https`] only to TLS requests, and
/// [`Proxy::all`] to both.
#[derive(Clone, Debug)]
pub struct Proxy {
    intercept: Intercept,
    hop: Hop,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Intercept {
    Http,
    Https,
    All,
}

impl Proxy {
    /// Proxy all HTTP traffic to the passed URI.
    pub fn http<U: IntoUri>(proxy: U) -> Result<Proxy, Error> {
        Proxy::new(Intercept::Http, proxy)
    }

    /// Proxy all HTTPS traffic to the passed URI.
    pub fn https<U: IntoUri>(proxy: U) -> Result<Proxy, Error> {
        Proxy::new(Intercept::Https, proxy)
    }

    /// Proxy all traffic to the passed URI.
    pub fn all<U: IntoUri>(proxy: U) -> Result<Proxy, Error> {
        Proxy::new(Intercept::All, proxy)
    }

    fn new<U: IntoUri>(intercept: Intercept, proxy: U) -> Result<Proxy, Error> {
        let uri = proxy.into_uri()?;
        let hop = Hop::from_uri(&uri)?;
        Ok(Proxy { intercept, hop })
    }

    fn matches(&self, secure: bool) -> bool {
        match self.intercept {
            Intercept::Http => !secure,
            Intercept::Https => secure,
            Intercept::All => true,
        }
    }
}

/// Computes the [`Route`] for a request URI against the configured proxy
/// rules. First matching rule wins.
#[derive(Clone, Debug, Default)]
pub(crate) struct RoutePlanner {
    proxies: Vec<Proxy>,
}

impl RoutePlanner {
    pub(crate) fn new(proxies: Vec<Proxy>) -> Self {
        RoutePlanner { proxies }
    }

    pub(crate) fn plan(&self, uri: &Uri) -> Result<Route, Error> {
        let target = Hop::from_uri(uri)?;
        let secure = target.scheme == Scheme::HTTPS;
        let proxy = self
            .proxies
            .iter()
            .find(|p| p.matches(secure))
            .map(|p| p.hop.clone());

        if secure && proxy.is_some() {
            // Establishing a TLS route through a proxy needs a CONNECT
            // tunnel, which this client does not set up.
            return Err(Error::builder(TunnelUnsupported));
        }

        Ok(Route {
            target,
            proxy,
            secure,
        })
    }
}

#[derive(Debug)]
struct MissingHost;

impl fmt::Display for MissingHost {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("request URI has no host")
    }
}

impl std::error::Error for MissingHost {}

#[derive(Debug)]
struct TunnelUnsupported;

impl fmt::Display for TunnelUnsupported {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("proxying TLS traffic requires a CONNECT tunnel, which is not supported")
    }
}

impl std::error::Error for TunnelUnsupported {}
