use std::{error::Error as StdError, fmt, io};

use http::{StatusCode, Uri};

/// A `Result` alias where the `Err` case is `courier::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// A boxed error type that can be used for dynamic error handling.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// The Errors that may occur when processing a `Request`.
///
/// Note: Errors may include the full URI used to make the `Request`. If the
/// URI contains sensitive information (e.g. an API key as a query
/// parameter), be sure to remove it ([`without_uri`](Error::without_uri)).
pub struct Error {
    inner: Box<Inner>,
}

struct Inner {
    kind: Kind,
    source: Option<BoxError>,
    uri: Option<Uri>,
}

impl Error {
    pub(crate) fn new<E>(kind: Kind, source: Option<E>) -> Error
    where
        E: Into<BoxError>,
    {
        Error {
            inner: Box::new(Inner {
                kind,
                source: source.map(Into::into),
                uri: None,
            }),
        }
    }

    pub(crate) fn builder<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Builder, Some(e))
    }

    pub(crate) fn body<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Body, Some(e))
    }

    pub(crate) fn io<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Io, Some(e))
    }

    pub(crate) fn tls<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Tls, Some(e))
    }

    pub(crate) fn connect_timeout() -> Error {
        Error::new(Kind::ConnectTimeout, Some(TimedOut))
    }

    pub(crate) fn protocol<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Protocol, Some(e))
    }

    pub(crate) fn too_many_redirects(uri: Uri) -> Error {
        Error::new(Kind::TooManyRedirects, None::<Error>).with_uri(uri)
    }

    pub(crate) fn circular_redirect(uri: Uri) -> Error {
        Error::new(Kind::CircularRedirect, None::<Error>).with_uri(uri)
    }

    pub(crate) fn redirect<E: Into<BoxError>>(e: E, uri: Uri) -> Error {
        Error::new(Kind::Protocol, Some(e)).with_uri(uri)
    }

    pub(crate) fn non_repeatable(uri: Uri) -> Error {
        Error::new(Kind::NonRepeatable, None::<Error>).with_uri(uri)
    }

    pub(crate) fn auth<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Auth, Some(e))
    }

    pub(crate) fn pool_shutdown() -> Error {
        Error::new(Kind::PoolShutdown, None::<Error>)
    }

    pub(crate) fn pool_timeout() -> Error {
        Error::new(Kind::PoolTimeout, Some(TimedOut))
    }

    pub(crate) fn cancelled() -> Error {
        Error::new(Kind::Cancelled, None::<Error>)
    }

    pub(crate) fn update_conflict(key: impl Into<String>) -> Error {
        Error::new(Kind::UpdateConflict, Some(UpdateConflict(key.into())))
    }

    pub(crate) fn serialization<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Serialization, Some(e))
    }

    pub(crate) fn status_code(uri: Uri, status: StatusCode) -> Error {
        Error::new(Kind::Status(status), None::<Error>).with_uri(uri)
    }

    pub(crate) fn uri_bad_scheme(uri: Uri) -> Error {
        Error::new(Kind::Builder, Some(BadScheme)).with_uri(uri)
    }
}

impl Error {
    /// Returns a possible URI related to this error.
    pub fn uri(&self) -> Option<&Uri> {
        self.inner.uri.as_ref()
    }

    /// Returns a mutable reference to the URI related to this error.
    ///
    /// This is useful if you need to remove sensitive information from the
    /// URI (e.g. an API key in the query), but do not want to remove the
    /// URI entirely.
    pub fn uri_mut(&mut self) -> Option<&mut Uri> {
        self.inner.uri.as_mut()
    }

    /// Add a URI related to this error (overwriting any existing).
    pub fn with_uri(mut self, uri: Uri) -> Self {
        self.inner.uri = Some(uri);
        self
    }

    /// Strip the related URI from this error (if, for example, it contains
    /// sensitive information).
    pub fn without_uri(mut self) -> Self {
        self.inner.uri = None;
        self
    }

    /// Returns true if the error originated while building a request or
    /// client.
    pub fn is_builder(&self) -> bool {
        matches!(self.inner.kind, Kind::Builder)
    }

    /// Returns true if the error is related to the request or response body.
    pub fn is_body(&self) -> bool {
        matches!(self.inner.kind, Kind::Body)
    }

    /// Returns true if the error is a connection-scoped I/O error.
    pub fn is_io(&self) -> bool {
        matches!(self.inner.kind, Kind::Io)
    }

    /// Returns true if the error came from establishing a connection within
    /// the connect timeout.
    pub fn is_connect_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::ConnectTimeout)
    }

    /// Returns true if the error is related to TLS.
    pub fn is_tls(&self) -> bool {
        matches!(self.inner.kind, Kind::Tls)
    }

    /// Returns true if the peer or a redirect target violated the HTTP
    /// protocol.
    pub fn is_protocol(&self) -> bool {
        matches!(self.inner.kind, Kind::Protocol)
    }

    /// Returns true if a redirect chain exceeded the configured maximum.
    pub fn is_too_many_redirects(&self) -> bool {
        matches!(self.inner.kind, Kind::TooManyRedirects)
    }

    /// Returns true if a redirect revisited an already-seen location.
    pub fn is_circular_redirect(&self) -> bool {
        matches!(self.inner.kind, Kind::CircularRedirect)
    }

    /// Returns true if a stage needed to replay a request body that cannot
    /// be produced again.
    pub fn is_non_repeatable(&self) -> bool {
        matches!(self.inner.kind, Kind::NonRepeatable)
    }

    /// Returns true if authentication failed terminally.
    pub fn is_auth(&self) -> bool {
        matches!(self.inner.kind, Kind::Auth)
    }

    /// Returns true if the connection pool was shut down while leasing.
    pub fn is_pool_shutdown(&self) -> bool {
        matches!(self.inner.kind, Kind::PoolShutdown)
    }

    /// Returns true if no pooled connection became available within the
    /// connection-request timeout.
    pub fn is_pool_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::PoolTimeout)
    }

    /// Returns true if the operation was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.inner.kind, Kind::Cancelled)
    }

    /// Returns true if a compare-and-swap cache update exhausted its
    /// retries.
    pub fn is_update_conflict(&self) -> bool {
        matches!(self.inner.kind, Kind::UpdateConflict)
    }

    /// Returns true if a cache entry could not be encoded or decoded.
    pub fn is_serialization(&self) -> bool {
        matches!(self.inner.kind, Kind::Serialization)
    }

    /// Returns true if the error is from `Response::error_for_status`.
    pub fn is_status(&self) -> bool {
        matches!(self.inner.kind, Kind::Status(_))
    }

    /// Returns true if the error is related to a timeout.
    pub fn is_timeout(&self) -> bool {
        if matches!(
            self.inner.kind,
            Kind::ConnectTimeout | Kind::PoolTimeout
        ) {
            return true;
        }

        let mut source = self.source();
        while let Some(err) = source {
            if err.is::<TimedOut>() {
                return true;
            }
            if let Some(io) = err.downcast_ref::<io::Error>() {
                if io.kind() == io::ErrorKind::TimedOut {
                    return true;
                }
            }
            source = err.source();
        }

        false
    }

    /// Returns true if the error is related to a connection reset.
    pub fn is_connection_reset(&self) -> bool {
        let mut source = self.source();

        while let Some(err) = source {
            if let Some(io) = err.downcast_ref::<io::Error>() {
                if io.kind() == io::ErrorKind::ConnectionReset {
                    return true;
                }
            }
            source = err.source();
        }

        false
    }

    /// Returns the status code, if the error was generated from a response.
    pub fn status(&self) -> Option<StatusCode> {
        match self.inner.kind {
            Kind::Status(code) => Some(code),
            _ => None,
        }
    }

    /// Whether a connection-scoped failure occurred before any response
    /// arrived, leaving the exchange retryable by policy.
    pub(crate) fn is_retryable_io(&self) -> bool {
        match self.inner.kind {
            Kind::Io | Kind::ConnectTimeout | Kind::PoolTimeout => true,
            _ => false,
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut builder = f.debug_struct("courier::Error");

        builder.field("kind", &self.inner.kind);

        if let Some(ref uri) = self.inner.uri {
            builder.field("uri", uri);
        }

        if let Some(ref source) = self.inner.source {
            builder.field("source", source);
        }

        builder.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.inner.kind {
            Kind::Builder => f.write_str("builder error")?,
            Kind::Body => f.write_str("request or response body error")?,
            Kind::Io => f.write_str("connection error")?,
            Kind::ConnectTimeout => f.write_str("timed out connecting")?,
            Kind::Tls => f.write_str("tls error")?,
            Kind::Protocol => f.write_str("protocol error")?,
            Kind::TooManyRedirects => f.write_str("too many redirects")?,
            Kind::CircularRedirect => f.write_str("circular redirect")?,
            Kind::NonRepeatable => {
                f.write_str("request body cannot be produced again")?
            }
            Kind::Auth => f.write_str("authentication error")?,
            Kind::PoolShutdown => f.write_str("connection pool shut down")?,
            Kind::PoolTimeout => {
                f.write_str("timed out waiting for a pooled connection")?
            }
            Kind::Cancelled => f.write_str("operation cancelled")?,
            Kind::UpdateConflict => f.write_str("cache update conflict")?,
            Kind::Serialization => f.write_str("cache entry codec error")?,
            Kind::Status(ref code) => {
                let prefix = if code.is_client_error() {
                    "HTTP status client error"
                } else {
                    debug_assert!(code.is_server_error());
                    "HTTP status server error"
                };
                write!(f, "{prefix} ({code})")?;
            }
        };

        if let Some(uri) = &self.inner.uri {
            write!(f, " for uri ({uri})")?;
        }

        if let Some(e) = &self.inner.source {
            write!(f, ": {e}")?;
        }

        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.source.as_ref().map(|e| &**e as _)
    }
}

#[derive(Debug)]
pub(crate) enum Kind {
    Builder,
    Body,
    Io,
    ConnectTimeout,
    Tls,
    Protocol,
    TooManyRedirects,
    CircularRedirect,
    NonRepeatable,
    Auth,
    PoolShutdown,
    PoolTimeout,
    Cancelled,
    UpdateConflict,
    Serialization,
    Status(StatusCode),
}

#[derive(Debug)]
pub(crate) struct TimedOut;

impl fmt::Display for TimedOut {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("operation timed out")
    }
}

impl StdError for TimedOut {}

#[derive(Debug)]
pub(crate) struct BadScheme;

impl fmt::Display for BadScheme {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("URI scheme is not allowed")
    }
}

impl StdError for BadScheme {}

#[derive(Debug)]
struct UpdateConflict(String);

impl fmt::Display for UpdateConflict {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "lost compare-and-swap race for key {:?}", self.0)
    }
}

impl StdError for UpdateConflict {}
