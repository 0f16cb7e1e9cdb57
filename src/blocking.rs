//! A blocking Client facade.
//!
//! The blocking client drives the asynchronous [`Client`](crate::Client)
//! on a private tokio runtime. Conveniently synchronous, but do not use
//! it from inside an async context; spawning a blocking task is the way
//! there.

use std::{fmt, sync::Arc, time::Duration};

use bytes::Bytes;
use http::{header::HeaderMap, Method, StatusCode, Uri, Version};

use crate::{Context, IntoUri};

/// A blocking `Client` to make Requests with.
#[derive(Clone)]
pub struct Client {
    inner: crate::Client,
    rt: Arc<tokio::runtime::Runtime>,
}

impl Client {
    /// Build a blocking client with the default configuration.
    pub fn new() -> crate::Result<Client> {
        Client::with(crate::Client::new())
    }

    /// Wrap an already-configured asynchronous client.
    pub fn with(inner: crate::Client) -> crate::Result<Client> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(crate::Error::builder)?;
        Ok(Client {
            inner,
            rt: Arc::new(rt),
        })
    }

    /// Convenience method to make a `GET` request to a URI.
    pub fn get<U: IntoUri>(&self, uri: U) -> RequestBuilder {
        self.request(Method::GET, uri)
    }

    /// Convenience method to make a `POST` request to a URI.
    pub fn post<U: IntoUri>(&self, uri: U) -> RequestBuilder {
        self.request(Method::POST, uri)
    }

    /// Convenience method to make a `PUT` request to a URI.
    pub fn put<U: IntoUri>(&self, uri: U) -> RequestBuilder {
        self.request(Method::PUT, uri)
    }

    /// Convenience method to make a `DELETE` request to a URI.
    pub fn delete<U: IntoUri>(&self, uri: U) -> RequestBuilder {
        self.request(Method::DELETE, uri)
    }

    /// Convenience method to make a `HEAD` request to a URI.
    pub fn head<U: IntoUri>(&self, uri: U) -> RequestBuilder {
        self.request(Method::HEAD, uri)
    }

    /// Start building a request with the `Method` and `Uri`.
    pub fn request<U: IntoUri>(&self, method: Method, uri: U) -> RequestBuilder {
        RequestBuilder {
            rt: self.rt.clone(),
            inner: self.inner.request(method, uri),
        }
    }

    /// Execute a prebuilt request, blocking until the response head
    /// arrives.
    pub fn execute(&self, request: crate::Request) -> crate::Result<Response> {
        let res = self.rt.block_on(self.inner.execute(request))?;
        Ok(Response {
            rt: self.rt.clone(),
            inner: res,
        })
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("blocking::Client").finish()
    }
}

/// A blocking request builder, mirroring the asynchronous one.
#[must_use = "RequestBuilder does nothing until you 'send' it"]
pub struct RequestBuilder {
    rt: Arc<tokio::runtime::Runtime>,
    inner: crate::RequestBuilder,
}

impl RequestBuilder {
    /// Add a header to this request.
    pub fn header<K, V>(mut self, key: K, value: V) -> RequestBuilder
    where
        http::header::HeaderName: TryFrom<K>,
        <http::header::HeaderName as TryFrom<K>>::Error: Into<http::Error>,
        http::HeaderValue: TryFrom<V>,
        <http::HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
    {
        self.inner = self.inner.header(key, value);
        self
    }

    /// Enable HTTP basic authentication for this request alone.
    pub fn basic_auth<U, P>(mut self, username: U, password: Option<P>) -> RequestBuilder
    where
        U: fmt::Display,
        P: fmt::Display,
    {
        self.inner = self.inner.basic_auth(username, password);
        self
    }

    /// Enable HTTP bearer authentication for this request alone.
    pub fn bearer_auth<T: fmt::Display>(mut self, token: T) -> RequestBuilder {
        self.inner = self.inner.bearer_auth(token);
        self
    }

    /// Set the request body.
    pub fn body<T: Into<crate::Body>>(mut self, body: T) -> RequestBuilder {
        self.inner = self.inner.body(body);
        self
    }

    /// Attach an execution [`Context`].
    pub fn context(mut self, ctx: Context) -> RequestBuilder {
        self.inner = self.inner.context(ctx);
        self
    }

    /// Override the response-head timeout for this request.
    pub fn timeout(mut self, timeout: Duration) -> RequestBuilder {
        self.inner = self.inner.timeout(timeout);
        self
    }

    /// Send the request, blocking until the response head arrives.
    pub fn send(self) -> crate::Result<Response> {
        let rt = self.rt;
        let res = rt.block_on(self.inner.send())?;
        Ok(Response { rt, inner: res })
    }
}

impl fmt::Debug for RequestBuilder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(&self.inner, f)
    }
}

/// A blocking response, with body accessors that block until the body is
/// fully read.
pub struct Response {
    rt: Arc<tokio::runtime::Runtime>,
    inner: crate::Response,
}

impl Response {
    /// Get the `StatusCode` of this `Response`.
    pub fn status(&self) -> StatusCode {
        self.inner.status()
    }

    /// Get the HTTP `Version` of this `Response`.
    pub fn version(&self) -> Version {
        self.inner.version()
    }

    /// Get the `Headers` of this `Response`.
    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    /// Get the final `Uri` of this `Response`.
    pub fn uri(&self) -> &Uri {
        self.inner.uri()
    }

    /// Collect the full response body as `Bytes`.
    pub fn bytes(self) -> crate::Result<Bytes> {
        self.rt.block_on(self.inner.bytes())
    }

    /// Collect the full response body as text.
    pub fn text(self) -> crate::Result<String> {
        self.rt.block_on(self.inner.text())
    }

    /// Turn a response into an error if the server returned an error
    /// status.
    pub fn error_for_status(self) -> crate::Result<Response> {
        let rt = self.rt;
        self.inner
            .error_for_status()
            .map(|inner| Response { rt, inner })
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(&self.inner, f)
    }
}
