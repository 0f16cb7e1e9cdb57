use std::{fmt, time::Duration};

use http::{
    header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE},
    Extensions, Method, Uri,
};
use serde::Serialize;

use crate::{
    auth::Basic,
    body::Body,
    client::Client,
    config::{
        AuthenticationEnabled, CircularRedirectsAllowed, ConnectTimeout, CookieSpec,
        CookieSpecKey, ExpectContinue, MaxRedirects, PoolLeaseTimeout, ProxyPreferredAuthSchemes,
        RedirectsEnabled, RequestConfig, ResponseTimeout, SocketTimeout,
        TargetPreferredAuthSchemes,
    },
    context::Context,
    error::Error,
    response::Response,
};

/// A request which can be executed with `Client::execute()`.
pub struct Request {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Option<Body>,
    extensions: Extensions,
    context: Option<Context>,
}

/// A builder to construct the properties of a `Request`.
///
/// To construct a `RequestBuilder`, refer to the [`Client`] documentation.
#[must_use = "RequestBuilder does nothing until you 'send' it"]
pub struct RequestBuilder {
    client: Client,
    request: crate::Result<Request>,
}

// ===== impl Request =====

impl Request {
    /// Constructs a new request.
    #[inline]
    pub fn new(method: Method, uri: Uri) -> Self {
        Request {
            method,
            uri,
            headers: HeaderMap::new(),
            body: None,
            extensions: Extensions::new(),
            context: None,
        }
    }

    /// Get the method.
    #[inline]
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Get a mutable reference to the method.
    #[inline]
    pub fn method_mut(&mut self) -> &mut Method {
        &mut self.method
    }

    /// Get the URI.
    #[inline]
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Get a mutable reference to the URI.
    #[inline]
    pub fn uri_mut(&mut self) -> &mut Uri {
        &mut self.uri
    }

    /// Get the headers.
    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Get a mutable reference to the headers.
    #[inline]
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Get the body.
    #[inline]
    pub fn body(&self) -> Option<&Body> {
        self.body.as_ref()
    }

    /// Get a mutable reference to the body.
    #[inline]
    pub fn body_mut(&mut self) -> &mut Option<Body> {
        &mut self.body
    }

    pub(crate) fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub(crate) fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    pub(crate) fn context(&self) -> Option<&Context> {
        self.context.as_ref()
    }

    pub(crate) fn set_context(&mut self, ctx: Context) {
        self.context = Some(ctx);
    }

    /// Attempt to clone the request.
    ///
    /// `None` is returned if the body cannot be produced again (it
    /// streams).
    pub fn try_clone(&self) -> Option<Request> {
        let body = match self.body.as_ref() {
            Some(body) => Some(body.try_clone()?),
            None => None,
        };
        Some(Request {
            method: self.method.clone(),
            uri: self.uri.clone(),
            headers: self.headers.clone(),
            body,
            extensions: self.extensions.clone(),
            context: self.context.clone(),
        })
    }

    pub(crate) fn into_parts(self) -> (Method, Uri, HeaderMap, Option<Body>, Extensions, Option<Context>) {
        (
            self.method,
            self.uri,
            self.headers,
            self.body,
            self.extensions,
            self.context,
        )
    }

    pub(crate) fn from_parts(
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Option<Body>,
        extensions: Extensions,
        context: Option<Context>,
    ) -> Request {
        Request {
            method,
            uri,
            headers,
            body,
            extensions,
            context,
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("headers", &self.headers)
            .finish()
    }
}

// ===== impl RequestBuilder =====

impl RequestBuilder {
    pub(crate) fn new(client: Client, request: crate::Result<Request>) -> RequestBuilder {
        RequestBuilder { client, request }
    }

    /// Add a header to this request.
    pub fn header<K, V>(mut self, key: K, value: V) -> RequestBuilder
    where
        HeaderName: TryFrom<K>,
        <HeaderName as TryFrom<K>>::Error: Into<http::Error>,
        HeaderValue: TryFrom<V>,
        <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
    {
        let mut error = None;
        if let Ok(ref mut req) = self.request {
            match <HeaderName as TryFrom<K>>::try_from(key) {
                Ok(key) => match HeaderValue::try_from(value) {
                    Ok(value) => {
                        req.headers_mut().append(key, value);
                    }
                    Err(e) => error = Some(Error::builder(e.into())),
                },
                Err(e) => error = Some(Error::builder(e.into())),
            }
        }
        if let Some(err) = error {
            self.request = Err(err);
        }
        self
    }

    /// Add a set of headers to the existing ones on this request.
    pub fn headers(mut self, headers: HeaderMap) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            let mut prev_name = None;
            for (key, value) in headers {
                match key {
                    Some(key) => {
                        req.headers_mut().append(key.clone(), value);
                        prev_name = Some(key);
                    }
                    None => {
                        if let Some(ref key) = prev_name {
                            req.headers_mut().append(key.clone(), value);
                        }
                    }
                }
            }
        }
        self
    }

    /// Enable HTTP basic authentication for this request alone.
    ///
    /// For challenge-driven or preemptive authentication across a whole
    /// context, attach a credentials provider instead.
    pub fn basic_auth<U, P>(self, username: U, password: Option<P>) -> RequestBuilder
    where
        U: fmt::Display,
        P: fmt::Display,
    {
        let password = password
            .map(|p| p.to_string())
            .unwrap_or_default();
        let value = Basic::encode(&username.to_string(), &password);
        self.header(http::header::AUTHORIZATION, value)
    }

    /// Enable HTTP bearer authentication for this request alone.
    pub fn bearer_auth<T: fmt::Display>(self, token: T) -> RequestBuilder {
        let mut builder = self;
        let value = match HeaderValue::try_from(format!("Bearer {token}")) {
            Ok(mut value) => {
                value.set_sensitive(true);
                value
            }
            Err(e) => {
                builder.request = Err(Error::builder(e));
                return builder;
            }
        };
        builder.header(http::header::AUTHORIZATION, value)
    }

    /// Set the request body.
    pub fn body<T: Into<Body>>(mut self, body: T) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            *req.body_mut() = Some(body.into());
        }
        self
    }

    /// Send a form body, url-encoded from `form`.
    ///
    /// Sets the `Content-Type: application/x-www-form-urlencoded` header.
    pub fn form<T: Serialize + ?Sized>(mut self, form: &T) -> RequestBuilder {
        let mut error = None;
        if let Ok(ref mut req) = self.request {
            match serde_urlencoded::to_string(form) {
                Ok(body) => {
                    req.headers_mut().entry(CONTENT_TYPE).or_insert(
                        HeaderValue::from_static("application/x-www-form-urlencoded"),
                    );
                    *req.body_mut() = Some(body.into());
                }
                Err(err) => error = Some(Error::builder(err)),
            }
        }
        if let Some(err) = error {
            self.request = Err(err);
        }
        self
    }

    /// Send a JSON body, serialized from `json`.
    ///
    /// Sets the `Content-Type: application/json` header.
    pub fn json<T: Serialize + ?Sized>(mut self, json: &T) -> RequestBuilder {
        let mut error = None;
        if let Ok(ref mut req) = self.request {
            match serde_json::to_vec(json) {
                Ok(body) => {
                    req.headers_mut()
                        .entry(CONTENT_TYPE)
                        .or_insert(HeaderValue::from_static("application/json"));
                    *req.body_mut() = Some(body.into());
                }
                Err(err) => error = Some(Error::builder(err)),
            }
        }
        if let Some(err) = error {
            self.request = Err(err);
        }
        self
    }

    /// Append a query string serialized from `query`.
    pub fn query<T: Serialize + ?Sized>(mut self, query: &T) -> RequestBuilder {
        let mut error = None;
        if let Ok(ref mut req) = self.request {
            match serde_urlencoded::to_string(query) {
                Ok(appended) if !appended.is_empty() => {
                    let uri = req.uri().clone();
                    let mut parts = uri.into_parts();
                    let path_and_query = match parts.path_and_query.take() {
                        Some(pq) => match pq.query() {
                            Some(existing) => {
                                format!("{}?{existing}&{appended}", pq.path())
                            }
                            None => format!("{}?{appended}", pq.path()),
                        },
                        None => format!("/?{appended}"),
                    };
                    match path_and_query.parse() {
                        Ok(pq) => {
                            parts.path_and_query = Some(pq);
                            match Uri::from_parts(parts) {
                                Ok(uri) => *req.uri_mut() = uri,
                                Err(err) => error = Some(Error::builder(err)),
                            }
                        }
                        Err(err) => error = Some(Error::builder(err)),
                    }
                }
                Ok(_) => {}
                Err(err) => error = Some(Error::builder(err)),
            }
        }
        if let Some(err) = error {
            self.request = Err(err);
        }
        self
    }

    /// Attach an execution [`Context`], threading request-scoped state
    /// (auth exchanges, redirect trail, user token) through this call.
    pub fn context(mut self, ctx: Context) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            req.set_context(ctx);
        }
        self
    }

    fn store_config<T>(mut self, value: T::Value) -> RequestBuilder
    where
        T: crate::config::ConfigValue,
    {
        if let Ok(ref mut req) = self.request {
            RequestConfig::<T>::store(req.extensions_mut(), value);
        }
        self
    }

    /// Override the response-head timeout for this request.
    pub fn timeout(self, timeout: Duration) -> RequestBuilder {
        self.store_config::<ResponseTimeout>(timeout)
    }

    /// Override the connect timeout for this request.
    pub fn connect_timeout(self, timeout: Duration) -> RequestBuilder {
        self.store_config::<ConnectTimeout>(timeout)
    }

    /// Override how long a pool lease may wait for a free slot.
    pub fn connection_request_timeout(self, timeout: Duration) -> RequestBuilder {
        self.store_config::<PoolLeaseTimeout>(timeout)
    }

    /// Override the response-body read-inactivity timeout.
    pub fn read_timeout(self, timeout: Duration) -> RequestBuilder {
        self.store_config::<SocketTimeout>(timeout)
    }

    /// Send `Expect: 100-continue` with the request body.
    pub fn expect_continue(self, enabled: bool) -> RequestBuilder {
        self.store_config::<ExpectContinue>(enabled)
    }

    /// Enable or disable redirect following for this request.
    pub fn redirects(self, enabled: bool) -> RequestBuilder {
        self.store_config::<RedirectsEnabled>(enabled)
    }

    /// Override the redirect hop cap for this request.
    pub fn max_redirects(self, max: usize) -> RequestBuilder {
        self.store_config::<MaxRedirects>(max)
    }

    /// Allow revisiting a location within one redirect chain, bounded by
    /// the hop cap.
    pub fn circular_redirects(self, allowed: bool) -> RequestBuilder {
        self.store_config::<CircularRedirectsAllowed>(allowed)
    }

    /// Enable or disable challenge-response authentication.
    pub fn authentication(self, enabled: bool) -> RequestBuilder {
        self.store_config::<AuthenticationEnabled>(enabled)
    }

    /// Preferred auth schemes for target challenges, most preferred
    /// first.
    pub fn target_auth_schemes<I, S>(self, schemes: I) -> RequestBuilder
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let schemes = schemes
            .into_iter()
            .map(|s| s.into().to_ascii_lowercase())
            .collect();
        self.store_config::<TargetPreferredAuthSchemes>(schemes)
    }

    /// Preferred auth schemes for proxy challenges, most preferred first.
    pub fn proxy_auth_schemes<I, S>(self, schemes: I) -> RequestBuilder
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let schemes = schemes
            .into_iter()
            .map(|s| s.into().to_ascii_lowercase())
            .collect();
        self.store_config::<ProxyPreferredAuthSchemes>(schemes)
    }

    /// Cookie handling for this request.
    pub fn cookie_spec(self, spec: CookieSpec) -> RequestBuilder {
        self.store_config::<CookieSpecKey>(spec)
    }

    /// Build a `Request`, which can be inspected, modified and executed
    /// with `Client::execute()`.
    pub fn build(self) -> crate::Result<Request> {
        self.request
    }

    /// Constructs the request and sends it to the target URI, returning a
    /// future Response.
    ///
    /// # Errors
    ///
    /// This method fails if there was an error while sending the request,
    /// a redirect loop was detected, or the redirect cap was exhausted.
    pub async fn send(self) -> crate::Result<Response> {
        match self.request {
            Ok(req) => self.client.execute(req).await,
            Err(err) => Err(err),
        }
    }
}

impl fmt::Debug for RequestBuilder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut builder = f.debug_struct("RequestBuilder");
        match self.request {
            Ok(ref req) => builder
                .field("method", req.method())
                .field("uri", req.uri())
                .finish(),
            Err(ref err) => builder.field("error", err).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_clone_preserves_reusable_body() {
        let mut req = Request::new(Method::POST, Uri::from_static("http://h/"));
        *req.body_mut() = Some(Body::from("payload"));
        let clone = req.try_clone().expect("reusable body clones");
        assert_eq!(
            clone.body().and_then(|b| b.as_bytes()),
            Some(&b"payload"[..])
        );
    }

    #[test]
    fn try_clone_fails_for_streaming_body() {
        let mut req = Request::new(Method::POST, Uri::from_static("http://h/"));
        *req.body_mut() = Some(Body::wrap(Body::from("stream")));
        assert!(req.try_clone().is_none());
    }
}
