use std::{fmt, sync::Arc, time::Duration};

use http::{
    header::{HeaderMap, HeaderValue, USER_AGENT},
    Method,
};

use crate::{
    auth::{CredentialsProvider, SchemeRegistry},
    chain::{
        auth::AuthExec, connect::ConnectExec, protocol::ProtocolExec, redirect::RedirectExec,
        retry::RetryExec, Interceptor, Next, Scope,
    },
    config::{Defaults, RequestConfig},
    conn::{Connection, Connector, TlsHandshake},
    error::Error,
    into_uri::IntoUri,
    pool::{Pool, PoolConfig, PoolReusePolicy, PoolStats},
    redirect,
    request::{Request, RequestBuilder},
    response::Response,
    retry::{DefaultRetryStrategy, RetryStrategy},
    route::{Proxy, Route, RoutePlanner},
};

/// An asynchronous `Client` to make Requests with.
///
/// The Client has various configuration values to tweak, but the defaults
/// are set to what is usually the most commonly desired value. To
/// configure a `Client`, use `Client::builder()`.
///
/// The `Client` holds a connection pool internally, so it is advised that
/// you create one and **reuse** it.
///
/// You do **not** have to wrap the `Client` in an [`Rc`] or [`Arc`] to
/// **reuse** it, because it already uses an [`Arc`] internally.
///
/// [`Rc`]: std::rc::Rc
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientRef>,
}

struct ClientRef {
    chain: Box<[Arc<dyn Interceptor>]>,
    pool: Pool<Connection, Route>,
    planner: RoutePlanner,
}

/// A `ClientBuilder` can be used to create a `Client` with custom
/// configuration.
#[must_use]
pub struct ClientBuilder {
    config: Config,
    error: Option<Error>,
}

struct Config {
    // NOTE: When adding a new field, update `fmt::Debug for ClientBuilder`
    defaults: Defaults,
    default_headers: HeaderMap,
    pool: PoolConfig,
    proxies: Vec<Proxy>,
    redirect_policy: redirect::Policy,
    referer: bool,
    retry_strategy: Arc<dyn RetryStrategy>,
    scheme_registry: SchemeRegistry,
    credentials: Option<Arc<dyn CredentialsProvider>>,
    #[cfg(feature = "cookies")]
    cookie_store: Option<Arc<dyn crate::cookie::CookieStore>>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    tls: Option<Arc<dyn TlsHandshake>>,
    tcp_nodelay: bool,
    http2_prior_knowledge: bool,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientBuilder {
    /// Constructs a new `ClientBuilder`.
    ///
    /// This is the same as `Client::builder()`.
    pub fn new() -> ClientBuilder {
        ClientBuilder {
            config: Config {
                defaults: Defaults::default(),
                default_headers: HeaderMap::new(),
                pool: PoolConfig::default(),
                proxies: Vec::new(),
                redirect_policy: redirect::Policy::default(),
                referer: false,
                retry_strategy: Arc::new(DefaultRetryStrategy::new()),
                scheme_registry: SchemeRegistry::new(),
                credentials: None,
                #[cfg(feature = "cookies")]
                cookie_store: None,
                interceptors: Vec::new(),
                tls: None,
                tcp_nodelay: true,
                http2_prior_knowledge: false,
            },
            error: None,
        }
    }

    /// Returns a `Client` that uses this `ClientBuilder` configuration.
    pub fn build(self) -> crate::Result<Client> {
        if let Some(err) = self.error {
            return Err(err);
        }
        let config = self.config;
        let defaults = Arc::new(config.defaults);

        let planner = RoutePlanner::new(config.proxies);
        let pool: Pool<Connection, Route> = Pool::new(config.pool);
        let connector = Connector::new(
            None,
            config.tcp_nodelay,
            config.http2_prior_knowledge,
            config.tls,
        );

        let mut chain: Vec<Arc<dyn Interceptor>> = config.interceptors;
        chain.push(Arc::new(RedirectExec::new(
            config.redirect_policy,
            config.referer,
            defaults.clone(),
        )));
        chain.push(Arc::new(RetryExec::new(config.retry_strategy)));
        chain.push(Arc::new(ProtocolExec::new(
            config.default_headers,
            defaults.clone(),
            #[cfg(feature = "cookies")]
            config.cookie_store,
        )));
        chain.push(Arc::new(AuthExec::new(
            Arc::new(config.scheme_registry),
            config.credentials,
            defaults.clone(),
        )));
        chain.push(Arc::new(ConnectExec::new(
            planner.clone(),
            pool.clone(),
            connector,
            defaults,
        )));

        Ok(Client {
            inner: Arc::new(ClientRef {
                chain: chain.into_boxed_slice(),
                pool,
                planner,
            }),
        })
    }

    // Higher-level options

    /// Sets default headers for every request.
    pub fn default_headers(mut self, headers: HeaderMap) -> ClientBuilder {
        for (key, value) in headers.iter() {
            self.config.default_headers.insert(key, value.clone());
        }
        self
    }

    /// Sets the `User-Agent` header to be used by this client.
    pub fn user_agent<V>(mut self, value: V) -> ClientBuilder
    where
        V: TryInto<HeaderValue>,
        V::Error: Into<http::Error>,
    {
        match value.try_into() {
            Ok(value) => {
                self.config.default_headers.insert(USER_AGENT, value);
            }
            Err(err) => {
                self.error = Some(Error::builder(err.into()));
            }
        }
        self
    }

    /// Set a redirect policy for this client.
    pub fn redirect(mut self, policy: redirect::Policy) -> ClientBuilder {
        self.config.redirect_policy = policy;
        self
    }

    /// Enable or disable automatic `Referer` management.
    pub fn referer(mut self, enable: bool) -> ClientBuilder {
        self.config.referer = enable;
        self
    }

    /// Set the retry strategy consulted on failed attempts.
    pub fn retry<S: RetryStrategy + 'static>(mut self, strategy: S) -> ClientBuilder {
        self.config.retry_strategy = Arc::new(strategy);
        self
    }

    /// Replace the authentication scheme registry.
    pub fn auth_scheme_registry(mut self, registry: SchemeRegistry) -> ClientBuilder {
        self.config.scheme_registry = registry;
        self
    }

    /// Set the client-wide credentials provider, used when a context
    /// carries none.
    pub fn credentials_provider<P>(mut self, provider: P) -> ClientBuilder
    where
        P: CredentialsProvider + 'static,
    {
        self.config.credentials = Some(Arc::new(provider));
        self
    }

    /// Set the client-wide cookie store.
    #[cfg(feature = "cookies")]
    #[cfg_attr(docsrs, doc(cfg(feature = "cookies")))]
    pub fn cookie_provider<S>(mut self, store: Arc<S>) -> ClientBuilder
    where
        S: crate::cookie::CookieStore + 'static,
    {
        self.config.cookie_store = Some(store);
        self
    }

    /// Enable a default in-memory cookie store.
    #[cfg(feature = "cookies")]
    #[cfg_attr(docsrs, doc(cfg(feature = "cookies")))]
    pub fn cookie_store(mut self, enable: bool) -> ClientBuilder {
        self.config.cookie_store = enable.then(|| {
            Arc::new(crate::cookie::Jar::default()) as Arc<dyn crate::cookie::CookieStore>
        });
        self
    }

    /// Add an interceptor to run ahead of the built-in stages.
    pub fn interceptor<I: Interceptor>(mut self, interceptor: I) -> ClientBuilder {
        self.config.interceptors.push(Arc::new(interceptor));
        self
    }

    /// Add a proxy rule to this client. First matching rule wins.
    pub fn proxy(mut self, proxy: Proxy) -> ClientBuilder {
        self.config.proxies.push(proxy);
        self
    }

    /// Install the TLS handshake implementation used for https routes.
    pub fn tls_handshake<T: TlsHandshake + 'static>(mut self, tls: T) -> ClientBuilder {
        self.config.tls = Some(Arc::new(tls));
        self
    }

    // Timeout options

    /// Default response-head timeout, from dispatch until the head
    /// arrives.
    pub fn timeout(mut self, timeout: Duration) -> ClientBuilder {
        self.config.defaults.response_timeout = RequestConfig::new(Some(timeout));
        self
    }

    /// Default timeout for the connect phase.
    pub fn connect_timeout(mut self, timeout: Duration) -> ClientBuilder {
        self.config.defaults.connect_timeout = RequestConfig::new(Some(timeout));
        self
    }

    /// Default read-inactivity timeout on response bodies.
    pub fn read_timeout(mut self, timeout: Duration) -> ClientBuilder {
        self.config.defaults.socket_timeout = RequestConfig::new(Some(timeout));
        self
    }

    /// Default bound on how long a pool lease may wait for a free slot.
    pub fn connection_request_timeout(mut self, timeout: Duration) -> ClientBuilder {
        self.config.defaults.pool_lease_timeout = RequestConfig::new(Some(timeout));
        self
    }

    /// Send `Expect: 100-continue` with request bodies by default.
    pub fn expect_continue(mut self, enable: bool) -> ClientBuilder {
        self.config.defaults.expect_continue = RequestConfig::new(Some(enable));
        self
    }

    /// Enable or disable challenge-response authentication by default.
    pub fn authentication(mut self, enable: bool) -> ClientBuilder {
        self.config.defaults.authentication_enabled = RequestConfig::new(Some(enable));
        self
    }

    // Pool options

    /// Cap on `leased + idle` connections across all routes.
    pub fn pool_max_total(mut self, max: usize) -> ClientBuilder {
        self.config.pool.max_total = max;
        self
    }

    /// Default cap on `leased + idle` connections per route.
    pub fn pool_max_per_route(mut self, max: usize) -> ClientBuilder {
        self.config.pool.default_max_per_route = max;
        self
    }

    /// How long idle connections are kept before the reaper closes them.
    pub fn pool_idle_timeout<D: Into<Option<Duration>>>(mut self, timeout: D) -> ClientBuilder {
        self.config.pool.idle_timeout = timeout.into();
        self
    }

    /// Total lifetime cap on pooled connections, counted from creation.
    pub fn pool_max_lifetime<D: Into<Option<Duration>>>(mut self, ttl: D) -> ClientBuilder {
        self.config.pool.max_lifetime = ttl.into();
        self
    }

    /// Idle reuse order: LIFO (the default) or FIFO.
    pub fn pool_reuse_policy(mut self, policy: PoolReusePolicy) -> ClientBuilder {
        self.config.pool.reuse = policy;
        self
    }

    /// Probe idle connections for liveness only when they have been
    /// unused longer than this window; `None` probes on every reuse.
    pub fn pool_validate_after_inactivity<D: Into<Option<Duration>>>(
        mut self,
        window: D,
    ) -> ClientBuilder {
        self.config.pool.validate_after_inactivity = window.into();
        self
    }

    // Transport options

    /// Set `TCP_NODELAY` on connections. Defaults to `true`.
    pub fn tcp_nodelay(mut self, enable: bool) -> ClientBuilder {
        self.config.tcp_nodelay = enable;
        self
    }

    /// Speak HTTP/2 on plain-text connections without ALPN (prior
    /// knowledge).
    pub fn http2_prior_knowledge(mut self, enable: bool) -> ClientBuilder {
        self.config.http2_prior_knowledge = enable;
        self
    }
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("default_headers", &self.config.default_headers)
            .field("pool", &self.config.pool)
            .field("proxies", &self.config.proxies)
            .field("redirect_policy", &self.config.redirect_policy)
            .field("referer", &self.config.referer)
            .field("scheme_registry", &self.config.scheme_registry)
            .field("tcp_nodelay", &self.config.tcp_nodelay)
            .field("http2_prior_knowledge", &self.config.http2_prior_knowledge)
            .finish()
    }
}

// ===== impl Client =====

impl Client {
    /// Constructs a new `Client` with the default configuration.
    ///
    /// # Panics
    ///
    /// This method panics if the default configuration cannot be built;
    /// use `Client::builder()` to handle the failure as an `Error`.
    pub fn new() -> Client {
        ClientBuilder::new().build().expect("Client::new()")
    }

    /// Creates a `ClientBuilder` to configure a `Client`.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
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

    /// Convenience method to make a `PATCH` request to a URI.
    pub fn patch<U: IntoUri>(&self, uri: U) -> RequestBuilder {
        self.request(Method::PATCH, uri)
    }

    /// Convenience method to make a `DELETE` request to a URI.
    pub fn delete<U: IntoUri>(&self, uri: U) -> RequestBuilder {
        self.request(Method::DELETE, uri)
    }

    /// Convenience method to make a `HEAD` request to a URI.
    pub fn head<U: IntoUri>(&self, uri: U) -> RequestBuilder {
        self.request(Method::HEAD, uri)
    }

    /// Start building a `Request` with the `Method` and `Uri`.
    ///
    /// Returns a `RequestBuilder`, which will allow setting headers and
    /// the request body before sending.
    pub fn request<U: IntoUri>(&self, method: Method, uri: U) -> RequestBuilder {
        let req = uri.into_uri().map(|uri| Request::new(method, uri));
        RequestBuilder::new(self.clone(), req)
    }

    /// Executes a `Request`.
    ///
    /// A `Request` can be built manually with `Request::new()` or
    /// obtained from a `RequestBuilder` with `RequestBuilder::build()`.
    ///
    /// # Errors
    ///
    /// This method fails if there was an error while sending the request,
    /// a redirect loop was detected, or the redirect cap was exhausted.
    pub async fn execute(&self, request: Request) -> crate::Result<Response> {
        let ctx = request.context().cloned().unwrap_or_default();
        let mut scope = Scope::new(ctx);
        Next::new(&self.inner.chain).run(request, &mut scope).await
    }

    /// Compute the route a URI would take under this client's proxy
    /// configuration, e.g. for per-route pool limits.
    pub fn route_for<U: IntoUri>(&self, uri: U) -> crate::Result<Route> {
        let uri = uri.into_uri()?;
        self.inner.planner.plan(&uri)
    }

    /// Aggregate pool counters.
    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    /// Pool counters for one route.
    pub fn pool_stats_for(&self, route: &Route) -> PoolStats {
        self.inner.pool.stats_for(route)
    }

    /// Raise or lower the global connection cap at runtime.
    pub fn set_pool_max_total(&self, max: usize) {
        self.inner.pool.set_max_total(max);
    }

    /// Change the default per-route cap at runtime.
    pub fn set_pool_default_max_per_route(&self, max: usize) {
        self.inner.pool.set_default_max_per_route(max);
    }

    /// Override the cap for one route at runtime.
    pub fn set_pool_max_per_route(&self, route: Route, max: usize) {
        self.inner.pool.set_max_per_route(route, max);
    }

    /// Close idle connections whose keep-alive or lifetime lapsed.
    pub fn close_expired_connections(&self) {
        self.inner.pool.close_expired();
    }

    /// Close idle connections unused for longer than `max_idle`.
    pub fn close_idle_connections(&self, max_idle: Duration) {
        self.inner.pool.close_idle(max_idle);
    }

    /// Shut down the connection pool. In-flight exchanges finish; new
    /// leases fail with the pool-shutdown error kind.
    pub fn close(&self) {
        self.inner.pool.close();
    }
}

impl Default for Client {
    fn default() -> Self {
        Client::new()
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Client")
            .field("pool", &self.inner.pool.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_client_has_empty_pool() {
        let client = Client::builder()
            .pool_max_total(2)
            .pool_max_per_route(1)
            .build()
            .unwrap();
        let stats = client.pool_stats();
        assert_eq!(stats.leased, 0);
        assert_eq!(stats.available, 0);
        assert_eq!(stats.pending, 0);
    }

    #[test]
    fn route_for_honors_proxies() {
        let client = Client::builder()
            .proxy(Proxy::http("http://proxy.local:3128").unwrap())
            .build()
            .unwrap();
        let route = client.route_for("http://example.com/x").unwrap();
        assert_eq!(route.proxy().unwrap().host(), "proxy.local");
    }

    #[test]
    fn request_builder_rejects_relative_uri() {
        let client = Client::new();
        let err = client.get("/relative").build().unwrap_err();
        assert!(err.is_builder());
    }

    #[test]
    fn invalid_user_agent_fails_build() {
        let err = Client::builder().user_agent("bad\nvalue").build().unwrap_err();
        assert!(err.is_builder());
    }
}
