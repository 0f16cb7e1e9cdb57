//! Request-scoped configuration.
//!
//! Centered around two abstractions:
//!
//! - The [`ConfigValue`] trait, which associates a config key type with its
//!   value type.
//! - The [`RequestConfig`] struct, which wraps an optional value of the
//!   type linked via [`ConfigValue`].
//!
//! A `RequestConfig<T>` held by the client carries the default; a
//! `RequestConfig<T>` stored in a request's [`http::Extensions`] shadows
//! it. This gives every option the same resolution rule (request wins,
//! client default otherwise) without duplicating storage code per option.

use std::{fmt::Debug, time::Duration};

use http::Extensions;

/// Associates a configuration key type with its value type.
pub(crate) trait ConfigValue: Copy + Clone + 'static {
    type Value: Clone + Debug + Send + Sync + 'static;
}

/// Carries one request-scoped configuration value.
pub(crate) struct RequestConfig<T: ConfigValue>(Option<T::Value>);

impl<T: ConfigValue> Clone for RequestConfig<T> {
    fn clone(&self) -> Self {
        RequestConfig(self.0.clone())
    }
}

impl<T: ConfigValue> Debug for RequestConfig<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_tuple("RequestConfig").field(&self.0).finish()
    }
}

impl<T: ConfigValue> Default for RequestConfig<T> {
    fn default() -> Self {
        RequestConfig(None)
    }
}

impl<T> RequestConfig<T>
where
    T: ConfigValue,
{
    #[inline]
    pub(crate) const fn new(v: Option<T::Value>) -> Self {
        RequestConfig(v)
    }

    /// Retrieve the value for this request.
    ///
    /// If the request's extensions specify a value, that value wins;
    /// otherwise the client-held default applies.
    #[inline]
    pub(crate) fn fetch<'a>(&'a self, ext: &'a Extensions) -> Option<&'a T::Value> {
        ext.get::<RequestConfig<T>>()
            .and_then(|v| v.0.as_ref())
            .or(self.0.as_ref())
    }

    /// Store a value into the request's extensions, shadowing the default.
    #[inline]
    pub(crate) fn store(ext: &mut Extensions, value: T::Value) {
        ext.insert(RequestConfig::<T>::new(Some(value)));
    }
}

// Well-known per-request option keys. Each is a zero-sized marker; the
// associated type is what actually travels in the extensions.

/// Timeout for establishing the TCP (and TLS) connection.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ConnectTimeout;

impl ConfigValue for ConnectTimeout {
    type Value = Duration;
}

/// Timeout for a connection-pool lease to produce an endpoint.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PoolLeaseTimeout;

impl ConfigValue for PoolLeaseTimeout {
    type Value = Duration;
}

/// Timeout for the response head to arrive after the request is sent.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ResponseTimeout;

impl ConfigValue for ResponseTimeout {
    type Value = Duration;
}

/// Read-inactivity timeout applied to the response body stream.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SocketTimeout;

impl ConfigValue for SocketTimeout {
    type Value = Duration;
}

/// Send `Expect: 100-continue` for requests with bodies.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ExpectContinue;

impl ConfigValue for ExpectContinue {
    type Value = bool;
}

/// Whether 3xx responses are followed at all.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RedirectsEnabled;

impl ConfigValue for RedirectsEnabled {
    type Value = bool;
}

/// Hop cap for one redirect chain.
#[derive(Clone, Copy, Debug)]
pub(crate) struct MaxRedirects;

impl ConfigValue for MaxRedirects {
    type Value = usize;
}

/// Permit revisiting a `(method, URI)` pair within one chain, bounded by
/// [`MaxRedirects`] instead of failing fast.
#[derive(Clone, Copy, Debug)]
pub(crate) struct CircularRedirectsAllowed;

impl ConfigValue for CircularRedirectsAllowed {
    type Value = bool;
}

/// Whether challenge-response authentication runs at all.
#[derive(Clone, Copy, Debug)]
pub(crate) struct AuthenticationEnabled;

impl ConfigValue for AuthenticationEnabled {
    type Value = bool;
}

/// Preferred scheme names (most preferred first) for target-host
/// challenges.
#[derive(Clone, Copy, Debug)]
pub(crate) struct TargetPreferredAuthSchemes;

impl ConfigValue for TargetPreferredAuthSchemes {
    type Value = Vec<String>;
}

/// Preferred scheme names (most preferred first) for proxy challenges.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ProxyPreferredAuthSchemes;

impl ConfigValue for ProxyPreferredAuthSchemes {
    type Value = Vec<String>;
}

/// Cookie handling for this request.
#[derive(Clone, Copy, Debug)]
pub(crate) struct CookieSpecKey;

impl ConfigValue for CookieSpecKey {
    type Value = CookieSpec;
}

/// How cookies are applied to a request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CookieSpec {
    /// Read from and write to the context's cookie store.
    #[default]
    Standard,
    /// Neither send stored cookies nor record `Set-Cookie` responses.
    Ignore,
}

/// The bundle of client-level defaults for every request option.
#[derive(Clone, Debug, Default)]
pub(crate) struct Defaults {
    pub(crate) connect_timeout: RequestConfig<ConnectTimeout>,
    pub(crate) pool_lease_timeout: RequestConfig<PoolLeaseTimeout>,
    pub(crate) response_timeout: RequestConfig<ResponseTimeout>,
    pub(crate) socket_timeout: RequestConfig<SocketTimeout>,
    pub(crate) expect_continue: RequestConfig<ExpectContinue>,
    pub(crate) redirects_enabled: RequestConfig<RedirectsEnabled>,
    pub(crate) max_redirects: RequestConfig<MaxRedirects>,
    pub(crate) circular_redirects_allowed: RequestConfig<CircularRedirectsAllowed>,
    pub(crate) authentication_enabled: RequestConfig<AuthenticationEnabled>,
    pub(crate) target_preferred_auth_schemes: RequestConfig<TargetPreferredAuthSchemes>,
    pub(crate) proxy_preferred_auth_schemes: RequestConfig<ProxyPreferredAuthSchemes>,
    pub(crate) cookie_spec: RequestConfig<CookieSpecKey>,
}
