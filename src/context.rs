//! Request execution contexts.
//!
//! A [`Context`] carries the request-scoped state that outlives a single
//! wire exchange: authentication exchanges for the target and the proxy,
//! the cache of successfully-negotiated auth schemes, the redirect trail,
//! and details about the endpoint that finally served the request. One
//! context spans a whole `execute` call — every redirect hop, retry and
//! authentication round-trip inside it — and may be reused across
//! sequential requests to keep preemptive authentication warm.
//!
//! Contexts are cheap to clone (shared interior); they are not meant to be
//! shared between *concurrent* `execute` calls.

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use http::{Extensions, StatusCode, Uri};

use crate::{
    auth::{AuthCache, AuthExchange, CredentialsProvider},
    conn::EndpointInfo,
};

/// Opaque identity attached to leased connections.
///
/// A lease carrying a token prefers idle connections previously released
/// under the same token, giving callers connection affinity (e.g. for
/// connection-bound server state).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct UserToken(Arc<str>);

impl UserToken {
    /// View the token's value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for UserToken {
    fn from(s: &str) -> Self {
        UserToken(Arc::from(s))
    }
}

impl From<String> for UserToken {
    fn from(s: String) -> Self {
        UserToken(Arc::from(s))
    }
}

impl fmt::Debug for UserToken {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("UserToken").field(&self.0).finish()
    }
}

/// One followed redirect within an `execute` call.
#[derive(Clone, Debug)]
pub struct RedirectHop {
    /// The 3xx status that caused the hop.
    pub status: StatusCode,
    /// The URI that answered with the redirect.
    pub from: Uri,
    /// The resolved target of the redirect.
    pub to: Uri,
}

/// Request-scoped execution state.
///
/// See the [module docs](self) for the sharing rules.
#[derive(Clone, Default)]
pub struct Context {
    inner: Arc<Mutex<ContextInner>>,
}

#[derive(Default)]
pub(crate) struct ContextInner {
    pub(crate) target_auth: AuthExchange,
    pub(crate) proxy_auth: AuthExchange,
    pub(crate) auth_cache: AuthCache,
    pub(crate) credentials: Option<Arc<dyn CredentialsProvider>>,
    #[cfg(feature = "cookies")]
    pub(crate) cookie_store: Option<Arc<dyn crate::cookie::CookieStore>>,
    pub(crate) trail: Vec<RedirectHop>,
    pub(crate) endpoint: Option<EndpointInfo>,
    pub(crate) user_token: Option<UserToken>,
    pub(crate) extensions: Extensions,
}

impl Context {
    /// Create an empty context.
    pub fn new() -> Context {
        Context::default()
    }

    /// Attach a credentials provider consulted when a host challenges.
    pub fn with_credentials_provider<P>(self, provider: P) -> Context
    where
        P: CredentialsProvider + 'static,
    {
        self.lock().credentials = Some(Arc::new(provider));
        self
    }

    /// Attach an opaque identity used for connection affinity.
    pub fn with_user_token<T: Into<UserToken>>(self, token: T) -> Context {
        self.lock().user_token = Some(token.into());
        self
    }

    /// Attach a cookie store for this context, overriding the client's.
    #[cfg(feature = "cookies")]
    #[cfg_attr(docsrs, doc(cfg(feature = "cookies")))]
    pub fn with_cookie_store<S>(self, store: S) -> Context
    where
        S: crate::cookie::CookieStore + 'static,
    {
        self.lock().cookie_store = Some(Arc::new(store));
        self
    }

    /// The redirects followed by the most recent `execute` call.
    pub fn redirect_trail(&self) -> Vec<RedirectHop> {
        self.lock().trail.clone()
    }

    /// Details of the connection that served the final response, if any
    /// exchange completed.
    pub fn endpoint(&self) -> Option<EndpointInfo> {
        self.lock().endpoint.clone()
    }

    /// The user token, if one was attached.
    pub fn user_token(&self) -> Option<UserToken> {
        self.lock().user_token.clone()
    }

    /// Store a typed extension value on this context.
    pub fn insert_extension<T>(&self, value: T)
    where
        T: Clone + Send + Sync + 'static,
    {
        self.lock().extensions.insert(value);
    }

    /// Retrieve a typed extension value previously stored.
    pub fn extension<T>(&self) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.lock().extensions.get::<T>().cloned()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ContextInner> {
        self.inner.lock().expect("context poisoned")
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("Context")
            .field("trail", &inner.trail)
            .field("endpoint", &inner.endpoint)
            .field("user_token", &inner.user_token)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extensions_round_trip() {
        #[derive(Clone, Debug, PartialEq)]
        struct Marker(u32);

        let ctx = Context::new();
        assert!(ctx.extension::<Marker>().is_none());
        ctx.insert_extension(Marker(7));
        assert_eq!(ctx.extension::<Marker>(), Some(Marker(7)));
    }

    #[test]
    fn clones_share_state() {
        let ctx = Context::new();
        let other = ctx.clone();
        ctx.insert_extension(1u32);
        assert_eq!(other.extension::<u32>(), Some(1));
    }
}
