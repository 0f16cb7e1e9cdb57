//! Challenge-response authentication.
//!
//! The client reacts to `401`/`407` responses by parsing the offered
//! challenges, selecting the most preferred scheme for which credentials
//! resolve, and replaying the request with the scheme's header attached.
//! Target and proxy authentication run independently, each as a small
//! state machine held by the request [`Context`]:
//!
//! ```text
//! Unchallenged -> Challenged -> HaveScheme -> Attempted -> Success
//!                                                       \-> Failure
//! ```
//!
//! A successful exchange is cached in the context keyed by
//! `(host, port, realm, scheme)`; later requests in the same context send
//! the scheme preemptively, skipping the challenge round-trip.
//!
//! [`Context`]: crate::Context

use std::{
    fmt,
    sync::{Arc, Mutex},
};

use http::{HeaderValue, Method, Uri};

mod basic;
mod bearer;
mod challenge;
mod digest;
mod scheme;

pub use self::basic::Basic;
pub use self::bearer::Bearer;
pub use self::challenge::Challenge;
pub use self::digest::Digest;
pub use self::scheme::AuthScheme;

pub(crate) use self::challenge::parse_challenges;

/// The default scheme preference, most preferred first.
pub(crate) const DEFAULT_SCHEME_PREFERENCE: &[&str] = &["bearer", "digest", "basic"];

/// Credentials handed to a scheme.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// A username/password pair, for `Basic` and `Digest`.
    UsernamePassword {
        /// The user name.
        username: String,
        /// The password.
        password: String,
    },
    /// An opaque token, for `Bearer`.
    Token(String),
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Credentials::UsernamePassword { username, .. } => f
                .debug_struct("UsernamePassword")
                .field("username", username)
                .field("password", &"********")
                .finish(),
            Credentials::Token(_) => f.debug_tuple("Token").field(&"********").finish(),
        }
    }
}

/// The scope a credentials lookup applies to.
///
/// Fields left as `None` act as wildcards when matching stored
/// credentials.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AuthScope {
    /// The challenging host.
    pub host: String,
    /// The challenging port.
    pub port: Option<u16>,
    /// The realm announced by the challenge.
    pub realm: Option<String>,
    /// The lowercased scheme name.
    pub scheme: Option<String>,
}

impl AuthScope {
    /// A scope for any realm and scheme on `host:port`.
    pub fn new(host: impl Into<String>, port: u16) -> AuthScope {
        AuthScope {
            host: host.into(),
            port: Some(port),
            realm: None,
            scheme: None,
        }
    }

    /// Restrict this scope to a realm.
    pub fn with_realm(mut self, realm: impl Into<String>) -> AuthScope {
        self.realm = Some(realm.into());
        self
    }

    /// Restrict this scope to a scheme name.
    pub fn with_scheme(mut self, scheme: impl Into<String>) -> AuthScope {
        self.scheme = Some(scheme.into().to_ascii_lowercase());
        self
    }

    /// Match score of `self` (a stored scope) against a challenge scope;
    /// `None` means no match, higher is more specific.
    fn match_score(&self, query: &AuthScope) -> Option<u32> {
        if !self.host.is_empty() && !self.host.eq_ignore_ascii_case(&query.host) {
            return None;
        }
        let mut score = if self.host.is_empty() { 0 } else { 8 };
        match (self.port, query.port) {
            (Some(a), Some(b)) if a != b => return None,
            (Some(_), _) => score += 4,
            (None, _) => {}
        }
        match (&self.realm, &query.realm) {
            (Some(a), Some(b)) if a != b => return None,
            (Some(_), _) => score += 2,
            (None, _) => {}
        }
        match (&self.scheme, &query.scheme) {
            (Some(a), Some(b)) if !a.eq_ignore_ascii_case(b) => return None,
            (Some(_), _) => score += 1,
            (None, _) => {}
        }
        Some(score)
    }
}

/// Resolves credentials for a challenge scope.
///
/// Implementations must be thread-safe; one provider may serve many
/// contexts.
pub trait CredentialsProvider: Send + Sync {
    /// Return credentials for the given scope, or `None` to decline.
    fn credentials(&self, scope: &AuthScope) -> Option<Credentials>;
}

impl<F> CredentialsProvider for F
where
    F: Fn(&AuthScope) -> Option<Credentials> + Send + Sync,
{
    fn credentials(&self, scope: &AuthScope) -> Option<Credentials> {
        (self)(scope)
    }
}

/// A provider that answers every scope with the same credentials.
#[derive(Clone, Debug)]
pub struct StaticCredentials {
    credentials: Credentials,
}

impl StaticCredentials {
    /// Provide the given credentials unconditionally.
    pub fn new(credentials: Credentials) -> StaticCredentials {
        StaticCredentials { credentials }
    }

    /// Username/password shorthand.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> StaticCredentials {
        StaticCredentials::new(Credentials::UsernamePassword {
            username: username.into(),
            password: password.into(),
        })
    }

    /// Bearer token shorthand.
    pub fn bearer(token: impl Into<String>) -> StaticCredentials {
        StaticCredentials::new(Credentials::Token(token.into()))
    }
}

impl CredentialsProvider for StaticCredentials {
    fn credentials(&self, _scope: &AuthScope) -> Option<Credentials> {
        Some(self.credentials.clone())
    }
}

/// A provider backed by per-scope entries; the most specific matching
/// entry wins.
#[derive(Default)]
pub struct CredentialsMap {
    entries: Mutex<Vec<(AuthScope, Credentials)>>,
}

impl CredentialsMap {
    /// An empty map.
    pub fn new() -> CredentialsMap {
        CredentialsMap::default()
    }

    /// Register credentials for a scope.
    pub fn insert(&self, scope: AuthScope, credentials: Credentials) {
        self.entries.lock().unwrap().push((scope, credentials));
    }
}

impl CredentialsProvider for CredentialsMap {
    fn credentials(&self, query: &AuthScope) -> Option<Credentials> {
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .filter_map(|(scope, creds)| scope.match_score(query).map(|s| (s, creds)))
            .max_by_key(|(score, _)| *score)
            .map(|(_, creds)| creds.clone())
    }
}

impl fmt::Debug for CredentialsMap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let entries = self.entries.lock().unwrap();
        f.debug_struct("CredentialsMap")
            .field("entries", &entries.len())
            .finish()
    }
}

/// Creates scheme instances by name.
#[derive(Clone)]
pub struct SchemeRegistry {
    factories: Vec<(String, Arc<dyn Fn() -> Box<dyn AuthScheme> + Send + Sync>)>,
}

impl SchemeRegistry {
    /// A registry with `basic`, `bearer` and `digest` installed.
    pub fn new() -> SchemeRegistry {
        let mut registry = SchemeRegistry {
            factories: Vec::new(),
        };
        registry.register("basic", || Box::new(Basic::default()));
        registry.register("bearer", || Box::new(Bearer::default()));
        registry.register("digest", || Box::new(Digest::default()));
        registry
    }

    /// Install (or replace) a scheme factory under `name`.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn AuthScheme> + Send + Sync + 'static,
    {
        let name = name.to_ascii_lowercase();
        self.factories.retain(|(n, _)| *n != name);
        self.factories.push((name, Arc::new(factory)));
    }

    pub(crate) fn create(&self, name: &str) -> Option<Box<dyn AuthScheme>> {
        self.factories
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, f)| f())
    }
}

impl Default for SchemeRegistry {
    fn default() -> Self {
        SchemeRegistry::new()
    }
}

impl fmt::Debug for SchemeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SchemeRegistry")
            .field(
                "schemes",
                &self.factories.iter().map(|(n, _)| n).collect::<Vec<_>>(),
            )
            .finish()
    }
}

// ===== state machine =====

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) enum AuthState {
    #[default]
    Unchallenged,
    Challenged,
    HaveScheme,
    Attempted,
    Success,
    Failure,
}

/// Per-host (target or proxy) authentication state within a context.
#[derive(Default)]
pub(crate) struct AuthExchange {
    pub(crate) state: AuthState,
    scheme: Option<Box<dyn AuthScheme>>,
    credentials: Option<Credentials>,
    fingerprint: Option<Vec<String>>,
}

impl AuthExchange {
    /// Digest a challenge set into something comparable, to tell a
    /// re-challenge apart from a brand-new one.
    fn fingerprint_of(challenges: &[Challenge]) -> Vec<String> {
        challenges
            .iter()
            .map(|c| {
                format!(
                    "{}|{}|{}",
                    c.scheme,
                    c.realm().unwrap_or(""),
                    c.param("nonce").unwrap_or("")
                )
            })
            .collect()
    }

    /// React to a 401/407 challenge set. Returns `true` when a scheme was
    /// selected and the request should be replayed with credentials.
    pub(crate) fn on_challenge(
        &mut self,
        challenges: &[Challenge],
        registry: &SchemeRegistry,
        preference: &[String],
        provider: Option<&dyn CredentialsProvider>,
        host: &str,
        port: u16,
    ) -> bool {
        let was_attempted = self.state == AuthState::Attempted;
        let previous_fingerprint = self.fingerprint.replace(Self::fingerprint_of(challenges));
        let challenge_changed = previous_fingerprint.as_ref() != self.fingerprint.as_ref();
        self.state = AuthState::Challenged;

        // A scheme already in flight continues only when the server sent a
        // *different* challenge set (e.g. a digest nonce rotation) that
        // leaves it incomplete; repeating the same challenge after an
        // attempt means the credentials were rejected.
        if was_attempted && challenge_changed {
            if let Some(scheme) = self.scheme.as_mut() {
                if let Some(ch) = challenges.iter().find(|c| c.scheme == scheme.name()) {
                    if scheme.process_challenge(ch).is_ok()
                        && !scheme.is_complete()
                        && self.credentials.is_some()
                    {
                        debug!("retrying auth scheme {:?} for {}", scheme.name(), host);
                        self.state = AuthState::HaveScheme;
                        return true;
                    }
                }
            }
        }

        let failed_scheme = if was_attempted {
            self.scheme.as_ref().map(|s| s.name())
        } else {
            None
        };

        for name in preference {
            if failed_scheme == Some(name.as_str()) {
                continue;
            }
            let Some(ch) = challenges
                .iter()
                .find(|c| c.scheme.eq_ignore_ascii_case(name))
            else {
                continue;
            };
            let Some(mut scheme) = registry.create(name) else {
                continue;
            };
            if scheme.process_challenge(ch).is_err() {
                continue;
            }
            let Some(provider) = provider else { break };
            let scope = AuthScope {
                host: host.to_owned(),
                port: Some(port),
                realm: scheme.realm().map(str::to_owned),
                scheme: Some(scheme.name().to_owned()),
            };
            match provider.credentials(&scope) {
                Some(credentials) => {
                    debug!("selected auth scheme {:?} for {}", scheme.name(), host);
                    self.scheme = Some(scheme);
                    self.credentials = Some(credentials);
                    self.state = AuthState::HaveScheme;
                    return true;
                }
                None => continue,
            }
        }

        self.state = AuthState::Failure;
        false
    }

    /// Produce the credentials header for the next attempt, moving
    /// `HaveScheme -> Attempted`.
    pub(crate) fn respond(
        &mut self,
        method: &Method,
        uri: &Uri,
    ) -> Option<crate::Result<HeaderValue>> {
        if self.state != AuthState::HaveScheme {
            return None;
        }
        let scheme = self.scheme.as_mut()?;
        let credentials = self.credentials.as_ref()?;
        let result = scheme.respond(credentials, method, uri);
        self.state = AuthState::Attempted;
        Some(result)
    }

    /// A non-challenge response arrived after an attempt: the exchange
    /// succeeded. Moves the live scheme into the cache for preemptive use.
    pub(crate) fn on_success(&mut self, host: &str, port: u16, cache: &mut AuthCache) {
        if self.state != AuthState::Attempted {
            return;
        }
        self.state = AuthState::Success;
        if let (Some(scheme), Some(credentials)) = (self.scheme.take(), self.credentials.clone()) {
            cache.put(host, port, scheme, credentials);
        }
    }
}

/// Successfully-negotiated schemes, kept per context for preemptive
/// authentication.
#[derive(Default)]
pub(crate) struct AuthCache {
    entries: Vec<CachedAuth>,
}

pub(crate) struct CachedAuth {
    host: String,
    port: u16,
    realm: Option<String>,
    scheme_name: String,
    pub(crate) scheme: Arc<Mutex<Box<dyn AuthScheme>>>,
    pub(crate) credentials: Credentials,
}

impl AuthCache {
    fn put(&mut self, host: &str, port: u16, scheme: Box<dyn AuthScheme>, credentials: Credentials) {
        let realm = scheme.realm().map(str::to_owned);
        let scheme_name = scheme.name().to_owned();
        self.entries.retain(|e| {
            !(e.host == host && e.port == port && e.realm == realm && e.scheme_name == scheme_name)
        });
        self.entries.push(CachedAuth {
            host: host.to_owned(),
            port,
            realm,
            scheme_name,
            scheme: Arc::new(Mutex::new(scheme)),
            credentials,
        });
    }

    /// The most recently cached preemptive-capable scheme for a host.
    pub(crate) fn preemptive_for(&self, host: &str, port: u16) -> Option<&CachedAuth> {
        self.entries
            .iter()
            .rev()
            .find(|e| {
                e.host.eq_ignore_ascii_case(host)
                    && e.port == port
                    && e.scheme.lock().unwrap().supports_preemptive()
            })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn preference() -> Vec<String> {
        DEFAULT_SCHEME_PREFERENCE
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn basic_challenge(realm: &str) -> Challenge {
        Challenge {
            scheme: "basic".into(),
            params: vec![("realm".into(), realm.into())],
            token68: None,
        }
    }

    #[test]
    fn selects_scheme_and_attempts() {
        let registry = SchemeRegistry::new();
        let provider = StaticCredentials::basic("user", "passwd");
        let mut exchange = AuthExchange::default();

        let selected = exchange.on_challenge(
            &[basic_challenge("r")],
            &registry,
            &preference(),
            Some(&provider),
            "example.com",
            80,
        );
        assert!(selected);
        assert_eq!(exchange.state, AuthState::HaveScheme);

        let header = exchange
            .respond(&Method::GET, &Uri::from_static("http://example.com/"))
            .unwrap()
            .unwrap();
        assert!(header.to_str().unwrap().starts_with("Basic "));
        assert_eq!(exchange.state, AuthState::Attempted);
    }

    #[test]
    fn no_credentials_consults_provider_once_and_fails() {
        let registry = SchemeRegistry::new();
        let calls = AtomicUsize::new(0);
        let provider = move |scope: &AuthScope| {
            calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(scope.host, "example.com");
            assert_eq!(scope.realm.as_deref(), Some("test realm"));
            assert_eq!(calls.load(Ordering::SeqCst), 1);
            None
        };
        let mut exchange = AuthExchange::default();

        let selected = exchange.on_challenge(
            &[basic_challenge("test realm")],
            &registry,
            &preference(),
            Some(&provider),
            "example.com",
            80,
        );
        assert!(!selected);
        assert_eq!(exchange.state, AuthState::Failure);
    }

    #[test]
    fn rechallenge_after_basic_attempt_fails() {
        let registry = SchemeRegistry::new();
        let provider = StaticCredentials::basic("user", "wrong");
        let mut exchange = AuthExchange::default();

        assert!(exchange.on_challenge(
            &[basic_challenge("r")],
            &registry,
            &preference(),
            Some(&provider),
            "h",
            80,
        ));
        exchange
            .respond(&Method::GET, &Uri::from_static("http://h/"))
            .unwrap()
            .unwrap();

        // Same challenge again: basic is complete, nothing else offered.
        assert!(!exchange.on_challenge(
            &[basic_challenge("r")],
            &registry,
            &preference(),
            Some(&provider),
            "h",
            80,
        ));
        assert_eq!(exchange.state, AuthState::Failure);
    }

    #[test]
    fn success_caches_for_preemptive_use() {
        let registry = SchemeRegistry::new();
        let provider = StaticCredentials::basic("user", "passwd");
        let mut exchange = AuthExchange::default();
        let mut cache = AuthCache::default();

        exchange.on_challenge(
            &[basic_challenge("r")],
            &registry,
            &preference(),
            Some(&provider),
            "h",
            80,
        );
        exchange
            .respond(&Method::GET, &Uri::from_static("http://h/"))
            .unwrap()
            .unwrap();
        exchange.on_success("h", 80, &mut cache);
        assert_eq!(exchange.state, AuthState::Success);

        let cached = cache.preemptive_for("h", 80).expect("cached");
        assert_eq!(cached.scheme_name, "basic");
        assert!(cache.preemptive_for("h", 8080).is_none());
        assert!(cache.preemptive_for("other", 80).is_none());
    }

    #[test]
    fn preference_order_picks_most_preferred() {
        let registry = SchemeRegistry::new();
        let provider = CredentialsMap::new();
        provider.insert(
            AuthScope::new("h", 80).with_scheme("basic"),
            Credentials::UsernamePassword {
                username: "u".into(),
                password: "p".into(),
            },
        );
        provider.insert(
            AuthScope::new("h", 80).with_scheme("bearer"),
            Credentials::Token("t".into()),
        );

        let challenges = vec![
            basic_challenge("r"),
            Challenge {
                scheme: "bearer".into(),
                params: vec![("realm".into(), "r".into())],
                token68: None,
            },
        ];

        let mut exchange = AuthExchange::default();
        assert!(exchange.on_challenge(
            &challenges,
            &registry,
            &preference(),
            Some(&provider),
            "h",
            80,
        ));
        let header = exchange
            .respond(&Method::GET, &Uri::from_static("http://h/"))
            .unwrap()
            .unwrap();
        assert!(header.to_str().unwrap().starts_with("Bearer "));
    }

    #[test]
    fn credentials_map_prefers_specific_scope() {
        let map = CredentialsMap::new();
        map.insert(
            AuthScope {
                host: String::new(),
                port: None,
                realm: None,
                scheme: None,
            },
            Credentials::Token("anywhere".into()),
        );
        map.insert(
            AuthScope::new("h", 80).with_realm("r"),
            Credentials::Token("exact".into()),
        );

        let query = AuthScope::new("h", 80).with_realm("r");
        assert_eq!(
            map.credentials(&query),
            Some(Credentials::Token("exact".into()))
        );

        let other = AuthScope::new("elsewhere", 80);
        assert_eq!(
            map.credentials(&other),
            Some(Credentials::Token("anywhere".into()))
        );
    }

    #[test]
    fn debug_redacts_secrets() {
        let creds = Credentials::UsernamePassword {
            username: "user".into(),
            password: "hunter2".into(),
        };
        let formatted = format!("{creds:?}");
        assert!(!formatted.contains("hunter2"));
        assert!(formatted.contains("user"));
    }
}
