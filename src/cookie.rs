//! HTTP Cookies
//!
//! Cookie parsing and persistence are external collaborators; this
//! module defines the header-level [`CookieStore`] contract the protocol
//! stage talks to, plus [`Jar`], a good default implementation backed by
//! the `cookie_store` crate.

use std::fmt;
use std::sync::RwLock;

use http::{HeaderValue, Uri};

/// Actions for a persistent cookie store providing session support.
///
/// Implementations must be thread-safe; one store may serve many
/// contexts.
pub trait CookieStore: Send + Sync {
    /// Store a set of `Set-Cookie` header values received from `uri`.
    fn set_cookies(&self, cookie_headers: &[HeaderValue], uri: &Uri);

    /// Get the `Cookie` header value for a request to `uri`.
    fn cookies(&self, uri: &Uri) -> Option<HeaderValue>;
}

/// A good default `CookieStore` implementation.
///
/// This is the implementation used when simply calling
/// `cookie_store(true)`. This type is exposed to allow creating one and
/// filling it with some existing cookies more easily, before creating a
/// `Client`.
#[derive(Default)]
pub struct Jar(RwLock<cookie_store::CookieStore>);

impl Jar {
    /// Add a cookie to this jar, as if `uri` had answered with it in a
    /// `Set-Cookie` header.
    ///
    /// # Example
    ///
    /// ```
    /// use courier::{cookie::Jar, Uri};
    ///
    /// let uri = Uri::from_static("https://example.com");
    /// let jar = Jar::default();
    /// jar.add_cookie_str("foo=bar; Domain=example.com", &uri);
    /// ```
    pub fn add_cookie_str(&self, cookie: &str, uri: &Uri) {
        let Some(url) = to_url(uri) else { return };
        let cookies = cookie_crate::Cookie::parse(cookie.to_owned())
            .ok()
            .into_iter();
        self.0
            .write()
            .expect("jar poisoned")
            .store_response_cookies(cookies, &url);
    }
}

impl CookieStore for Jar {
    fn set_cookies(&self, cookie_headers: &[HeaderValue], uri: &Uri) {
        let Some(url) = to_url(uri) else { return };
        let cookies = cookie_headers.iter().filter_map(|value| {
            std::str::from_utf8(value.as_bytes())
                .ok()
                .and_then(|text| cookie_crate::Cookie::parse(text.to_owned()).ok())
        });
        self.0
            .write()
            .expect("jar poisoned")
            .store_response_cookies(cookies, &url);
    }

    fn cookies(&self, uri: &Uri) -> Option<HeaderValue> {
        let url = to_url(uri)?;
        let store = self.0.read().expect("jar poisoned");
        let value = store
            .get_request_values(&url)
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ");
        if value.is_empty() {
            return None;
        }
        HeaderValue::try_from(value).ok()
    }
}

impl fmt::Debug for Jar {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Jar")
    }
}

fn to_url(uri: &Uri) -> Option<url::Url> {
    url::Url::parse(&uri.to_string()).ok()
}
