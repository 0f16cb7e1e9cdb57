use std::collections::HashMap;

use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use serde::{Deserialize, Serialize};

/// A stored response: status, headers, body bytes, and the variant map
/// for `Vary` negotiation.
///
/// The entry records the request method and effective URI it was stored
/// under; storage implementations compare that identity against the
/// requested key and treat a mismatch as a miss (hash collision).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    method: String,
    uri: String,
    status: u16,
    headers: Vec<(String, Vec<u8>)>,
    body: Vec<u8>,
    variants: HashMap<String, String>,
}

impl CacheEntry {
    /// Build an entry for `method uri` answering with `status`, the given
    /// headers and body.
    pub fn new(
        method: &Method,
        uri: &Uri,
        status: StatusCode,
        headers: &HeaderMap,
        body: Vec<u8>,
    ) -> CacheEntry {
        CacheEntry {
            method: method.as_str().to_owned(),
            uri: uri.to_string(),
            status: status.as_u16(),
            headers: headers
                .iter()
                .map(|(name, value)| (name.as_str().to_owned(), value.as_bytes().to_vec()))
                .collect(),
            body,
            variants: HashMap::new(),
        }
    }

    /// The primary cache key for a request: method plus effective URI.
    pub fn primary_key(method: &Method, uri: &Uri) -> String {
        format!("{method}:{uri}")
    }

    /// The sibling key for a specific valuation of the headers listed in
    /// `Vary`.
    pub fn variant_key(primary: &str, fingerprint: &str) -> String {
        format!("{{{fingerprint}}}{primary}")
    }

    /// The key this entry was stored under.
    pub fn key(&self) -> String {
        format!("{}:{}", self.method, self.uri)
    }

    /// The stored response status.
    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// The stored response headers.
    pub fn headers(&self) -> HeaderMap {
        let mut map = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                name.parse::<HeaderName>(),
                HeaderValue::from_bytes(value),
            ) {
                map.append(name, value);
            }
        }
        map
    }

    /// The stored body bytes.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Register a sibling entry for a variant fingerprint.
    pub fn add_variant(&mut self, fingerprint: impl Into<String>, key: impl Into<String>) {
        self.variants.insert(fingerprint.into(), key.into());
    }

    /// Look up the sibling key for a variant fingerprint.
    pub fn variant(&self, fingerprint: &str) -> Option<&str> {
        self.variants.get(fingerprint).map(String::as_str)
    }

    /// All registered variants.
    pub fn variants(&self) -> impl Iterator<Item = (&str, &str)> {
        self.variants
            .iter()
            .map(|(fingerprint, key)| (fingerprint.as_str(), key.as_str()))
    }
}
