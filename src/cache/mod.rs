//! Cache storage protocol.
//!
//! The storage contract HTTP caching layers build on: an abstract
//! key-to-entry store with unconditional writes and compare-and-swap
//! updates. Caching *policy* (freshness, revalidation) is out of scope;
//! this module only defines how entries are kept.
//!
//! Two seams are exposed:
//!
//! - [`CacheStorage`] is what cache layers consume: `get` / `put` /
//!   `remove` / `update`, where `update` retries a read-modify-write loop
//!   against concurrent writers and fails with the update-conflict error
//!   kind when the retries run out.
//! - [`CasBackend`] is what external stores implement: byte-oriented
//!   `get` / `set` / `gets` / `cas` / `delete` with opaque tokens, the
//!   shape of memcached-style protocols.
//!
//! [`CasStorage`] adapts any backend into a [`CacheStorage`], handling
//! key derivation (SHA-256 by default, pluggable via [`KeyHasher`]) and
//! the serde entry codec. Decode failures and hash collisions degrade to
//! misses; encode failures surface with the serialization error kind.

use std::{fmt, sync::Arc, time::Duration};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

mod entry;
mod key;
mod memory;

pub use self::entry::CacheEntry;
pub use self::key::{KeyHasher, Sha256KeyHasher};
pub use self::memory::InMemoryBackend;

/// The callback applied by [`CacheStorage::update`]: current entry in,
/// replacement out. May run several times when CAS races.
pub type UpdateFn = Box<dyn Fn(Option<CacheEntry>) -> CacheEntry + Send + Sync>;

/// The entry store consumed by caching layers.
pub trait CacheStorage: Send + Sync {
    /// Look up the entry stored under `key`.
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<CacheEntry>>>;

    /// Store `entry` under `key` unconditionally.
    fn put<'a>(&'a self, key: &'a str, entry: CacheEntry) -> BoxFuture<'a, Result<()>>;

    /// Remove the entry under `key`. Removing an absent key is fine.
    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Read-modify-write `key` atomically with respect to concurrent
    /// updates, retrying a bounded number of times before failing with
    /// the update-conflict error kind.
    fn update<'a>(&'a self, key: &'a str, f: UpdateFn) -> BoxFuture<'a, Result<()>>;
}

/// An opaque compare-and-swap token returned by [`CasBackend::gets`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CasToken(u64);

impl CasToken {
    /// Wrap a backend-native token value.
    pub fn new(value: u64) -> CasToken {
        CasToken(value)
    }

    /// The backend-native token value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

/// Result of a conditional write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CasOutcome {
    /// The write was applied.
    Ok,
    /// The key changed since the token was issued.
    Exists,
    /// The key vanished since the token was issued.
    NotFound,
}

/// The byte-oriented contract external backends implement.
///
/// Backend timeouts and transport failures surface with the I/O error
/// kind.
pub trait CasBackend: Send + Sync {
    /// Fetch the bytes stored under `key`.
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Bytes>>>;

    /// Store bytes unconditionally, with an optional time-to-live.
    fn set<'a>(
        &'a self,
        key: &'a str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> BoxFuture<'a, Result<()>>;

    /// Fetch bytes plus the CAS token for a later conditional write.
    fn gets<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<(CasToken, Bytes)>>>;

    /// Conditionally store bytes if the key is unchanged since `token`.
    fn cas<'a>(
        &'a self,
        key: &'a str,
        token: CasToken,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> BoxFuture<'a, Result<CasOutcome>>;

    /// Delete the key. Deleting an absent key is fine.
    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>>;
}

/// What actually travels to the backend: the logical key alongside the
/// entry, so collisions under the derived key are detectable.
#[derive(Serialize, Deserialize)]
struct Envelope {
    key: String,
    entry: CacheEntry,
}

fn encode(key: &str, entry: CacheEntry) -> Result<Bytes> {
    let envelope = Envelope {
        key: key.to_owned(),
        entry,
    };
    serde_json::to_vec(&envelope)
        .map(Bytes::from)
        .map_err(Error::serialization)
}

/// Decode bytes stored under `key`. Anything that does not round-trip to
/// an entry for that exact key reads as a miss.
fn decode(key: &str, bytes: &[u8]) -> Option<CacheEntry> {
    let envelope: Envelope = serde_json::from_slice(bytes).ok()?;
    if envelope.key != key {
        trace!("cache key collision: wanted {:?}, found {:?}", key, envelope.key);
        return None;
    }
    Some(envelope.entry)
}

/// Adapts a [`CasBackend`] into a [`CacheStorage`].
pub struct CasStorage<B> {
    backend: B,
    hasher: Arc<dyn KeyHasher>,
    ttl: Option<Duration>,
    max_update_retries: u32,
}

impl<B: CasBackend> CasStorage<B> {
    /// Wrap `backend` with the default SHA-256 key derivation, no TTL and
    /// three update retries.
    pub fn new(backend: B) -> CasStorage<B> {
        CasStorage {
            backend,
            hasher: Arc::new(Sha256KeyHasher),
            ttl: None,
            max_update_retries: 3,
        }
    }

    /// Replace the key derivation function.
    pub fn with_hasher<H: KeyHasher + 'static>(mut self, hasher: H) -> Self {
        self.hasher = Arc::new(hasher);
        self
    }

    /// Time-to-live passed to the backend on every write.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// How many times `update` retries a lost CAS race before failing.
    pub fn with_max_update_retries(mut self, max: u32) -> Self {
        self.max_update_retries = max;
        self
    }
}

impl<B: CasBackend> CacheStorage for CasStorage<B> {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<CacheEntry>>> {
        Box::pin(async move {
            // Key derivation failures read as misses.
            let Ok(storage_key) = self.hasher.hash(key) else {
                return Ok(None);
            };
            let Some(bytes) = self.backend.get(&storage_key).await? else {
                return Ok(None);
            };
            Ok(decode(key, &bytes))
        })
    }

    fn put<'a>(&'a self, key: &'a str, entry: CacheEntry) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let Ok(storage_key) = self.hasher.hash(key) else {
                return Ok(());
            };
            let bytes = encode(key, entry)?;
            self.backend.set(&storage_key, bytes, self.ttl).await
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let Ok(storage_key) = self.hasher.hash(key) else {
                return Ok(());
            };
            self.backend.delete(&storage_key).await
        })
    }

    fn update<'a>(&'a self, key: &'a str, f: UpdateFn) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let Ok(storage_key) = self.hasher.hash(key) else {
                return Ok(());
            };

            let mut attempts = 0u32;
            loop {
                match self.backend.gets(&storage_key).await? {
                    None => {
                        // Nothing stored yet: plain write. A racing writer
                        // may still beat us; the caller asked for
                        // last-writer-wins in that window.
                        let entry = f(None);
                        let bytes = encode(key, entry)?;
                        return self.backend.set(&storage_key, bytes, self.ttl).await;
                    }
                    Some((token, bytes)) => {
                        let current = decode(key, &bytes);
                        let entry = f(current);
                        let encoded = encode(key, entry)?;
                        match self
                            .backend
                            .cas(&storage_key, token, encoded, self.ttl)
                            .await?
                        {
                            CasOutcome::Ok => return Ok(()),
                            CasOutcome::Exists | CasOutcome::NotFound => {
                                attempts += 1;
                                if attempts > self.max_update_retries {
                                    return Err(Error::update_conflict(key));
                                }
                                trace!("cache update raced for {:?}, retrying", key);
                            }
                        }
                    }
                }
            }
        })
    }
}

impl<B: fmt::Debug> fmt::Debug for CasStorage<B> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CasStorage")
            .field("backend", &self.backend)
            .field("ttl", &self.ttl)
            .field("max_update_retries", &self.max_update_retries)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use http::{HeaderMap, Method, StatusCode, Uri};

    use super::*;

    fn entry(body: &[u8]) -> CacheEntry {
        CacheEntry::new(
            &Method::GET,
            &Uri::from_static("http://example.com/x"),
            StatusCode::OK,
            &HeaderMap::new(),
            body.to_vec(),
        )
    }

    #[tokio::test]
    async fn round_trip_through_backend() {
        let storage = CasStorage::new(InMemoryBackend::new());
        let key = "GET:http://example.com/x";

        assert!(storage.get(key).await.unwrap().is_none());
        storage.put(key, entry(b"one")).await.unwrap();
        let loaded = storage.get(key).await.unwrap().expect("hit");
        assert_eq!(loaded.body(), b"one");

        storage.remove(key).await.unwrap();
        assert!(storage.get(key).await.unwrap().is_none());
        // Idempotent remove.
        storage.remove(key).await.unwrap();
    }

    #[tokio::test]
    async fn collision_under_derived_key_is_a_miss() {
        // A hasher that maps every logical key to one slot.
        let storage =
            CasStorage::new(InMemoryBackend::new()).with_hasher(|_key: &str| Ok("slot".to_owned()));

        storage.put("GET:http://a/", entry(b"a")).await.unwrap();

        // Same derived key, different logical key: miss, not a wrong hit.
        assert!(storage.get("GET:http://b/").await.unwrap().is_none());

        // The next put overwrites unconditionally.
        storage.put("GET:http://b/", entry(b"b")).await.unwrap();
        assert!(storage.get("GET:http://a/").await.unwrap().is_none());
        assert!(storage.get("GET:http://b/").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn hasher_failure_degrades_to_miss() {
        let storage = CasStorage::new(InMemoryBackend::new())
            .with_hasher(|_key: &str| Err(Error::serialization("no key for you")));

        assert!(storage.get("k").await.unwrap().is_none());
        storage.put("k", entry(b"x")).await.unwrap();
        storage.remove("k").await.unwrap();
        storage
            .update("k", Box::new(|_| entry(b"y")))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn update_applies_over_current_value() {
        let storage = CasStorage::new(InMemoryBackend::new());
        let key = "GET:http://example.com/x";

        storage
            .update(
                key,
                Box::new(|current| {
                    assert!(current.is_none());
                    entry(b"0")
                }),
            )
            .await
            .unwrap();

        storage
            .update(
                key,
                Box::new(|current| {
                    let current = current.expect("stored");
                    let mut body = current.body().to_vec();
                    body.push(b'1');
                    entry(&body)
                }),
            )
            .await
            .unwrap();

        let loaded = storage.get(key).await.unwrap().unwrap();
        assert_eq!(loaded.body(), b"01");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_updates_are_serialized() {
        const WORKERS: usize = 8;
        const ROUNDS: usize = 25;

        let storage = Arc::new(
            CasStorage::new(InMemoryBackend::new()).with_max_update_retries(u32::MAX - 1),
        );
        let key = "GET:http://example.com/counter";

        let mut tasks = Vec::new();
        for _ in 0..WORKERS {
            let storage = storage.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..ROUNDS {
                    storage
                        .update(
                            key,
                            Box::new(|current| {
                                let next = match current {
                                    Some(entry) => {
                                        let mut body = entry.body().to_vec();
                                        body.push(b'.');
                                        body
                                    }
                                    None => vec![b'.'],
                                };
                                entry_with(next)
                            }),
                        )
                        .await
                        .unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        // No update was silently dropped.
        let loaded = storage.get(key).await.unwrap().unwrap();
        assert_eq!(loaded.body().len(), WORKERS * ROUNDS);

        fn entry_with(body: Vec<u8>) -> CacheEntry {
            CacheEntry::new(
                &Method::GET,
                &Uri::from_static("http://example.com/counter"),
                StatusCode::OK,
                &HeaderMap::new(),
                body,
            )
        }
    }

    #[tokio::test]
    async fn exhausted_retries_fail_with_update_conflict() {
        // A backend whose conditional writes always lose.
        struct AlwaysRaces(InMemoryBackend);

        impl CasBackend for AlwaysRaces {
            fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Bytes>>> {
                self.0.get(key)
            }
            fn set<'a>(
                &'a self,
                key: &'a str,
                value: Bytes,
                ttl: Option<Duration>,
            ) -> BoxFuture<'a, Result<()>> {
                self.0.set(key, value, ttl)
            }
            fn gets<'a>(
                &'a self,
                key: &'a str,
            ) -> BoxFuture<'a, Result<Option<(CasToken, Bytes)>>> {
                self.0.gets(key)
            }
            fn cas<'a>(
                &'a self,
                _key: &'a str,
                _token: CasToken,
                _value: Bytes,
                _ttl: Option<Duration>,
            ) -> BoxFuture<'a, Result<CasOutcome>> {
                Box::pin(async { Ok(CasOutcome::Exists) })
            }
            fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>> {
                self.0.delete(key)
            }
        }

        let storage = CasStorage::new(AlwaysRaces(InMemoryBackend::new()))
            .with_max_update_retries(2);
        let key = "GET:http://example.com/x";
        storage.put(key, entry(b"seed")).await.unwrap();

        let err = storage
            .update(key, Box::new(|_| entry(b"next")))
            .await
            .unwrap_err();
        assert!(err.is_update_conflict());
    }
}
