use std::{
    collections::HashMap,
    fmt,
    sync::Mutex,
    time::{Duration, Instant},
};

use bytes::Bytes;
use futures_util::future::BoxFuture;

use crate::Result;

use super::{CasBackend, CasOutcome, CasToken};

/// An in-process [`CasBackend`] with real CAS tokens.
///
/// Suitable for tests and single-process deployments; every write bumps
/// the slot's token so racing `cas` calls observe `Exists`.
#[derive(Default)]
pub struct InMemoryBackend {
    slots: Mutex<Slots>,
}

#[derive(Default)]
struct Slots {
    map: HashMap<String, Slot>,
    next_token: u64,
}

struct Slot {
    token: u64,
    value: Bytes,
    expires_at: Option<Instant>,
}

impl Slots {
    fn live(&mut self, key: &str) -> Option<&Slot> {
        let expired = self
            .map
            .get(key)
            .and_then(|slot| slot.expires_at)
            .is_some_and(|at| Instant::now() >= at);
        if expired {
            self.map.remove(key);
        }
        self.map.get(key)
    }

    fn store(&mut self, key: &str, value: Bytes, ttl: Option<Duration>) {
        self.next_token += 1;
        self.map.insert(
            key.to_owned(),
            Slot {
                token: self.next_token,
                value,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
    }
}

impl InMemoryBackend {
    /// An empty store.
    pub fn new() -> InMemoryBackend {
        InMemoryBackend::default()
    }

    /// Number of live entries, for diagnostics.
    pub fn len(&self) -> usize {
        self.slots.lock().unwrap().map.len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CasBackend for InMemoryBackend {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Bytes>>> {
        Box::pin(async move {
            let mut slots = self.slots.lock().unwrap();
            Ok(slots.live(key).map(|slot| slot.value.clone()))
        })
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut slots = self.slots.lock().unwrap();
            slots.store(key, value, ttl);
            Ok(())
        })
    }

    fn gets<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<(CasToken, Bytes)>>> {
        Box::pin(async move {
            let mut slots = self.slots.lock().unwrap();
            Ok(slots
                .live(key)
                .map(|slot| (CasToken::new(slot.token), slot.value.clone())))
        })
    }

    fn cas<'a>(
        &'a self,
        key: &'a str,
        token: CasToken,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> BoxFuture<'a, Result<CasOutcome>> {
        Box::pin(async move {
            let mut slots = self.slots.lock().unwrap();
            let outcome = match slots.live(key) {
                None => CasOutcome::NotFound,
                Some(slot) if slot.token != token.value() => CasOutcome::Exists,
                Some(_) => CasOutcome::Ok,
            };
            if outcome == CasOutcome::Ok {
                slots.store(key, value, ttl);
            }
            Ok(outcome)
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut slots = self.slots.lock().unwrap();
            slots.map.remove(key);
            Ok(())
        })
    }
}

impl fmt::Debug for InMemoryBackend {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("InMemoryBackend")
            .field("entries", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cas_token_rotates_on_write() {
        let backend = InMemoryBackend::new();
        backend.set("k", Bytes::from_static(b"v1"), None).await.unwrap();

        let (token, value) = backend.gets("k").await.unwrap().unwrap();
        assert_eq!(value, Bytes::from_static(b"v1"));

        // Conditional write with the live token succeeds once.
        assert_eq!(
            backend
                .cas("k", token, Bytes::from_static(b"v2"), None)
                .await
                .unwrap(),
            CasOutcome::Ok
        );
        // The same token is now stale.
        assert_eq!(
            backend
                .cas("k", token, Bytes::from_static(b"v3"), None)
                .await
                .unwrap(),
            CasOutcome::Exists
        );
    }

    #[tokio::test]
    async fn cas_against_missing_key_reports_not_found() {
        let backend = InMemoryBackend::new();
        assert_eq!(
            backend
                .cas("nope", CasToken::new(1), Bytes::new(), None)
                .await
                .unwrap(),
            CasOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn ttl_expires_entries() {
        let backend = InMemoryBackend::new();
        backend
            .set("k", Bytes::from_static(b"v"), Some(Duration::ZERO))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(backend.get("k").await.unwrap().is_none());
        assert!(backend.is_empty());
    }
}
