use std::fmt;

use sha2::{Digest as _, Sha256};

use crate::Result;

/// Derives the backend storage key from a logical cache key.
///
/// Backends with key-length or charset restrictions (memcached being the
/// classic case) get a fixed-width digest instead of the raw
/// `METHOD:URI` string. Derivation failures degrade to cache misses
/// rather than failing the request path.
pub trait KeyHasher: Send + Sync {
    /// Map a logical key to the backend key.
    fn hash(&self, key: &str) -> Result<String>;
}

impl<F> KeyHasher for F
where
    F: Fn(&str) -> Result<String> + Send + Sync,
{
    fn hash(&self, key: &str) -> Result<String> {
        (self)(key)
    }
}

/// The default hasher: lowercase hex SHA-256 of the logical key.
#[derive(Clone, Copy, Default)]
pub struct Sha256KeyHasher;

impl KeyHasher for Sha256KeyHasher {
    fn hash(&self, key: &str) -> Result<String> {
        Ok(hex::encode(Sha256::digest(key.as_bytes())))
    }
}

impl fmt::Debug for Sha256KeyHasher {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Sha256KeyHasher")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_of_known_input() {
        let hasher = Sha256KeyHasher;
        // sha256("abc")
        assert_eq!(
            hasher.hash("abc").unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn identical_keys_collide_on_purpose() {
        let hasher = Sha256KeyHasher;
        assert_eq!(hasher.hash("k").unwrap(), hasher.hash("k").unwrap());
        assert_ne!(hasher.hash("k").unwrap(), hasher.hash("K").unwrap());
    }
}
