use std::fmt::Write as _;

use http::{HeaderValue, Method, Uri};
use md5::Md5;
use rand::Rng;
use sha2::{Digest as _, Sha256};

use crate::{Error, Result};

use super::{challenge::Challenge, scheme::AuthScheme, Credentials};

/// `Digest` authentication (RFC 7616, with RFC 2617 compatibility).
///
/// Supports the `MD5`, `MD5-sess`, `SHA-256` and `SHA-256-sess`
/// algorithms and `qop=auth`. The nonce count survives across requests so
/// a cached instance keeps producing valid headers preemptively until the
/// server rotates the nonce.
#[derive(Debug, Default)]
pub struct Digest {
    realm: Option<String>,
    nonce: Option<String>,
    opaque: Option<String>,
    algorithm: Algorithm,
    qop_auth: bool,
    stale: bool,
    nc: u32,
    answered: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum Algorithm {
    #[default]
    Md5,
    Md5Sess,
    Sha256,
    Sha256Sess,
}

impl Algorithm {
    fn parse(value: &str) -> Option<Algorithm> {
        if value.eq_ignore_ascii_case("MD5") {
            Some(Algorithm::Md5)
        } else if value.eq_ignore_ascii_case("MD5-sess") {
            Some(Algorithm::Md5Sess)
        } else if value.eq_ignore_ascii_case("SHA-256") {
            Some(Algorithm::Sha256)
        } else if value.eq_ignore_ascii_case("SHA-256-sess") {
            Some(Algorithm::Sha256Sess)
        } else {
            None
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Algorithm::Md5 => "MD5",
            Algorithm::Md5Sess => "MD5-sess",
            Algorithm::Sha256 => "SHA-256",
            Algorithm::Sha256Sess => "SHA-256-sess",
        }
    }

    fn is_session(&self) -> bool {
        matches!(self, Algorithm::Md5Sess | Algorithm::Sha256Sess)
    }

    fn hash(&self, data: &str) -> String {
        match self {
            Algorithm::Md5 | Algorithm::Md5Sess => hex::encode(Md5::digest(data.as_bytes())),
            Algorithm::Sha256 | Algorithm::Sha256Sess => {
                hex::encode(Sha256::digest(data.as_bytes()))
            }
        }
    }
}

impl Digest {
    fn fresh_cnonce() -> String {
        let bytes: [u8; 8] = rand::rng().random();
        hex::encode(bytes)
    }
}

impl AuthScheme for Digest {
    fn name(&self) -> &'static str {
        "digest"
    }

    fn process_challenge(&mut self, challenge: &Challenge) -> Result<()> {
        let nonce = challenge
            .param("nonce")
            .ok_or_else(|| Error::auth("digest challenge carries no nonce"))?;

        self.stale = challenge
            .param("stale")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let nonce_rotated = self.nonce.as_deref() != Some(nonce);
        if nonce_rotated {
            self.nc = 0;
        }

        self.realm = challenge.realm().map(str::to_owned);
        self.nonce = Some(nonce.to_owned());
        self.opaque = challenge.param("opaque").map(str::to_owned);
        self.algorithm = match challenge.param("algorithm") {
            Some(value) => Algorithm::parse(value)
                .ok_or_else(|| Error::auth(format!("unsupported digest algorithm {value:?}")))?,
            None => Algorithm::Md5,
        };
        self.qop_auth = challenge
            .param("qop")
            .map(|qop| qop.split(',').any(|q| q.trim().eq_ignore_ascii_case("auth")))
            .unwrap_or(false);

        Ok(())
    }

    fn is_complete(&self) -> bool {
        // A re-challenge with a stale (or rotated) nonce invites another
        // attempt with the same credentials; anything else is final.
        self.answered && !self.stale
    }

    fn supports_preemptive(&self) -> bool {
        // Valid as long as the server honors the cached nonce.
        self.nonce.is_some()
    }

    fn realm(&self) -> Option<&str> {
        self.realm.as_deref()
    }

    fn respond(
        &mut self,
        credentials: &Credentials,
        method: &Method,
        uri: &Uri,
    ) -> Result<HeaderValue> {
        let (username, password) = match credentials {
            Credentials::UsernamePassword { username, password } => (username, password),
            Credentials::Token(_) => {
                return Err(Error::auth("digest authentication needs a username and password"))
            }
        };
        let nonce = self
            .nonce
            .clone()
            .ok_or_else(|| Error::auth("digest scheme was never challenged"))?;
        let realm = self.realm.clone().unwrap_or_default();
        let digest_uri = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_owned())
            .unwrap_or_else(|| "/".to_owned());

        self.nc += 1;
        let nc = format!("{:08x}", self.nc);
        let cnonce = Digest::fresh_cnonce();
        let algorithm = self.algorithm;

        let mut ha1 = algorithm.hash(&format!("{username}:{realm}:{password}"));
        if algorithm.is_session() {
            ha1 = algorithm.hash(&format!("{ha1}:{nonce}:{cnonce}"));
        }
        let ha2 = algorithm.hash(&format!("{method}:{digest_uri}"));

        let response = if self.qop_auth {
            algorithm.hash(&format!("{ha1}:{nonce}:{nc}:{cnonce}:auth:{ha2}"))
        } else {
            algorithm.hash(&format!("{ha1}:{nonce}:{ha2}"))
        };

        let mut header = String::with_capacity(128);
        write!(
            header,
            "Digest username=\"{username}\", realm=\"{realm}\", nonce=\"{nonce}\", \
             uri=\"{digest_uri}\", response=\"{response}\", algorithm={}",
            algorithm.label()
        )
        .expect("writing to a String cannot fail");
        if self.qop_auth {
            write!(header, ", qop=auth, nc={nc}, cnonce=\"{cnonce}\"")
                .expect("writing to a String cannot fail");
        }
        if let Some(ref opaque) = self.opaque {
            write!(header, ", opaque=\"{opaque}\"").expect("writing to a String cannot fail");
        }

        self.answered = true;
        self.stale = false;

        let mut value = HeaderValue::try_from(header).map_err(Error::auth)?;
        value.set_sensitive(true);
        Ok(value)
    }
}
