use base64::{engine::general_purpose::STANDARD, Engine};
use http::{HeaderValue, Method, Uri};

use crate::{Error, Result};

use super::{challenge::Challenge, scheme::AuthScheme, Credentials};

/// `Basic` authentication (RFC 7617): `base64(user:pass)`.
#[derive(Debug, Default)]
pub struct Basic {
    realm: Option<String>,
}

impl Basic {
    pub(crate) fn encode(username: &str, password: &str) -> HeaderValue {
        let encoded = STANDARD.encode(format!("{username}:{password}"));
        let mut value = HeaderValue::try_from(format!("Basic {encoded}"))
            .expect("base64 is always a valid header value");
        value.set_sensitive(true);
        value
    }
}

impl AuthScheme for Basic {
    fn name(&self) -> &'static str {
        "basic"
    }

    fn process_challenge(&mut self, challenge: &Challenge) -> Result<()> {
        self.realm = challenge.realm().map(str::to_owned);
        Ok(())
    }

    fn is_complete(&self) -> bool {
        // One shot: credentials either worked or they never will.
        true
    }

    fn supports_preemptive(&self) -> bool {
        true
    }

    fn realm(&self) -> Option<&str> {
        self.realm.as_deref()
    }

    fn respond(
        &mut self,
        credentials: &Credentials,
        _method: &Method,
        _uri: &Uri,
    ) -> Result<HeaderValue> {
        match credentials {
            Credentials::UsernamePassword { username, password } => {
                Ok(Basic::encode(username, password))
            }
            Credentials::Token(_) => Err(Error::auth(
                "basic authentication needs a username and password",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_rfc_example() {
        // RFC 7617 §2 example pair
        let value = Basic::encode("Aladdin", "open sesame");
        assert_eq!(value.to_str().unwrap(), "Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ==");
        assert!(value.is_sensitive());
    }

    #[test]
    fn token_credentials_are_rejected() {
        let mut scheme = Basic::default();
        let err = scheme
            .respond(
                &Credentials::Token("abc".into()),
                &Method::GET,
                &Uri::from_static("http://example.com/"),
            )
            .unwrap_err();
        assert!(err.is_auth());
    }
}
