use http::{HeaderValue, Method, Uri};

use crate::{Error, Result};

use super::{challenge::Challenge, scheme::AuthScheme, Credentials};

/// `Bearer` token authentication (RFC 6750).
#[derive(Debug, Default)]
pub struct Bearer {
    realm: Option<String>,
}

impl AuthScheme for Bearer {
    fn name(&self) -> &'static str {
        "bearer"
    }

    fn process_challenge(&mut self, challenge: &Challenge) -> Result<()> {
        self.realm = challenge.realm().map(str::to_owned);
        Ok(())
    }

    fn is_complete(&self) -> bool {
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
            Credentials::Token(token) => {
                let mut value = HeaderValue::try_from(format!("Bearer {token}"))
                    .map_err(Error::auth)?;
                value.set_sensitive(true);
                Ok(value)
            }
            Credentials::UsernamePassword { .. } => {
                Err(Error::auth("bearer authentication needs a token"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_token() {
        let mut scheme = Bearer::default();
        let value = scheme
            .respond(
                &Credentials::Token("mF_9.B5f-4.1JqM".into()),
                &Method::GET,
                &Uri::from_static("http://example.com/"),
            )
            .unwrap();
        assert_eq!(value.to_str().unwrap(), "Bearer mF_9.B5f-4.1JqM");
    }
}
