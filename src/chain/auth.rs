use std::sync::Arc;

use futures_util::future::BoxFuture;
use http::{
    header::{AUTHORIZATION, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, WWW_AUTHENTICATE},
    HeaderValue, StatusCode, Uri,
};

use crate::{
    auth::{parse_challenges, CredentialsProvider, SchemeRegistry, DEFAULT_SCHEME_PREFERENCE},
    config::Defaults,
    request::Request,
    response::Response,
};

use super::{Interceptor, Next, Scope};

// An adversarial server could rotate digest nonces forever; the state
// machine terminates on honest peers, this cap bounds the rest.
const MAX_CHALLENGE_ROUNDS: usize = 10;

/// Handles `401`/`407` challenges: selects a scheme, attaches
/// credentials, and re-enters the chain. Terminal failures return the
/// challenge response to the caller as-is.
pub(crate) struct AuthExec {
    registry: Arc<SchemeRegistry>,
    provider: Option<Arc<dyn CredentialsProvider>>,
    defaults: Arc<Defaults>,
}

impl AuthExec {
    pub(crate) fn new(
        registry: Arc<SchemeRegistry>,
        provider: Option<Arc<dyn CredentialsProvider>>,
        defaults: Arc<Defaults>,
    ) -> AuthExec {
        AuthExec {
            registry,
            provider,
            defaults,
        }
    }

    fn preference(&self, req: &Request, proxy: bool) -> Vec<String> {
        let configured = if proxy {
            self.defaults
                .proxy_preferred_auth_schemes
                .fetch(req.extensions())
        } else {
            self.defaults
                .target_preferred_auth_schemes
                .fetch(req.extensions())
        };
        match configured {
            Some(schemes) => schemes.clone(),
            None => DEFAULT_SCHEME_PREFERENCE
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

fn target_host_port(uri: &Uri) -> Option<(String, u16)> {
    let host = uri.host()?.to_owned();
    let port = uri.port_u16().unwrap_or_else(|| {
        if uri.scheme_str() == Some("https") {
            443
        } else {
            80
        }
    });
    Some((host, port))
}

impl Interceptor for AuthExec {
    fn exec<'a>(
        &'a self,
        req: Request,
        scope: &'a mut Scope,
        next: Next<'a>,
    ) -> BoxFuture<'a, crate::Result<Response>> {
        Box::pin(async move {
            let enabled = self
                .defaults
                .authentication_enabled
                .fetch(req.extensions())
                .copied()
                .unwrap_or(true);

            let mut req = req;
            let mut rounds = 0;

            loop {
                let replay = req.try_clone();
                let method = req.method().clone();
                let uri = req.uri().clone();

                let res = next.run(req, &mut *scope).await?;
                let status = res.status();

                let proxy_challenge = status == StatusCode::PROXY_AUTHENTICATION_REQUIRED;
                let is_challenge = status == StatusCode::UNAUTHORIZED || proxy_challenge;

                if !is_challenge {
                    // Any non-challenge response concludes a pending
                    // attempt successfully and caches its scheme.
                    if enabled {
                        let mut inner = scope.ctx.lock();
                        let inner = &mut *inner;
                        if let Some((host, port)) = target_host_port(&uri) {
                            inner
                                .target_auth
                                .on_success(&host, port, &mut inner.auth_cache);
                        }
                        if let Some(proxy) =
                            scope.route.as_ref().and_then(|route| route.proxy())
                        {
                            let (host, port) = (proxy.host().to_owned(), proxy.port());
                            inner
                                .proxy_auth
                                .on_success(&host, port, &mut inner.auth_cache);
                        }
                    }
                    return Ok(res);
                }

                if !enabled {
                    return Ok(res);
                }
                rounds += 1;
                if rounds > MAX_CHALLENGE_ROUNDS {
                    return Ok(res);
                }
                // Replaying needs the body again; streaming producers
                // surface the challenge to the caller instead.
                let Some(replay) = replay else {
                    return Ok(res);
                };

                let challenge_header = if proxy_challenge {
                    PROXY_AUTHENTICATE
                } else {
                    WWW_AUTHENTICATE
                };
                let challenges = parse_challenges(res.headers().get_all(challenge_header));
                if challenges.is_empty() {
                    return Ok(res);
                }

                let (host, port) = if proxy_challenge {
                    match scope.route.as_ref().and_then(|route| route.proxy()) {
                        Some(proxy) => (proxy.host().to_owned(), proxy.port()),
                        // A 407 without a proxy on the route is the
                        // server's problem, not ours.
                        None => return Ok(res),
                    }
                } else {
                    match target_host_port(&uri) {
                        Some(pair) => pair,
                        None => return Ok(res),
                    }
                };

                let preference = self.preference(&replay, proxy_challenge);
                let provider = {
                    let inner = scope.ctx.lock();
                    inner.credentials.clone()
                }
                .or_else(|| self.provider.clone());

                let header: Option<crate::Result<HeaderValue>> = {
                    let mut inner = scope.ctx.lock();
                    let exchange = if proxy_challenge {
                        &mut inner.proxy_auth
                    } else {
                        &mut inner.target_auth
                    };
                    let selected = exchange.on_challenge(
                        &challenges,
                        &self.registry,
                        &preference,
                        provider.as_deref(),
                        &host,
                        port,
                    );
                    if selected {
                        exchange.respond(&method, &uri)
                    } else {
                        None
                    }
                };

                let value = match header {
                    Some(Ok(value)) => value,
                    Some(Err(err)) => {
                        // The scheme could not produce a header (wrong
                        // credential type, say); terminal.
                        debug!("auth scheme failed to respond: {}", err);
                        return Ok(res);
                    }
                    None => return Ok(res),
                };

                debug!("answering {} challenge from {}", status, host);
                drop(res);

                let mut next_req = replay;
                let header_name = if proxy_challenge {
                    PROXY_AUTHORIZATION
                } else {
                    AUTHORIZATION
                };
                next_req.headers_mut().insert(header_name, value);
                req = next_req;
            }
        })
    }
}
