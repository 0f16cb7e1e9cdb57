use std::sync::Arc;

use futures_util::future::BoxFuture;
use http::{
    header::{CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, LOCATION, REFERER, TRANSFER_ENCODING},
    Method, Uri,
};

use crate::{
    config::Defaults,
    context::RedirectHop,
    error::Error,
    redirect::{
        is_redirect_status, make_referer, method_rewrite, resolve_location,
        scrub_cross_origin_headers, ActionKind, MethodRewrite, Policy, TooManyRedirects,
    },
    request::Request,
    response::Response,
};

use super::{Interceptor, Next, Scope};

/// Intercepts 3xx responses: resolves the new location, rewrites method
/// and body, detects loops, scrubs cross-origin credentials, and
/// re-enters the chain.
pub(crate) struct RedirectExec {
    policy: Policy,
    referer: bool,
    defaults: Arc<Defaults>,
}

impl RedirectExec {
    pub(crate) fn new(policy: Policy, referer: bool, defaults: Arc<Defaults>) -> RedirectExec {
        RedirectExec {
            policy,
            referer,
            defaults,
        }
    }
}

impl Interceptor for RedirectExec {
    fn exec<'a>(
        &'a self,
        req: Request,
        scope: &'a mut Scope,
        next: Next<'a>,
    ) -> BoxFuture<'a, crate::Result<Response>> {
        Box::pin(async move {
            let enabled = self
                .defaults
                .redirects_enabled
                .fetch(req.extensions())
                .copied()
                .unwrap_or(true)
                && !self.policy.is_none();
            let circular_allowed = self
                .defaults
                .circular_redirects_allowed
                .fetch(req.extensions())
                .copied()
                .unwrap_or(false);
            let max_override = self
                .defaults
                .max_redirects
                .fetch(req.extensions())
                .copied();

            // A fresh execute call grows a fresh trail.
            scope.ctx.lock().trail.clear();

            let (mut method, mut uri, mut headers, mut body, extensions, context) =
                req.into_parts();

            // Requested (method, URI) pairs, for circularity detection.
            let mut visited: Vec<(Method, Uri)> = vec![(method.clone(), uri.clone())];
            // Requested URIs in order; the first is the initial request.
            let mut previous: Vec<Uri> = vec![uri.clone()];

            loop {
                let body_replay = match body.as_ref() {
                    Some(body) => body.try_clone().map(Some),
                    None => Some(None),
                };
                let attempt = Request::from_parts(
                    method.clone(),
                    uri.clone(),
                    headers.clone(),
                    body.take(),
                    extensions.clone(),
                    context.clone(),
                );

                let res = next.run(attempt, &mut *scope).await?;
                let status = res.status();

                if !enabled || !is_redirect_status(status) {
                    return Ok(res);
                }
                // A redirect without a Location is returned to the caller.
                let Some(location) = res.headers().get(LOCATION) else {
                    return Ok(res);
                };

                let next_uri = resolve_location(&uri, location)
                    .map_err(|err| err.with_uri(uri.clone()))?;

                let rewrite = method_rewrite(status, &method, self.policy.is_strict());
                let next_method = match rewrite {
                    MethodRewrite::Preserve => method.clone(),
                    MethodRewrite::ToGet => Method::GET,
                };

                if !circular_allowed
                    && visited
                        .iter()
                        .any(|(m, u)| *m == next_method && *u == next_uri)
                {
                    return Err(Error::circular_redirect(next_uri));
                }

                if let Some(max) = max_override {
                    if previous.len() > max {
                        return Err(Error::too_many_redirects(next_uri));
                    }
                } else {
                    match self.policy.check(status, &next_uri, &previous) {
                        ActionKind::Follow => {}
                        ActionKind::Stop => return Ok(res),
                        ActionKind::Error(err) => {
                            return Err(if err.is::<TooManyRedirects>() {
                                Error::too_many_redirects(next_uri)
                            } else {
                                Error::redirect(err, next_uri)
                            });
                        }
                    }
                }

                debug!("redirecting {} -> {} ({})", uri, next_uri, status);

                // Rebuild the follow-up request.
                match rewrite {
                    MethodRewrite::ToGet => {
                        body = None;
                        headers.remove(CONTENT_LENGTH);
                        headers.remove(CONTENT_TYPE);
                        headers.remove(CONTENT_ENCODING);
                        headers.remove(TRANSFER_ENCODING);
                    }
                    MethodRewrite::Preserve => {
                        body = match body_replay {
                            Some(body) => body,
                            // 307/308 must resend the body bytes; a
                            // streaming producer cannot.
                            None => return Err(Error::non_repeatable(next_uri)),
                        };
                    }
                }

                scrub_cross_origin_headers(&mut headers, &next_uri, &uri);
                if self.referer {
                    if let Some(value) = make_referer(&next_uri, &uri) {
                        headers.insert(REFERER, value);
                    }
                }

                scope.ctx.lock().trail.push(RedirectHop {
                    status,
                    from: uri.clone(),
                    to: next_uri.clone(),
                });

                method = next_method;
                uri = next_uri;
                visited.push((method.clone(), uri.clone()));
                previous.push(uri.clone());
            }
        })
    }
}
