use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context as TaskContext, Poll},
    time::Duration,
};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::{
    header::{CONNECTION, HOST},
    uri::PathAndQuery,
    Uri, Version,
};
use hyper::body::Incoming;

use crate::{
    body::{boxed, Body},
    config::Defaults,
    conn::{Connection, Connector},
    error::{Error, TimedOut},
    pool::{KeepAlive, Lease, Pool, Pooled},
    request::Request,
    response::Response,
    route::{Route, RoutePlanner},
};

use super::{Interceptor, Next, Scope};

/// The innermost stage: plans the route, leases an endpoint from the
/// pool, connects if the lease produced a permit, dispatches the exchange
/// and arranges release on response completion.
pub(crate) struct ConnectExec {
    planner: RoutePlanner,
    pool: Pool<Connection, Route>,
    connector: Connector,
    defaults: Arc<Defaults>,
}

impl ConnectExec {
    pub(crate) fn new(
        planner: RoutePlanner,
        pool: Pool<Connection, Route>,
        connector: Connector,
        defaults: Arc<Defaults>,
    ) -> ConnectExec {
        ConnectExec {
            planner,
            pool,
            connector,
            defaults,
        }
    }
}

impl Interceptor for ConnectExec {
    fn exec<'a>(
        &'a self,
        req: Request,
        scope: &'a mut Scope,
        _next: Next<'a>,
    ) -> BoxFuture<'a, crate::Result<Response>> {
        Box::pin(async move {
            let route = self.planner.plan(req.uri())?;
            scope.route = Some(route.clone());
            // First use happens inside the runtime; safe to arm expiry.
            self.pool.spawn_reaper();

            let lease_timeout = self
                .defaults
                .pool_lease_timeout
                .fetch(req.extensions())
                .copied();
            let connect_timeout = self
                .defaults
                .connect_timeout
                .fetch(req.extensions())
                .copied();
            let response_timeout = self
                .defaults
                .response_timeout
                .fetch(req.extensions())
                .copied();
            let socket_timeout = self
                .defaults
                .socket_timeout
                .fetch(req.extensions())
                .copied();

            let token = scope.ctx.lock().user_token.clone();
            let uri = req.uri().clone();

            let mut pooled = match self
                .pool
                .lease(route.clone(), token.clone(), lease_timeout)
                .await
                .map_err(|err| err.with_uri(uri.clone()))?
            {
                Lease::Reused(pooled) => pooled,
                Lease::Permit(permit) => {
                    // A failed connect drops the permit, returning the
                    // reservation to the pool.
                    let conn = self
                        .connector
                        .connect(&route, connect_timeout)
                        .await
                        .map_err(|err| err.with_uri(uri.clone()))?;
                    permit.complete(conn)
                }
            };
            pooled.set_user_token(token);

            let version = pooled.version();
            {
                let mut info = pooled.info().clone();
                info.reused = pooled.is_reused();
                scope.ctx.lock().endpoint = Some(info);
            }

            let wire_req = wire_request(req, &route, version)?;
            scope.request_sent = true;

            let exchange = pooled.send_request(wire_req);
            let result = match response_timeout {
                Some(dur) => match tokio::time::timeout(dur, exchange).await {
                    Ok(result) => result,
                    Err(_elapsed) => {
                        pooled.discard();
                        return Err(Error::io(TimedOut).with_uri(uri));
                    }
                },
                None => exchange.await,
            };

            let res = match result {
                Ok(res) => res,
                Err(err) => {
                    // The connection state is unknown; never reuse it.
                    pooled.discard();
                    return Err(Error::io(err).with_uri(uri));
                }
            };

            apply_release_hints(&mut pooled, version, res.headers());

            let (parts, incoming) = res.into_parts();
            let body = PooledBody {
                inner: incoming,
                pooled: Some(pooled),
                timeout: socket_timeout,
                sleep: None,
            };
            let mut res = http::Response::from_parts(parts, boxed(body));
            res.extensions_mut().insert(route);

            Ok(Response::new(res, uri))
        })
    }
}

/// Shape the request for the negotiated protocol: request-target form,
/// version, and the `Host`/`:authority` split.
fn wire_request(
    req: Request,
    route: &Route,
    version: Version,
) -> crate::Result<http::Request<Body>> {
    let (method, uri, mut headers, body, _extensions, _context) = req.into_parts();

    let target = if version == Version::HTTP_2 {
        // h2 carries scheme and authority in pseudo-headers.
        headers.remove(HOST);
        uri.clone()
    } else if route.absolute_form() {
        uri.clone()
    } else {
        let path_and_query = uri
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));
        let mut parts = http::uri::Parts::default();
        parts.path_and_query = Some(path_and_query);
        Uri::from_parts(parts).map_err(Error::builder)?
    };

    let mut builder = http::Request::builder()
        .method(method)
        .uri(target)
        .version(version);
    if let Some(headers_mut) = builder.headers_mut() {
        *headers_mut = headers;
    }
    builder
        .body(body.unwrap_or_default())
        .map_err(Error::builder)
}

/// `Connection: close` discards the entry; `Keep-Alive: timeout=N` arms
/// its idle expiry.
fn apply_release_hints(
    pooled: &mut Pooled<Connection, Route>,
    version: Version,
    headers: &http::HeaderMap,
) {
    if version == Version::HTTP_2 {
        return;
    }

    let close = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("close"));
    if close {
        pooled.discard();
        return;
    }

    if let Some(timeout) = headers
        .get("keep-alive")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_keep_alive_timeout)
    {
        pooled.set_keep_alive(KeepAlive::For(timeout));
    }
}

fn parse_keep_alive_timeout(value: &str) -> Option<Duration> {
    value.split(',').find_map(|param| {
        let (key, secs) = param.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("timeout") {
            return None;
        }
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    })
}

/// The response body stream. It owns the pooled lease: the connection
/// returns to the idle set only when the body is fully read (or the
/// stream is dropped, in which case an incomplete h1 connection fails its
/// liveness check and is discarded).
struct PooledBody {
    inner: Incoming,
    pooled: Option<Pooled<Connection, Route>>,
    timeout: Option<Duration>,
    sleep: Option<Pin<Box<tokio::time::Sleep>>>,
}

impl http_body::Body for PooledBody {
    type Data = Bytes;
    type Error = Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<Option<Result<http_body::Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;

        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                this.sleep = None;
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(err))) => {
                if let Some(mut pooled) = this.pooled.take() {
                    pooled.discard();
                }
                Poll::Ready(Some(Err(Error::body(err))))
            }
            Poll::Ready(None) => {
                // Response complete: release the lease.
                this.pooled.take();
                Poll::Ready(None)
            }
            Poll::Pending => {
                if let Some(timeout) = this.timeout {
                    let sleep = this.sleep.get_or_insert_with(|| {
                        Box::pin(tokio::time::sleep(timeout))
                    });
                    if let Poll::Ready(()) = sleep.as_mut().poll(cx) {
                        if let Some(mut pooled) = this.pooled.take() {
                            pooled.discard();
                        }
                        return Poll::Ready(Some(Err(Error::io(TimedOut))));
                    }
                }
                Poll::Pending
            }
        }
    }

    fn size_hint(&self) -> http_body::SizeHint {
        http_body::Body::size_hint(&self.inner)
    }

    fn is_end_stream(&self) -> bool {
        http_body::Body::is_end_stream(&self.inner)
    }
}
