//! The request execution chain.
//!
//! A request travels down an ordered list of interceptors; the wire
//! response bubbles back up through them. Each stage receives the request
//! together with a [`Next`] continuation and may rewrite the request,
//! re-enter the chain (redirects, retries, auth round-trips), or
//! short-circuit entirely:
//!
//! ```text
//! user interceptors -> redirect -> retry -> protocol -> auth -> connect
//! ```
//!
//! The [`Scope`] threads the execution [`Context`] and per-attempt state
//! (the planned route, whether the request reached the wire) through the
//! stages.

use std::{fmt, sync::Arc};

use futures_util::future::BoxFuture;

use crate::{context::Context, request::Request, response::Response, route::Route};

pub(crate) mod auth;
pub(crate) mod connect;
pub(crate) mod protocol;
pub(crate) mod redirect;
pub(crate) mod retry;

/// State threaded through one `execute` call.
#[derive(Debug)]
pub struct Scope {
    pub(crate) ctx: Context,
    pub(crate) route: Option<Route>,
    pub(crate) request_sent: bool,
}

impl Scope {
    pub(crate) fn new(ctx: Context) -> Scope {
        Scope {
            ctx,
            route: None,
            request_sent: false,
        }
    }

    /// The execution context of this call.
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// The route planned for the current attempt, once the connection
    /// stage has run.
    pub fn route(&self) -> Option<&Route> {
        self.route.as_ref()
    }
}

/// One stage of the execution chain.
///
/// Implementations see the request on the way down and the result of the
/// rest of the chain on the way back up; `next` is a value, not a parent
/// call, so a stage may invoke it repeatedly to re-enter the chain.
pub trait Interceptor: Send + Sync + 'static {
    /// Execute `req`, delegating to `next` for the remainder of the
    /// chain.
    fn exec<'a>(
        &'a self,
        req: Request,
        scope: &'a mut Scope,
        next: Next<'a>,
    ) -> BoxFuture<'a, crate::Result<Response>>;
}

/// The remainder of the execution chain, as a continuation value.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    stack: &'a [Arc<dyn Interceptor>],
}

impl<'a> Next<'a> {
    pub(crate) fn new(stack: &'a [Arc<dyn Interceptor>]) -> Next<'a> {
        Next { stack }
    }

    /// Run the rest of the chain on `req`.
    pub fn run<'s>(
        self,
        req: Request,
        scope: &'s mut Scope,
    ) -> BoxFuture<'s, crate::Result<Response>>
    where
        'a: 's,
    {
        match self.stack.split_first() {
            Some((stage, rest)) => stage.exec(req, scope, Next { stack: rest }),
            None => Box::pin(async {
                Err(crate::Error::builder(
                    "execution chain ended without a connection stage",
                ))
            }),
        }
    }
}

impl fmt::Debug for Next<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Next")
            .field("remaining", &self.stack.len())
            .finish()
    }
}
