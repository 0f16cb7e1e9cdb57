#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(test, deny(warnings))]

//! # courier
//!
//! A composable HTTP/1.1 and HTTP/2 client built around an explicit
//! request-execution chain: redirect resolution, retries, authentication,
//! protocol normalization, and pooled connection management are ordered
//! interceptors that each see the request on the way down and the response
//! on the way back up.
//!
//! - Route-keyed connection pool with per-route and global limits
//! - Challenge/response authentication (`Basic`, `Bearer`, `Digest`) with
//!   preemptive caching per [`Context`]
//! - [Redirect policies](crate::redirect) with loop detection and
//!   cross-origin header scrubbing
//! - [Retry strategies](crate::retry) honoring idempotency and `Retry-After`
//! - A compare-and-swap [cache storage protocol](crate::cache) for HTTP
//!   caching backends
//!
//! ## Making a GET request
//!
//! ```rust,no_run
//! # async fn run() -> Result<(), courier::Error> {
//! let client = courier::Client::new();
//! let body = client
//!     .get("http://www.rust-lang.org")
//!     .send()
//!     .await?
//!     .text()
//!     .await?;
//!
//! println!("body = {body:?}");
//! # Ok(())
//! # }
//! ```
//!
//! **NOTE**: If you plan to perform multiple requests, it is best to create
//! a [`Client`] and reuse it, taking advantage of keep-alive connection
//! pooling.
//!
//! ## Contexts
//!
//! A [`Context`] carries request-scoped state that outlives a single wire
//! exchange: the redirect trail, authentication exchanges, and the cached
//! schemes used for preemptive authentication. Reusing one context across
//! sequential requests to the same host avoids repeated 401 round-trips:
//!
//! ```rust,no_run
//! # async fn run() -> Result<(), courier::Error> {
//! use courier::auth::StaticCredentials;
//!
//! let client = courier::Client::new();
//! let ctx = courier::Context::new()
//!     .with_credentials_provider(StaticCredentials::basic("user", "passwd"));
//!
//! // First request answers the 401 challenge, second sends
//! // `Authorization` on the first wire exchange.
//! client.get("http://example.com/a").context(ctx.clone()).send().await?;
//! client.get("http://example.com/b").context(ctx.clone()).send().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Making POST requests (or setting request bodies)
//!
//! The `body()` method of a [`RequestBuilder`] sets the exact raw bytes of
//! the request body. It accepts various types, including `String` and
//! `Vec<u8>`; custom producers go through the [`Body`] constructors.
//!
//! ```rust,no_run
//! # async fn run() -> Result<(), courier::Error> {
//! let client = courier::Client::new();
//! let res = client.post("http://httpbin.org/post")
//!     .body("the exact body that is sent")
//!     .send()
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Optional Features
//!
//! - **cookies**: Provides cookie session support.
//! - **blocking**: Provides a synchronous client facade.
//! - **tracing**: Internal diagnostics via the `tracing` crate (default).

#[macro_use]
mod trace;

pub use http::header;
pub use http::Method;
pub use http::{StatusCode, Uri, Version};

mod error;
mod into_uri;

pub use self::error::{BoxError, Error, Result};
pub use self::into_uri::IntoUri;

mod body;
mod chain;
mod client;
mod config;
mod conn;
mod context;
mod pool;
mod request;
mod response;
mod route;

pub mod auth;
pub mod cache;
pub mod redirect;
pub mod retry;

pub use self::body::Body;
pub use self::chain::{Interceptor, Next, Scope};
pub use self::client::{Client, ClientBuilder};
pub use self::config::CookieSpec;
pub use self::conn::{AlpnProtocol, BoxIo, EndpointInfo, TlsHandshake, TlsSession};
pub use self::context::{Context, RedirectHop, UserToken};
pub use self::pool::{PoolReusePolicy, PoolStats};
pub use self::request::{Request, RequestBuilder};
pub use self::response::Response;
pub use self::route::{Hop, Proxy, Route};

#[cfg(feature = "blocking")]
#[cfg_attr(docsrs, doc(cfg(feature = "blocking")))]
pub mod blocking;
#[cfg(feature = "cookies")]
#[cfg_attr(docsrs, doc(cfg(feature = "cookies")))]
pub mod cookie;

fn _assert_impls() {
    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}
    fn assert_clone<T: Clone>() {}

    assert_send::<Client>();
    assert_sync::<Client>();
    assert_clone::<Client>();

    assert_send::<Request>();
    assert_send::<RequestBuilder>();

    assert_send::<Response>();

    assert_send::<Error>();
    assert_sync::<Error>();

    assert_send::<Context>();
    assert_sync::<Context>();
    assert_clone::<Context>();
}
