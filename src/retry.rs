//! Retry strategies.
//!
//! A [`RetryStrategy`] looks at one failed attempt — an error or a
//! retryable status — and decides whether the chain should sleep and
//! replay the request. The [`DefaultRetryStrategy`] follows conservative
//! user-agent rules:
//!
//! - Idempotent methods retry on connection-scoped I/O failures,
//!   including connections closed before a full response arrived.
//! - Non-idempotent methods retry only when the request never reached the
//!   wire (e.g. the lease or connect failed).
//! - `429` and `503` retry honoring `Retry-After` (delta-seconds or
//!   HTTP-date).
//! - Cancellation and protocol violations never retry.
//!
//! **Requests should not be retried** if the server cannot safely handle
//! the same request twice; scope strategies accordingly.

use std::time::{Duration, SystemTime};

use http::{HeaderMap, Method, StatusCode, Uri};

use crate::error::Error;

/// One failed attempt, as seen by a [`RetryStrategy`].
#[derive(Debug)]
pub struct RetryAttempt<'a> {
    pub(crate) method: &'a Method,
    pub(crate) uri: &'a Uri,
    pub(crate) attempt: u32,
    pub(crate) request_sent: bool,
    pub(crate) outcome: Outcome<'a>,
}

/// What ended the attempt.
#[derive(Debug)]
pub enum Outcome<'a> {
    /// The exchange failed with an error.
    Err(&'a Error),
    /// A response arrived whose status may warrant a retry.
    Status {
        /// The response status.
        status: StatusCode,
        /// Parsed `Retry-After`, if the response carried one.
        retry_after: Option<Duration>,
    },
}

impl<'a> RetryAttempt<'a> {
    /// The request method.
    pub fn method(&self) -> &Method {
        self.method
    }

    /// The request URI of this attempt.
    pub fn uri(&self) -> &Uri {
        self.uri
    }

    /// 1-based index of the attempt that just failed.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Whether the request was already handed to the wire codec. A
    /// request that never left cannot have had side effects.
    pub fn request_sent(&self) -> bool {
        self.request_sent
    }

    /// What ended the attempt.
    pub fn outcome(&self) -> &Outcome<'a> {
        &self.outcome
    }

    /// Whether the method is idempotent per RFC 9110.
    pub fn is_idempotent(&self) -> bool {
        matches!(
            *self.method,
            Method::GET
                | Method::HEAD
                | Method::PUT
                | Method::DELETE
                | Method::OPTIONS
                | Method::TRACE
        )
    }
}

/// A strategy's verdict on one failed attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Surface the failure to the caller.
    DoNotRetry,
    /// Sleep for the given delay, then replay the request.
    RetryAfter(Duration),
}

/// Decides retryability and backoff for failed attempts.
pub trait RetryStrategy: Send + Sync {
    /// Judge one failed attempt.
    fn decide(&self, attempt: &RetryAttempt<'_>) -> Decision;
}

impl<F> RetryStrategy for F
where
    F: Fn(&RetryAttempt<'_>) -> Decision + Send + Sync,
{
    fn decide(&self, attempt: &RetryAttempt<'_>) -> Decision {
        (self)(attempt)
    }
}

/// A strategy that never retries anything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NeverRetry;

impl RetryStrategy for NeverRetry {
    fn decide(&self, _attempt: &RetryAttempt<'_>) -> Decision {
        Decision::DoNotRetry
    }
}

/// The default retry rules; see the [module docs](self).
#[derive(Clone, Debug)]
pub struct DefaultRetryStrategy {
    max_retries: u32,
    retry_interval: Duration,
    retry_server_errors: bool,
}

impl DefaultRetryStrategy {
    /// The stock configuration: one retry, one second apart, 5xx other
    /// than 503 not retried.
    pub fn new() -> DefaultRetryStrategy {
        DefaultRetryStrategy {
            max_retries: 1,
            retry_interval: Duration::from_secs(1),
            retry_server_errors: false,
        }
    }

    /// Cap the number of retries per request.
    pub fn max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    /// The sleep between attempts when the server names no `Retry-After`.
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Also retry idempotent requests answered with other 5xx statuses.
    pub fn retry_server_errors(mut self, enabled: bool) -> Self {
        self.retry_server_errors = enabled;
        self
    }
}

impl Default for DefaultRetryStrategy {
    fn default() -> Self {
        DefaultRetryStrategy::new()
    }
}

impl RetryStrategy for DefaultRetryStrategy {
    fn decide(&self, attempt: &RetryAttempt<'_>) -> Decision {
        if attempt.attempt() > self.max_retries {
            return Decision::DoNotRetry;
        }

        match attempt.outcome() {
            Outcome::Err(err) => {
                if err.is_cancelled() || err.is_protocol() {
                    return Decision::DoNotRetry;
                }
                if !attempt.is_idempotent() && attempt.request_sent() {
                    return Decision::DoNotRetry;
                }
                let transient = err.is_retryable_io()
                    || err.is_connection_reset()
                    || is_premature_close(err);
                if transient {
                    Decision::RetryAfter(self.retry_interval)
                } else {
                    Decision::DoNotRetry
                }
            }
            Outcome::Status {
                status,
                retry_after,
            } => match *status {
                StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
                    Decision::RetryAfter(retry_after.unwrap_or(self.retry_interval))
                }
                status if status.is_server_error() => {
                    if self.retry_server_errors && attempt.is_idempotent() {
                        Decision::RetryAfter(retry_after.unwrap_or(self.retry_interval))
                    } else {
                        Decision::DoNotRetry
                    }
                }
                _ => Decision::DoNotRetry,
            },
        }
    }
}

/// A connection that died between sending the request and completing the
/// response head or body.
fn is_premature_close(err: &Error) -> bool {
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        if let Some(hyper_err) = cause.downcast_ref::<hyper::Error>() {
            if hyper_err.is_incomplete_message() || hyper_err.is_canceled() {
                return true;
            }
        }
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::UnexpectedEof {
                return true;
            }
        }
        source = cause.source();
    }
    false
}

/// Parse `Retry-After` from response headers: delta-seconds or an
/// HTTP-date in the future.
pub(crate) fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(http::header::RETRY_AFTER)?.to_str().ok()?;
    let value = value.trim();

    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let when = httpdate::parse_http_date(value).ok()?;
    when.duration_since(SystemTime::now()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt<'a>(
        method: &'a Method,
        uri: &'a Uri,
        n: u32,
        sent: bool,
        outcome: Outcome<'a>,
    ) -> RetryAttempt<'a> {
        RetryAttempt {
            method,
            uri,
            attempt: n,
            request_sent: sent,
            outcome,
        }
    }

    #[test]
    fn idempotent_io_error_retries_within_budget() {
        let strategy = DefaultRetryStrategy::new();
        let method = Method::GET;
        let uri = Uri::from_static("http://h/");
        let err = Error::io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));

        let decision = strategy.decide(&attempt(&method, &uri, 1, true, Outcome::Err(&err)));
        assert_eq!(
            decision,
            Decision::RetryAfter(Duration::from_secs(1))
        );

        // Budget exhausted on the second retry.
        let decision = strategy.decide(&attempt(&method, &uri, 2, true, Outcome::Err(&err)));
        assert_eq!(decision, Decision::DoNotRetry);
    }

    #[test]
    fn transmitted_post_does_not_retry() {
        let strategy = DefaultRetryStrategy::new();
        let method = Method::POST;
        let uri = Uri::from_static("http://h/");
        let err = Error::io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));

        let decision = strategy.decide(&attempt(&method, &uri, 1, true, Outcome::Err(&err)));
        assert_eq!(decision, Decision::DoNotRetry);

        // Not yet on the wire: safe for any method.
        let decision = strategy.decide(&attempt(&method, &uri, 1, false, Outcome::Err(&err)));
        assert_eq!(
            decision,
            Decision::RetryAfter(Duration::from_secs(1))
        );
    }

    #[test]
    fn cancellation_never_retries() {
        let strategy = DefaultRetryStrategy::new();
        let method = Method::GET;
        let uri = Uri::from_static("http://h/");
        let err = Error::cancelled();

        let decision = strategy.decide(&attempt(&method, &uri, 1, false, Outcome::Err(&err)));
        assert_eq!(decision, Decision::DoNotRetry);
    }

    #[test]
    fn service_unavailable_honors_retry_after() {
        let strategy = DefaultRetryStrategy::new();
        let method = Method::GET;
        let uri = Uri::from_static("http://h/");

        let decision = strategy.decide(&attempt(
            &method,
            &uri,
            1,
            true,
            Outcome::Status {
                status: StatusCode::SERVICE_UNAVAILABLE,
                retry_after: Some(Duration::from_secs(7)),
            },
        ));
        assert_eq!(decision, Decision::RetryAfter(Duration::from_secs(7)));
    }

    #[test]
    fn other_server_errors_are_opt_in() {
        let method = Method::GET;
        let uri = Uri::from_static("http://h/");
        let outcome = || Outcome::Status {
            status: StatusCode::BAD_GATEWAY,
            retry_after: None,
        };

        let strategy = DefaultRetryStrategy::new();
        assert_eq!(
            strategy.decide(&attempt(&method, &uri, 1, true, outcome())),
            Decision::DoNotRetry
        );

        let strategy = DefaultRetryStrategy::new().retry_server_errors(true);
        assert_eq!(
            strategy.decide(&attempt(&method, &uri, 1, true, outcome())),
            Decision::RetryAfter(Duration::from_secs(1))
        );
    }

    #[test]
    fn parse_retry_after_delta_and_date() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::RETRY_AFTER, "120".parse().unwrap());
        assert_eq!(
            parse_retry_after(&headers),
            Some(Duration::from_secs(120))
        );

        let future = SystemTime::now() + Duration::from_secs(60);
        headers.insert(
            http::header::RETRY_AFTER,
            httpdate::fmt_http_date(future).parse().unwrap(),
        );
        let parsed = parse_retry_after(&headers).expect("parses");
        assert!(parsed <= Duration::from_secs(60));
        assert!(parsed > Duration::from_secs(50));

        headers.insert(http::header::RETRY_AFTER, "bogus".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), None);
    }
}
