use std::fmt;

use http::{HeaderValue, Method, Uri};

use crate::Result;

use super::{challenge::Challenge, Credentials};

/// A challenge-response authentication scheme.
///
/// Instances are stateful: a scheme absorbs challenges over the lifetime
/// of an exchange (and, when cached for preemptive use, over multiple
/// requests in the same context).
pub trait AuthScheme: Send + fmt::Debug {
    /// Canonical lowercase scheme name, e.g. `"basic"`.
    fn name(&self) -> &'static str;

    /// Absorb a parsed challenge from a 401/407 response.
    fn process_challenge(&mut self, challenge: &Challenge) -> Result<()>;

    /// Whether the exchange has concluded: a complete scheme that is
    /// challenged again has failed terminally rather than needing another
    /// round-trip.
    fn is_complete(&self) -> bool;

    /// Whether this scheme may authenticate a request without having seen
    /// a challenge first.
    fn supports_preemptive(&self) -> bool;

    /// The realm from the most recent challenge, if any.
    fn realm(&self) -> Option<&str>;

    /// Build the credentials header value for the given request.
    fn respond(
        &mut self,
        credentials: &Credentials,
        method: &Method,
        uri: &Uri,
    ) -> Result<HeaderValue>;
}
