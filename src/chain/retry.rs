use std::sync::Arc;

use futures_util::future::BoxFuture;
use http::StatusCode;

use crate::{
    request::Request,
    response::Response,
    retry::{parse_retry_after, Decision, Outcome, RetryAttempt, RetryStrategy},
};

use super::{Interceptor, Next, Scope};

/// Replays attempts that failed retryably, sleeping per the strategy's
/// verdict. Sleeps ride the task; cancelling the execute future cancels
/// them.
pub(crate) struct RetryExec {
    strategy: Arc<dyn RetryStrategy>,
}

impl RetryExec {
    pub(crate) fn new(strategy: Arc<dyn RetryStrategy>) -> RetryExec {
        RetryExec { strategy }
    }
}

impl Interceptor for RetryExec {
    fn exec<'a>(
        &'a self,
        req: Request,
        scope: &'a mut Scope,
        next: Next<'a>,
    ) -> BoxFuture<'a, crate::Result<Response>> {
        Box::pin(async move {
            let mut req = req;
            let mut attempt: u32 = 0;

            loop {
                attempt += 1;
                // Without a replayable request there is nothing to retry.
                let replay = req.try_clone();
                scope.request_sent = false;

                match next.run(req, &mut *scope).await {
                    Ok(res) => {
                        let status = res.status();
                        let judgeable = status == StatusCode::TOO_MANY_REQUESTS
                            || status.is_server_error();
                        if !judgeable {
                            return Ok(res);
                        }
                        let Some(replay) = replay else {
                            return Ok(res);
                        };
                        let retry_after = parse_retry_after(res.headers());
                        let decision = self.strategy.decide(&RetryAttempt {
                            method: replay.method(),
                            uri: replay.uri(),
                            attempt,
                            request_sent: scope.request_sent,
                            outcome: Outcome::Status {
                                status,
                                retry_after,
                            },
                        });
                        match decision {
                            Decision::DoNotRetry => return Ok(res),
                            Decision::RetryAfter(delay) => {
                                debug!(
                                    "retrying {} {} after {:?} (status {})",
                                    replay.method(),
                                    replay.uri(),
                                    delay,
                                    status
                                );
                                drop(res);
                                tokio::time::sleep(delay).await;
                                req = replay;
                            }
                        }
                    }
                    Err(err) => {
                        // Cancellation and protocol violations are always
                        // terminal.
                        if err.is_cancelled() || err.is_protocol() {
                            return Err(err);
                        }
                        let Some(replay) = replay else {
                            return Err(err);
                        };
                        let decision = self.strategy.decide(&RetryAttempt {
                            method: replay.method(),
                            uri: replay.uri(),
                            attempt,
                            request_sent: scope.request_sent,
                            outcome: Outcome::Err(&err),
                        });
                        match decision {
                            Decision::DoNotRetry => return Err(err),
                            Decision::RetryAfter(delay) => {
                                debug!(
                                    "retrying {} {} after {:?} ({})",
                                    replay.method(),
                                    replay.uri(),
                                    delay,
                                    err
                                );
                                tokio::time::sleep(delay).await;
                                req = replay;
                            }
                        }
                    }
                }
            }
        })
    }
}
