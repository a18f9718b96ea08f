use reqwest::{Response, StatusCode};
use reqwest_retry::{
    default_on_request_failure, default_on_request_success, Retryable, RetryableStrategy,
};

pub struct RetryOnError;

impl RetryableStrategy for RetryOnError {
    fn handle(&self, res: &reqwest_middleware::Result<Response>) -> Option<Retryable> {
        match res {
            // [`TimeoutMiddleware`] returns `Error::Middleware` when timeout,
            // [`reqwest_retry::DefaultRetryableStrategy`] won't retry in such case.
            Err(reqwest_middleware::Error::Middleware(_)) => Some(Retryable::Transient),
            Err(e @ reqwest_middleware::Error::Reqwest(_)) => default_on_request_failure(e),
            Ok(resp) => {
                // A stale access token comes back as 401; the auth middleware
                // already dropped it from the cache, so one more pass fixes it.
                if resp.status() == StatusCode::UNAUTHORIZED {
                    Some(Retryable::Transient)
                } else {
                    default_on_request_success(resp)
                }
            }
        }
    }
}
