mod authorization;
mod retry;
mod timeout;

use std::sync::Arc;
use std::time::Duration;

use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use typed_builder::TypedBuilder;

#[rustfmt::skip]
pub use self::{
    authorization::AuthMiddleware,
    retry::RetryOnError,
    timeout::TimeoutMiddleware,
};

#[derive(TypedBuilder)]
pub struct MiddlewareMenu {
    #[builder(default, setter(strip_option))]
    retries: Option<u32>,
    auth: Arc<AuthMiddleware>,
    timeout: Duration,
}

impl MiddlewareMenu {
    pub fn make(self) -> ClientWithMiddleware {
        let Self {
            retries,
            auth,
            timeout,
        } = self;

        /*
         * Pay attention here.
         * The correct order to attach our middlewares is
         *  ```
         *  (Retry ->) Auth -> Timeout
         *  ```
         *  because middlewares run in the order they were attached.
         *
         *  Part PUTs never go through this stack: their bodies carry whole
         *  part buffers and the uploader keeps its own retry schedule.
         */

        let cb = ClientBuilder::new(reqwest::Client::new());
        let cb = if let Some(retries) = retries {
            let policy = ExponentialBackoff::builder().build_with_max_retries(retries);
            let mdw = RetryTransientMiddleware::new_with_policy_and_strategy(policy, RetryOnError);
            cb.with(mdw)
        } else {
            cb
        };

        cb.with_arc(auth).with(TimeoutMiddleware::new(timeout)).build()
    }
}
