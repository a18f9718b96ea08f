use std::time::Duration;

use anyhow::Context;
use reqwest::{Request, Response};
use reqwest_middleware::{Middleware, Next};
use task_local_extensions::Extensions;

/// Hard wall-clock cap on a single request, racing the whole send against a
/// tokio timer. [`reqwest::ClientBuilder::timeout`] alone does not always
/// fire on hung connections (reqwest#1279, hyper#2312).
///
/// Attach as the **last** middleware so the retry layer above sees the
/// elapsed timer as a plain transient failure.
pub struct TimeoutMiddleware {
    limit: Duration,
}

impl TimeoutMiddleware {
    #[inline]
    pub fn new(limit: Duration) -> Self {
        Self { limit }
    }
}

#[async_trait::async_trait]
impl Middleware for TimeoutMiddleware {
    async fn handle(
        &self,
        req: Request,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> reqwest_middleware::Result<Response> {
        tokio::time::timeout(self.limit, next.run(req, extensions))
            .await
            .with_context(|| format!("request exceeded its {:?} limit", self.limit))?
    }
}
