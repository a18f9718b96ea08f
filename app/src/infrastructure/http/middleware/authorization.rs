use std::sync::Arc;

use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::{Request, Response, StatusCode};
use reqwest_middleware::{Middleware, Next};
use task_local_extensions::Extensions;

use crate::infrastructure::service::token::TokenCache;

/// Injects the bearer token of one drive config into every request.
///
/// A 401 marks the cached token stale; the retry layer re-sends and the next
/// pass through here picks up a freshly exchanged token.
pub struct AuthMiddleware {
    cache: Arc<TokenCache>,
    drive_config_id: String,
}

#[async_trait::async_trait]
impl Middleware for AuthMiddleware {
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> reqwest_middleware::Result<Response> {
        let token = self
            .cache
            .access_token(&self.drive_config_id)
            .await
            .map_err(reqwest_middleware::Error::Middleware)?;
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| reqwest_middleware::Error::Middleware(anyhow::Error::new(e)))?;
        req.headers_mut().insert(AUTHORIZATION, value);

        let resp = next.run(req, extensions).await?;

        if resp.status() == StatusCode::UNAUTHORIZED {
            self.cache.invalidate(&self.drive_config_id);
        }

        Ok(resp)
    }
}

impl AuthMiddleware {
    pub fn new(cache: Arc<TokenCache>, drive_config_id: impl Into<String>) -> Self {
        Self {
            cache,
            drive_config_id: drive_config_id.into(),
        }
    }
}
