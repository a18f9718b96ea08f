use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use url::Url;

use domain::repository::{get_json, put_json, KeyedStore};

use crate::dto::TokenResponse;

const DRIVE_CONFIG_TABLE: &str = "drive_configs";

/// How long before the server-side expiry a token is considered stale.
const EARLY_EXPIRY: i64 = 300;

/// Stored per drive config; the refresh token rotates on every exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriveCredentials {
    pub refresh_token: String,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    valid_until: DateTime<Utc>,
}

/// Process-wide refresh-token → access-token store.
///
/// One exclusive refresh path per drive config id: concurrent callers park on
/// the entry mutex and reuse the token the first one obtained.
pub struct TokenCache {
    auth_url: Url,
    http: reqwest::Client,
    store: Arc<dyn KeyedStore>,
    entries: DashMap<String, Arc<Mutex<Option<CachedToken>>>>,
}

static INSTANCE: OnceLock<Arc<TokenCache>> = OnceLock::new();

impl TokenCache {
    pub fn new(auth_url: Url, store: Arc<dyn KeyedStore>) -> Self {
        Self {
            auth_url,
            http: reqwest::Client::new(),
            store,
            entries: DashMap::new(),
        }
    }

    /// Install the process-wide instance. Later calls return the first one.
    pub fn init_global(auth_url: Url, store: Arc<dyn KeyedStore>) -> Arc<TokenCache> {
        INSTANCE.get_or_init(|| Arc::new(Self::new(auth_url, store))).clone()
    }

    pub fn global() -> Option<Arc<TokenCache>> {
        INSTANCE.get().cloned()
    }

    /// A still-valid access token for the drive config, refreshing if needed.
    pub async fn access_token(&self, id: &str) -> anyhow::Result<String> {
        let slot = self.entries.entry(id.to_owned()).or_default().clone();
        let mut cached = slot.lock().await;

        if let Some(token) = cached.as_ref() {
            if Utc::now() < token.valid_until {
                return Ok(token.access_token.clone());
            }
        }

        let mut creds: DriveCredentials = get_json(&*self.store, DRIVE_CONFIG_TABLE, id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("no credentials stored for drive config {id}"))?;

        // Stored token may outlive the in-memory cache across restarts.
        if let (Some(token), Some(expires_at)) = (&creds.access_token, creds.expires_at) {
            if Utc::now() < expires_at {
                *cached = Some(CachedToken {
                    access_token: token.clone(),
                    valid_until: expires_at,
                });
                return Ok(token.clone());
            }
        }

        let grant = self.refresh(&creds.refresh_token).await?;
        let valid_until = Utc::now() + Duration::seconds(grant.expires_in as i64 - EARLY_EXPIRY);

        creds.refresh_token = grant.refresh_token;
        creds.access_token = Some(grant.access_token.clone());
        creds.expires_at = Some(valid_until);
        put_json(&*self.store, DRIVE_CONFIG_TABLE, id, &creds).await?;

        *cached = Some(CachedToken {
            access_token: grant.access_token.clone(),
            valid_until,
        });
        tracing::debug!(drive_config = id, "Access token refreshed");

        Ok(grant.access_token)
    }

    /// Drop the cached token so the next call refreshes. The stored refresh
    /// token is untouched.
    pub fn invalidate(&self, id: &str) {
        if let Some(slot) = self.entries.get(id) {
            if let Ok(mut cached) = slot.try_lock() {
                *cached = None;
            }
        }
    }

    /// Seed credentials for a drive config at first login. Rotation owns
    /// the stored pair afterwards, so an already-known id is left alone.
    pub async fn seed_credentials(&self, id: &str, refresh_token: &str) -> anyhow::Result<()> {
        let existing: Option<DriveCredentials> =
            get_json(&*self.store, DRIVE_CONFIG_TABLE, id).await?;
        if existing.is_some() {
            return Ok(());
        }
        let creds = DriveCredentials {
            refresh_token: refresh_token.to_owned(),
            access_token: None,
            expires_at: None,
        };
        put_json(&*self.store, DRIVE_CONFIG_TABLE, id, &creds).await
    }

    async fn refresh(&self, refresh_token: &str) -> anyhow::Result<TokenResponse> {
        #[derive(Serialize)]
        struct RefreshRequest<'a> {
            grant_type: &'static str,
            refresh_token: &'a str,
        }

        Ok(self
            .http
            .post(self.auth_url.clone())
            .json(&RefreshRequest {
                grant_type: "refresh_token",
                refresh_token,
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }
}
