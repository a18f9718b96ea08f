//! Typed operations over the cloud-drive HTTP API.

use std::time::Duration;

use reqwest::StatusCode;
use reqwest_middleware::ClientWithMiddleware;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::time::Instant;
use typed_builder::TypedBuilder;
use url::Url;

use domain::SyncError;

use crate::dto::{
    CompleteUploadRequest, CreateFileRequest, CreateFileResponse, DownloadUrlResponse, DriveInfo,
    ErrorReply, FileItem, ItemKind, ListRequest, ListResponse, SpaceInfo, VipInfo,
};

/// Baseline pacing between list/search calls.
const LIST_PACE: Duration = Duration::from_millis(250);
/// Attempts before a 429 escalates to `Throttled`.
const MAX_THROTTLED_ATTEMPTS: u32 = 5;
/// Retries before a transport error escalates to `Transient`.
const MAX_TRANSPORT_RETRIES: u32 = 5;

#[derive(TypedBuilder)]
pub struct DriveClient {
    base_url: Url,
    drive_id: String,
    client: ClientWithMiddleware,
    #[builder(default)]
    last_listing: Mutex<Option<Instant>>,
}

impl DriveClient {
    pub fn drive_id(&self) -> &str {
        &self.drive_id
    }

    pub async fn space_info(&self) -> anyhow::Result<SpaceInfo> {
        self.call("user/getSpaceInfo", &json!({ "drive_id": self.drive_id })).await
    }

    pub async fn vip_info(&self) -> anyhow::Result<VipInfo> {
        self.call("user/getVipInfo", &json!({ "drive_id": self.drive_id })).await
    }

    pub async fn drive_info(&self) -> anyhow::Result<DriveInfo> {
        self.call("user/getDriveInfo", &json!({ "drive_id": self.drive_id })).await
    }

    pub async fn list(
        &self,
        parent_file_id: &str,
        limit: u32,
        marker: Option<&str>,
        order_by: Option<&str>,
    ) -> anyhow::Result<ListResponse> {
        self.pace().await;
        self.call(
            "file/list",
            &ListRequest {
                drive_id: &self.drive_id,
                parent_file_id,
                limit,
                marker,
                order_by,
            },
        )
        .await
    }

    /// Drain all pages of one folder.
    pub async fn list_children(&self, parent_file_id: &str) -> anyhow::Result<Vec<FileItem>> {
        let mut items = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let page = self.list(parent_file_id, 200, marker.as_deref(), Some("name")).await?;
            items.extend(page.items);
            match page.next_marker {
                Some(next) if !next.is_empty() => marker = Some(next),
                _ => break Ok(items),
            }
        }
    }

    pub async fn search(&self, query: &str) -> anyhow::Result<Vec<FileItem>> {
        self.pace().await;
        let resp: ListResponse = self
            .call(
                "file/search",
                &json!({ "drive_id": self.drive_id, "query": query }),
            )
            .await?;
        Ok(resp.items)
    }

    pub async fn get(&self, file_id: &str) -> anyhow::Result<FileItem> {
        self.call(
            "file/get",
            &json!({ "drive_id": self.drive_id, "file_id": file_id }),
        )
        .await
    }

    /// Whether `(parent, name, kind)` exists; absence is not an error.
    pub async fn exist(
        &self,
        parent_file_id: &str,
        name: &str,
        kind: ItemKind,
    ) -> anyhow::Result<Option<FileItem>> {
        let query = format!(
            "parent_file_id = \"{parent_file_id}\" and name = \"{}\"",
            name.replace('"', "\\\"")
        );
        let items = self.search(&query).await?;
        Ok(items.into_iter().find(|item| item.kind == kind))
    }

    pub async fn create_folder(
        &self,
        parent_file_id: &str,
        name: &str,
    ) -> anyhow::Result<CreateFileResponse> {
        self.call(
            "file/create",
            &CreateFileRequest::folder(&self.drive_id, parent_file_id, name),
        )
        .await
    }

    pub async fn create_file(
        &self,
        request: &CreateFileRequest<'_>,
    ) -> anyhow::Result<CreateFileResponse> {
        self.call("file/create", request).await
    }

    pub async fn complete_upload(&self, file_id: &str, upload_id: &str) -> anyhow::Result<FileItem> {
        self.call(
            "file/complete",
            &CompleteUploadRequest {
                drive_id: &self.drive_id,
                file_id,
                upload_id,
            },
        )
        .await
    }

    pub async fn download_url(
        &self,
        file_id: &str,
        ttl_secs: u64,
    ) -> anyhow::Result<DownloadUrlResponse> {
        self.call(
            "file/getDownloadUrl",
            &json!({
                "drive_id": self.drive_id,
                "file_id": file_id,
                "expire_sec": ttl_secs,
            }),
        )
        .await
    }

    pub async fn rename(&self, file_id: &str, new_name: &str) -> anyhow::Result<FileItem> {
        self.call(
            "file/update",
            &json!({
                "drive_id": self.drive_id,
                "file_id": file_id,
                "name": new_name,
                "check_name_mode": "refuse",
            }),
        )
        .await
    }

    pub async fn r#move(
        &self,
        file_id: &str,
        new_parent_id: &str,
        new_name: Option<&str>,
    ) -> anyhow::Result<FileItem> {
        self.call(
            "file/move",
            &json!({
                "drive_id": self.drive_id,
                "file_id": file_id,
                "to_parent_file_id": new_parent_id,
                "new_name": new_name,
            }),
        )
        .await
    }

    /// Remove an entry, through the recycle bin when asked. `NotFound` is
    /// swallowed: deleting what is already gone succeeded.
    pub async fn delete(&self, file_id: &str, recycle: bool) -> anyhow::Result<()> {
        let path = if recycle { "recyclebin/trash" } else { "file/delete" };
        let body = json!({ "drive_id": self.drive_id, "file_id": file_id });
        match self.call_discard(path, &body).await {
            Err(e) if matches!(SyncError::of(&e), Some(SyncError::NotFound(_))) => Ok(()),
            other => other,
        }
    }

    /// One policy for every request: 429 honors `retry-after` (never below
    /// the 250 ms baseline) for up to five attempts; transport errors back
    /// off 5ⁿ seconds for up to five retries; recognized body codes surface
    /// typed.
    async fn call<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &impl Serialize,
    ) -> anyhow::Result<T> {
        let bytes = self.call_raw(path, body).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn call_discard(&self, path: &str, body: &impl Serialize) -> anyhow::Result<()> {
        self.call_raw(path, body).await.map(|_| ())
    }

    async fn call_raw(&self, path: &str, body: &impl Serialize) -> anyhow::Result<Vec<u8>> {
        let url = self.base_url.join(path)?;
        let mut throttled = 0u32;
        let mut transport_errors = 0u32;

        loop {
            let resp = match self.client.post(url.clone()).json(body).send().await {
                Ok(resp) => resp,
                Err(e) => {
                    transport_errors += 1;
                    if transport_errors > MAX_TRANSPORT_RETRIES {
                        return Err(anyhow::Error::new(SyncError::Transient(e.to_string()))
                            .context(format!("POST {path}")));
                    }
                    let wait = transport_backoff(transport_errors - 1);
                    tracing::warn!(%path, attempt = transport_errors, "Transport error, retrying in {wait:?}: {e}");
                    tokio::time::sleep(wait).await;
                    continue;
                }
            };

            let status = resp.status();
            if status.is_success() {
                return Ok(resp.bytes().await?.to_vec());
            }

            if status == StatusCode::TOO_MANY_REQUESTS {
                throttled += 1;
                if throttled >= MAX_THROTTLED_ATTEMPTS {
                    return Err(anyhow::Error::new(SyncError::Throttled(throttled))
                        .context(format!("POST {path}")));
                }
                let wait = throttle_wait(retry_after(&resp));
                tracing::warn!(%path, attempt = throttled, "Rate limited, sleeping {wait:?}");
                tokio::time::sleep(wait).await;
                continue;
            }

            let reply: ErrorReply =
                serde_json::from_slice(&resp.bytes().await.unwrap_or_default())
                    .unwrap_or(ErrorReply {
                        code: None,
                        message: None,
                    });
            return Err(anyhow::Error::new(classify_reply(status, reply))
                .context(format!("POST {path}")));
        }
    }

    /// Keep at least [`LIST_PACE`] of wall time between listing calls.
    async fn pace(&self) {
        let mut last = self.last_listing.lock().await;
        if let Some(at) = *last {
            let elapsed = at.elapsed();
            if elapsed < LIST_PACE {
                tokio::time::sleep(LIST_PACE - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

fn retry_after(resp: &reqwest::Response) -> Option<Duration> {
    resp.headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Honored sleep for a 429: the `retry-after` header when it is at or above
/// the baseline, the 250 ms baseline otherwise.
fn throttle_wait(retry_after: Option<Duration>) -> Duration {
    match retry_after {
        Some(after) if after >= LIST_PACE => after,
        _ => LIST_PACE,
    }
}

fn transport_backoff(n: u32) -> Duration {
    Duration::from_secs(5u64.pow(n))
}

/// Map a recognizable body `code` to its kind; anything else is fatal with
/// the code surfaced.
fn classify_reply(status: StatusCode, reply: ErrorReply) -> SyncError {
    let message = reply.message.unwrap_or_default();
    match reply.code.as_deref() {
        Some("PreHashMatched") => SyncError::PreHashMatched,
        Some(code) if code.starts_with("NotFound") => SyncError::NotFound(message),
        Some("ForbiddenFileInTheRecycleBin") => SyncError::ForbiddenInRecycleBin(message),
        Some("PermissionDenied") => SyncError::PermissionDenied(message),
        Some(code) => SyncError::Fatal(format!("{code}: {message} ({status})")),
        None => SyncError::Fatal(format!("http {status}: {message}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(code: &str) -> ErrorReply {
        ErrorReply {
            code: Some(code.into()),
            message: Some("m".into()),
        }
    }

    #[test]
    fn recognized_codes_surface_typed() {
        assert!(matches!(
            classify_reply(StatusCode::CONFLICT, reply("PreHashMatched")),
            SyncError::PreHashMatched
        ));
        assert!(matches!(
            classify_reply(StatusCode::NOT_FOUND, reply("NotFound.File")),
            SyncError::NotFound(_)
        ));
        assert!(matches!(
            classify_reply(StatusCode::FORBIDDEN, reply("ForbiddenFileInTheRecycleBin")),
            SyncError::ForbiddenInRecycleBin(_)
        ));
        assert!(matches!(
            classify_reply(StatusCode::FORBIDDEN, reply("PermissionDenied")),
            SyncError::PermissionDenied(_)
        ));
        assert!(matches!(
            classify_reply(StatusCode::BAD_REQUEST, reply("SomethingElse")),
            SyncError::Fatal(_)
        ));
    }

    #[test]
    fn throttle_honors_retry_after_above_baseline() {
        assert_eq!(throttle_wait(None), Duration::from_millis(250));
        assert_eq!(
            throttle_wait(Some(Duration::from_millis(100))),
            Duration::from_millis(250)
        );
        assert_eq!(throttle_wait(Some(Duration::from_secs(3))), Duration::from_secs(3));
    }

    #[test]
    fn transport_backoff_is_powers_of_five() {
        assert_eq!(transport_backoff(0), Duration::from_secs(1));
        assert_eq!(transport_backoff(1), Duration::from_secs(5));
        assert_eq!(transport_backoff(2), Duration::from_secs(25));
    }
}
