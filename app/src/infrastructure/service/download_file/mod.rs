mod supervisor;

use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use dashmap::DashMap;
use infrastructure::sync::PauseToken;
use tokio::fs::File;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use domain::model::entity::RemoteEntry;
use domain::SyncError;

use self::supervisor::DownloadPartSupervisor;
use crate::infrastructure::service::crypto::CryptoPipeline;
use crate::infrastructure::service::drive::DriveClient;
use crate::infrastructure::service::hasher;

/// Signed URLs are requested with this validity…
const URL_TTL_SECS: u64 = 4 * 60 * 60;
/// …and dropped from the cache this much earlier.
const URL_EVICT_EARLY: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// Where the verified file landed.
    Done(PathBuf),
    Cancelled,
}

struct CachedUrl {
    url: String,
    fetched: Instant,
}

#[derive(TypedBuilder)]
pub struct DownloadFileService {
    client: Arc<DriveClient>,
    /// Temp area for `.part` files, `<root>/.cache`.
    cache_dir: PathBuf,
    #[builder(default = 16 * 1024 * 1024)]
    part_size: u64,
    #[builder(default)]
    crypto: Option<Arc<CryptoPipeline>>,
    /// Signed URLs carry their own auth; a plain client fetches them.
    #[builder(default = reqwest::Client::new())]
    fetch_client: reqwest::Client,
    #[builder(default)]
    pause: PauseToken,
    #[builder(default = 16)]
    max_part_workers: usize,
    #[builder(default)]
    preserve_time: bool,
    #[builder(default)]
    url_cache: DashMap<String, CachedUrl>,
}

impl DownloadFileService {
    pub fn pause_token(&self) -> &PauseToken {
        &self.pause
    }

    /// A still-fresh signed download URL for the file.
    pub async fn signed_url(&self, file_id: &str) -> anyhow::Result<String> {
        if let Some(hit) = self.url_cache.get(file_id) {
            if hit.fetched.elapsed() + URL_EVICT_EARLY < Duration::from_secs(URL_TTL_SECS) {
                return Ok(hit.url.clone());
            }
        }

        let resp = self.client.download_url(file_id, URL_TTL_SECS).await?;
        self.url_cache.insert(
            file_id.to_owned(),
            CachedUrl {
                url: resp.url.clone(),
                fetched: Instant::now(),
            },
        );
        Ok(resp.url)
    }

    /// Fetch, verify and atomically place one remote file at `dest`.
    pub async fn download(
        &self,
        remote: &RemoteEntry,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> anyhow::Result<DownloadOutcome> {
        if cancel.is_cancelled() {
            return Ok(DownloadOutcome::Cancelled);
        }

        tokio::fs::create_dir_all(&self.cache_dir).await?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.cache_dir.join(format!("{}.part", Uuid::new_v4()));

        let url = self.signed_url(&remote.id).await?;
        let fetched = self.fetch(&url, remote, &tmp, cancel).await;
        match fetched {
            Ok(false) => {}
            Ok(true) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Ok(DownloadOutcome::Cancelled);
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(e);
            }
        }

        if let Err(e) = self.verify(remote, &tmp).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }

        let final_path = self.place(remote, &tmp, dest).await?;

        if self.preserve_time {
            let target = final_path.clone();
            let updated = remote.updated;
            tokio::task::spawn_blocking(move || {
                std::fs::File::options()
                    .write(true)
                    .open(&target)
                    .and_then(|f| f.set_modified(updated.into()))
            })
            .await?
            .ok();
        }

        tracing::debug!(key = %remote.key, "Download finished");
        Ok(DownloadOutcome::Done(final_path))
    }

    /// Ranged byte window, used by the mounted projection's read path.
    pub async fn read_range(&self, file_id: &str, range: Range<u64>) -> anyhow::Result<Bytes> {
        anyhow::ensure!(range.start < range.end, "empty range");
        let url = self.signed_url(file_id).await?;
        let bytes = self
            .fetch_client
            .get(&url)
            // The right end is inclusive.
            .header("Range", format!("bytes={}-{}", range.start, range.end - 1))
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        Ok(bytes)
    }

    /// Returns whether the transfer was cancelled.
    async fn fetch(
        &self,
        url: &str,
        remote: &RemoteEntry,
        tmp: &Path,
        cancel: &CancellationToken,
    ) -> anyhow::Result<bool> {
        if remote.size == 0 {
            // Nothing to range over; one plain GET settles it.
            let bytes = self
                .fetch_client
                .get(url)
                .send()
                .await?
                .error_for_status()?
                .bytes()
                .await?;
            tokio::fs::write(tmp, &bytes).await?;
            return Ok(false);
        }

        let file = File::create(tmp).await?;
        file.set_len(remote.size).await?;

        let supervisor = Arc::new(DownloadPartSupervisor::new(
            file,
            remote.size,
            self.part_size,
            url.to_owned(),
            self.fetch_client.clone(),
            self.pause.clone(),
            cancel.child_token(),
            self.max_part_workers,
        ));
        supervisor.run().await
    }

    async fn verify(&self, remote: &RemoteEntry, tmp: &Path) -> anyhow::Result<()> {
        let Some(expected) = remote.sha1.clone() else {
            return Ok(());
        };
        let path = tmp.to_owned();
        let actual = tokio::task::spawn_blocking(move || hasher::sha1_file(&path)).await??;
        if !actual.eq_ignore_ascii_case(&expected) {
            return Err(SyncError::IntegrityMismatch {
                expected,
                actual,
            })
            .with_context(|| format!("downloaded {}", remote.key));
        }
        Ok(())
    }

    /// Atomic rename into place; encrypted envelopes are opened beside the
    /// requested destination under their recorded original name.
    async fn place(&self, remote: &RemoteEntry, tmp: &Path, dest: &Path) -> anyhow::Result<PathBuf> {
        let crypto = match (&self.crypto, remote.name.ends_with(".e")) {
            (Some(crypto), true) => crypto.clone(),
            _ => {
                tokio::fs::rename(tmp, dest).await?;
                return Ok(dest.to_owned());
            }
        };

        let envelope = tmp.to_owned();
        let opened = self.cache_dir.join(format!("{}.open", Uuid::new_v4()));
        let opened_for_task = opened.clone();
        let original_name = tokio::task::spawn_blocking(move || {
            crypto.open_file(&envelope, &opened_for_task)
        })
        .await??;
        let _ = tokio::fs::remove_file(tmp).await;

        let final_path =
            dest.parent().map(|p| p.join(&original_name)).unwrap_or_else(|| dest.to_owned());
        tokio::fs::rename(&opened, &final_path).await?;
        Ok(final_path)
    }
}
