mod supervisor;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use infrastructure::sync::PauseToken;
use tokio::fs::File;
use tokio_util::sync::CancellationToken;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use domain::model::entity::{LocalEntry, RemoteEntry};
use domain::SyncError;
use service::Catalogue;

use self::supervisor::UploadPartSupervisor;
use crate::dto::{CreateFileRequest, CreateFileResponse, FileItem, ItemKind};
use crate::infrastructure::service::crypto::CryptoPipeline;
use crate::infrastructure::service::drive::DriveClient;
use crate::infrastructure::service::hasher;
use crate::infrastructure::service::token::TokenCache;

/// Fixed upload part size.
pub const PART_SIZE: u64 = 16 * 1024 * 1024;
/// Below this, rapid upload is not attempted at all.
const RAPID_MIN: u64 = 10 * 1024;
/// Above this, a pre-hash probe goes first; below, straight to full proof.
const PRE_HASH_MIN: u64 = 1024 * 1024;
/// Attempts to clear a same-name collision before giving up.
const COLLISION_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Target already carries this content.
    AlreadyPresent,
    /// Accepted on proof alone; no part was transferred.
    RapidUpload,
    Uploaded,
    Cancelled,
}

/// A fixed-size multi-part upload in flight. Owned by the uploader; the
/// rest of the system refers to it only through the remote file id.
pub struct UploadSession {
    pub file_id: String,
    pub upload_id: String,
    pub parts: Vec<UploadPart>,
    pub total_size: u64,
    pub key: String,
}

pub struct UploadPart {
    pub number: u64,
    pub url: String,
    pub length: u64,
    pub uploaded: AtomicBool,
}

impl UploadSession {
    pub fn new(
        file_id: String,
        upload_id: String,
        part_urls: Vec<(u64, String)>,
        total_size: u64,
        part_size: u64,
        key: String,
    ) -> Self {
        let parts = part_urls
            .into_iter()
            .map(|(number, url)| {
                let offset = (number - 1) * part_size;
                UploadPart {
                    number,
                    url,
                    length: part_size.min(total_size - offset),
                    uploaded: AtomicBool::new(false),
                }
            })
            .collect();
        Self {
            file_id,
            upload_id,
            parts,
            total_size,
            key,
        }
    }

    /// `complete` may only be called once this holds.
    pub fn all_uploaded(&self) -> bool {
        let mut bytes = 0;
        for part in &self.parts {
            if !part.uploaded.load(Ordering::Acquire) {
                return false;
            }
            bytes += part.length;
        }
        bytes == self.total_size
    }
}

#[derive(TypedBuilder)]
pub struct UploadFileService {
    client: Arc<DriveClient>,
    catalogue: Arc<Catalogue>,
    token_cache: Arc<TokenCache>,
    drive_config_id: String,
    save_root: String,
    #[builder(default = PART_SIZE)]
    part_size: u64,
    #[builder(default = true)]
    rapid_upload: bool,
    #[builder(default)]
    recycle_bin: bool,
    #[builder(default)]
    crypto: Option<Arc<CryptoPipeline>>,
    /// Scratch space for sealed envelopes.
    cache_dir: PathBuf,
    /// Dedicated client for part PUTs: signed URLs need no bearer, and the
    /// transfer gets the long 45-minute timeout.
    #[builder(default = part_put_client())]
    part_client: reqwest::Client,
    #[builder(default)]
    pause: PauseToken,
    #[builder(default = 16)]
    max_part_workers: usize,
    /// Serializes remote folder creation across concurrent uploads.
    #[builder(default)]
    dir_lock: tokio::sync::Mutex<()>,
}

pub(crate) fn part_put_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(45 * 60))
        .build()
        .expect("default TLS backend is available")
}

impl UploadFileService {
    pub fn pause_token(&self) -> &PauseToken {
        &self.pause
    }

    /// Bring one local entry to its remote path-key.
    pub async fn upload(
        &self,
        entry: &LocalEntry,
        cancel: &CancellationToken,
    ) -> anyhow::Result<UploadOutcome> {
        if cancel.is_cancelled() {
            return Ok(UploadOutcome::Cancelled);
        }

        let remote_key = join_key(&self.save_root, &entry.remote_relative_key());
        let name = remote_key.rsplit('/').next().unwrap_or(&remote_key).to_owned();

        let content_sha1 = match &entry.sha1 {
            Some(sha1) => sha1.clone(),
            None => {
                let path = entry.path.clone();
                let sha1 = tokio::task::spawn_blocking(move || hasher::sha1_file(&path)).await??;
                self.catalogue.update_local(&entry.key, |e| e.sha1 = Some(sha1.clone()));
                sha1
            }
        };

        // Short-circuit before any wire traffic. Envelope hashes never equal
        // the content hash, so the no-op check only applies to plain uploads.
        if let Some(existing) = self.catalogue.get_remote_file(&remote_key) {
            let same = !entry.encrypted
                && existing
                    .sha1
                    .as_deref()
                    .map(|h| h.eq_ignore_ascii_case(&content_sha1))
                    .unwrap_or(false);
            if same {
                return Ok(UploadOutcome::AlreadyPresent);
            }
            self.client.delete(&existing.id, self.recycle_bin).await?;
            self.catalogue.remove_remote(&remote_key);
        }

        // An encrypted job uploads the sealed envelope from scratch space.
        let mut sealed_tmp: Option<PathBuf> = None;
        let (upload_path, upload_size, upload_sha1) = match &self.crypto {
            None => (entry.path.clone(), entry.size, content_sha1.clone()),
            Some(crypto) => {
                let crypto = crypto.clone();
                let src = entry.path.clone();
                let dst = self.cache_dir.join(format!("{}.sealed", Uuid::new_v4()));
                let original_name = entry.name().to_owned();
                let out = dst.clone();
                tokio::fs::create_dir_all(&self.cache_dir).await?;
                let size = tokio::task::spawn_blocking(move || {
                    crypto.seal_file(&src, &out, &original_name)
                })
                .await??;
                let sealed = dst.clone();
                let sha1 =
                    tokio::task::spawn_blocking(move || hasher::sha1_file(&sealed)).await??;
                sealed_tmp = Some(dst.clone());
                (dst, size, sha1)
            }
        };

        let result = self
            .transfer(&upload_path, upload_size, &upload_sha1, &name, &remote_key, cancel)
            .await;

        if let Some(tmp) = sealed_tmp {
            let _ = tokio::fs::remove_file(tmp).await;
        }
        result
    }

    async fn transfer(
        &self,
        path: &Path,
        size: u64,
        sha1: &str,
        name: &str,
        remote_key: &str,
        cancel: &CancellationToken,
    ) -> anyhow::Result<UploadOutcome> {
        let parent_key = match remote_key.rsplit_once('/') {
            Some((parent, _)) => parent.to_owned(),
            None => String::new(),
        };
        let parent_id = self.ensure_folders(&parent_key).await?;

        let parts = size.div_ceil(self.part_size).max(1);
        let resp = self.negotiate(path, size, sha1, name, &parent_id, parts).await?;

        if resp.rapid_upload {
            tracing::debug!(key = remote_key, "Rapid upload accepted");
            self.remember(resp.file_id, &parent_id, name, size, sha1, remote_key, None);
            return Ok(UploadOutcome::RapidUpload);
        }

        let upload_id = resp
            .upload_id
            .clone()
            .context("create-file reply carries no upload id")?;
        let part_urls: Vec<(u64, String)> =
            resp.part_info_list.iter().map(|p| (p.part_number, p.upload_url.clone())).collect();
        let session = UploadSession::new(
            resp.file_id.clone(),
            upload_id,
            part_urls,
            size,
            self.part_size,
            remote_key.to_owned(),
        );

        let file = File::open(path).await?;
        let supervisor = Arc::new(UploadPartSupervisor::new(
            file,
            session,
            self.part_client.clone(),
            self.part_size,
            self.pause.clone(),
            cancel.child_token(),
            self.max_part_workers,
        ));
        if supervisor.clone().run().await? {
            return Ok(UploadOutcome::Cancelled);
        }

        let session = &supervisor.session;
        anyhow::ensure!(
            session.all_uploaded(),
            "upload session of {remote_key} completed with missing parts"
        );
        let item = self.client.complete_upload(&session.file_id, &session.upload_id).await?;
        self.remember(
            item.file_id.clone(),
            &parent_id,
            name,
            size,
            sha1,
            remote_key,
            Some(&item),
        );
        tracing::info!(key = remote_key, size, "Uploaded in {} parts", session.parts.len());

        Ok(UploadOutcome::Uploaded)
    }

    /// The create → (PreHashMatched → full proof) negotiation, wrapped in
    /// same-name collision cleanup.
    async fn negotiate(
        &self,
        path: &Path,
        size: u64,
        sha1: &str,
        name: &str,
        parent_id: &str,
        parts: u64,
    ) -> anyhow::Result<CreateFileResponse> {
        for _ in 0..COLLISION_ATTEMPTS {
            let result = self.create_once(path, size, sha1, name, parent_id, parts).await;
            match result {
                Ok(resp) if resp.exist && resp.upload_id.is_none() && !resp.rapid_upload => {
                    self.purge_duplicates(parent_id, name).await?;
                }
                other => return other,
            }
        }
        Err(SyncError::Fatal(format!("name collision on {name} would not clear")).into())
    }

    async fn create_once(
        &self,
        path: &Path,
        size: u64,
        sha1: &str,
        name: &str,
        parent_id: &str,
        parts: u64,
    ) -> anyhow::Result<CreateFileResponse> {
        let drive_id = self.client.drive_id();
        let base = CreateFileRequest::file(drive_id, parent_id, name, size, parts);

        if !(self.rapid_upload && size > RAPID_MIN) {
            return self.client.create_file(&base).await;
        }

        if size > PRE_HASH_MIN {
            let probe_path = path.to_owned();
            let probe =
                tokio::task::spawn_blocking(move || hasher::pre_hash(&probe_path)).await??;
            match self.client.create_file(&base.clone().with_pre_hash(&probe)).await {
                Err(e) if matches!(SyncError::of(&e), Some(SyncError::PreHashMatched)) => {
                    let proof = self.proof_code(path, size).await?;
                    self.client.create_file(&base.with_proof(sha1, &proof)).await
                }
                other => other,
            }
        } else {
            let proof = self.proof_code(path, size).await?;
            self.client.create_file(&base.with_proof(sha1, &proof)).await
        }
    }

    async fn proof_code(&self, path: &Path, size: u64) -> anyhow::Result<String> {
        let token = self.token_cache.access_token(&self.drive_config_id).await?;
        let path = path.to_owned();
        Ok(tokio::task::spawn_blocking(move || hasher::proof_code(&path, &token, size)).await??)
    }

    /// Delete every remote entry shadowing `(parent, name)`.
    async fn purge_duplicates(&self, parent_id: &str, name: &str) -> anyhow::Result<()> {
        let duplicates = self.client.exist(parent_id, name, ItemKind::File).await?;
        match duplicates {
            Some(item) => {
                tracing::warn!(name, "Clearing remote name collision");
                self.client.delete(&item.file_id, self.recycle_bin).await
            }
            None => Ok(()),
        }
    }

    /// Walk `dir_key` under the save-root, creating what is missing.
    /// Returns the folder id of the deepest segment.
    pub async fn ensure_folders(&self, dir_key: &str) -> anyhow::Result<String> {
        let _guard = self.dir_lock.lock().await;

        let root = self
            .catalogue
            .get_remote_folder(&self.save_root)
            .with_context(|| format!("save-root {} is not resolved yet", self.save_root))?;

        let mut current_key = self.save_root.clone();
        let mut current_id = root.id;
        let rest = dir_key.strip_prefix(&self.save_root).unwrap_or(dir_key);
        for segment in rest.split('/').filter(|s| !s.is_empty()) {
            current_key = format!("{current_key}/{segment}");
            if let Some(folder) = self.catalogue.get_remote_folder(&current_key) {
                current_id = folder.id;
                continue;
            }

            let resp = self.client.create_folder(&current_id, segment).await?;
            let now = Utc::now();
            let entry = RemoteEntry {
                id: resp.file_id.clone(),
                parent_id: current_id.clone(),
                name: segment.to_owned(),
                is_folder: true,
                size: 0,
                sha1: None,
                created: now,
                updated: now,
                key: current_key.clone(),
            };
            self.catalogue.insert_remote_folder(entry);
            current_id = resp.file_id;
        }
        Ok(current_id)
    }

    #[allow(clippy::too_many_arguments)]
    fn remember(
        &self,
        file_id: String,
        parent_id: &str,
        name: &str,
        size: u64,
        sha1: &str,
        remote_key: &str,
        item: Option<&FileItem>,
    ) {
        let now = Utc::now();
        self.catalogue.insert_remote_file(RemoteEntry {
            id: file_id,
            parent_id: parent_id.to_owned(),
            name: name.to_owned(),
            is_folder: false,
            size: item.and_then(|i| i.size).unwrap_or(size),
            sha1: item
                .and_then(|i| i.content_hash.clone())
                .or_else(|| Some(sha1.to_owned())),
            created: item.map(|i| i.created_at).unwrap_or(now),
            updated: item.map(|i| i.updated_at).unwrap_or(now),
            key: remote_key.to_owned(),
        });
    }
}

fn join_key(save_root: &str, key: &str) -> String {
    if save_root.is_empty() {
        key.to_owned()
    } else {
        format!("{save_root}/{key}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_tracks_part_lengths_and_completion() {
        let size = 40 * 1024 * 1024u64;
        let urls = (1..=3).map(|n| (n, format!("https://u/{n}"))).collect();
        let session =
            UploadSession::new("f".into(), "u".into(), urls, size, PART_SIZE, "k".into());

        assert_eq!(session.parts.len(), 3);
        assert_eq!(session.parts[0].length, PART_SIZE);
        assert_eq!(session.parts[1].length, PART_SIZE);
        assert_eq!(session.parts[2].length, size - 2 * PART_SIZE);

        assert!(!session.all_uploaded());
        for part in &session.parts {
            part.uploaded.store(true, Ordering::Release);
        }
        assert!(session.all_uploaded());
    }

    #[test]
    fn part_plan_rounds_up() {
        assert_eq!(1u64.div_ceil(PART_SIZE), 1);
        assert_eq!(PART_SIZE.div_ceil(PART_SIZE), 1);
        assert_eq!((PART_SIZE + 1).div_ceil(PART_SIZE), 2);
        assert_eq!((50 * 1024 * 1024u64).div_ceil(PART_SIZE), 4);
    }
}
