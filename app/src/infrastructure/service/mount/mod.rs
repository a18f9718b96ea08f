//! The mounted projection: a read-write view of the remote drive served
//! through the standard filesystem callback set. The syscall binding is an
//! external collaborator; it forwards open/read/write/rename/delete/list/
//! stat/set-end-of-file/volume-info here.

mod read_cache;
mod writer;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::Mutex;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use domain::model::entity::RemoteEntry;
use domain::model::vo::config::TargetOptions;
use domain::service::MountService;
use domain::SyncError;
use service::Catalogue;

use self::read_cache::{RangeCache, RangeKey, CACHE_WINDOW_MAX};
use self::writer::WriteSession;
use super::controller::JobController;
use super::download_file::DownloadFileService;
use super::drive::DriveClient;
use super::token::TokenCache;
use super::upload_file::{part_put_client, UploadFileService};
use crate::dto::CreateFileRequest;

pub struct VolumeInfo {
    pub total: u64,
    pub used: u64,
}

/// One mounted drive volume. Paths arriving from the callback layer are
/// relative to the mount root and map onto path-keys under the save-root.
#[derive(TypedBuilder)]
pub struct DriveVolume {
    client: Arc<DriveClient>,
    catalogue: Arc<Catalogue>,
    downloader: Arc<DownloadFileService>,
    uploader: Arc<UploadFileService>,
    save_root: String,
    /// Per-part temp files live here, `<cwd>/.uploadcache` by default.
    upload_cache_dir: PathBuf,
    #[builder(default = 16 * 1024 * 1024)]
    part_size: u64,
    #[builder(default)]
    read_only: bool,
    /// Report used space from the drive metric instead of summing entries.
    #[builder(default = true)]
    used_space_from_drive: bool,
    #[builder(default)]
    recycle_bin: bool,
    #[builder(default = part_put_client())]
    part_client: reqwest::Client,
    #[builder(default)]
    read_cache: RangeCache,
    #[builder(default)]
    write_sessions: DashMap<String, Arc<Mutex<WriteSession>>>,
    #[builder(default)]
    path_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl DriveVolume {
    fn path_key(&self, relative: &str) -> String {
        mount_key(&self.save_root, relative)
    }

    fn path_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.path_locks.entry(key.to_owned()).or_default().clone()
    }

    pub fn stat(&self, relative: &str) -> Option<RemoteEntry> {
        let key = self.path_key(relative);
        self.catalogue.get_remote_file(&key).or_else(|| self.catalogue.get_remote_folder(&key))
    }

    /// Enumerate a directory, optionally filtered by the caller's pattern.
    pub fn list_dir(
        &self,
        relative: &str,
        pattern: Option<&str>,
    ) -> anyhow::Result<Vec<RemoteEntry>> {
        let key = self.path_key(relative);
        let folder = self
            .catalogue
            .get_remote_folder(&key)
            .ok_or_else(|| SyncError::NotFound(key.clone()))?;

        let mut children = self.catalogue.remote_children(&folder.id);
        if let Some(pattern) = pattern.filter(|p| !p.is_empty() && *p != "*") {
            let matcher = globset::Glob::new(pattern)
                .map_err(|e| SyncError::ConfigInvalid(format!("bad list pattern: {e}")))?
                .compile_matcher();
            children.retain(|entry| matcher.is_match(&entry.name));
        }
        Ok(children)
    }

    /// Ranged read with the small-window cache. The window is clamped to
    /// the file end.
    pub async fn read(&self, relative: &str, offset: u64, length: u64) -> anyhow::Result<Bytes> {
        let key = self.path_key(relative);
        let entry = self
            .catalogue
            .get_remote_file(&key)
            .ok_or_else(|| SyncError::NotFound(key.clone()))?;

        if offset >= entry.size || length == 0 {
            return Ok(Bytes::new());
        }
        let end = (offset + length).min(entry.size);
        let window = end - offset;

        if window <= CACHE_WINDOW_MAX {
            let cache_key = RangeKey {
                file_id: entry.id.clone(),
                content_hash: entry.sha1.clone().unwrap_or_default(),
                offset,
                length: window,
            };
            if let Some(hit) = self.read_cache.get(&cache_key) {
                return Ok(hit);
            }
            let bytes = self.downloader.read_range(&entry.id, offset..end).await?;
            self.read_cache.put(cache_key, bytes.clone());
            return Ok(bytes);
        }

        self.downloader.read_range(&entry.id, offset..end).await
    }

    /// `SetEndOfFile`: fix the length, pre-allocate the part plan, open a
    /// write session.
    pub async fn set_end_of_file(&self, relative: &str, size: u64) -> anyhow::Result<()> {
        self.writable()?;
        let key = self.path_key(relative);
        let _guard = self.path_lock(&key).lock_owned().await;

        // A rewrite replaces the previous entry.
        if let Some(existing) = self.catalogue.get_remote_file(&key) {
            self.client.delete(&existing.id, self.recycle_bin).await?;
            self.catalogue.remove_remote(&key);
            self.read_cache.invalidate_file(&existing.id);
        }

        let (parent_key, name) = match key.rsplit_once('/') {
            Some((parent, name)) => (parent.to_owned(), name.to_owned()),
            None => (String::new(), key.clone()),
        };
        let parent_id = self.uploader.ensure_folders(&parent_key).await?;

        let parts = size.div_ceil(self.part_size).max(1);
        let resp = self
            .client
            .create_file(&CreateFileRequest::file(
                self.client.drive_id(),
                &parent_id,
                &name,
                size,
                parts,
            ))
            .await?;
        let upload_id = resp.upload_id.context("create-file reply carries no upload id")?;
        let part_urls =
            resp.part_info_list.iter().map(|p| (p.part_number, p.upload_url.clone())).collect();

        tokio::fs::create_dir_all(&self.upload_cache_dir).await?;
        let session = WriteSession::new(
            resp.file_id,
            upload_id,
            part_urls,
            size,
            self.part_size,
            &self.upload_cache_dir,
        );
        self.write_sessions.insert(key, Arc::new(Mutex::new(session)));
        Ok(())
    }

    /// `WriteFile`: dispatch bytes into the session's part buffers; full
    /// parts are PUT immediately.
    pub async fn write(&self, relative: &str, offset: u64, data: &[u8]) -> anyhow::Result<()> {
        self.writable()?;
        let key = self.path_key(relative);
        let session = self
            .write_sessions
            .get(&key)
            .map(|kv| kv.value().clone())
            .ok_or_else(|| SyncError::Fatal(format!("no write session open for {key}")))?;

        let mut session = session.lock().await;
        session.write(offset, data, &self.part_client).await
    }

    /// `CloseFile`: flush unsent parts, complete the upload, register the
    /// new entry.
    pub async fn close(&self, relative: &str) -> anyhow::Result<()> {
        let key = self.path_key(relative);
        let Some((_, session)) = self.write_sessions.remove(&key) else {
            return Ok(());
        };
        let _guard = self.path_lock(&key).lock_owned().await;

        let mut session = session.lock().await;
        if let Err(e) = session.finish(&self.part_client).await {
            session.abandon().await;
            return Err(e);
        }

        let item = self.client.complete_upload(&session.file_id, &session.upload_id).await?;
        let (parent_key, _) = key.rsplit_once('/').unwrap_or(("", key.as_str()));
        let parent_id = self
            .catalogue
            .get_remote_folder(parent_key)
            .map(|f| f.id)
            .unwrap_or_default();
        self.catalogue.insert_remote_file(RemoteEntry {
            id: item.file_id,
            parent_id,
            name: item.name,
            is_folder: false,
            size: item.size.unwrap_or(session.total_size),
            sha1: item.content_hash,
            created: item.created_at,
            updated: item.updated_at,
            key,
        });
        Ok(())
    }

    pub async fn create_dir(&self, relative: &str) -> anyhow::Result<()> {
        self.writable()?;
        let key = self.path_key(relative);
        self.uploader.ensure_folders(&key).await?;
        Ok(())
    }

    pub async fn rename(&self, relative: &str, new_name: &str) -> anyhow::Result<()> {
        self.writable()?;
        let key = self.path_key(relative);
        let _guard = self.path_lock(&key).lock_owned().await;

        let entry = self.stat(relative).ok_or_else(|| SyncError::NotFound(key.clone()))?;
        let item = self.client.rename(&entry.id, new_name).await?;

        let new_key = match key.rsplit_once('/') {
            Some((parent, _)) => format!("{parent}/{new_name}"),
            None => new_name.to_owned(),
        };
        if entry.is_folder {
            // Children keys are stale until the next listing.
            self.catalogue.remove_remote_tree(&key);
            self.catalogue.insert_remote_folder(RemoteEntry {
                name: item.name,
                updated: item.updated_at,
                key: new_key,
                ..entry
            });
        } else {
            self.catalogue.remove_remote(&key);
            self.read_cache.invalidate_file(&entry.id);
            self.catalogue.insert_remote_file(RemoteEntry {
                name: item.name,
                updated: item.updated_at,
                key: new_key,
                ..entry
            });
        }
        Ok(())
    }

    pub async fn move_entry(&self, relative: &str, new_parent: &str) -> anyhow::Result<()> {
        self.writable()?;
        let key = self.path_key(relative);
        let _guard = self.path_lock(&key).lock_owned().await;

        let entry = self.stat(relative).ok_or_else(|| SyncError::NotFound(key.clone()))?;
        let parent_key = self.path_key(new_parent);
        let parent = self
            .catalogue
            .get_remote_folder(&parent_key)
            .ok_or_else(|| SyncError::NotFound(parent_key.clone()))?;

        let item = self.client.r#move(&entry.id, &parent.id, None).await?;
        let new_key = format!("{parent_key}/{}", item.name);
        if entry.is_folder {
            self.catalogue.remove_remote_tree(&key);
            self.catalogue.insert_remote_folder(RemoteEntry {
                parent_id: parent.id,
                updated: item.updated_at,
                key: new_key,
                ..entry
            });
        } else {
            self.catalogue.remove_remote(&key);
            self.catalogue.insert_remote_file(RemoteEntry {
                parent_id: parent.id,
                updated: item.updated_at,
                key: new_key,
                ..entry
            });
        }
        Ok(())
    }

    pub async fn delete(&self, relative: &str) -> anyhow::Result<()> {
        self.writable()?;
        let key = self.path_key(relative);
        let _guard = self.path_lock(&key).lock_owned().await;

        let Some(entry) = self.stat(relative) else {
            return Ok(());
        };
        self.client.delete(&entry.id, self.recycle_bin).await?;
        if entry.is_folder {
            self.catalogue.remove_remote_tree(&key);
        } else {
            self.catalogue.remove_remote(&key);
            self.read_cache.invalidate_file(&entry.id);
        }
        Ok(())
    }

    pub async fn volume_info(&self) -> anyhow::Result<VolumeInfo> {
        let space = self.client.space_info().await?;
        let used = if self.used_space_from_drive {
            space.used_size
        } else {
            self.catalogue.remote_files_map().values().map(|f| f.size).sum()
        };
        Ok(VolumeInfo {
            total: space.total_size,
            used,
        })
    }

    fn writable(&self) -> anyhow::Result<()> {
        if self.read_only {
            return Err(SyncError::PermissionDenied("volume is mounted read-only".into()).into());
        }
        Ok(())
    }
}

/// Builds and tracks one volume per mounted job.
#[derive(TypedBuilder)]
pub struct MountManager {
    controller: Arc<JobController>,
    client: Arc<DriveClient>,
    token_cache: Arc<TokenCache>,
    drive_config_id: String,
    cache_dir: PathBuf,
    #[builder(default)]
    volumes: DashMap<Uuid, Arc<DriveVolume>>,
}

impl MountManager {
    pub fn volume(&self, job_id: Uuid) -> Option<Arc<DriveVolume>> {
        self.volumes.get(&job_id).map(|kv| kv.value().clone())
    }
}

#[async_trait::async_trait]
impl MountService for MountManager {
    async fn mount(&self, job_id: Uuid) -> anyhow::Result<()> {
        let config = self.controller.job_config(job_id).context("unknown job")?;
        let TargetOptions::CloudDrive { save_root, .. } = &config.target else {
            return Err(
                SyncError::ConfigInvalid("only cloud-drive jobs can be mounted".into()).into()
            );
        };

        self.controller.refresh_remote(job_id).await?;
        let catalogue = self.controller.catalogue(job_id).context("job has no catalogue")?;

        let uploader = Arc::new(
            UploadFileService::builder()
                .client(self.client.clone())
                .catalogue(catalogue.clone())
                .token_cache(self.token_cache.clone())
                .drive_config_id(self.drive_config_id.clone())
                .save_root(save_root.clone())
                .recycle_bin(config.recycle_bin)
                .cache_dir(self.cache_dir.join(".cache"))
                .build(),
        );
        let downloader = Arc::new(
            DownloadFileService::builder()
                .client(self.client.clone())
                .cache_dir(self.cache_dir.join(".cache"))
                .build(),
        );

        let volume = DriveVolume::builder()
            .client(self.client.clone())
            .catalogue(catalogue)
            .downloader(downloader)
            .uploader(uploader)
            .save_root(save_root.clone())
            .upload_cache_dir(self.cache_dir.join(".uploadcache"))
            .read_only(config.read_only_mount)
            .used_space_from_drive(!config.mount_used_space_local)
            .recycle_bin(config.recycle_bin)
            .build();

        self.volumes.insert(job_id, Arc::new(volume));
        tracing::info!(job = %config.name, "Volume mounted");
        Ok(())
    }

    async fn unmount(&self, job_id: Uuid) -> anyhow::Result<()> {
        let Some((_, volume)) = self.volumes.remove(&job_id) else {
            return Ok(());
        };
        for entry in volume.write_sessions.iter() {
            let mut session = entry.value().lock().await;
            session.abandon().await;
        }
        tracing::info!(job = %job_id, "Volume unmounted");
        Ok(())
    }
}

/// Map a mount-relative path onto its path-key under the save-root.
fn mount_key(save_root: &str, relative: &str) -> String {
    let relative = relative.trim_matches('/');
    if relative.is_empty() {
        save_root.to_owned()
    } else {
        format!("{save_root}/{relative}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_map_under_the_save_root() {
        assert_eq!(mount_key("backup", ""), "backup");
        assert_eq!(mount_key("backup", "/"), "backup");
        assert_eq!(mount_key("backup", "/A/a.txt"), "backup/A/a.txt");
        assert_eq!(mount_key("backup", "A/a.txt/"), "backup/A/a.txt");
    }
}
