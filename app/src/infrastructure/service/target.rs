//! The job's counterpart side, selected from the tagged provider options.
//!
//! The sync engine drives a narrow capability set (create-dir, copy in both
//! directions, rename, delete); each backend realizes it with its own
//! transport. Tags without a shipped backend are accepted in configuration
//! but refuse to connect.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use domain::model::entity::{Direction, LocalEntry, PlanAction, RemoteEntry};
use domain::model::vo::config::TargetOptions;
use domain::SyncError;
use service::Catalogue;

use super::download_file::{DownloadFileService, DownloadOutcome};
use super::upload_file::{UploadFileService, UploadOutcome};
use crate::infrastructure::service::drive::DriveClient;

pub enum SyncTarget {
    Drive(DriveTarget),
    Local(LocalTarget),
}

pub struct DriveTarget {
    pub client: Arc<DriveClient>,
    pub uploader: Arc<UploadFileService>,
    pub downloader: Arc<DownloadFileService>,
    pub catalogue: Arc<Catalogue>,
    pub recycle_bin: bool,
}

pub struct LocalTarget {
    pub root: PathBuf,
    pub preserve_time: bool,
}

/// What one executed action moved, for the statistics.
pub struct Moved {
    pub bytes: u64,
    pub cancelled: bool,
}

impl SyncTarget {
    /// Match the tag to a backend. `drive` carries the wired cloud-drive
    /// backend when the agent has one.
    pub fn connect(options: &TargetOptions, drive: Option<DriveTarget>) -> anyhow::Result<Self> {
        match options {
            TargetOptions::CloudDrive { .. } => Ok(Self::Drive(
                drive.context("no cloud-drive backend is wired for this agent")?,
            )),
            TargetOptions::Local { root } => Ok(Self::Local(LocalTarget {
                root: PathBuf::from(root),
                preserve_time: false,
            })),
            other => {
                let tag = match other {
                    TargetOptions::Ftp { .. } => "ftp",
                    TargetOptions::Sftp { .. } => "sftp",
                    TargetOptions::WebDav { .. } => "webdav",
                    TargetOptions::S3 { .. } => "s3",
                    TargetOptions::Smb { .. } => "smb",
                    _ => unreachable!(),
                };
                Err(SyncError::ConfigInvalid(format!(
                    "target backend {tag} is not available in this build"
                ))
                .into())
            }
        }
    }

    pub async fn create_dir(&self, action: &PlanAction) -> anyhow::Result<()> {
        match action.direction {
            Direction::TargetToSource => {
                tokio::fs::create_dir_all(&action.source).await?;
                Ok(())
            }
            Direction::SourceToTarget => match self {
                Self::Drive(drive) => {
                    drive.uploader.ensure_folders(&action.target).await?;
                    Ok(())
                }
                Self::Local(local) => {
                    tokio::fs::create_dir_all(local.root.join(&action.key)).await?;
                    Ok(())
                }
            },
        }
    }

    pub async fn copy_file(
        &self,
        action: &PlanAction,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Moved> {
        match self {
            Self::Drive(drive) => drive.copy_file(action, cancel).await,
            Self::Local(local) => local.copy_file(action).await,
        }
    }

    pub async fn rename(&self, action: &PlanAction) -> anyhow::Result<()> {
        match self {
            Self::Drive(drive) => drive.rename(action).await,
            Self::Local(local) => local.rename(action).await,
        }
    }

    pub async fn delete(&self, action: &PlanAction) -> anyhow::Result<()> {
        match self {
            Self::Drive(drive) => drive.delete(action).await,
            Self::Local(local) => local.delete(action).await,
        }
    }
}

impl DriveTarget {
    async fn copy_file(
        &self,
        action: &PlanAction,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Moved> {
        match action.direction {
            Direction::SourceToTarget => {
                let entry = self
                    .catalogue
                    .get_local(&action.key)
                    .with_context(|| format!("local entry {} vanished from catalogue", action.key))?;
                let outcome = self.uploader.upload(&entry, cancel).await?;
                Ok(Moved {
                    bytes: match outcome {
                        UploadOutcome::Uploaded => entry.size,
                        _ => 0,
                    },
                    cancelled: outcome == UploadOutcome::Cancelled,
                })
            }
            Direction::TargetToSource => {
                let remote = self
                    .catalogue
                    .get_remote_file(&action.target)
                    .with_context(|| format!("remote entry {} vanished from catalogue", action.target))?;
                let outcome = self.downloader.download(&remote, &action.source, cancel).await?;
                match outcome {
                    DownloadOutcome::Cancelled => Ok(Moved {
                        bytes: 0,
                        cancelled: true,
                    }),
                    DownloadOutcome::Done(path) => {
                        self.remember_local(&action.key, &path, &remote).await;
                        Ok(Moved {
                            bytes: remote.size,
                            cancelled: false,
                        })
                    }
                }
            }
        }
    }

    async fn rename(&self, action: &PlanAction) -> anyhow::Result<()> {
        let old_key = action.source.to_string_lossy().into_owned();
        let Some(remote) = self.catalogue.get_remote_file(&old_key) else {
            // Renaming what is already gone is a success.
            return Ok(());
        };
        let new_name = action.target.rsplit('/').next().unwrap_or(&action.target);

        match self.client.rename(&remote.id, new_name).await {
            Ok(item) => {
                self.catalogue.remove_remote(&old_key);
                self.catalogue.insert_remote_file(RemoteEntry {
                    name: item.name,
                    updated: item.updated_at,
                    key: action.target.clone(),
                    ..remote
                });
                Ok(())
            }
            Err(e) if matches!(SyncError::of(&e), Some(SyncError::NotFound(_))) => {
                self.catalogue.remove_remote(&old_key);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, action: &PlanAction) -> anyhow::Result<()> {
        let entry = self
            .catalogue
            .get_remote_file(&action.target)
            .or_else(|| self.catalogue.get_remote_folder(&action.target));
        let Some(entry) = entry else {
            return Ok(());
        };
        // NotFound inside is already treated as success by the client.
        self.client.delete(&entry.id, self.recycle_bin).await?;
        self.catalogue.remove_remote(&action.target);
        Ok(())
    }

    /// Track a freshly downloaded file so the mount and the next plan see it.
    async fn remember_local(&self, key: &str, path: &Path, remote: &RemoteEntry) {
        let meta = match tokio::fs::metadata(path).await {
            Ok(meta) => meta,
            Err(_) => return,
        };
        let modified = meta.modified().map(Into::into).unwrap_or_else(|_| Utc::now());
        let created = meta.created().map(Into::into).unwrap_or(modified);
        self.catalogue.insert_local(LocalEntry {
            path: path.to_owned(),
            key: key.to_owned(),
            parent_key: key.rsplit_once('/').map(|(p, _)| p.to_owned()).unwrap_or_default(),
            is_file: true,
            size: meta.len(),
            created,
            modified,
            fast_hash: None,
            sha1: remote.sha1.clone(),
            encrypted: false,
            encrypted_name: None,
        });
    }
}

impl LocalTarget {
    fn effective_paths(&self, action: &PlanAction) -> (PathBuf, PathBuf) {
        let on_target = self.root.join(&action.key);
        match action.direction {
            Direction::SourceToTarget => (action.source.clone(), on_target),
            Direction::TargetToSource => (on_target, action.source.clone()),
        }
    }

    async fn copy_file(&self, action: &PlanAction) -> anyhow::Result<Moved> {
        let (from, to) = self.effective_paths(action);
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = tokio::fs::copy(&from, &to).await?;

        if self.preserve_time {
            let meta = tokio::fs::metadata(&from).await?;
            if let Ok(modified) = meta.modified() {
                let to = to.clone();
                tokio::task::spawn_blocking(move || {
                    std::fs::File::options()
                        .write(true)
                        .open(&to)
                        .and_then(|f| f.set_modified(modified))
                })
                .await?
                .ok();
            }
        }
        Ok(Moved {
            bytes,
            cancelled: false,
        })
    }

    async fn rename(&self, action: &PlanAction) -> anyhow::Result<()> {
        let from = self.root.join(action.source.to_string_lossy().as_ref());
        let to = self.root.join(&action.target);
        match tokio::fs::rename(&from, &to).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, action: &PlanAction) -> anyhow::Result<()> {
        let path = self.root.join(&action.key);
        let result = if action.kind.is_directory() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
