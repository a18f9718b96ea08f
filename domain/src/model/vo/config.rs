use std::path::Path;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SyncError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    #[default]
    OneWay,
    Mirror,
    TwoWay,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareMethod {
    Size,
    DateTime,
    #[default]
    DateTimeAndSize,
    Content,
    Hash,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictResolution {
    #[default]
    SourceWins,
    TargetWins,
    KeepBoth,
    Skip,
    Newer,
    Older,
    Larger,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compression {
    #[default]
    Zstd,
    Lz4,
    Snappy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cipher {
    #[default]
    Aes256Gcm,
    ChaCha20Poly1305,
}

/// Digest used for key derivation and envelope content digests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Blake3,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptionConfig {
    pub compression: Compression,
    pub cipher: Cipher,
    pub key_hash: HashAlgorithm,
    pub password: String,
    /// Replace remote file names with a hash of the original name.
    #[serde(default)]
    pub encrypt_names: bool,
}

/// Where a job's counterpart side lives. The constructor of the concrete
/// backend matches on this tag; backends the build does not ship reject at
/// connect time with `ConfigInvalid`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TargetOptions {
    CloudDrive { drive_id: String, save_root: String },
    Local { root: String },
    Ftp { host: String, root: String },
    Sftp { host: String, root: String },
    WebDav { url: String, root: String },
    S3 { bucket: String, prefix: String },
    Smb { share: String, root: String },
}

impl TargetOptions {
    pub fn save_root(&self) -> &str {
        match self {
            Self::CloudDrive { save_root, .. } => save_root,
            Self::Local { root }
            | Self::Ftp { root, .. }
            | Self::Sftp { root, .. }
            | Self::WebDav { root, .. }
            | Self::Smb { root, .. } => root,
            Self::S3 { prefix, .. } => prefix,
        }
    }
}

/// Per-job settings, immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub id: Uuid,
    pub name: String,
    /// Absolute local source roots.
    pub sources: Vec<String>,
    pub target: TargetOptions,
    #[serde(default)]
    pub mode: SyncMode,
    #[serde(default)]
    pub compare: CompareMethod,
    #[serde(default)]
    pub conflict: ConflictResolution,
    /// Fraction of interior blocks sampled by hash comparison, in (0, 1].
    #[serde(default = "JobConfig::default_sampling_rate")]
    pub sampling_rate: f64,
    /// Tolerated whole-second drift for date-time comparison.
    #[serde(default = "JobConfig::default_time_drift_secs")]
    pub time_drift_secs: u64,
    /// In-flight task cap; `None` means one per logical CPU.
    #[serde(default)]
    pub parallelism: Option<usize>,
    #[serde(default = "JobConfig::default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub preserve_time: bool,
    #[serde(default)]
    pub recycle_bin: bool,
    #[serde(default)]
    pub follow_symlinks: bool,
    /// Glob patterns excluding local paths; `#` lines are comments.
    #[serde(default)]
    pub ignore_patterns: Vec<String>,
    #[serde(default)]
    pub encryption: Option<EncryptionConfig>,
    #[serde(default = "JobConfig::default_rapid_upload")]
    pub rapid_upload: bool,
    /// Fixed-interval schedule in seconds; external schedulers may also
    /// invoke `RunJob` on their own cadence.
    #[serde(default)]
    pub interval_secs: Option<u64>,
    #[serde(default)]
    pub watcher: bool,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default)]
    pub read_only_mount: bool,
    /// Report mounted used space as the sum of catalogued file sizes
    /// instead of the drive's own metric.
    #[serde(default)]
    pub mount_used_space_local: bool,
}

impl JobConfig {
    fn default_sampling_rate() -> f64 {
        0.1
    }

    fn default_time_drift_secs() -> u64 {
        1
    }

    fn default_max_retries() -> u32 {
        3
    }

    fn default_rapid_upload() -> bool {
        true
    }

    /// Refuse the run before it starts on any invalid setting.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.sources.is_empty() {
            return Err(SyncError::ConfigInvalid("no source roots".into()));
        }
        for source in &self.sources {
            if !Path::new(source).is_absolute() {
                return Err(SyncError::ConfigInvalid(format!(
                    "source root is not absolute: {source}"
                )));
            }
        }

        // No root may be a path-prefix of another, in either direction.
        let mut roots: Vec<&str> = self.sources.iter().map(String::as_str).collect();
        if let TargetOptions::Local { root } = &self.target {
            roots.push(root);
        }
        for (i, a) in roots.iter().enumerate() {
            for b in roots.iter().skip(i + 1) {
                if is_path_prefix(a, b) || is_path_prefix(b, a) {
                    return Err(SyncError::ConfigInvalid(format!(
                        "roots must not nest: {a} and {b}"
                    )));
                }
            }
        }

        if !(self.sampling_rate > 0.0 && self.sampling_rate <= 1.0) {
            return Err(SyncError::ConfigInvalid(format!(
                "sampling rate out of (0, 1]: {}",
                self.sampling_rate
            )));
        }
        if self.parallelism == Some(0) {
            return Err(SyncError::ConfigInvalid("parallelism must be at least 1".into()));
        }

        // Algorithm names are constrained to the known sets by their enums;
        // what is left to refuse here is an unusable key source.
        if let Some(encryption) = &self.encryption {
            if encryption.password.is_empty() {
                return Err(SyncError::ConfigInvalid("encryption password is empty".into()));
            }
        }

        Ok(())
    }
}

fn is_path_prefix(prefix: &str, path: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    let path = path.trim_end_matches('/');
    path.len() > prefix.len()
        && path.starts_with(prefix)
        && path.as_bytes()[prefix.len()] == b'/'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(sources: &[&str], target: TargetOptions) -> JobConfig {
        JobConfig {
            id: Uuid::new_v4(),
            name: "photos".into(),
            sources: sources.iter().map(|s| s.to_string()).collect(),
            target,
            mode: SyncMode::OneWay,
            compare: CompareMethod::default(),
            conflict: ConflictResolution::default(),
            sampling_rate: 0.1,
            time_drift_secs: 1,
            parallelism: None,
            max_retries: 3,
            preserve_time: false,
            recycle_bin: false,
            follow_symlinks: false,
            ignore_patterns: vec![],
            encryption: None,
            rapid_upload: true,
            interval_secs: None,
            watcher: false,
            continue_on_error: false,
            read_only_mount: false,
            mount_used_space_local: false,
        }
    }

    fn drive() -> TargetOptions {
        TargetOptions::CloudDrive {
            drive_id: "d1".into(),
            save_root: "backup".into(),
        }
    }

    #[test]
    fn nested_roots_are_rejected() {
        let cfg = config(&["/data", "/data/sub"], drive());
        assert!(matches!(cfg.validate(), Err(SyncError::ConfigInvalid(_))));

        let cfg = config(&["/data"], TargetOptions::Local { root: "/data/mirror".into() });
        assert!(matches!(cfg.validate(), Err(SyncError::ConfigInvalid(_))));
    }

    #[test]
    fn sibling_roots_are_fine() {
        let cfg = config(&["/data/a", "/data/ab"], drive());
        cfg.validate().unwrap();
    }

    #[test]
    fn sampling_rate_bounds() {
        let mut cfg = config(&["/data"], drive());
        cfg.sampling_rate = 0.0;
        assert!(cfg.validate().is_err());
        cfg.sampling_rate = 1.0;
        cfg.validate().unwrap();
    }

    #[test]
    fn enums_serialize_by_name() {
        let json = serde_json::to_string(&SyncMode::TwoWay).unwrap();
        assert_eq!(json, "\"TwoWay\"");
        let cipher: Cipher = serde_json::from_str("\"ChaCha20Poly1305\"").unwrap();
        assert_eq!(cipher, Cipher::ChaCha20Poly1305);
        assert!(serde_json::from_str::<Compression>("\"Brotli\"").is_err());
    }

    #[test]
    fn empty_encryption_password_refuses_the_run() {
        let mut cfg = config(&["/data"], drive());
        cfg.encryption = Some(EncryptionConfig {
            compression: Compression::Zstd,
            cipher: Cipher::Aes256Gcm,
            key_hash: HashAlgorithm::Sha256,
            password: String::new(),
            encrypt_names: false,
        });
        assert!(matches!(cfg.validate(), Err(SyncError::ConfigInvalid(_))));

        cfg.encryption.as_mut().unwrap().password = "p".into();
        cfg.validate().unwrap();
    }
}
