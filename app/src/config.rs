use std::path::Path;

use bytesize::ByteSize;
use serde::{Deserialize, Serialize};
use url::Url;

use domain::model::vo::config::JobConfig;
use domain::SyncError;

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Base URL of the cloud-drive API.
    pub api_server: Url,

    /// Token refresh endpoint.
    pub auth_server: Url,

    pub drive_id: String,

    #[serde(default = "AgentConfig::default_drive_config_id")]
    pub drive_config_id: String,

    /// Seed refresh token; once exchanged, rotation lives in the store.
    #[serde(default)]
    pub refresh_token: Option<String>,

    #[serde(default = "AgentConfig::default_state_dir")]
    pub state_dir: String,

    #[serde(default = "AgentConfig::default_cache_dir")]
    pub cache_dir: String,

    #[serde(default = "AgentConfig::default_upload_part_size")]
    pub upload_part_size: ByteSize,

    #[serde(default = "AgentConfig::default_schedule_tick")]
    pub schedule_tick: u64,

    #[serde(default = "AgentConfig::default_request_timeout")]
    pub request_timeout: u64,

    /// Kept raw so one malformed job refuses alone instead of failing the
    /// whole agent config; see [`parse_job`].
    #[serde(default)]
    pub jobs: Vec<serde_json::Value>,
}

impl AgentConfig {
    pub fn default_drive_config_id() -> String {
        "default".to_owned()
    }

    pub fn default_state_dir() -> String {
        "state".to_owned()
    }

    pub fn default_cache_dir() -> String {
        ".".to_owned()
    }

    pub fn default_upload_part_size() -> ByteSize {
        ByteSize::mib(16)
    }

    pub fn default_schedule_tick() -> u64 {
        60
    }

    pub fn default_request_timeout() -> u64 {
        30
    }
}

/// Global client options, round-tripped through a compact JSON file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalOptions {
    /// Fallback parallelism for jobs that do not set their own.
    #[serde(default)]
    pub parallelism: Option<usize>,

    #[serde(default)]
    pub preserve_time: bool,

    #[serde(default)]
    pub recycle_bin: bool,
}

pub fn build_config() -> anyhow::Result<AgentConfig> {
    let settings = config::Config::builder()
        .add_source(config::File::with_name("config").required(false))
        .add_source(config::Environment::with_prefix("AGENT").separator("__"))
        .build()?;
    Ok(settings.try_deserialize()?)
}

/// Parse one raw job entry. Anything the job model refuses — an unknown
/// algorithm or mode name included — surfaces as `ConfigInvalid` naming the
/// job, so the caller can skip it and keep the healthy ones.
pub fn parse_job(value: &serde_json::Value) -> anyhow::Result<JobConfig> {
    let name = value
        .get("name")
        .and_then(|v| v.as_str())
        .unwrap_or("<unnamed>")
        .to_owned();
    let job: JobConfig = serde_json::from_value(value.clone())
        .map_err(|e| SyncError::ConfigInvalid(format!("job {name}: {e}")))?;
    job.validate().map_err(|e| match e {
        SyncError::ConfigInvalid(msg) => SyncError::ConfigInvalid(format!("job {name}: {msg}")),
        other => other,
    })?;
    Ok(job)
}

pub async fn load_options(state_dir: &str) -> GlobalOptions {
    let path = Path::new(state_dir).join("options.json");
    match tokio::fs::read(&path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
        Err(_) => GlobalOptions::default(),
    }
}

pub async fn save_options(state_dir: &str, options: &GlobalOptions) -> anyhow::Result<()> {
    let path = Path::new(state_dir).join("options.json");
    tokio::fs::create_dir_all(state_dir).await?;
    tokio::fs::write(path, serde_json::to_vec(options)?).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn one_bad_job_refuses_alone() {
        let good = json!({
            "id": "5f9a0f3e-4a94-47a1-9001-76e49e8c73e9",
            "name": "photos",
            "sources": ["/data/photos"],
            "target": { "kind": "cloud_drive", "drive_id": "d1", "save_root": "backup" },
        });
        parse_job(&good).unwrap();

        // An algorithm name outside the known set stays a per-job refusal.
        let bad_cipher = json!({
            "id": "5f9a0f3e-4a94-47a1-9001-76e49e8c73ea",
            "name": "vault",
            "sources": ["/data/vault"],
            "target": { "kind": "cloud_drive", "drive_id": "d1", "save_root": "vault" },
            "encryption": {
                "compression": "Zstd",
                "cipher": "Rot13",
                "key_hash": "Sha256",
                "password": "p",
            },
        });
        let err = parse_job(&bad_cipher).unwrap_err();
        match SyncError::of(&err) {
            Some(SyncError::ConfigInvalid(msg)) => assert!(msg.starts_with("job vault:")),
            other => panic!("expected ConfigInvalid, got {other:?}"),
        }

        // Model-level validation is folded in with the same shape.
        let nested_roots = json!({
            "id": "5f9a0f3e-4a94-47a1-9001-76e49e8c73eb",
            "name": "nested",
            "sources": ["/data", "/data/sub"],
            "target": { "kind": "cloud_drive", "drive_id": "d1", "save_root": "backup" },
        });
        let err = parse_job(&nested_roots).unwrap_err();
        assert!(matches!(SyncError::of(&err), Some(SyncError::ConfigInvalid(_))));
    }

    #[tokio::test]
    async fn options_round_trip_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().to_str().unwrap();

        let options = GlobalOptions {
            parallelism: Some(8),
            preserve_time: true,
            recycle_bin: false,
        };
        save_options(state_dir, &options).await.unwrap();

        let loaded = load_options(state_dir).await;
        assert_eq!(loaded.parallelism, Some(8));
        assert!(loaded.preserve_time);

        // A missing file falls back to defaults.
        let fresh = load_options(dir.path().join("nowhere").to_str().unwrap()).await;
        assert_eq!(fresh.parallelism, None);
    }
}
