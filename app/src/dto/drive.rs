//! Wire shapes of the cloud-drive HTTP/JSON API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    File,
    Folder,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileItem {
    pub file_id: String,
    pub parent_file_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ItemKind,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub content_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListRequest<'a> {
    pub drive_id: &'a str,
    pub parent_file_id: &'a str,
    pub limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub marker: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_by: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
pub struct ListResponse {
    pub items: Vec<FileItem>,
    #[serde(default)]
    pub next_marker: Option<String>,
}

/// Body of `create-file` / `create-folder`. `check_name_mode` stays `refuse`;
/// collisions are resolved by the uploader, not by server auto-renaming.
#[derive(Debug, Clone, Serialize)]
pub struct CreateFileRequest<'a> {
    pub drive_id: &'a str,
    pub parent_file_id: &'a str,
    pub name: &'a str,
    #[serde(rename = "type")]
    pub kind: ItemKind,
    pub check_name_mode: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub part_info_list: Vec<PartNumber>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_hash: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash_name: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proof_version: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proof_code: Option<&'a str>,
}

impl<'a> CreateFileRequest<'a> {
    pub fn folder(drive_id: &'a str, parent_file_id: &'a str, name: &'a str) -> Self {
        Self {
            drive_id,
            parent_file_id,
            name,
            kind: ItemKind::Folder,
            check_name_mode: "refuse",
            size: None,
            part_info_list: Vec::new(),
            pre_hash: None,
            content_hash: None,
            content_hash_name: None,
            proof_version: None,
            proof_code: None,
        }
    }

    pub fn file(drive_id: &'a str, parent_file_id: &'a str, name: &'a str, size: u64, parts: u64) -> Self {
        Self {
            drive_id,
            parent_file_id,
            name,
            kind: ItemKind::File,
            check_name_mode: "refuse",
            size: Some(size),
            part_info_list: (1..=parts).map(|part_number| PartNumber { part_number }).collect(),
            pre_hash: None,
            content_hash: None,
            content_hash_name: None,
            proof_version: None,
            proof_code: None,
        }
    }

    pub fn with_pre_hash(mut self, pre_hash: &'a str) -> Self {
        self.pre_hash = Some(pre_hash);
        self
    }

    pub fn with_proof(mut self, content_sha1: &'a str, proof_code: &'a str) -> Self {
        self.content_hash = Some(content_sha1);
        self.content_hash_name = Some("sha1");
        self.proof_version = Some("v1");
        self.proof_code = Some(proof_code);
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PartNumber {
    pub part_number: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PartInfo {
    pub part_number: u64,
    pub upload_url: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateFileResponse {
    pub file_id: String,
    #[serde(default)]
    pub upload_id: Option<String>,
    #[serde(default)]
    pub rapid_upload: bool,
    #[serde(default)]
    pub exist: bool,
    #[serde(default)]
    pub part_info_list: Vec<PartInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompleteUploadRequest<'a> {
    pub drive_id: &'a str,
    pub file_id: &'a str,
    pub upload_id: &'a str,
}

/// Error body; `code` is the discriminator the retry policy keys on.
#[derive(Debug, Deserialize)]
pub struct ErrorReply {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub token_type: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: u64,
}

#[derive(Debug, Deserialize)]
pub struct DownloadUrlResponse {
    pub url: String,
    #[serde(default)]
    pub expiration: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SpaceInfo {
    pub used_size: u64,
    pub total_size: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VipInfo {
    pub identity: String,
    #[serde(default)]
    pub expire: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DriveInfo {
    pub user_id: String,
    pub name: String,
    pub default_drive_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_file_request_shape() {
        let req = CreateFileRequest::file("d1", "root", "a.bin", 40 << 20, 3)
            .with_proof("da39a3ee", "AAAAAAAAAAA=");
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["type"], "file");
        assert_eq!(json["check_name_mode"], "refuse");
        assert_eq!(json["part_info_list"].as_array().unwrap().len(), 3);
        assert_eq!(json["part_info_list"][0]["part_number"], 1);
        assert_eq!(json["content_hash_name"], "sha1");
        assert_eq!(json["proof_version"], "v1");
        assert!(json.get("pre_hash").is_none());
    }

    #[test]
    fn folder_request_omits_upload_fields() {
        let req = CreateFileRequest::folder("d1", "root", "A");
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["type"], "folder");
        assert!(json.get("size").is_none());
        assert!(json.get("part_info_list").is_none());
    }
}
