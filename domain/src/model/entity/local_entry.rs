use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One node of a scanned local tree.
///
/// `key` is the forward-slash path relative to the backup source root name
/// and is unique within a job. The fast hash never regresses while the
/// `(size, modified, created)` triple is unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalEntry {
    pub path: PathBuf,
    pub key: String,
    pub parent_key: String,
    pub is_file: bool,
    pub size: u64,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    /// Size-tiered digest over selected byte windows.
    pub fast_hash: Option<String>,
    /// Full content SHA-1, filled lazily before any upload that needs it.
    pub sha1: Option<String>,
    pub encrypted: bool,
    /// Cached remote file name when name-encryption is enabled.
    pub encrypted_name: Option<String>,
}

impl LocalEntry {
    /// The `(length, last-write, creation)` triple used to decide whether a
    /// previously computed full hash may be reused.
    pub fn unchanged_since(&self, other: &Self) -> bool {
        self.size == other.size
            && self.modified == other.modified
            && self.created == other.created
    }

    /// Field-by-field equality over the stable attributes, used by the
    /// catalogue when diffing against its persisted snapshot.
    pub fn stable_eq(&self, other: &Self) -> bool {
        self.path == other.path
            && self.key == other.key
            && self.is_file == other.is_file
            && self.size == other.size
            && self.created == other.created
            && self.modified == other.modified
            && self.fast_hash == other.fast_hash
            && self.sha1 == other.sha1
            && self.encrypted == other.encrypted
            && self.encrypted_name == other.encrypted_name
    }

    /// File name component of `key`.
    pub fn name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }

    /// The relative key this entry occupies on the remote side.
    ///
    /// Plain entries keep their key. Encrypted files gain the `.e` suffix;
    /// with name-encryption the whole name is replaced by the cached hash.
    pub fn remote_relative_key(&self) -> String {
        if !self.is_file || !self.encrypted {
            return self.key.clone();
        }
        match &self.encrypted_name {
            Some(hashed) => {
                if self.parent_key.is_empty() {
                    hashed.clone()
                } else {
                    format!("{}/{hashed}", self.parent_key)
                }
            }
            None => format!("{}.e", self.key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str) -> LocalEntry {
        LocalEntry {
            path: PathBuf::from(format!("/data/{key}")),
            key: key.to_owned(),
            parent_key: key.rsplit_once('/').map(|(p, _)| p.to_owned()).unwrap_or_default(),
            is_file: true,
            size: 10,
            created: Utc::now(),
            modified: Utc::now(),
            fast_hash: None,
            sha1: None,
            encrypted: false,
            encrypted_name: None,
        }
    }

    #[test]
    fn remote_key_plain_and_encrypted() {
        let mut e = entry("A/a.txt");
        assert_eq!(e.remote_relative_key(), "A/a.txt");

        e.encrypted = true;
        assert_eq!(e.remote_relative_key(), "A/a.txt.e");

        e.encrypted_name = Some("0cc175b9c0f1b6a831c399e269772661.e".into());
        assert_eq!(
            e.remote_relative_key(),
            "A/0cc175b9c0f1b6a831c399e269772661.e"
        );
    }

    #[test]
    fn stable_eq_ignores_nothing_relevant() {
        let a = entry("A/a.txt");
        let mut b = a.clone();
        assert!(a.stable_eq(&b));
        b.sha1 = Some("da39a3ee5e6b4b0d3255bfef95601890afd80709".into());
        assert!(!a.stable_eq(&b));
    }
}
