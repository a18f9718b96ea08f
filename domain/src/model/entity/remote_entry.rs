use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One node of the remote drive tree.
///
/// `(parent_id, name)` is unique within the drive; folder entries form a
/// tree rooted at the job's save-root folder. `key` is the entry's position
/// under the configured save-root, forward-slash separated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub id: String,
    pub parent_id: String,
    pub name: String,
    pub is_folder: bool,
    pub size: u64,
    pub sha1: Option<String>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub key: String,
}

impl RemoteEntry {
    /// Depth of the path-key, used for reverse-depth delete ordering.
    pub fn depth(&self) -> usize {
        self.key.split('/').count()
    }
}
