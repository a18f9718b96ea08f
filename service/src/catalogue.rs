use std::collections::HashMap;

use dashmap::{DashMap, DashSet};
use domain::model::entity::{LocalEntry, RemoteEntry};
use domain::repository::{put_json, KeyedStore};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Path-indexed maps of local entries, remote files, and remote folders,
/// shared by the sync engine and the mounted projection.
///
/// Reads are lock-free snapshots; writes contend only on their own key.
/// Local entries are periodically diffed against a persisted snapshot and
/// flushed to the keyed store; remote maps are rebuilt from a fresh listing
/// on every run and never persisted.
pub struct Catalogue {
    job_id: Uuid,
    local_entries: DashMap<String, LocalEntry>,
    remote_files: DashMap<String, RemoteEntry>,
    remote_folders: DashMap<String, RemoteEntry>,
    path_is_dir: DashSet<String>,
    /// Last state written to the store, keyed like `local_entries`.
    snapshot: Mutex<HashMap<String, LocalEntry>>,
}

impl Catalogue {
    pub fn new(job_id: Uuid) -> Self {
        Self {
            job_id,
            local_entries: DashMap::new(),
            remote_files: DashMap::new(),
            remote_folders: DashMap::new(),
            path_is_dir: DashSet::new(),
            snapshot: Mutex::default(),
        }
    }

    fn table(&self) -> String {
        format!("local_entries.{}", self.job_id)
    }

    /// Rehydrate local entries from the store at job initialization.
    pub async fn load(&self, store: &dyn KeyedStore) -> anyhow::Result<usize> {
        let rows = store.list(&self.table()).await?;
        let mut snapshot = self.snapshot.lock().await;
        snapshot.clear();
        self.local_entries.clear();
        self.path_is_dir.clear();
        for (key, bytes) in rows {
            let entry: LocalEntry = serde_json::from_slice(&bytes)?;
            if !entry.is_file {
                self.path_is_dir.insert(key.clone());
            }
            snapshot.insert(key.clone(), entry.clone());
            self.local_entries.insert(key, entry);
        }
        Ok(snapshot.len())
    }

    /// Diff live local entries against the persisted snapshot and apply the
    /// adds, updates and deletes in bulk. Returns how many rows changed.
    pub async fn persist(&self, store: &dyn KeyedStore) -> anyhow::Result<usize> {
        let table = self.table();
        let mut snapshot = self.snapshot.lock().await;
        let live: HashMap<String, LocalEntry> =
            self.local_entries.iter().map(|kv| (kv.key().clone(), kv.value().clone())).collect();

        let mut changed = 0;
        for (key, entry) in &live {
            match snapshot.get(key) {
                Some(old) if old.stable_eq(entry) => {}
                _ => {
                    put_json(store, &table, key, entry).await?;
                    changed += 1;
                }
            }
        }
        for key in snapshot.keys() {
            if !live.contains_key(key) {
                store.delete(&table, key).await?;
                changed += 1;
            }
        }

        *snapshot = live;
        Ok(changed)
    }

    /// Swap in a fresh scan: entries absent from `entries` disappear.
    pub fn replace_local(&self, entries: Vec<LocalEntry>) {
        self.local_entries.clear();
        self.path_is_dir.clear();
        for entry in entries {
            self.insert_local(entry);
        }
    }

    pub fn insert_local(&self, entry: LocalEntry) {
        if !entry.is_file {
            self.path_is_dir.insert(entry.key.clone());
        }
        self.local_entries.insert(entry.key.clone(), entry);
    }

    pub fn remove_local(&self, key: &str) {
        self.local_entries.remove(key);
        self.path_is_dir.remove(key);
    }

    /// Drop a directory entry together with everything beneath it.
    pub fn remove_local_tree(&self, key: &str) {
        let prefix = format!("{key}/");
        self.local_entries.retain(|k, _| k != key && !k.starts_with(&prefix));
        self.path_is_dir.retain(|k| k != key && !k.starts_with(&prefix));
    }

    pub fn get_local(&self, key: &str) -> Option<LocalEntry> {
        self.local_entries.get(key).map(|kv| kv.value().clone())
    }

    /// Update one local entry in place under its keyed lock.
    pub fn update_local(&self, key: &str, f: impl FnOnce(&mut LocalEntry)) {
        if let Some(mut kv) = self.local_entries.get_mut(key) {
            f(kv.value_mut());
        }
    }

    pub fn local_snapshot(&self) -> Vec<LocalEntry> {
        let mut entries: Vec<_> =
            self.local_entries.iter().map(|kv| kv.value().clone()).collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    pub async fn persisted_snapshot(&self) -> HashMap<String, LocalEntry> {
        self.snapshot.lock().await.clone()
    }

    pub fn is_dir(&self, key: &str) -> bool {
        self.path_is_dir.contains(key)
    }

    /// Replace the remote maps with a fresh listing.
    pub fn set_remote_listing(&self, files: Vec<RemoteEntry>, folders: Vec<RemoteEntry>) {
        self.remote_files.clear();
        self.remote_folders.clear();
        for f in files {
            self.remote_files.insert(f.key.clone(), f);
        }
        for f in folders {
            self.remote_folders.insert(f.key.clone(), f);
        }
    }

    pub fn insert_remote_file(&self, entry: RemoteEntry) {
        self.remote_files.insert(entry.key.clone(), entry);
    }

    pub fn insert_remote_folder(&self, entry: RemoteEntry) {
        self.remote_folders.insert(entry.key.clone(), entry);
    }

    pub fn remove_remote(&self, key: &str) {
        if self.remote_files.remove(key).is_none() {
            self.remote_folders.remove(key);
        }
    }

    /// Drop a remote folder and every entry beneath it; mount-side renames
    /// and deletes invalidate whole subtrees until the next listing.
    pub fn remove_remote_tree(&self, key: &str) {
        let prefix = format!("{key}/");
        self.remote_files.retain(|k, _| k != key && !k.starts_with(&prefix));
        self.remote_folders.retain(|k, _| k != key && !k.starts_with(&prefix));
    }

    pub fn get_remote_file(&self, key: &str) -> Option<RemoteEntry> {
        self.remote_files.get(key).map(|kv| kv.value().clone())
    }

    pub fn get_remote_folder(&self, key: &str) -> Option<RemoteEntry> {
        self.remote_folders.get(key).map(|kv| kv.value().clone())
    }

    pub fn remote_files_map(&self) -> HashMap<String, RemoteEntry> {
        self.remote_files.iter().map(|kv| (kv.key().clone(), kv.value().clone())).collect()
    }

    pub fn remote_folders_map(&self) -> HashMap<String, RemoteEntry> {
        self.remote_folders.iter().map(|kv| (kv.key().clone(), kv.value().clone())).collect()
    }

    /// Children of a remote folder, files and folders alike.
    pub fn remote_children(&self, parent_id: &str) -> Vec<RemoteEntry> {
        let mut children: Vec<RemoteEntry> = self
            .remote_folders
            .iter()
            .chain(self.remote_files.iter())
            .filter(|kv| kv.value().parent_id == parent_id)
            .map(|kv| kv.value().clone())
            .collect();
        children.sort_by(|a, b| a.name.cmp(&b.name));
        children
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Mutex as StdMutex;

    use chrono::Utc;

    use super::*;

    #[derive(Default)]
    struct MemStore {
        rows: StdMutex<HashMap<(String, String), Vec<u8>>>,
    }

    #[async_trait::async_trait]
    impl KeyedStore for MemStore {
        async fn get(&self, table: &str, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
            Ok(self.rows.lock().unwrap().get(&(table.into(), key.into())).cloned())
        }
        async fn put(&self, table: &str, key: &str, value: Vec<u8>) -> anyhow::Result<()> {
            self.rows.lock().unwrap().insert((table.into(), key.into()), value);
            Ok(())
        }
        async fn delete(&self, table: &str, key: &str) -> anyhow::Result<()> {
            self.rows.lock().unwrap().remove(&(table.into(), key.into()));
            Ok(())
        }
        async fn list(&self, table: &str) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
            Ok(self
                .rows
                .lock()
                .unwrap()
                .iter()
                .filter(|((t, _), _)| t == table)
                .map(|((_, k), v)| (k.clone(), v.clone()))
                .collect())
        }
    }

    fn entry(key: &str, size: u64) -> LocalEntry {
        LocalEntry {
            path: PathBuf::from(format!("/data/{key}")),
            key: key.into(),
            parent_key: String::new(),
            is_file: true,
            size,
            created: Utc::now(),
            modified: Utc::now(),
            fast_hash: None,
            sha1: None,
            encrypted: false,
            encrypted_name: None,
        }
    }

    #[tokio::test]
    async fn persist_applies_only_the_diff() {
        let store = MemStore::default();
        let catalogue = Catalogue::new(Uuid::new_v4());

        catalogue.insert_local(entry("a.txt", 1));
        catalogue.insert_local(entry("b.txt", 2));
        assert_eq!(catalogue.persist(&store).await.unwrap(), 2);

        // No changes, nothing written.
        assert_eq!(catalogue.persist(&store).await.unwrap(), 0);

        // One update, one delete, one add.
        catalogue.insert_local(entry("a.txt", 9));
        catalogue.remove_local("b.txt");
        catalogue.insert_local(entry("c.txt", 3));
        assert_eq!(catalogue.persist(&store).await.unwrap(), 3);

        // Round-trips through load.
        let reloaded = Catalogue::new(catalogue.job_id);
        assert_eq!(reloaded.load(&store).await.unwrap(), 2);
        assert_eq!(reloaded.get_local("a.txt").unwrap().size, 9);
        assert!(reloaded.get_local("b.txt").is_none());
    }

    #[tokio::test]
    async fn remote_maps_are_rebuilt_wholesale() {
        let catalogue = Catalogue::new(Uuid::new_v4());
        let file = RemoteEntry {
            id: "f1".into(),
            parent_id: "root".into(),
            name: "a.txt".into(),
            is_folder: false,
            size: 1,
            sha1: None,
            created: Utc::now(),
            updated: Utc::now(),
            key: "backup/a.txt".into(),
        };
        catalogue.set_remote_listing(vec![file.clone()], vec![]);
        assert!(catalogue.get_remote_file("backup/a.txt").is_some());

        catalogue.set_remote_listing(vec![], vec![]);
        assert!(catalogue.get_remote_file("backup/a.txt").is_none());
    }

    #[test]
    fn remove_local_tree_drops_children() {
        let catalogue = Catalogue::new(Uuid::new_v4());
        let mut dir = entry("A", 0);
        dir.is_file = false;
        catalogue.insert_local(dir);
        catalogue.insert_local(entry("A/a.txt", 1));
        catalogue.insert_local(entry("AB/b.txt", 1));

        catalogue.remove_local_tree("A");
        assert!(catalogue.get_local("A").is_none());
        assert!(catalogue.get_local("A/a.txt").is_none());
        assert!(catalogue.get_local("AB/b.txt").is_some());
    }
}
