use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Mutex;

use domain::repository::KeyedStore;

/// Keyed store backed by one JSON file per table under `save_dir`.
///
/// Tables are loaded lazily and kept in memory; every mutation rewrites the
/// table's file. Values must be JSON, which holds for everything the agent
/// persists.
pub struct JsonDb {
    save_dir: PathBuf,
    tables: DashMap<String, Arc<Mutex<Table>>>,
}

#[derive(Default)]
struct Table {
    loaded: bool,
    rows: HashMap<String, Value>,
}

impl JsonDb {
    pub async fn new(save_dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let save_dir = save_dir.into();
        tokio::fs::create_dir_all(&save_dir).await?;
        Ok(Self {
            save_dir,
            tables: DashMap::new(),
        })
    }

    fn table_path(&self, name: &str) -> PathBuf {
        self.save_dir.join(format!("{name}.json"))
    }

    async fn table(&self, name: &str) -> anyhow::Result<Arc<Mutex<Table>>> {
        let slot = self.tables.entry(name.to_owned()).or_default().clone();
        {
            let mut table = slot.lock().await;
            if !table.loaded {
                let path = self.table_path(name);
                table.rows = match tokio::fs::read(&path).await {
                    Ok(bytes) => serde_json::from_slice(&bytes)?,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
                    Err(e) => return Err(e.into()),
                };
                table.loaded = true;
            }
        }
        Ok(slot)
    }

    async fn flush(&self, name: &str, rows: &HashMap<String, Value>) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec(rows)?;
        tokio::fs::write(self.table_path(name), bytes).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl KeyedStore for JsonDb {
    async fn get(&self, table: &str, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let slot = self.table(table).await?;
        let guard = slot.lock().await;
        Ok(match guard.rows.get(key) {
            Some(value) => Some(serde_json::to_vec(value)?),
            None => None,
        })
    }

    async fn put(&self, table: &str, key: &str, value: Vec<u8>) -> anyhow::Result<()> {
        let slot = self.table(table).await?;
        let mut guard = slot.lock().await;
        guard.rows.insert(key.to_owned(), serde_json::from_slice(&value)?);
        self.flush(table, &guard.rows).await
    }

    async fn delete(&self, table: &str, key: &str) -> anyhow::Result<()> {
        let slot = self.table(table).await?;
        let mut guard = slot.lock().await;
        if guard.rows.remove(key).is_some() {
            self.flush(table, &guard.rows).await?;
        }
        Ok(())
    }

    async fn list(&self, table: &str) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
        let slot = self.table(table).await?;
        let guard = slot.lock().await;
        guard
            .rows
            .iter()
            .map(|(k, v)| Ok((k.clone(), serde_json::to_vec(v)?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let db = JsonDb::new(dir.path()).await.unwrap();
        db.put("jobs", "a", br#"{"n":1}"#.to_vec()).await.unwrap();
        db.put("jobs", "b", br#"{"n":2}"#.to_vec()).await.unwrap();
        db.delete("jobs", "a").await.unwrap();

        // Fresh instance reads the file back.
        let db = JsonDb::new(dir.path()).await.unwrap();
        assert!(db.get("jobs", "a").await.unwrap().is_none());
        let b = db.get("jobs", "b").await.unwrap().unwrap();
        let v: Value = serde_json::from_slice(&b).unwrap();
        assert_eq!(v["n"], 2);
        assert_eq!(db.list("jobs").await.unwrap().len(), 1);
        assert!(db.list("empty").await.unwrap().is_empty());
    }
}
