use serde::de::DeserializeOwned;
use serde::Serialize;

/// Contract of the embedded keyed store. One table per component scope:
/// drive configs in one, per-job local-entry snapshots in their own.
/// Values are opaque bytes; callers round-trip JSON through the helpers.
#[async_trait::async_trait]
pub trait KeyedStore: Send + Sync {
    async fn get(&self, table: &str, key: &str) -> anyhow::Result<Option<Vec<u8>>>;
    async fn put(&self, table: &str, key: &str, value: Vec<u8>) -> anyhow::Result<()>;
    async fn delete(&self, table: &str, key: &str) -> anyhow::Result<()>;
    async fn list(&self, table: &str) -> anyhow::Result<Vec<(String, Vec<u8>)>>;
}

/// Typed read over [`KeyedStore::get`].
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn KeyedStore,
    table: &str,
    key: &str,
) -> anyhow::Result<Option<T>> {
    match store.get(table, key).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Typed write over [`KeyedStore::put`].
pub async fn put_json<T: Serialize>(
    store: &dyn KeyedStore,
    table: &str,
    key: &str,
    value: &T,
) -> anyhow::Result<()> {
    store.put(table, key, serde_json::to_vec(value)?).await
}
