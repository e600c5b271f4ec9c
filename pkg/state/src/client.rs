use async_trait::async_trait;
use slatedb::Db;
use slatedb::object_store::local::LocalFileSystem;
use slatedb::object_store::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::backend::Backend;

/// Persistent backend on SlateDB over a local filesystem directory.
#[derive(Clone)]
pub struct StateStore {
    db: Db,
}

impl StateStore {
    /// Open (or create) a state store rooted at `path`.
    pub async fn new(path: &str) -> anyhow::Result<Self> {
        info!("Opening SlateDB state store at {}", path);

        std::fs::create_dir_all(path)
            .map_err(|e| anyhow::anyhow!("Failed to create data directory {}: {}", path, e))?;

        let object_store = Arc::new(
            LocalFileSystem::new_with_prefix(path)
                .map_err(|e| anyhow::anyhow!("Failed to create local object store: {}", e))?,
        );
        let db = Db::open(Path::from("/"), object_store)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to open SlateDB: {}", e))?;
        Ok(Self { db })
    }
}

#[async_trait]
impl Backend for StateStore {
    async fn put(&self, key: &str, value: &[u8]) -> anyhow::Result<()> {
        self.db
            .put(key.as_bytes(), value)
            .await
            .map(|_| ())
            .map_err(|e| anyhow::anyhow!("SlateDB put {} failed: {}", key, e))
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        match self.db.get(key.as_bytes()).await {
            Ok(value) => Ok(value.map(|bytes| bytes.to_vec())),
            Err(e) => Err(anyhow::anyhow!("SlateDB get {} failed: {}", key, e)),
        }
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.db
            .delete(key.as_bytes())
            .await
            .map(|_| ())
            .map_err(|e| anyhow::anyhow!("SlateDB delete {} failed: {}", key, e))
    }

    async fn list_prefix(&self, prefix: &str) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
        let mut iter = self
            .db
            .scan_prefix(prefix.as_bytes())
            .await
            .map_err(|e| anyhow::anyhow!("SlateDB scan_prefix {} failed: {}", prefix, e))?;

        let mut results = Vec::new();
        loop {
            match iter.next().await {
                Ok(Some(kv)) => {
                    let key = String::from_utf8_lossy(&kv.key).to_string();
                    results.push((key, kv.value.to_vec()));
                }
                Ok(None) => break,
                Err(e) => {
                    return Err(anyhow::anyhow!(
                        "SlateDB scan_prefix {} failed mid-iteration: {}",
                        prefix,
                        e
                    ));
                }
            }
        }
        Ok(results)
    }

    async fn close(&self) -> anyhow::Result<()> {
        info!("Closing SlateDB state store");
        self.db
            .clone()
            .close()
            .await
            .map_err(|e| anyhow::anyhow!("SlateDB close failed: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_str().unwrap().to_string();

        let store = StateStore::new(&path).await.unwrap();
        store.put("/registry/roles/ns1/a", b"one").await.unwrap();
        store.put("/registry/roles/ns1/b", b"two").await.unwrap();
        store.put("/registry/rolebindings/ns1/a", b"three").await.unwrap();
        store.close().await.unwrap();

        let store = StateStore::new(&path).await.unwrap();
        assert_eq!(
            store.get("/registry/roles/ns1/a").await.unwrap().as_deref(),
            Some(&b"one"[..])
        );
        let roles = store.list_prefix("/registry/roles/").await.unwrap();
        assert_eq!(roles.len(), 2);

        store.delete("/registry/roles/ns1/a").await.unwrap();
        assert!(store.get("/registry/roles/ns1/a").await.unwrap().is_none());
        store.close().await.unwrap();
    }
}
