use async_trait::async_trait;

/// Raw key-value storage underneath [`crate::Store`].
///
/// Implementations only need to be linearizable per key; the store
/// serializes writers itself.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn put(&self, key: &str, value: &[u8]) -> anyhow::Result<()>;

    /// `None` if the key does not exist.
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;

    async fn delete(&self, key: &str) -> anyhow::Result<()>;

    /// All `(key, value)` pairs whose key starts with `prefix`, in key order.
    async fn list_prefix(&self, prefix: &str) -> anyhow::Result<Vec<(String, Vec<u8>)>>;

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
