use anyhow::Result;
use async_trait::async_trait;

/// A stored value together with the revision at which it was last modified.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
    pub mod_revision: i64,
}

/// Key-value backend holding every cluster object as YAML under `/registry/...` keys.
///
/// All writes that race with other reconcilers go through `compare_and_put`, so a stale read
/// never silently overwrites a newer value.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>>;

    /// All entries whose key starts with `prefix`, ordered by key.
    async fn list(&self, prefix: &str) -> Result<Vec<KeyValue>>;

    /// Write `value` only if the key is still at `expected_revision`.
    ///
    /// An expected revision of `0` means the key must not exist yet. Returns the new
    /// modification revision, or `None` when the comparison failed and nothing was written.
    async fn compare_and_put(
        &self,
        key: &str,
        expected_revision: i64,
        value: &str,
    ) -> Result<Option<i64>>;

    async fn delete(&self, key: &str) -> Result<()>;
}
