use crate::api::store::{ClusterStore, KeyValue};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

/// In-process store with etcd-like revision semantics.
///
/// Every successful write bumps a single global revision, which becomes the written key's
/// `mod_revision`.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    revision: i64,
    entries: BTreeMap<String, (String, i64)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current global revision.
    pub async fn revision(&self) -> i64 {
        self.inner.read().await.revision
    }
}

#[async_trait]
impl ClusterStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let inner = self.inner.read().await;
        Ok(inner.entries.get(key).map(|(value, rev)| KeyValue {
            key: key.to_string(),
            value: value.clone(),
            mod_revision: *rev,
        }))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let inner = self.inner.read().await;
        Ok(inner
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, (value, rev))| KeyValue {
                key: k.clone(),
                value: value.clone(),
                mod_revision: *rev,
            })
            .collect())
    }

    async fn compare_and_put(
        &self,
        key: &str,
        expected_revision: i64,
        value: &str,
    ) -> Result<Option<i64>> {
        let mut inner = self.inner.write().await;
        let current = inner.entries.get(key).map(|(_, rev)| *rev).unwrap_or(0);
        if current != expected_revision {
            return Ok(None);
        }
        inner.revision += 1;
        let rev = inner.revision;
        inner.entries.insert(key.to_string(), (value.to_string(), rev));
        Ok(Some(rev))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.entries.remove(key).is_some() {
            inner.revision += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_compare_and_put_rejects_stale_revision() {
        let store = MemoryStore::new();
        assert_eq!(
            store.compare_and_put("/registry/a", 0, "v1").await.unwrap(),
            Some(1)
        );
        // creating again must fail
        assert!(
            store
                .compare_and_put("/registry/a", 0, "v2")
                .await
                .unwrap()
                .is_none()
        );

        let kv = store.get("/registry/a").await.unwrap().unwrap();
        assert_eq!(kv.value, "v1");
        assert_eq!(
            store
                .compare_and_put("/registry/a", kv.mod_revision, "v2")
                .await
                .unwrap(),
            Some(2)
        );
        assert!(
            store
                .compare_and_put("/registry/a", kv.mod_revision, "v3")
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(store.get("/registry/a").await.unwrap().unwrap().value, "v2");
    }

    #[tokio::test]
    async fn test_list_by_prefix() {
        let store = MemoryStore::new();
        for key in ["/registry/x/b", "/registry/x/a", "/registry/y/a"] {
            store.compare_and_put(key, 0, "v").await.unwrap();
        }
        let keys: Vec<String> = store
            .list("/registry/x/")
            .await
            .unwrap()
            .into_iter()
            .map(|kv| kv.key)
            .collect();
        assert_eq!(keys, vec!["/registry/x/a", "/registry/x/b"]);

        store.delete("/registry/x/a").await.unwrap();
        assert!(store.get("/registry/x/a").await.unwrap().is_none());
        assert_eq!(store.revision().await, 4);
    }
}
