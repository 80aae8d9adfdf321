use crate::api::store::{ClusterStore, KeyValue};
use anyhow::{Context, Result};
use async_trait::async_trait;
use etcd_client::{Client, Compare, CompareOp, GetOptions, PutOptions, Txn, TxnOp};
use std::sync::Arc;
use tokio::sync::RwLock;

/// XlineStore keeps registry objects in xline (etcd-compatible).
/// Keys live under `/registry/<plural>/`, values are YAML serialized objects.
#[derive(Clone)]
pub struct XlineStore {
    client: Arc<RwLock<Client>>,
}

impl XlineStore {
    /// Create a new XlineStore instance by connecting to the given endpoints.
    pub async fn new(endpoints: &[String]) -> Result<Self> {
        let client = Client::connect(endpoints, None)
            .await
            .with_context(|| format!("failed to connect xline at {endpoints:?}"))?;
        Ok(Self {
            client: Arc::new(RwLock::new(client)),
        })
    }
}

#[async_trait]
impl ClusterStore for XlineStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let mut client = self.client.write().await;
        let resp = client.get(key, None).await?;
        Ok(resp.kvs().first().map(|kv| KeyValue {
            key: key.to_string(),
            value: String::from_utf8_lossy(kv.value()).to_string(),
            mod_revision: kv.mod_revision(),
        }))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let mut client = self.client.write().await;
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;
        let mut items: Vec<KeyValue> = resp
            .kvs()
            .iter()
            .map(|kv| KeyValue {
                key: String::from_utf8_lossy(kv.key()).to_string(),
                value: String::from_utf8_lossy(kv.value()).to_string(),
                mod_revision: kv.mod_revision(),
            })
            .collect();
        items.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(items)
    }

    async fn compare_and_put(
        &self,
        key: &str,
        expected_revision: i64,
        value: &str,
    ) -> Result<Option<i64>> {
        // a missing key has create revision 0
        let cmp = if expected_revision == 0 {
            Compare::create_revision(key, CompareOp::Equal, 0)
        } else {
            Compare::mod_revision(key, CompareOp::Equal, expected_revision)
        };
        let then_ops = vec![TxnOp::put(key, value, Some(PutOptions::new()))];
        let else_ops = vec![TxnOp::get(key, None)];
        let txn = Txn::new()
            .when(vec![cmp])
            .and_then(then_ops)
            .or_else(else_ops);
        let mut client = self.client.write().await;
        let resp = client.txn(txn).await?;
        if !resp.succeeded() {
            return Ok(None);
        }
        // the txn header carries the store revision after the put, which is the key's new mod revision
        Ok(resp.header().map(|h| h.revision()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut client = self.client.write().await;
        client.delete(key, None).await?;
        Ok(())
    }
}
