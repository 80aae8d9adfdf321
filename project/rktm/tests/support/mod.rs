#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use common::{ConfigMap, NamespacedName, ObjectMeta, Secret};
use rktm::api::{ClusterStore, KeyValue, MemoryStore, Registry};
use rktm::controllers::pipeline::logpipeline::{self, LogPipelineKind};
use rktm::controllers::pipeline::tracepipeline::{self, TracePipelineKind};
use rktm::controllers::{PipelineReconciler, Probers};
use rktm::lock::ResourceCountLock;
use rktm::overrides::{OVERRIDE_KEY, OverridesHandler};
use rktm::prober::{DaemonSetProber, DeploymentProber};
use rktm::protocol::config::{LogConfig, TraceConfig};
use rktm::tlscert::Validator;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

pub const NS: &str = "kyma-system";
pub const OVERRIDES: &str = "telemetry-override-config";

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Readiness switch standing in for workload status.
pub struct StubProber {
    ready: AtomicBool,
}

impl StubProber {
    pub fn new(ready: bool) -> Arc<Self> {
        Arc::new(Self {
            ready: AtomicBool::new(ready),
        })
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }
}

#[async_trait]
impl DeploymentProber for StubProber {
    async fn is_ready(&self, _name: &NamespacedName) -> Result<bool> {
        Ok(self.ready.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl DaemonSetProber for StubProber {
    async fn is_ready(&self, _name: &NamespacedName) -> Result<bool> {
        Ok(self.ready.load(Ordering::SeqCst))
    }
}

/// In-memory store that delays every read and write by a few milliseconds, so concurrent
/// passes interleave between their reads and their compare-and-put.
pub struct JitterStore {
    inner: MemoryStore,
    calls: AtomicU64,
}

impl JitterStore {
    pub fn registry() -> Registry {
        Registry::new(Arc::new(Self {
            inner: MemoryStore::new(),
            calls: AtomicU64::new(0),
        }))
    }

    async fn pause(&self) {
        let n = self.calls.fetch_add(1, Ordering::Relaxed);
        let millis = (n.wrapping_mul(2_654_435_761) >> 5) % 8;
        tokio::time::sleep(Duration::from_millis(millis)).await;
    }
}

#[async_trait]
impl ClusterStore for JitterStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        self.pause().await;
        self.inner.get(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        self.pause().await;
        self.inner.list(prefix).await
    }

    async fn compare_and_put(
        &self,
        key: &str,
        expected_revision: i64,
        value: &str,
    ) -> Result<Option<i64>> {
        self.pause().await;
        self.inner.compare_and_put(key, expected_revision, value).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.pause().await;
        self.inner.delete(key).await
    }
}

pub fn overrides(registry: &Registry) -> Arc<OverridesHandler> {
    Arc::new(OverridesHandler::new(
        registry.clone(),
        NamespacedName::new(NS, OVERRIDES),
        log::LevelFilter::Info,
    ))
}

pub fn probers(prober: &Arc<StubProber>) -> Probers {
    Probers {
        deployment: prober.clone(),
        daemon_set: prober.clone(),
        flow: None,
    }
}

pub fn trace_reconciler(
    registry: &Registry,
    max_pipelines: usize,
    prober: &Arc<StubProber>,
) -> PipelineReconciler<TracePipelineKind> {
    PipelineReconciler::new(
        TracePipelineKind::new(registry.clone(), NS, TraceConfig::default()),
        registry.clone(),
        overrides(registry),
        ResourceCountLock::new(
            registry.clone(),
            NamespacedName::new(NS, tracepipeline::LOCK_NAME),
            max_pipelines,
        ),
        probers(prober),
        Arc::new(Validator::new(registry.clone())),
    )
}

pub fn log_reconciler(registry: &Registry, prober: &Arc<StubProber>) -> PipelineReconciler<LogPipelineKind> {
    let config = LogConfig::default();
    let max = config.max_pipelines;
    PipelineReconciler::new(
        LogPipelineKind::new(registry.clone(), NS, config),
        registry.clone(),
        overrides(registry),
        ResourceCountLock::new(
            registry.clone(),
            NamespacedName::new(NS, logpipeline::LOCK_NAME),
            max,
        ),
        probers(prober),
        Arc::new(Validator::new(registry.clone())),
    )
}

pub async fn put_secret(registry: &Registry, name: &str, data: &[(&str, &str)]) -> Result<()> {
    let data: BTreeMap<String, String> = data
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    registry
        .apply(&Secret::new(ObjectMeta::namespaced(NS, name), data))
        .await?;
    Ok(())
}

pub async fn put_overrides(registry: &Registry, raw: &str) -> Result<()> {
    let data = BTreeMap::from([(OVERRIDE_KEY.to_string(), raw.to_string())]);
    registry
        .apply(&ConfigMap::new(ObjectMeta::namespaced(NS, OVERRIDES), data))
        .await?;
    Ok(())
}
