//! Readiness and flow-health signals for the managed workloads.

use crate::api::Registry;
use anyhow::{Context, Result};
use async_trait::async_trait;
use common::{ConfigMap, DaemonSet, Deployment, NamespacedName};
use serde::{Deserialize, Serialize};

#[async_trait]
pub trait DeploymentProber: Send + Sync {
    async fn is_ready(&self, name: &NamespacedName) -> Result<bool>;
}

#[async_trait]
pub trait DaemonSetProber: Send + Sync {
    async fn is_ready(&self, name: &NamespacedName) -> Result<bool>;
}

/// Alerts the self-monitor currently reports for one pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineProbeResult {
    #[serde(default)]
    pub all_data_dropped: bool,
    #[serde(default)]
    pub some_data_dropped: bool,
    #[serde(default)]
    pub queue_almost_full: bool,
    #[serde(default)]
    pub throttling: bool,
    #[serde(default)]
    pub healthy: bool,
}

#[async_trait]
pub trait FlowHealthProber: Send + Sync {
    async fn probe(&self, pipeline_name: &str) -> Result<PipelineProbeResult>;
}

/// Reads readiness from the stored workload status.
#[derive(Clone)]
pub struct WorkloadProber {
    registry: Registry,
}

impl WorkloadProber {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl DeploymentProber for WorkloadProber {
    async fn is_ready(&self, name: &NamespacedName) -> Result<bool> {
        let Some(deployment) = self.registry.get::<Deployment>(name).await? else {
            return Ok(false);
        };
        let d = deployment.object;
        Ok(d.spec.replicas > 0 && d.status.ready_replicas >= d.spec.replicas)
    }
}

#[async_trait]
impl DaemonSetProber for WorkloadProber {
    async fn is_ready(&self, name: &NamespacedName) -> Result<bool> {
        let Some(ds) = self.registry.get::<DaemonSet>(name).await? else {
            return Ok(false);
        };
        let status = ds.object.status;
        Ok(status.desired_number_scheduled > 0
            && status.number_ready >= status.desired_number_scheduled)
    }
}

/// Flow health published by the self-monitor into a ConfigMap, one YAML entry per pipeline.
pub struct SelfMonitorProber {
    registry: Registry,
    config_map: NamespacedName,
}

impl SelfMonitorProber {
    pub fn new(registry: Registry, config_map: NamespacedName) -> Self {
        Self {
            registry,
            config_map,
        }
    }
}

#[async_trait]
impl FlowHealthProber for SelfMonitorProber {
    async fn probe(&self, pipeline_name: &str) -> Result<PipelineProbeResult> {
        let cm = self
            .registry
            .get::<ConfigMap>(&self.config_map)
            .await?
            .with_context(|| format!("self-monitor results {} not found", self.config_map))?;
        match cm.object.data.get(pipeline_name) {
            Some(raw) => serde_yaml::from_str(raw)
                .with_context(|| format!("invalid probe result for {pipeline_name}")),
            // no alerts known for this pipeline
            None => Ok(PipelineProbeResult {
                healthy: true,
                ..Default::default()
            }),
        }
    }
}
