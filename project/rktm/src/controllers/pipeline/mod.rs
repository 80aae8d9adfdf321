//! The reconcile pass shared by all pipeline kinds.
//!
//! A pass locks a quota slot for the requested pipeline, renders every reconcilable pipeline of
//! the kind into the shared collector configuration, and always finishes by refreshing the
//! requested pipeline's status.

pub mod filter;
pub mod logpipeline;
pub mod metricpipeline;
pub mod status;
pub mod tracepipeline;

use crate::api::Registry;
use crate::conditions::Signal;
use crate::controllers::manager::Controller;
use crate::errors::{is_max_pipelines_exceeded, merge_status_error};
use crate::lock::ResourceCountLock;
use crate::overrides::{OverrideConfig, OverridesHandler};
use crate::prober::{DaemonSetProber, DeploymentProber, FlowHealthProber};
use crate::tlscert::TlsCertValidator;
use anyhow::{Context, Result};
use async_trait::async_trait;
use common::{NamespacedName, Pipeline, Resource, Telemetry};
use status::{LegacyReasons, StatusObservations, apply_observations, observe_configuration, observe_flow};
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Gateway replicas unless a `Telemetry` resource overrides them.
pub const DEFAULT_GATEWAY_REPLICAS: i32 = 2;

/// What differs between log, metric and trace pipelines.
#[async_trait]
pub trait PipelineKind: Send + Sync + 'static {
    type Pipeline: Pipeline;

    const SIGNAL: Signal;
    const CONTROLLER_NAME: &'static str;

    fn paused(overrides: &OverrideConfig) -> bool;

    /// Reason of a successful `ConfigurationGenerated`.
    fn configured_reason(&self) -> &'static str;

    fn legacy_reasons(&self) -> LegacyReasons;

    /// Gateway Deployment whose readiness is reported as `GatewayHealthy`.
    fn gateway(&self) -> Option<NamespacedName>;

    /// Agent DaemonSet the pipeline needs, if any.
    fn agent(&self, pipeline: &Self::Pipeline) -> Option<NamespacedName>;

    /// Render and apply the collector resources for the reconcilable set.
    async fn deploy(&self, owner: &Self::Pipeline, reconcilable: &[Self::Pipeline]) -> Result<()>;
}

/// Health sources shared by all pipeline reconcilers.
#[derive(Clone)]
pub struct Probers {
    pub deployment: Arc<dyn DeploymentProber>,
    pub daemon_set: Arc<dyn DaemonSetProber>,
    /// Present only when flow health probing is enabled.
    pub flow: Option<Arc<dyn FlowHealthProber>>,
}

pub struct PipelineReconciler<K: PipelineKind> {
    kind: K,
    registry: Registry,
    overrides: Arc<OverridesHandler>,
    lock: ResourceCountLock,
    probers: Probers,
    tls_validator: Arc<dyn TlsCertValidator>,
    // set once the first pass wiped the conditions of existing pipelines
    conditions_cleared: OnceCell<()>,
}

impl<K: PipelineKind> PipelineReconciler<K> {
    pub fn new(
        kind: K,
        registry: Registry,
        overrides: Arc<OverridesHandler>,
        lock: ResourceCountLock,
        probers: Probers,
        tls_validator: Arc<dyn TlsCertValidator>,
    ) -> Self {
        Self {
            kind,
            registry,
            overrides,
            lock,
            probers,
            tls_validator,
            conditions_cleared: OnceCell::new(),
        }
    }

    pub async fn reconcile_pipeline(&self, name: &str) -> Result<()> {
        let overrides = self.overrides.load_overrides().await?;
        if K::paused(&overrides) {
            log::debug!("{} reconciliation is paused, skipping {name}", K::CONTROLLER_NAME);
            return Ok(());
        }

        let key = NamespacedName::cluster(name);
        let Some(pipeline) = self.registry.get::<K::Pipeline>(&key).await? else {
            log::debug!("pipeline {name} is gone");
            return Ok(());
        };

        let mut lock_acquired = true;
        let result = self.do_reconcile(&pipeline.object, &mut lock_acquired).await;
        match (result, self.update_status(&key, lock_acquired).await) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(e), Ok(())) => Err(e),
            (result, Err(status_err)) => Err(merge_status_error(result.err(), status_err)),
        }
    }

    async fn do_reconcile(&self, pipeline: &K::Pipeline, lock_acquired: &mut bool) -> Result<()> {
        // concurrent passes wait here until the clear is done, so none of them writes status first
        self.conditions_cleared
            .get_or_try_init(|| self.clear_legacy_conditions())
            .await?;

        let name = pipeline.name();
        if let Err(e) = self.lock.try_acquire_lock(pipeline).await {
            if is_max_pipelines_exceeded(&e) {
                *lock_acquired = false;
                log::info!(
                    "pipeline {name} was not deployed: at most {} pipelines are allowed",
                    self.lock.max_pipelines()
                );
            }
            return Err(e);
        }

        let all: Vec<K::Pipeline> = self
            .registry
            .list::<K::Pipeline>()
            .await?
            .into_iter()
            .map(|p| p.object)
            .collect();

        let reconcilable = filter::reconcilable_pipelines(
            &self.registry,
            self.tls_validator.as_ref(),
            &self.lock,
            &all,
        )
        .await?;
        if reconcilable.is_empty() {
            log::debug!("no reconcilable {} pipelines, nothing to deploy", K::CONTROLLER_NAME);
            return Ok(());
        }

        self.kind
            .deploy(pipeline, &reconcilable)
            .await
            .with_context(|| format!("failed to deploy resources for pipeline {name}"))
    }

    /// Empty every pipeline's conditions once per process lifetime, so that the legacy
    /// `Pending`/`Running` pair is rebuilt at the tail of the list. Restarting the process
    /// clears them again.
    async fn clear_legacy_conditions(&self) -> Result<()> {
        let pipelines = self.registry.list::<K::Pipeline>().await?;
        for pipeline in pipelines.iter().map(|p| &p.object) {
            self.registry
                .update_with::<K::Pipeline, _>(&pipeline.key(), |p| {
                    if p.conditions().is_empty() {
                        return false;
                    }
                    p.status_mut().conditions.clear();
                    true
                })
                .await
                .with_context(|| format!("failed to clear conditions of {}", pipeline.name()))?;
        }
        log::info!("cleared legacy conditions of {} pipelines", pipelines.len());
        Ok(())
    }

    async fn update_status(&self, key: &NamespacedName, lock_acquired: bool) -> Result<()> {
        let Some(current) = self.registry.get::<K::Pipeline>(key).await? else {
            return Ok(());
        };
        let pipeline = current.object;
        let name = pipeline.name();

        let gateway_ready = match self.kind.gateway() {
            Some(gateway) => Some(self.probe_deployment(name, &gateway).await),
            None => None,
        };
        let agent_ready = match self.kind.agent(&pipeline) {
            Some(agent) => Some(self.probe_daemon_set(name, &agent).await),
            None => None,
        };
        let configuration = observe_configuration(
            &self.registry,
            self.tls_validator.as_ref(),
            &pipeline,
            lock_acquired,
            self.kind.configured_reason(),
            K::SIGNAL,
        )
        .await?;
        let flow = match &self.probers.flow {
            Some(prober) => Some(observe_flow(K::SIGNAL, &prober.probe(name).await)),
            None => None,
        };
        let observations = StatusObservations {
            gateway_ready,
            agent_ready,
            configuration,
            flow,
        };

        let legacy = self.kind.legacy_reasons();
        self.registry
            .update_with::<K::Pipeline, _>(key, |p| {
                let generation = p.metadata().generation;
                apply_observations(p.status_mut(), generation, K::SIGNAL, &observations, legacy)
            })
            .await
            .with_context(|| format!("failed to update status of pipeline {name}"))?;
        Ok(())
    }

    async fn probe_deployment(&self, pipeline: &str, name: &NamespacedName) -> bool {
        match self.probers.deployment.is_ready(name).await {
            Ok(ready) => ready,
            Err(e) => {
                log::warn!("pipeline {pipeline}: failed to probe deployment {name}: {e:#}");
                false
            }
        }
    }

    async fn probe_daemon_set(&self, pipeline: &str, name: &NamespacedName) -> bool {
        match self.probers.daemon_set.is_ready(name).await {
            Ok(ready) => ready,
            Err(e) => {
                log::warn!("pipeline {pipeline}: failed to probe daemonset {name}: {e:#}");
                false
            }
        }
    }
}

#[async_trait]
impl<K: PipelineKind> Controller for PipelineReconciler<K> {
    fn name(&self) -> &'static str {
        K::CONTROLLER_NAME
    }

    async fn reconcile(&self, key: &str) -> Result<()> {
        self.reconcile_pipeline(key).await
    }

    async fn list_keys(&self) -> Result<Vec<String>> {
        Ok(self
            .registry
            .list::<K::Pipeline>()
            .await?
            .into_iter()
            .map(|p| p.object.name().to_string())
            .collect())
    }
}

/// Replicas from the first `Telemetry` with a static override for `signal`, else the default.
/// A failed lookup falls back to the default instead of failing the deployment.
pub async fn gateway_replicas(registry: &Registry, signal: Signal) -> i32 {
    let telemetries = match registry.list::<Telemetry>().await {
        Ok(telemetries) => telemetries,
        Err(e) => {
            log::warn!(
                "failed to read gateway scaling, using {DEFAULT_GATEWAY_REPLICAS} replicas: {e:#}"
            );
            return DEFAULT_GATEWAY_REPLICAS;
        }
    };
    let replicas = telemetries
        .iter()
        .filter_map(|t| {
            let spec = match signal {
                Signal::Trace => t.object.spec.trace.as_ref(),
                Signal::Metric => t.object.spec.metric.as_ref(),
                Signal::Log => None,
            }?;
            spec.gateway.scaling.static_scaling.as_ref().map(|s| s.replicas)
        })
        .find(|replicas| *replicas > 0);
    replicas.unwrap_or(DEFAULT_GATEWAY_REPLICAS)
}
