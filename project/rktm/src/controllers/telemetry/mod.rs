//! Module-level status: one `<Signal>ComponentsHealthy` condition per signal on the `Telemetry`
//! resource, the derived `state`, and the finalizer that holds deletion until no pipelines remain.

pub mod components;

use crate::api::Registry;
use crate::controllers::manager::Controller;
use crate::overrides::OverridesHandler;
use anyhow::{Context, Result};
use async_trait::async_trait;
use common::{
    Condition, ConditionStatus, LogParser, LogPipeline, MetricPipeline, NamespacedName, Resource,
    Telemetry, TelemetryState, TracePipeline, set_status_condition,
};
use components::{BlockingResources, ComponentsChecker};
use std::sync::Arc;

pub const FINALIZER: &str = "telemetry.kyma-project.io/finalizer";
pub const CONTROLLER_NAME: &str = "telemetry";

pub struct TelemetryController {
    registry: Registry,
    overrides: Arc<OverridesHandler>,
    namespace: String,
    log: ComponentsChecker,
    metric: ComponentsChecker,
    trace: ComponentsChecker,
}

impl TelemetryController {
    pub fn new(
        registry: Registry,
        overrides: Arc<OverridesHandler>,
        namespace: impl Into<String>,
        flow_health_probing: bool,
    ) -> Self {
        Self {
            registry,
            overrides,
            namespace: namespace.into(),
            log: ComponentsChecker::log(flow_health_probing),
            metric: ComponentsChecker::metric(flow_health_probing),
            trace: ComponentsChecker::trace(flow_health_probing),
        }
    }

    pub async fn reconcile_telemetry(&self, name: &str) -> Result<()> {
        if self.overrides.load_overrides().await?.telemetry.paused {
            log::debug!("telemetry reconciliation is paused, skipping {name}");
            return Ok(());
        }

        let key = NamespacedName::new(self.namespace.clone(), name);
        let Some(current) = self.registry.get::<Telemetry>(&key).await? else {
            log::debug!("telemetry {key} is gone");
            return Ok(());
        };
        let in_deletion = current.object.metadata.is_being_deleted();

        let logs = self.objects::<LogPipeline>().await?;
        let parsers = self.objects::<LogParser>().await?;
        let metrics = self.objects::<MetricPipeline>().await?;
        let traces = self.objects::<TracePipeline>().await?;
        let parser_blockers = [BlockingResources {
            resource_type: "LogParsers",
            names: parsers.iter().map(|p| p.name().to_string()).collect(),
        }];

        let conditions = [
            self.log.check(&logs, &parser_blockers, in_deletion),
            self.metric.check(&metrics, &[], in_deletion),
            self.trace.check(&traces, &[], in_deletion),
        ];
        let blocked = !(logs.is_empty() && parsers.is_empty() && metrics.is_empty() && traces.is_empty());

        self.registry
            .update_with::<Telemetry, _>(&key, |t| {
                let generation = t.metadata.generation;
                apply_module_status(t, &conditions, generation, blocked)
            })
            .await
            .with_context(|| format!("failed to update status of telemetry {key}"))?;

        if in_deletion && !blocked {
            log::info!("no telemetry resources left, releasing telemetry {key}");
        }
        Ok(())
    }

    async fn objects<T: Resource>(&self) -> Result<Vec<T>> {
        Ok(self
            .registry
            .list::<T>()
            .await?
            .into_iter()
            .map(|v| v.object)
            .collect())
    }
}

/// Set the components conditions, the state and the finalizer. Returns whether anything changed.
pub fn apply_module_status(
    telemetry: &mut Telemetry,
    conditions: &[Condition],
    generation: i64,
    blocked: bool,
) -> bool {
    let before = telemetry.clone();
    let in_deletion = telemetry.metadata.is_being_deleted();

    for condition in conditions {
        set_status_condition(
            &mut telemetry.status.conditions,
            condition.clone().with_observed_generation(generation),
        );
    }
    telemetry.status.state = module_state(conditions, in_deletion);

    let finalizers = &mut telemetry.metadata.finalizers;
    if !in_deletion {
        if !finalizers.iter().any(|f| f == FINALIZER) {
            finalizers.push(FINALIZER.to_string());
        }
    } else if !blocked {
        finalizers.retain(|f| f != FINALIZER);
    }

    *telemetry != before
}

pub fn module_state(conditions: &[Condition], in_deletion: bool) -> TelemetryState {
    if in_deletion {
        TelemetryState::Deleting
    } else if conditions.iter().any(|c| c.status == ConditionStatus::False) {
        TelemetryState::Warning
    } else {
        TelemetryState::Ready
    }
}

#[async_trait]
impl Controller for TelemetryController {
    fn name(&self) -> &'static str {
        CONTROLLER_NAME
    }

    async fn reconcile(&self, key: &str) -> Result<()> {
        self.reconcile_telemetry(key).await
    }

    async fn list_keys(&self) -> Result<Vec<String>> {
        Ok(self
            .objects::<Telemetry>()
            .await?
            .into_iter()
            .filter(|t| t.metadata.namespace == self.namespace)
            .map(|t| t.metadata.name)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::*;
    use common::{ObjectMeta, TelemetrySpec};

    fn condition(status: ConditionStatus, reason: &str) -> Condition {
        Condition::new(TYPE_TRACE_COMPONENTS_HEALTHY, status, reason, "")
    }

    #[test]
    fn test_state_follows_conditions() {
        assert_eq!(
            module_state(&[condition(ConditionStatus::True, REASON_COMPONENTS_RUNNING)], false),
            TelemetryState::Ready
        );
        assert_eq!(
            module_state(&[condition(ConditionStatus::False, REASON_GATEWAY_NOT_READY)], false),
            TelemetryState::Warning
        );
        assert_eq!(
            module_state(&[condition(ConditionStatus::True, REASON_COMPONENTS_RUNNING)], true),
            TelemetryState::Deleting
        );
    }

    #[test]
    fn test_finalizer_added_then_released_when_unblocked() {
        let mut telemetry = Telemetry::new(
            ObjectMeta::namespaced("kyma-system", "default"),
            TelemetrySpec::default(),
        );
        let conds = [condition(ConditionStatus::True, REASON_NO_PIPELINE_DEPLOYED)];
        assert!(apply_module_status(&mut telemetry, &conds, 1, false));
        assert_eq!(telemetry.metadata.finalizers, vec![FINALIZER.to_string()]);
        assert!(!apply_module_status(&mut telemetry, &conds, 1, false));

        telemetry.metadata.deletion_timestamp = Some(chrono::Utc::now());
        apply_module_status(&mut telemetry, &conds, 1, true);
        assert_eq!(telemetry.metadata.finalizers, vec![FINALIZER.to_string()]);
        assert_eq!(telemetry.status.state, TelemetryState::Deleting);

        apply_module_status(&mut telemetry, &conds, 1, false);
        assert!(telemetry.metadata.finalizers.is_empty());
    }
}
