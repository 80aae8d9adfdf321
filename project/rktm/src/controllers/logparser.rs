//! Log parsers are rendered into one shared parsers file mounted by the Fluent Bit DaemonSet.

use crate::api::Registry;
use crate::conditions::*;
use crate::controllers::manager::Controller;
use crate::overrides::OverridesHandler;
use crate::prober::DaemonSetProber;
use crate::protocol::config::LogConfig;
use crate::render::fluentbit::make_parsers_config;
use crate::resources::fluentbit::apply_parsers;
use anyhow::{Context, Result};
use async_trait::async_trait;
use common::{
    Condition, ConditionStatus, LogParser, NamespacedName, PipelineStatus, Resource,
    set_status_condition,
};
use std::sync::Arc;

pub const CONTROLLER_NAME: &str = "logparser";

pub struct LogParserController {
    registry: Registry,
    overrides: Arc<OverridesHandler>,
    prober: Arc<dyn DaemonSetProber>,
    namespace: String,
    config: LogConfig,
}

impl LogParserController {
    pub fn new(
        registry: Registry,
        overrides: Arc<OverridesHandler>,
        prober: Arc<dyn DaemonSetProber>,
        namespace: impl Into<String>,
        config: LogConfig,
    ) -> Self {
        Self {
            registry,
            overrides,
            prober,
            namespace: namespace.into(),
            config,
        }
    }

    pub async fn reconcile_parser(&self, name: &str) -> Result<()> {
        if self.overrides.load_overrides().await?.logging.paused {
            log::debug!("logging reconciliation is paused, skipping parser {name}");
            return Ok(());
        }

        let key = NamespacedName::cluster(name);
        if self.registry.get::<LogParser>(&key).await?.is_none() {
            log::debug!("parser {name} is gone");
        }

        let parsers: Vec<LogParser> = self
            .registry
            .list::<LogParser>()
            .await?
            .into_iter()
            .map(|v| v.object)
            .filter(|p| !p.metadata.is_being_deleted())
            .collect();
        apply_parsers(
            &self.registry,
            &self.namespace,
            &self.config.daemon_set,
            make_parsers_config(&parsers),
        )
        .await
        .with_context(|| format!("failed to apply parsers for {name}"))?;
        log::info!("fluent bit parsers configured with {} parsers", parsers.len());

        self.update_status(&key).await
    }

    async fn update_status(&self, key: &NamespacedName) -> Result<()> {
        let daemon_set = NamespacedName::new(self.namespace.clone(), self.config.daemon_set.clone());
        let ready = match self.prober.is_ready(&daemon_set).await {
            Ok(ready) => ready,
            Err(e) => {
                log::warn!("parser {}: failed to probe daemonset {daemon_set}: {e:#}", key.name);
                false
            }
        };

        self.registry
            .update_with::<LogParser, _>(key, |parser| {
                if parser.metadata.is_being_deleted() {
                    return false;
                }
                let generation = parser.metadata.generation;
                apply_parser_status(&mut parser.status, generation, ready)
            })
            .await
            .with_context(|| format!("failed to update status of parser {}", key.name))?;
        Ok(())
    }
}

/// `AgentHealthy` plus the legacy pair, both from the DaemonSet readiness.
pub fn apply_parser_status(status: &mut PipelineStatus, generation: i64, ready: bool) -> bool {
    let before = status.clone();
    let (agent_status, agent_reason) = if ready {
        (ConditionStatus::True, REASON_AGENT_READY)
    } else {
        (ConditionStatus::False, REASON_AGENT_NOT_READY)
    };
    set_status_condition(
        &mut status.conditions,
        Condition::new(
            TYPE_AGENT_HEALTHY,
            agent_status,
            agent_reason,
            message_for(Signal::Log, agent_reason),
        )
        .with_observed_generation(generation),
    );

    if ready {
        handle_running_condition(
            &mut status.conditions,
            generation,
            REASON_FLUENT_BIT_DS_READY,
            REASON_FLUENT_BIT_DS_NOT_READY,
            &message_for(Signal::Log, REASON_FLUENT_BIT_DS_READY),
            &message_for(Signal::Log, REASON_FLUENT_BIT_DS_NOT_READY),
        );
    } else {
        handle_pending_condition(
            &mut status.conditions,
            generation,
            REASON_FLUENT_BIT_DS_NOT_READY,
            &message_for(Signal::Log, REASON_FLUENT_BIT_DS_NOT_READY),
        );
    }
    status.phase = Some(legacy_phase(&status.conditions));

    *status != before
}

#[async_trait]
impl Controller for LogParserController {
    fn name(&self) -> &'static str {
        CONTROLLER_NAME
    }

    async fn reconcile(&self, key: &str) -> Result<()> {
        self.reconcile_parser(key).await
    }

    async fn list_keys(&self) -> Result<Vec<String>> {
        Ok(self
            .registry
            .list::<LogParser>()
            .await?
            .into_iter()
            .map(|v| v.object.name().to_string())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{PipelinePhase, find_status_condition};

    #[test]
    fn test_parser_status_follows_daemon_set() {
        let mut status = PipelineStatus::default();
        assert!(apply_parser_status(&mut status, 1, false));
        assert_eq!(status.phase, Some(PipelinePhase::Pending));
        let pending = find_status_condition(&status.conditions, TYPE_PENDING).unwrap();
        assert_eq!(pending.reason, REASON_FLUENT_BIT_DS_NOT_READY);

        assert!(apply_parser_status(&mut status, 1, true));
        assert_eq!(status.phase, Some(PipelinePhase::Running));
        let agent = find_status_condition(&status.conditions, TYPE_AGENT_HEALTHY).unwrap();
        assert_eq!(agent.reason, REASON_AGENT_READY);
        assert_eq!(
            status.conditions.last().unwrap().condition_type,
            TYPE_RUNNING
        );
        assert!(!apply_parser_status(&mut status, 1, true));
    }
}
