//! Per-pipeline conditions.
//!
//! Everything that needs I/O is observed first; the observations are then applied to the
//! stored status inside a retry-on-conflict update.

use crate::api::Registry;
use crate::conditions::*;
use crate::prober::PipelineProbeResult;
use crate::secretref::references_non_existent_secret;
use crate::tlscert::{TlsCertError, TlsCertValidator, tls_cert_error};
use anyhow::Result;
use common::{
    Condition, ConditionStatus, Pipeline, PipelineStatus, find_status_condition,
    remove_status_condition, set_status_condition,
};

/// A condition outcome before it is stamped with a generation.
#[derive(Debug, Clone, PartialEq)]
pub struct Observed {
    pub status: ConditionStatus,
    pub reason: &'static str,
    pub message: String,
}

impl Observed {
    fn new(status: ConditionStatus, reason: &'static str, message: String) -> Self {
        Self {
            status,
            reason,
            message,
        }
    }

    fn into_condition(self, condition_type: &str, generation: i64) -> Condition {
        Condition::new(condition_type, self.status, self.reason, self.message)
            .with_observed_generation(generation)
    }
}

/// Reasons used for the legacy `Running`/`Pending` pair.
#[derive(Debug, Clone, Copy)]
pub struct LegacyReasons {
    pub ready: &'static str,
    pub not_ready: &'static str,
}

#[derive(Debug, Clone)]
pub struct StatusObservations {
    /// `None` for kinds without a gateway.
    pub gateway_ready: Option<bool>,
    /// `None` when the pipeline needs no agent; an existing `AgentHealthy` is then removed.
    pub agent_ready: Option<bool>,
    pub configuration: Observed,
    /// Only set when flow health probing is enabled.
    pub flow: Option<Observed>,
}

/// `ConfigurationGenerated` for one pipeline.
pub async fn observe_configuration<P: Pipeline>(
    registry: &Registry,
    tls_validator: &dyn TlsCertValidator,
    pipeline: &P,
    lock_acquired: bool,
    configured_reason: &'static str,
    signal: Signal,
) -> Result<Observed> {
    if !lock_acquired {
        return Ok(Observed::new(
            ConditionStatus::False,
            REASON_MAX_PIPELINES_EXCEEDED,
            message_for(signal, REASON_MAX_PIPELINES_EXCEEDED),
        ));
    }
    if references_non_existent_secret(registry, pipeline).await? {
        return Ok(Observed::new(
            ConditionStatus::False,
            REASON_REFERENCED_SECRET_MISSING,
            message_for(signal, REASON_REFERENCED_SECRET_MISSING),
        ));
    }
    if let Some((cert, key)) = pipeline.tls_client_material() {
        if let Err(e) = tls_validator.validate_certificate(cert, key).await {
            return match tls_cert_error(&e) {
                Some(TlsCertError::Expired { .. }) => Ok(Observed::new(
                    ConditionStatus::False,
                    REASON_TLS_CERTIFICATE_EXPIRED,
                    format!("{}: {e}", message_for(signal, REASON_TLS_CERTIFICATE_EXPIRED)),
                )),
                Some(TlsCertError::AboutToExpire { not_after }) => Ok(Observed::new(
                    ConditionStatus::True,
                    REASON_TLS_CERTIFICATE_ABOUT_TO_EXPIRE,
                    tls_about_to_expire_message(*not_after),
                )),
                Some(other) => Ok(Observed::new(
                    ConditionStatus::False,
                    REASON_TLS_CERTIFICATE_INVALID,
                    format!("TLS certificate invalid: {other}"),
                )),
                None => Err(e),
            };
        }
    }
    Ok(Observed::new(
        ConditionStatus::True,
        configured_reason,
        message_for(signal, configured_reason),
    ))
}

/// `TelemetryFlowHealthy` from a probe outcome, most severe alert first.
pub fn observe_flow(signal: Signal, probe: &Result<PipelineProbeResult>) -> Observed {
    let (status, reason) = match probe {
        Err(e) => {
            log::warn!("failed to probe telemetry flow: {e:#}");
            (ConditionStatus::Unknown, REASON_PROBING_FAILED)
        }
        Ok(r) if r.all_data_dropped => (ConditionStatus::False, REASON_ALL_DATA_DROPPED),
        Ok(r) if r.some_data_dropped => (ConditionStatus::False, REASON_SOME_DATA_DROPPED),
        Ok(r) if r.queue_almost_full => (ConditionStatus::False, REASON_BUFFER_FILLING_UP),
        Ok(r) if r.throttling => (ConditionStatus::False, REASON_GATEWAY_THROTTLING),
        Ok(r) if r.healthy => (ConditionStatus::True, REASON_FLOW_HEALTHY),
        Ok(_) => (ConditionStatus::Unknown, REASON_PROBING_FAILED),
    };
    Observed::new(status, reason, message_for(signal, reason))
}

fn health(signal: Signal, ready: bool, ready_reason: &'static str, not_ready_reason: &'static str) -> Observed {
    let (status, reason) = if ready {
        (ConditionStatus::True, ready_reason)
    } else {
        (ConditionStatus::False, not_ready_reason)
    };
    Observed::new(status, reason, message_for(signal, reason))
}

/// Write the observations into `status`. Returns whether anything changed.
pub fn apply_observations(
    status: &mut PipelineStatus,
    generation: i64,
    signal: Signal,
    observations: &StatusObservations,
    legacy: LegacyReasons,
) -> bool {
    let before = status.clone();
    let conditions = &mut status.conditions;

    match observations.agent_ready {
        Some(ready) => {
            set_status_condition(
                conditions,
                health(signal, ready, REASON_AGENT_READY, REASON_AGENT_NOT_READY)
                    .into_condition(TYPE_AGENT_HEALTHY, generation),
            );
        }
        None => {
            remove_status_condition(conditions, TYPE_AGENT_HEALTHY);
        }
    }
    if let Some(ready) = observations.gateway_ready {
        set_status_condition(
            conditions,
            health(signal, ready, REASON_GATEWAY_READY, REASON_GATEWAY_NOT_READY)
                .into_condition(TYPE_GATEWAY_HEALTHY, generation),
        );
    }
    set_status_condition(
        conditions,
        observations
            .configuration
            .clone()
            .into_condition(TYPE_CONFIGURATION_GENERATED, generation),
    );
    match &observations.flow {
        Some(flow) => {
            set_status_condition(
                conditions,
                flow.clone().into_condition(TYPE_FLOW_HEALTHY, generation),
            );
        }
        None => {
            remove_status_condition(conditions, TYPE_FLOW_HEALTHY);
        }
    }

    let configured = find_status_condition(conditions, TYPE_CONFIGURATION_GENERATED)
        .filter(|c| c.status == ConditionStatus::False)
        .map(|c| (c.reason.clone(), c.message.clone()));
    if let Some((reason, message)) = configured {
        handle_pending_condition(conditions, generation, &reason, &message);
    } else if observations
        .gateway_ready
        .or(observations.agent_ready)
        .unwrap_or(false)
    {
        handle_running_condition(
            conditions,
            generation,
            legacy.ready,
            legacy.not_ready,
            &message_for(signal, legacy.ready),
            &message_for(signal, legacy.not_ready),
        );
    } else {
        handle_pending_condition(
            conditions,
            generation,
            legacy.not_ready,
            &message_for(signal, legacy.not_ready),
        );
    }
    status.phase = Some(legacy_phase(&status.conditions));

    *status != before
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use common::PipelinePhase;

    const TRACE_LEGACY: LegacyReasons = LegacyReasons {
        ready: REASON_TRACE_GATEWAY_DEPLOYMENT_READY,
        not_ready: REASON_TRACE_GATEWAY_DEPLOYMENT_NOT_READY,
    };

    fn configured() -> Observed {
        Observed::new(
            ConditionStatus::True,
            REASON_GATEWAY_CONFIGURED,
            message_for(Signal::Trace, REASON_GATEWAY_CONFIGURED),
        )
    }

    fn types(status: &PipelineStatus) -> Vec<&str> {
        status
            .conditions
            .iter()
            .map(|c| c.condition_type.as_str())
            .collect()
    }

    #[test]
    fn test_ready_gateway_runs() {
        let mut status = PipelineStatus::default();
        let obs = StatusObservations {
            gateway_ready: Some(true),
            agent_ready: None,
            configuration: configured(),
            flow: None,
        };
        assert!(apply_observations(&mut status, 1, Signal::Trace, &obs, TRACE_LEGACY));
        assert_eq!(
            types(&status),
            vec![TYPE_GATEWAY_HEALTHY, TYPE_CONFIGURATION_GENERATED, TYPE_RUNNING]
        );
        assert_eq!(status.phase, Some(PipelinePhase::Running));
        assert!(!apply_observations(&mut status, 1, Signal::Trace, &obs, TRACE_LEGACY));
    }

    #[test]
    fn test_config_failure_is_pending_with_config_reason() {
        let mut status = PipelineStatus::default();
        let obs = StatusObservations {
            gateway_ready: Some(true),
            agent_ready: None,
            configuration: Observed::new(
                ConditionStatus::False,
                REASON_MAX_PIPELINES_EXCEEDED,
                message_for(Signal::Trace, REASON_MAX_PIPELINES_EXCEEDED),
            ),
            flow: None,
        };
        apply_observations(&mut status, 3, Signal::Trace, &obs, TRACE_LEGACY);
        let pending = find_status_condition(&status.conditions, TYPE_PENDING).unwrap();
        assert_eq!(pending.reason, REASON_MAX_PIPELINES_EXCEEDED);
        assert_eq!(pending.observed_generation, 3);
        assert_eq!(status.phase, Some(PipelinePhase::Pending));
    }

    #[test]
    fn test_agent_condition_removed_when_not_required() {
        let mut status = PipelineStatus::default();
        let mut obs = StatusObservations {
            gateway_ready: Some(false),
            agent_ready: Some(true),
            configuration: configured(),
            flow: None,
        };
        apply_observations(&mut status, 1, Signal::Metric, &obs, TRACE_LEGACY);
        assert!(find_status_condition(&status.conditions, TYPE_AGENT_HEALTHY).is_some());

        obs.agent_ready = None;
        apply_observations(&mut status, 1, Signal::Metric, &obs, TRACE_LEGACY);
        assert!(find_status_condition(&status.conditions, TYPE_AGENT_HEALTHY).is_none());
        assert_eq!(status.phase, Some(PipelinePhase::Pending));
    }

    #[test]
    fn test_flow_priority() {
        let both = PipelineProbeResult {
            all_data_dropped: true,
            throttling: true,
            ..Default::default()
        };
        assert_eq!(observe_flow(Signal::Trace, &Ok(both)).reason, REASON_ALL_DATA_DROPPED);

        let throttling = PipelineProbeResult {
            throttling: true,
            healthy: true,
            ..Default::default()
        };
        assert_eq!(
            observe_flow(Signal::Trace, &Ok(throttling)).reason,
            REASON_GATEWAY_THROTTLING
        );

        let failed = observe_flow(Signal::Trace, &Err(anyhow!("prometheus down")));
        assert_eq!(failed.status, ConditionStatus::Unknown);
        assert_eq!(failed.reason, REASON_PROBING_FAILED);
    }
}
