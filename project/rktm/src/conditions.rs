//! Condition types, reason codes and messages persisted in pipeline and Telemetry status.
//!
//! Reason strings are read back by other tooling and must stay verbatim.

use common::{
    Condition, ConditionStatus, PipelinePhase, find_status_condition, is_status_condition_true,
    remove_status_condition, set_status_condition,
};

pub const TYPE_CONFIGURATION_GENERATED: &str = "ConfigurationGenerated";
pub const TYPE_GATEWAY_HEALTHY: &str = "GatewayHealthy";
pub const TYPE_AGENT_HEALTHY: &str = "AgentHealthy";
pub const TYPE_FLOW_HEALTHY: &str = "TelemetryFlowHealthy";

pub const TYPE_LOG_COMPONENTS_HEALTHY: &str = "LogComponentsHealthy";
pub const TYPE_METRIC_COMPONENTS_HEALTHY: &str = "MetricComponentsHealthy";
pub const TYPE_TRACE_COMPONENTS_HEALTHY: &str = "TraceComponentsHealthy";

// deprecated, kept at the tail of the list
pub const TYPE_PENDING: &str = "Pending";
pub const TYPE_RUNNING: &str = "Running";

pub const REASON_NO_PIPELINE_DEPLOYED: &str = "NoPipelineDeployed";
pub const REASON_RESOURCE_BLOCKS_DELETION: &str = "ResourceBlocksDeletion";
pub const REASON_COMPONENTS_RUNNING: &str = "ComponentsRunning";

pub const REASON_GATEWAY_CONFIGURED: &str = "GatewayConfigured";
pub const REASON_AGENT_CONFIGURED: &str = "AgentConfigured";
pub const REASON_MAX_PIPELINES_EXCEEDED: &str = "MaxPipelinesExceeded";
pub const REASON_REFERENCED_SECRET_MISSING: &str = "ReferencedSecretMissing";
pub const REASON_TLS_CERTIFICATE_INVALID: &str = "TLSCertificateInvalid";
pub const REASON_TLS_CERTIFICATE_EXPIRED: &str = "TLSCertificateExpired";
pub const REASON_TLS_CERTIFICATE_ABOUT_TO_EXPIRE: &str = "TLSCertificateAboutToExpire";

pub const REASON_GATEWAY_READY: &str = "GatewayReady";
pub const REASON_GATEWAY_NOT_READY: &str = "GatewayNotReady";
pub const REASON_AGENT_READY: &str = "AgentReady";
pub const REASON_AGENT_NOT_READY: &str = "AgentNotReady";

pub const REASON_FLOW_HEALTHY: &str = "FlowHealthy";
pub const REASON_ALL_DATA_DROPPED: &str = "AllDataDropped";
pub const REASON_SOME_DATA_DROPPED: &str = "SomeDataDropped";
pub const REASON_BUFFER_FILLING_UP: &str = "BufferFillingUp";
pub const REASON_GATEWAY_THROTTLING: &str = "GatewayThrottling";
pub const REASON_PROBING_FAILED: &str = "ProbingFailed";

// legacy Pending/Running reasons
pub const REASON_FLUENT_BIT_DS_READY: &str = "FluentBitDSReady";
pub const REASON_FLUENT_BIT_DS_NOT_READY: &str = "FluentBitDSNotReady";
pub const REASON_TRACE_GATEWAY_DEPLOYMENT_READY: &str = "TraceGatewayDeploymentReady";
pub const REASON_TRACE_GATEWAY_DEPLOYMENT_NOT_READY: &str = "TraceGatewayDeploymentNotReady";
pub const REASON_METRIC_GATEWAY_DEPLOYMENT_READY: &str = "MetricGatewayDeploymentReady";
pub const REASON_METRIC_GATEWAY_DEPLOYMENT_NOT_READY: &str = "MetricGatewayDeploymentNotReady";

/// Which signal a message is written for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Log,
    Metric,
    Trace,
}

impl Signal {
    fn pipeline_kind(self) -> &'static str {
        match self {
            Signal::Log => "LogPipeline",
            Signal::Metric => "MetricPipeline",
            Signal::Trace => "TracePipeline",
        }
    }

    fn collector(self) -> &'static str {
        match self {
            Signal::Log => "Fluent Bit agent",
            Signal::Metric => "Metric gateway",
            Signal::Trace => "Trace gateway",
        }
    }
}

/// Default human message for a reason. Unknown reasons map to an empty message.
pub fn message_for(signal: Signal, reason: &str) -> String {
    let kind = signal.pipeline_kind();
    let collector = signal.collector();
    match reason {
        REASON_NO_PIPELINE_DEPLOYED => format!("No {kind}s deployed"),
        REASON_COMPONENTS_RUNNING => "All components are running".to_string(),
        REASON_GATEWAY_CONFIGURED => format!("{kind} specification is successfully applied to the configuration of {collector}"),
        REASON_AGENT_CONFIGURED => format!("{kind} specification is successfully applied to the configuration of the agent"),
        REASON_MAX_PIPELINES_EXCEEDED => "Maximum pipeline count limit exceeded".to_string(),
        REASON_REFERENCED_SECRET_MISSING => "One or more referenced Secrets are missing".to_string(),
        REASON_TLS_CERTIFICATE_INVALID => "TLS certificate invalid".to_string(),
        REASON_TLS_CERTIFICATE_EXPIRED => "TLS certificate expired".to_string(),
        REASON_GATEWAY_READY => format!("{collector} Deployment is ready"),
        REASON_GATEWAY_NOT_READY => format!("{collector} Deployment is not ready"),
        REASON_AGENT_READY => "Agent DaemonSet is ready".to_string(),
        REASON_AGENT_NOT_READY => "Agent DaemonSet is not ready".to_string(),
        REASON_FLOW_HEALTHY => "No problems detected in the telemetry flow".to_string(),
        REASON_ALL_DATA_DROPPED => "Backend is not reachable or rejecting data. All data is dropped".to_string(),
        REASON_SOME_DATA_DROPPED => "Backend is reachable, but rejecting data. Some data is dropped".to_string(),
        REASON_BUFFER_FILLING_UP => "Buffer nearing capacity. Incoming data rate exceeds export rate".to_string(),
        REASON_GATEWAY_THROTTLING => "Gateway is refusing data due to memory limits".to_string(),
        REASON_PROBING_FAILED => "Could not determine the health of the telemetry flow".to_string(),
        REASON_FLUENT_BIT_DS_READY => "Fluent Bit DaemonSet is ready".to_string(),
        REASON_FLUENT_BIT_DS_NOT_READY => "Fluent Bit DaemonSet is not ready".to_string(),
        REASON_TRACE_GATEWAY_DEPLOYMENT_READY => "Trace gateway Deployment is ready".to_string(),
        REASON_TRACE_GATEWAY_DEPLOYMENT_NOT_READY => "Trace gateway Deployment is not ready".to_string(),
        REASON_METRIC_GATEWAY_DEPLOYMENT_READY => "Metric gateway Deployment is ready".to_string(),
        REASON_METRIC_GATEWAY_DEPLOYMENT_NOT_READY => "Metric gateway Deployment is not ready".to_string(),
        _ => String::new(),
    }
}

pub fn tls_about_to_expire_message(not_after: chrono::DateTime<chrono::Utc>) -> String {
    format!(
        "TLS certificate is about to expire, configured certificate is valid until {}",
        not_after.format("%Y-%m-%d")
    )
}

/// Mark the pipeline as pending: drop `Running` and set `Pending=True`.
pub fn handle_pending_condition(
    conditions: &mut Vec<Condition>,
    generation: i64,
    reason: &str,
    message: &str,
) {
    remove_status_condition(conditions, TYPE_RUNNING);
    set_status_condition(
        conditions,
        Condition::new(TYPE_PENDING, ConditionStatus::True, reason, message)
            .with_observed_generation(generation),
    );
}

/// Mark the pipeline as running.
///
/// An existing `Pending` is flipped to `False` and moved to the tail, then `Running=True` is
/// appended after it, so the pair stays last in the list.
pub fn handle_running_condition(
    conditions: &mut Vec<Condition>,
    generation: i64,
    running_reason: &str,
    pending_reason: &str,
    running_message: &str,
    pending_message: &str,
) {
    if let Some(previous) = find_status_condition(conditions, TYPE_PENDING).cloned() {
        remove_status_condition(conditions, TYPE_PENDING);
        let mut pending = Condition::new(
            TYPE_PENDING,
            ConditionStatus::False,
            pending_reason,
            pending_message,
        )
        .with_observed_generation(generation);
        if previous.status == ConditionStatus::False {
            pending.last_transition_time = previous.last_transition_time;
        }
        set_status_condition(conditions, pending);
    }
    let mut running = Condition::new(
        TYPE_RUNNING,
        ConditionStatus::True,
        running_reason,
        running_message,
    )
    .with_observed_generation(generation);
    if let Some(previous) = find_status_condition(conditions, TYPE_RUNNING) {
        if previous.status == ConditionStatus::True {
            running.last_transition_time = previous.last_transition_time;
        }
    }
    remove_status_condition(conditions, TYPE_RUNNING);
    set_status_condition(conditions, running);
}

/// The coarse phase mirrored from the legacy conditions.
pub fn legacy_phase(conditions: &[Condition]) -> PipelinePhase {
    if is_status_condition_true(conditions, TYPE_RUNNING) {
        PipelinePhase::Running
    } else {
        PipelinePhase::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn types(conditions: &[Condition]) -> Vec<&str> {
        conditions
            .iter()
            .map(|c| c.condition_type.as_str())
            .collect()
    }

    #[test]
    fn test_pending_replaces_running() {
        let mut conditions = Vec::new();
        handle_running_condition(&mut conditions, 1, "Up", "Down", "up", "down");
        handle_pending_condition(&mut conditions, 2, "Down", "down");
        assert_eq!(types(&conditions), vec![TYPE_PENDING]);
        assert_eq!(conditions[0].status, ConditionStatus::True);
        assert_eq!(conditions[0].observed_generation, 2);
        assert_eq!(legacy_phase(&conditions), PipelinePhase::Pending);
    }

    #[test]
    fn test_running_moves_pending_to_tail() {
        let mut conditions = Vec::new();
        handle_pending_condition(&mut conditions, 1, "Down", "down");
        set_status_condition(
            &mut conditions,
            Condition::new(TYPE_GATEWAY_HEALTHY, ConditionStatus::True, REASON_GATEWAY_READY, ""),
        );
        handle_running_condition(&mut conditions, 1, "Up", "Down", "up", "down");

        assert_eq!(
            types(&conditions),
            vec![TYPE_GATEWAY_HEALTHY, TYPE_PENDING, TYPE_RUNNING]
        );
        let pending = find_status_condition(&conditions, TYPE_PENDING).unwrap();
        assert_eq!(pending.status, ConditionStatus::False);
        assert_eq!(pending.reason, "Down");
        assert_eq!(legacy_phase(&conditions), PipelinePhase::Running);
    }

    #[test]
    fn test_repeated_running_is_stable() {
        let mut conditions = Vec::new();
        handle_pending_condition(&mut conditions, 1, "Down", "down");
        handle_running_condition(&mut conditions, 1, "Up", "Down", "up", "down");
        let first = conditions.clone();
        handle_running_condition(&mut conditions, 1, "Up", "Down", "up", "down");
        assert_eq!(conditions, first);
    }

    #[test]
    fn test_messages() {
        assert_eq!(
            message_for(Signal::Trace, REASON_NO_PIPELINE_DEPLOYED),
            "No TracePipelines deployed"
        );
        assert_eq!(
            message_for(Signal::Metric, REASON_GATEWAY_NOT_READY),
            "Metric gateway Deployment is not ready"
        );
        assert!(message_for(Signal::Log, "Whatever").is_empty());
    }
}
