//! Roll-up of all pipelines of one signal into a single `<Signal>ComponentsHealthy` condition.

use crate::conditions::*;
use common::{Condition, ConditionStatus, Pipeline, find_status_condition};

/// Names of objects that keep the `Telemetry` resource from being deleted.
#[derive(Debug, Clone)]
pub struct BlockingResources {
    pub resource_type: &'static str,
    pub names: Vec<String>,
}

pub fn deletion_blocked_message(resources: &[BlockingResources]) -> String {
    let listed: Vec<String> = resources
        .iter()
        .filter(|r| !r.names.is_empty())
        .map(|r| {
            let mut names = r.names.clone();
            names.sort();
            format!("{} ({})", r.resource_type, names.join(","))
        })
        .collect();
    format!(
        "The deletion of the module is blocked. To unblock the deletion, delete the following resources: {}",
        listed.join(",")
    )
}

pub struct ComponentsChecker {
    signal: Signal,
    condition_type: &'static str,
    resource_type: &'static str,
    /// Checked in order; the first type any pipeline reports as False decides the reason.
    priority: Vec<&'static str>,
}

impl ComponentsChecker {
    pub fn trace(flow_health_probing: bool) -> Self {
        Self::new(
            Signal::Trace,
            TYPE_TRACE_COMPONENTS_HEALTHY,
            "TracePipelines",
            vec![TYPE_CONFIGURATION_GENERATED, TYPE_GATEWAY_HEALTHY],
            flow_health_probing,
        )
    }

    pub fn metric(flow_health_probing: bool) -> Self {
        Self::new(
            Signal::Metric,
            TYPE_METRIC_COMPONENTS_HEALTHY,
            "MetricPipelines",
            vec![
                TYPE_CONFIGURATION_GENERATED,
                TYPE_GATEWAY_HEALTHY,
                TYPE_AGENT_HEALTHY,
            ],
            flow_health_probing,
        )
    }

    pub fn log(flow_health_probing: bool) -> Self {
        Self::new(
            Signal::Log,
            TYPE_LOG_COMPONENTS_HEALTHY,
            "LogPipelines",
            vec![TYPE_CONFIGURATION_GENERATED, TYPE_AGENT_HEALTHY],
            flow_health_probing,
        )
    }

    fn new(
        signal: Signal,
        condition_type: &'static str,
        resource_type: &'static str,
        mut priority: Vec<&'static str>,
        flow_health_probing: bool,
    ) -> Self {
        if flow_health_probing {
            priority.push(TYPE_FLOW_HEALTHY);
        }
        Self {
            signal,
            condition_type,
            resource_type,
            priority,
        }
    }

    /// Condition for the given pipelines. `extra_blockers` are other resources of the signal
    /// (log parsers) that also keep the module from being deleted.
    pub fn check<P: Pipeline>(
        &self,
        pipelines: &[P],
        extra_blockers: &[BlockingResources],
        in_deletion: bool,
    ) -> Condition {
        let has_blockers = extra_blockers.iter().any(|b| !b.names.is_empty());
        let reason = self.determine_reason(pipelines, has_blockers, in_deletion);
        let status = match reason.as_str() {
            REASON_NO_PIPELINE_DEPLOYED
            | REASON_COMPONENTS_RUNNING
            | REASON_TLS_CERTIFICATE_ABOUT_TO_EXPIRE => ConditionStatus::True,
            _ => ConditionStatus::False,
        };

        let message = if reason == REASON_RESOURCE_BLOCKS_DELETION {
            let mut blocking = vec![BlockingResources {
                resource_type: self.resource_type,
                names: pipelines.iter().map(|p| p.name().to_string()).collect(),
            }];
            blocking.extend(extra_blockers.iter().cloned());
            deletion_blocked_message(&blocking)
        } else {
            first_about_to_expire_message(pipelines)
                .unwrap_or_else(|| message_for(self.signal, &reason))
        };

        Condition::new(self.condition_type, status, reason, message)
    }

    fn determine_reason<P: Pipeline>(
        &self,
        pipelines: &[P],
        has_blockers: bool,
        in_deletion: bool,
    ) -> String {
        if pipelines.is_empty() && !has_blockers {
            return REASON_NO_PIPELINE_DEPLOYED.to_string();
        }
        if in_deletion {
            return REASON_RESOURCE_BLOCKS_DELETION.to_string();
        }
        if let Some(reason) = self.first_unhealthy_reason(pipelines) {
            return reason;
        }
        if first_about_to_expire_message(pipelines).is_some() {
            return REASON_TLS_CERTIFICATE_ABOUT_TO_EXPIRE.to_string();
        }
        REASON_COMPONENTS_RUNNING.to_string()
    }

    fn first_unhealthy_reason<P: Pipeline>(&self, pipelines: &[P]) -> Option<String> {
        self.priority.iter().find_map(|condition_type| {
            pipelines.iter().find_map(|p| {
                find_status_condition(p.conditions(), condition_type)
                    .filter(|c| c.status == ConditionStatus::False)
                    .map(|c| c.reason.clone())
            })
        })
    }
}

fn first_about_to_expire_message<P: Pipeline>(pipelines: &[P]) -> Option<String> {
    pipelines.iter().find_map(|p| {
        find_status_condition(p.conditions(), TYPE_CONFIGURATION_GENERATED)
            .filter(|c| c.reason == REASON_TLS_CERTIFICATE_ABOUT_TO_EXPIRE)
            .map(|c| c.message.clone())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{TracePipeline, TracePipelineSpec, set_status_condition};

    fn pipeline(name: &str, conditions: &[(&str, ConditionStatus, &str)]) -> TracePipeline {
        let mut p = TracePipeline::new(name, TracePipelineSpec::default());
        for (t, s, r) in conditions {
            set_status_condition(
                &mut p.status.conditions,
                Condition::new(*t, *s, *r, format!("{r} message")),
            );
        }
        p
    }

    fn healthy(name: &str) -> TracePipeline {
        pipeline(
            name,
            &[
                (TYPE_CONFIGURATION_GENERATED, ConditionStatus::True, REASON_GATEWAY_CONFIGURED),
                (TYPE_GATEWAY_HEALTHY, ConditionStatus::True, REASON_GATEWAY_READY),
            ],
        )
    }

    #[test]
    fn test_no_pipelines_is_healthy() {
        let cond = ComponentsChecker::trace(false).check::<TracePipeline>(&[], &[], true);
        assert_eq!(cond.reason, REASON_NO_PIPELINE_DEPLOYED);
        assert_eq!(cond.status, ConditionStatus::True);
        assert_eq!(cond.condition_type, TYPE_TRACE_COMPONENTS_HEALTHY);
    }

    #[test]
    fn test_deletion_blocked_lists_pipelines() {
        let cond = ComponentsChecker::trace(false).check(&[healthy("p2"), healthy("p1")], &[], true);
        assert_eq!(cond.reason, REASON_RESOURCE_BLOCKS_DELETION);
        assert_eq!(cond.status, ConditionStatus::False);
        assert_eq!(
            cond.message,
            "The deletion of the module is blocked. To unblock the deletion, delete the following resources: TracePipelines (p1,p2)"
        );
    }

    #[test]
    fn test_first_type_in_priority_wins_over_later_pipeline_order() {
        let gateway_down = pipeline(
            "a",
            &[
                (TYPE_CONFIGURATION_GENERATED, ConditionStatus::True, REASON_GATEWAY_CONFIGURED),
                (TYPE_GATEWAY_HEALTHY, ConditionStatus::False, REASON_GATEWAY_NOT_READY),
            ],
        );
        let secret_missing = pipeline(
            "b",
            &[(
                TYPE_CONFIGURATION_GENERATED,
                ConditionStatus::False,
                REASON_REFERENCED_SECRET_MISSING,
            )],
        );
        let cond = ComponentsChecker::trace(false).check(&[gateway_down, secret_missing], &[], false);
        assert_eq!(cond.reason, REASON_REFERENCED_SECRET_MISSING);
        assert_eq!(cond.status, ConditionStatus::False);
    }

    #[test]
    fn test_flow_checked_only_when_probing() {
        let mut p = healthy("p1");
        set_status_condition(
            &mut p.status.conditions,
            Condition::new(
                TYPE_FLOW_HEALTHY,
                ConditionStatus::False,
                REASON_SOME_DATA_DROPPED,
                "",
            ),
        );
        let pipelines = [p];
        assert_eq!(
            ComponentsChecker::trace(false).check(&pipelines, &[], false).reason,
            REASON_COMPONENTS_RUNNING
        );
        assert_eq!(
            ComponentsChecker::trace(true).check(&pipelines, &[], false).reason,
            REASON_SOME_DATA_DROPPED
        );
    }

    #[test]
    fn test_about_to_expire_is_a_warning_with_its_message() {
        let expiring = pipeline(
            "p1",
            &[
                (
                    TYPE_CONFIGURATION_GENERATED,
                    ConditionStatus::True,
                    REASON_TLS_CERTIFICATE_ABOUT_TO_EXPIRE,
                ),
                (TYPE_GATEWAY_HEALTHY, ConditionStatus::True, REASON_GATEWAY_READY),
            ],
        );
        let cond = ComponentsChecker::trace(false).check(&[healthy("p0"), expiring.clone()], &[], false);
        assert_eq!(cond.reason, REASON_TLS_CERTIFICATE_ABOUT_TO_EXPIRE);
        assert_eq!(cond.status, ConditionStatus::True);
        assert_eq!(cond.message, "TLSCertificateAboutToExpire message");

        // a failing gateway decides the reason, the expiry message still wins
        let mut broken = healthy("p2");
        set_status_condition(
            &mut broken.status.conditions,
            Condition::new(TYPE_GATEWAY_HEALTHY, ConditionStatus::False, REASON_GATEWAY_NOT_READY, ""),
        );
        let cond = ComponentsChecker::trace(false).check(&[expiring, broken], &[], false);
        assert_eq!(cond.reason, REASON_GATEWAY_NOT_READY);
        assert_eq!(cond.message, "TLSCertificateAboutToExpire message");
    }

    #[test]
    fn test_all_healthy_is_running() {
        let cond = ComponentsChecker::trace(false).check(&[healthy("p1")], &[], false);
        assert_eq!(cond.reason, REASON_COMPONENTS_RUNNING);
        assert_eq!(cond.message, "All components are running");
    }

    #[test]
    fn test_log_parsers_block_deletion() {
        let parsers = [BlockingResources {
            resource_type: "LogParsers",
            names: vec!["regex".to_string()],
        }];
        let cond = ComponentsChecker::log(false).check::<common::LogPipeline>(&[], &parsers, true);
        assert_eq!(cond.reason, REASON_RESOURCE_BLOCKS_DELETION);
        assert!(cond.message.ends_with("LogParsers (regex)"));
    }
}
