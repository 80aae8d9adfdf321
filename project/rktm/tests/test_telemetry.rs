mod support;

use anyhow::Result;
use common::*;
use rktm::api::Registry;
use rktm::conditions::*;
use rktm::controllers::TelemetryController;
use rktm::controllers::telemetry::FINALIZER;
use support::*;

fn telemetry_key() -> NamespacedName {
    NamespacedName::new(NS, "default")
}

async fn telemetry(registry: &Registry) -> Result<Option<Telemetry>> {
    Ok(registry
        .get::<Telemetry>(&telemetry_key())
        .await?
        .map(|v| v.object))
}

fn trace_pipeline(name: &str) -> TracePipeline {
    TracePipeline::new(
        name,
        TracePipelineSpec {
            output: TracePipelineOutput {
                otlp: Some(OtlpOutput::grpc("http://jaeger:4317")),
            },
        },
    )
}

#[tokio::test]
async fn test_module_status_follows_pipelines_and_holds_deletion() -> Result<()> {
    init_logger();
    let registry = Registry::in_memory();
    let controller = TelemetryController::new(registry.clone(), overrides(&registry), NS, false);
    registry
        .create(Telemetry::new(
            ObjectMeta::namespaced(NS, "default"),
            TelemetrySpec::default(),
        ))
        .await?;

    controller.reconcile_telemetry("default").await?;
    let t = telemetry(&registry).await?.expect("telemetry should exist");
    assert_eq!(t.status.state, TelemetryState::Ready);
    assert_eq!(t.metadata.finalizers, vec![FINALIZER.to_string()]);
    for condition_type in [
        TYPE_LOG_COMPONENTS_HEALTHY,
        TYPE_METRIC_COMPONENTS_HEALTHY,
        TYPE_TRACE_COMPONENTS_HEALTHY,
    ] {
        let c = find_status_condition(&t.status.conditions, condition_type).expect("condition");
        assert_eq!(c.reason, REASON_NO_PIPELINE_DEPLOYED);
        assert_eq!(c.status, ConditionStatus::True);
    }

    // an unhealthy gateway turns the module into a warning
    let prober = StubProber::new(false);
    registry.create(trace_pipeline("p1")).await?;
    trace_reconciler(&registry, 5, &prober)
        .reconcile_pipeline("p1")
        .await?;
    controller.reconcile_telemetry("default").await?;
    let t = telemetry(&registry).await?.expect("telemetry should exist");
    assert_eq!(t.status.state, TelemetryState::Warning);
    let trace = find_status_condition(&t.status.conditions, TYPE_TRACE_COMPONENTS_HEALTHY)
        .expect("trace condition");
    assert_eq!(trace.reason, REASON_GATEWAY_NOT_READY);
    assert_eq!(trace.message, "Trace gateway Deployment is not ready");

    // deletion is held while the pipeline exists
    registry.delete::<Telemetry>(&telemetry_key()).await?;
    controller.reconcile_telemetry("default").await?;
    let t = telemetry(&registry).await?.expect("telemetry is held by its finalizer");
    assert_eq!(t.status.state, TelemetryState::Deleting);
    let trace = find_status_condition(&t.status.conditions, TYPE_TRACE_COMPONENTS_HEALTHY)
        .expect("trace condition");
    assert_eq!(trace.reason, REASON_RESOURCE_BLOCKS_DELETION);
    assert!(trace.message.ends_with("TracePipelines (p1)"));

    registry
        .delete::<TracePipeline>(&NamespacedName::cluster("p1"))
        .await?;
    controller.reconcile_telemetry("default").await?;
    assert!(telemetry(&registry).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_paused_telemetry_is_left_alone() -> Result<()> {
    init_logger();
    let registry = Registry::in_memory();
    let controller = TelemetryController::new(registry.clone(), overrides(&registry), NS, false);
    put_overrides(&registry, "telemetry:\n  paused: true\n").await?;
    registry
        .create(Telemetry::new(
            ObjectMeta::namespaced(NS, "default"),
            TelemetrySpec::default(),
        ))
        .await?;

    controller.reconcile_telemetry("default").await?;
    let t = telemetry(&registry).await?.expect("telemetry should exist");
    assert!(t.status.conditions.is_empty());
    assert!(t.metadata.finalizers.is_empty());
    Ok(())
}
