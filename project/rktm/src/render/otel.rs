//! OpenTelemetry collector configs: trace and metric gateways, metric agent.

use crate::api::Registry;
use crate::errors::ControllerError;
use crate::ports;
use crate::render::{EnvVars, sanitize_env_name};
use crate::secretref::resolve_value;
use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use common::{MetricPipeline, NamespacedName, OtlpOutput, Resource, TracePipeline, ValueType};
use serde::Serialize;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CollectorConfig {
    pub extensions: BTreeMap<String, Value>,
    pub receivers: BTreeMap<String, Value>,
    pub processors: BTreeMap<String, Value>,
    pub exporters: BTreeMap<String, Value>,
    pub service: ServiceConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServiceConfig {
    pub pipelines: BTreeMap<String, PipelineConfig>,
    pub telemetry: TelemetryConfig,
    pub extensions: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineConfig {
    pub receivers: Vec<String>,
    pub processors: Vec<String>,
    pub exporters: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryConfig {
    pub metrics: TelemetryMetrics,
    pub logs: TelemetryLogs,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryMetrics {
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryLogs {
    pub level: String,
    pub encoding: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            metrics: TelemetryMetrics {
                address: format!("${{MY_POD_IP}}:{}", ports::METRICS),
            },
            logs: TelemetryLogs {
                level: "info".to_string(),
                encoding: "json".to_string(),
            },
        }
    }
}

impl CollectorConfig {
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("failed to marshal collector config")
    }
}

#[derive(Serialize)]
struct ExporterTls {
    insecure: bool,
    insecure_skip_verify: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    ca_pem: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cert_pem: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    key_pem: Option<String>,
}

#[derive(Serialize)]
struct SendingQueue {
    enabled: bool,
    queue_size: u32,
}

#[derive(Serialize)]
struct RetryOnFailure {
    enabled: bool,
    initial_interval: String,
    max_interval: String,
    max_elapsed_time: String,
}

#[derive(Serialize)]
struct OtlpExporter {
    endpoint: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    headers: BTreeMap<String, String>,
    tls: ExporterTls,
    sending_queue: SendingQueue,
    retry_on_failure: RetryOnFailure,
}

fn to_value<T: Serialize>(value: &T) -> Result<Value> {
    serde_yaml::to_value(value).context("failed to encode collector component")
}

fn mapping(entries: &[(&str, Value)]) -> Value {
    let mut map = Mapping::new();
    for (k, v) in entries {
        map.insert(Value::from(*k), v.clone());
    }
    Value::Mapping(map)
}

async fn resolve_required(
    registry: &Registry,
    pipeline: &str,
    what: &str,
    value: &ValueType,
) -> Result<String> {
    resolve_value(registry, value).await?.ok_or_else(|| {
        ControllerError::ConfigurationInvalid(format!("{what} of pipeline {pipeline} is not resolvable"))
            .into()
    })
}

/// The OTLP exporter of one pipeline, with its secret material moved into `env`.
async fn make_otlp_exporter(
    registry: &Registry,
    pipeline: &str,
    otlp: &OtlpOutput,
    queue_size: u32,
    env: &mut EnvVars,
) -> Result<(String, Value)> {
    let suffix = sanitize_env_name(pipeline);

    let mut endpoint = resolve_required(registry, pipeline, "endpoint", &otlp.endpoint).await?;
    if let Some(path) = otlp.path.as_deref().filter(|p| !p.is_empty()) {
        endpoint = format!("{}/{}", endpoint.trim_end_matches('/'), path.trim_start_matches('/'));
    }
    let endpoint_var = format!("OTLP_ENDPOINT_{suffix}");
    env.insert(endpoint_var.clone(), endpoint);

    let mut headers = BTreeMap::new();
    if let Some(basic) = otlp.authentication.as_ref().and_then(|a| a.basic.as_ref()) {
        let user = resolve_required(registry, pipeline, "basic auth user", &basic.user).await?;
        let password =
            resolve_required(registry, pipeline, "basic auth password", &basic.password).await?;
        let var = format!("BASIC_AUTH_HEADER_{suffix}");
        env.insert(
            var.clone(),
            format!("Basic {}", STANDARD.encode(format!("{user}:{password}"))),
        );
        headers.insert("Authorization".to_string(), format!("${{{var}}}"));
    }
    for header in &otlp.headers {
        let value = resolve_required(registry, pipeline, "header", &header.value).await?;
        let var = format!("HEADER_{suffix}_{}", sanitize_env_name(&header.name));
        let value = match header.prefix.as_deref() {
            Some(prefix) if !prefix.is_empty() => format!("{prefix} {value}"),
            _ => value,
        };
        env.insert(var.clone(), value);
        headers.insert(header.name.clone(), format!("${{{var}}}"));
    }

    let mut tls = ExporterTls {
        insecure: false,
        insecure_skip_verify: false,
        ca_pem: None,
        cert_pem: None,
        key_pem: None,
    };
    if let Some(cfg) = &otlp.tls {
        tls.insecure = cfg.insecure;
        tls.insecure_skip_verify = cfg.insecure_skip_verify;
        for (name, value, slot) in [
            ("CA", &cfg.ca, &mut tls.ca_pem),
            ("CERT", &cfg.cert, &mut tls.cert_pem),
            ("KEY", &cfg.key, &mut tls.key_pem),
        ] {
            if let Some(value) = value {
                let pem = resolve_required(registry, pipeline, "tls material", value).await?;
                let var = format!("OTLP_TLS_{name}_PEM_{suffix}");
                env.insert(var.clone(), pem);
                *slot = Some(format!("${{{var}}}"));
            }
        }
    }

    let exporter_type = if otlp.protocol == "http" {
        "otlphttp"
    } else {
        "otlp"
    };
    let exporter = OtlpExporter {
        endpoint: format!("${{{endpoint_var}}}"),
        headers,
        tls,
        sending_queue: SendingQueue {
            enabled: true,
            queue_size,
        },
        retry_on_failure: RetryOnFailure {
            enabled: true,
            initial_interval: "5s".to_string(),
            max_interval: "30s".to_string(),
            max_elapsed_time: "300s".to_string(),
        },
    };
    Ok((format!("{exporter_type}/{pipeline}"), to_value(&exporter)?))
}

fn otlp_receiver() -> Value {
    mapping(&[(
        "protocols",
        mapping(&[
            (
                "grpc",
                mapping(&[(
                    "endpoint",
                    Value::from(format!("${{MY_POD_IP}}:{}", ports::OTLP_GRPC)),
                )]),
            ),
            (
                "http",
                mapping(&[(
                    "endpoint",
                    Value::from(format!("${{MY_POD_IP}}:{}", ports::OTLP_HTTP)),
                )]),
            ),
        ]),
    )])
}

fn gateway_base() -> CollectorConfig {
    let mut cfg = CollectorConfig::default();
    cfg.extensions.insert(
        "health_check".to_string(),
        mapping(&[(
            "endpoint",
            Value::from(format!("${{MY_POD_IP}}:{}", ports::HEALTH_CHECK)),
        )]),
    );
    cfg.service.extensions.push("health_check".to_string());
    cfg.receivers.insert("otlp".to_string(), otlp_receiver());
    cfg.processors.insert(
        "memory_limiter".to_string(),
        mapping(&[
            ("check_interval", Value::from("1s")),
            ("limit_percentage", Value::from(75)),
            ("spike_limit_percentage", Value::from(15)),
        ]),
    );
    cfg.processors.insert(
        "batch".to_string(),
        mapping(&[
            ("send_batch_size", Value::from(512)),
            ("timeout", Value::from("10s")),
            ("send_batch_max_size", Value::from(512)),
        ]),
    );
    cfg.processors.insert(
        "k8sattributes".to_string(),
        mapping(&[
            ("auth_type", Value::from("serviceAccount")),
            ("passthrough", Value::from(false)),
        ]),
    );
    cfg
}

fn gateway_processors() -> Vec<String> {
    ["memory_limiter", "k8sattributes", "batch"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// Trace gateway config: one `traces/<pipeline>` pipeline per reconcilable pipeline.
pub async fn make_trace_gateway_config(
    registry: &Registry,
    pipelines: &[TracePipeline],
) -> Result<(CollectorConfig, EnvVars)> {
    let mut cfg = gateway_base();
    let mut env = EnvVars::new();
    for pipeline in pipelines {
        let Some(otlp) = &pipeline.spec.output.otlp else {
            continue;
        };
        let (exporter_id, exporter) =
            make_otlp_exporter(registry, pipeline.name(), otlp, 256, &mut env).await?;
        cfg.exporters.insert(exporter_id.clone(), exporter);
        cfg.service.pipelines.insert(
            format!("traces/{}", pipeline.name()),
            PipelineConfig {
                receivers: vec!["otlp".to_string()],
                processors: gateway_processors(),
                exporters: vec![exporter_id],
            },
        );
    }
    Ok((cfg, env))
}

/// Metric gateway config: one `metrics/<pipeline>` pipeline per reconcilable pipeline.
pub async fn make_metric_gateway_config(
    registry: &Registry,
    pipelines: &[MetricPipeline],
) -> Result<(CollectorConfig, EnvVars)> {
    let mut cfg = gateway_base();
    let mut env = EnvVars::new();
    for pipeline in pipelines {
        let Some(otlp) = &pipeline.spec.output.otlp else {
            continue;
        };
        let (exporter_id, exporter) =
            make_otlp_exporter(registry, pipeline.name(), otlp, 256, &mut env).await?;
        cfg.exporters.insert(exporter_id.clone(), exporter);

        let mut processors = gateway_processors();
        // inputs the pipeline did not ask for are dropped in the gateway
        let mut dropped = Vec::new();
        if !pipeline.spec.input.runtime_enabled() {
            dropped.push("runtime");
        }
        if !pipeline.spec.input.prometheus_enabled() {
            dropped.push("prometheus");
        }
        if !pipeline.spec.input.istio_enabled() {
            dropped.push("istio");
        }
        if !dropped.is_empty() {
            let id = format!("filter/{}-drop-inputs", pipeline.name());
            let conditions: Vec<Value> = dropped
                .iter()
                .map(|input| {
                    Value::from(format!(
                        "resource.attributes[\"kyma.source\"] == \"{input}\""
                    ))
                })
                .collect();
            cfg.processors.insert(
                id.clone(),
                mapping(&[(
                    "metrics",
                    mapping(&[("metric", Value::Sequence(conditions))]),
                )]),
            );
            processors.insert(2, id);
        }

        cfg.service.pipelines.insert(
            format!("metrics/{}", pipeline.name()),
            PipelineConfig {
                receivers: vec!["otlp".to_string()],
                processors,
                exporters: vec![exporter_id],
            },
        );
    }
    Ok((cfg, env))
}

/// Metric agent config. Enabled inputs across all pipelines are scraped once and sent to the
/// gateway's OTLP service.
pub fn make_metric_agent_config(
    gateway_service: &NamespacedName,
    pipelines: &[MetricPipeline],
    istio_active: bool,
) -> CollectorConfig {
    let mut cfg = CollectorConfig::default();
    cfg.extensions.insert(
        "health_check".to_string(),
        mapping(&[(
            "endpoint",
            Value::from(format!("${{MY_POD_IP}}:{}", ports::HEALTH_CHECK)),
        )]),
    );
    cfg.service.extensions.push("health_check".to_string());

    let runtime = pipelines.iter().any(|p| p.spec.input.runtime_enabled());
    let prometheus = pipelines.iter().any(|p| p.spec.input.prometheus_enabled());
    let istio = pipelines.iter().any(|p| p.spec.input.istio_enabled());

    cfg.exporters.insert(
        "otlp".to_string(),
        mapping(&[
            (
                "endpoint",
                Value::from(format!(
                    "{}.{}:{}",
                    gateway_service.name,
                    gateway_service.namespace,
                    ports::OTLP_GRPC
                )),
            ),
            ("tls", mapping(&[("insecure", Value::from(true))])),
        ]),
    );
    cfg.processors.insert(
        "memory_limiter".to_string(),
        mapping(&[
            ("check_interval", Value::from("1s")),
            ("limit_percentage", Value::from(75)),
            ("spike_limit_percentage", Value::from(15)),
        ]),
    );

    let mut add_input = |id: &str, receiver: Value, source: &str| {
        cfg.receivers.insert(id.to_string(), receiver);
        let processor = format!("resource/{source}");
        cfg.processors.insert(
            processor.clone(),
            mapping(&[(
                "attributes",
                Value::Sequence(vec![mapping(&[
                    ("action", Value::from("insert")),
                    ("key", Value::from("kyma.source")),
                    ("value", Value::from(source)),
                ])]),
            )]),
        );
        cfg.service.pipelines.insert(
            format!("metrics/{source}"),
            PipelineConfig {
                receivers: vec![id.to_string()],
                processors: vec!["memory_limiter".to_string(), processor],
                exporters: vec!["otlp".to_string()],
            },
        );
    };

    if runtime {
        add_input(
            "kubeletstats",
            mapping(&[
                ("collection_interval", Value::from("30s")),
                ("auth_type", Value::from("serviceAccount")),
                (
                    "endpoint",
                    Value::from("https://${env:MY_NODE_NAME}:10250"),
                ),
                ("insecure_skip_verify", Value::from(true)),
            ]),
            "runtime",
        );
    }
    if prometheus {
        // with a mesh, app pods are scraped over the sidecar's mTLS certificates
        let scheme = if istio_active { "https" } else { "http" };
        add_input(
            "prometheus/app-pods",
            mapping(&[(
                "config",
                mapping(&[(
                    "scrape_configs",
                    Value::Sequence(vec![mapping(&[
                        ("job_name", Value::from("app-pods")),
                        ("scrape_interval", Value::from("30s")),
                        ("scheme", Value::from(scheme)),
                    ])]),
                )]),
            )]),
            "prometheus",
        );
    }
    if istio {
        add_input(
            "prometheus/istio",
            mapping(&[(
                "config",
                mapping(&[(
                    "scrape_configs",
                    Value::Sequence(vec![mapping(&[
                        ("job_name", Value::from("istio-proxy")),
                        ("scrape_interval", Value::from("30s")),
                        ("metrics_path", Value::from("/stats/prometheus")),
                    ])]),
                )]),
            )]),
            "istio",
        );
    }
    cfg
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{
        BasicAuth, AuthenticationOptions, Header, MetricInputToggle, MetricPipelineInput,
        MetricPipelineOutput, MetricPipelineSpec, ObjectMeta, Secret, TracePipelineOutput,
        TracePipelineSpec,
    };

    fn trace(name: &str, otlp: OtlpOutput) -> TracePipeline {
        TracePipeline::new(
            name,
            TracePipelineSpec {
                output: TracePipelineOutput { otlp: Some(otlp) },
            },
        )
    }

    #[tokio::test]
    async fn test_trace_gateway_has_one_pipeline_per_input() {
        let registry = Registry::in_memory();
        let pipelines = vec![
            trace("p1", OtlpOutput::grpc("http://a:4317")),
            trace("p2", OtlpOutput::grpc("http://b:4317")),
        ];
        let (cfg, env) = make_trace_gateway_config(&registry, &pipelines)
            .await
            .unwrap();
        assert_eq!(
            cfg.service.pipelines.keys().collect::<Vec<_>>(),
            vec!["traces/p1", "traces/p2"]
        );
        assert!(cfg.exporters.contains_key("otlp/p1"));
        assert_eq!(env.get("OTLP_ENDPOINT_P1").unwrap(), "http://a:4317");
        // secrets never end up in the config itself
        assert!(!cfg.to_yaml().unwrap().contains("http://a:4317"));
    }

    #[tokio::test]
    async fn test_secret_material_is_moved_to_env() {
        let registry = Registry::in_memory();
        let mut data = BTreeMap::new();
        data.insert("user".to_string(), "alice".to_string());
        data.insert("token".to_string(), "s3cr3t".to_string());
        registry
            .apply(&Secret::new(ObjectMeta::namespaced("default", "creds"), data))
            .await
            .unwrap();

        let mut otlp = OtlpOutput::grpc("http://a:4317");
        otlp.protocol = "http".to_string();
        otlp.authentication = Some(AuthenticationOptions {
            basic: Some(BasicAuth {
                user: ValueType::from_secret("creds", "default", "user"),
                password: ValueType::inline("pw"),
            }),
        });
        otlp.headers.push(Header {
            name: "x-token".to_string(),
            prefix: Some("Bearer".to_string()),
            value: ValueType::from_secret("creds", "default", "token"),
        });
        let (cfg, env) = make_trace_gateway_config(&registry, &[trace("p1", otlp)])
            .await
            .unwrap();

        assert!(cfg.exporters.contains_key("otlphttp/p1"));
        assert_eq!(
            env.get("BASIC_AUTH_HEADER_P1").unwrap(),
            &format!("Basic {}", STANDARD.encode("alice:pw"))
        );
        assert_eq!(env.get("HEADER_P1_X_TOKEN").unwrap(), "Bearer s3cr3t");
    }

    #[tokio::test]
    async fn test_unresolvable_endpoint_fails() {
        let registry = Registry::in_memory();
        let mut otlp = OtlpOutput::grpc("");
        otlp.endpoint = ValueType::from_secret("missing", "default", "endpoint");
        assert!(
            make_trace_gateway_config(&registry, &[trace("p1", otlp)])
                .await
                .is_err()
        );
    }

    #[test]
    fn test_metric_agent_scrapes_enabled_inputs_once() {
        let pipeline = |name: &str, runtime: bool| {
            MetricPipeline::new(
                name,
                MetricPipelineSpec {
                    input: MetricPipelineInput {
                        runtime: Some(MetricInputToggle { enabled: runtime }),
                        prometheus: None,
                        istio: None,
                    },
                    output: MetricPipelineOutput {
                        otlp: Some(OtlpOutput::grpc("http://a:4317")),
                    },
                },
            )
        };
        let cfg = make_metric_agent_config(
            &NamespacedName::new("kyma-system", "telemetry-otlp-metrics"),
            &[pipeline("a", true), pipeline("b", true), pipeline("c", false)],
            false,
        );
        assert_eq!(
            cfg.service.pipelines.keys().collect::<Vec<_>>(),
            vec!["metrics/runtime"]
        );
        let yaml = cfg.to_yaml().unwrap();
        assert!(yaml.contains("telemetry-otlp-metrics.kyma-system:4317"));
    }
}
