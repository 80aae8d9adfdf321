use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::sync::OnceLock;
use std::time::Duration;

static CONFIG: OnceLock<Config> = OnceLock::new();

/// The process-wide configuration. Only valid after `load_config` succeeded.
pub fn config_ref() -> Option<&'static Config> {
    CONFIG.get()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    // namespace of every managed object
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_resync_period_secs")]
    pub resync_period_secs: u64,
    #[serde(default)]
    pub reconcile_timeout_secs: Option<u64>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub flow_health_probing: bool,
    // ConfigMap the self-monitor publishes per-pipeline flow health into
    #[serde(default = "default_self_monitor_results")]
    pub self_monitor_results: String,
    #[serde(default = "default_overrides_config_map")]
    pub overrides_config_map: String,
    #[serde(default = "default_telemetry_name")]
    pub telemetry_name: String,
    #[serde(default)]
    pub trace: TraceConfig,
    #[serde(default)]
    pub metric: MetricConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            namespace: default_namespace(),
            workers: default_workers(),
            resync_period_secs: default_resync_period_secs(),
            reconcile_timeout_secs: None,
            log_level: default_log_level(),
            flow_health_probing: false,
            self_monitor_results: default_self_monitor_results(),
            overrides_config_map: default_overrides_config_map(),
            telemetry_name: default_telemetry_name(),
            trace: TraceConfig::default(),
            metric: MetricConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Config {
    pub fn resync_period(&self) -> Duration {
        Duration::from_secs(self.resync_period_secs.max(1))
    }

    pub fn reconcile_timeout(&self) -> Option<Duration> {
        self.reconcile_timeout_secs.map(Duration::from_secs)
    }

    pub fn default_level_filter(&self) -> log::LevelFilter {
        self.log_level.parse().unwrap_or(log::LevelFilter::Info)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Xline,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            endpoints: default_endpoints(),
        }
    }
}

/// Container resources as `base + perPipeline * pipelineCount`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSettings {
    pub base_cpu_limit_millis: u32,
    pub per_pipeline_cpu_limit_millis: u32,
    pub base_memory_limit_mib: u32,
    pub per_pipeline_memory_limit_mib: u32,
    pub cpu_request_millis: u32,
    pub memory_request_mib: u32,
}

impl Default for ResourceSettings {
    fn default() -> Self {
        Self {
            base_cpu_limit_millis: 700,
            per_pipeline_cpu_limit_millis: 500,
            base_memory_limit_mib: 500,
            per_pipeline_memory_limit_mib: 1500,
            cpu_request_millis: 100,
            memory_request_mib: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Deployment, ConfigMap, Secret and NetworkPolicy name.
    pub name: String,
    /// Service receiving OTLP traffic.
    pub otlp_service_name: String,
    pub image: String,
    #[serde(default)]
    pub priority_class_name: Option<String>,
    #[serde(default)]
    pub resources: ResourceSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub priority_class_name: Option<String>,
    #[serde(default)]
    pub resources: ResourceSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TraceConfig {
    pub max_pipelines: usize,
    pub gateway: GatewayConfig,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            max_pipelines: 3,
            gateway: GatewayConfig {
                name: "telemetry-trace-collector".to_string(),
                otlp_service_name: "telemetry-otlp-traces".to_string(),
                image: default_otel_image(),
                priority_class_name: None,
                resources: ResourceSettings::default(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricConfig {
    pub max_pipelines: usize,
    pub gateway: GatewayConfig,
    pub agent: AgentConfig,
}

impl Default for MetricConfig {
    fn default() -> Self {
        Self {
            max_pipelines: 3,
            gateway: GatewayConfig {
                name: "telemetry-metric-gateway".to_string(),
                otlp_service_name: "telemetry-otlp-metrics".to_string(),
                image: default_otel_image(),
                priority_class_name: None,
                resources: ResourceSettings::default(),
            },
            agent: AgentConfig {
                name: "telemetry-metric-agent".to_string(),
                image: default_otel_image(),
                priority_class_name: None,
                resources: ResourceSettings {
                    base_cpu_limit_millis: 1000,
                    per_pipeline_cpu_limit_millis: 0,
                    base_memory_limit_mib: 1200,
                    per_pipeline_memory_limit_mib: 0,
                    cpu_request_millis: 15,
                    memory_request_mib: 50,
                },
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    pub max_pipelines: usize,
    /// Fluent Bit DaemonSet; also prefixes its ConfigMaps and Secrets.
    pub daemon_set: String,
    pub image: String,
    #[serde(default)]
    pub priority_class_name: Option<String>,
    #[serde(default)]
    pub resources: ResourceSettings,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_pipelines: 5,
            daemon_set: "telemetry-fluent-bit".to_string(),
            image: "europe-docker.pkg.dev/kyma-project/prod/tpi/fluent-bit:3.0.3".to_string(),
            priority_class_name: None,
            resources: ResourceSettings {
                base_cpu_limit_millis: 1000,
                per_pipeline_cpu_limit_millis: 0,
                base_memory_limit_mib: 1024,
                per_pipeline_memory_limit_mib: 0,
                cpu_request_millis: 100,
                memory_request_mib: 50,
            },
        }
    }
}

fn default_namespace() -> String {
    "kyma-system".to_string()
}

fn default_workers() -> usize {
    2
}

fn default_resync_period_secs() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_self_monitor_results() -> String {
    "telemetry-self-monitor-results".to_string()
}

fn default_overrides_config_map() -> String {
    "telemetry-override-config".to_string()
}

fn default_telemetry_name() -> String {
    "default".to_string()
}

fn default_endpoints() -> Vec<String> {
    vec!["127.0.0.1:2379".to_string()]
}

fn default_otel_image() -> String {
    "europe-docker.pkg.dev/kyma-project/prod/tpi/otel-collector:0.102.1".to_string()
}

pub fn parse_config(content: &str) -> anyhow::Result<Config> {
    let cfg: Config = serde_yaml::from_str(content).context("Failed to parse YAML config")?;
    if cfg.workers == 0 {
        return Err(crate::errors::ControllerError::ConfigurationInvalid(
            "workers must be at least 1".to_string(),
        )
        .into());
    }
    Ok(cfg)
}

pub fn load_config(path: &str) -> anyhow::Result<&'static Config> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read config from {path}"))?;
    let cfg = parse_config(&content)?;
    let cfg = CONFIG.get_or_init(|| cfg);
    Ok(cfg)
}
