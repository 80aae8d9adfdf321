//! Telemetry resources: the three pipeline kinds, log parsers, the cluster-wide `Telemetry`
//! object and the per-kind quota lock.

use crate::{Condition, ObjectMeta, Resource, ResourceKind};
use serde::{Deserialize, Serialize};

pub const TELEMETRY_API_VERSION: &str = "telemetry.kyma-project.io/v1alpha1";
pub const OPERATOR_API_VERSION: &str = "operator.kyma-project.io/v1alpha1";

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct SecretKeyRef {
    pub name: String,
    pub namespace: String,
    pub key: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ValueFromSource {
    #[serde(rename = "secretKeyRef", default, skip_serializing_if = "Option::is_none")]
    pub secret_key_ref: Option<SecretKeyRef>,
}

/// Either an inline value or a reference to a secret key.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ValueType {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(rename = "valueFrom", default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<ValueFromSource>,
}

impl ValueType {
    pub fn inline(value: impl Into<String>) -> Self {
        Self {
            value: Some(value.into()),
            value_from: None,
        }
    }

    pub fn from_secret(
        name: impl Into<String>,
        namespace: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            value: None,
            value_from: Some(ValueFromSource {
                secret_key_ref: Some(SecretKeyRef {
                    name: name.into(),
                    namespace: namespace.into(),
                    key: key.into(),
                }),
            }),
        }
    }

    pub fn secret_key_ref(&self) -> Option<&SecretKeyRef> {
        self.value_from
            .as_ref()
            .and_then(|v| v.secret_key_ref.as_ref())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct BasicAuth {
    pub user: ValueType,
    pub password: ValueType,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct AuthenticationOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic: Option<BasicAuth>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct Header {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(flatten)]
    pub value: ValueType,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct OtlpTlsConfig {
    #[serde(default)]
    pub insecure: bool,
    #[serde(rename = "insecureSkipVerify", default)]
    pub insecure_skip_verify: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<ValueType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert: Option<ValueType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<ValueType>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct OtlpOutput {
    #[serde(default = "default_otlp_protocol")]
    pub protocol: String,
    pub endpoint: ValueType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<AuthenticationOptions>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<Header>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<OtlpTlsConfig>,
}

fn default_otlp_protocol() -> String {
    "grpc".to_string()
}

impl OtlpOutput {
    pub fn grpc(endpoint: impl Into<String>) -> Self {
        Self {
            protocol: default_otlp_protocol(),
            endpoint: ValueType::inline(endpoint),
            ..Default::default()
        }
    }

    fn value_refs(&self) -> Vec<&ValueType> {
        let mut refs = vec![&self.endpoint];
        if let Some(basic) = self
            .authentication
            .as_ref()
            .and_then(|a| a.basic.as_ref())
        {
            refs.push(&basic.user);
            refs.push(&basic.password);
        }
        refs.extend(self.headers.iter().map(|h| &h.value));
        if let Some(tls) = &self.tls {
            refs.extend([&tls.ca, &tls.cert, &tls.key].into_iter().flatten());
        }
        refs
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub enum PipelinePhase {
    #[default]
    Pending,
    Running,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct PipelineStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Legacy coarse state, mirrors the `Pending`/`Running` conditions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<PipelinePhase>,
}

/// Pipeline material that the filter and status code look at regardless of kind.
pub trait Pipeline: Resource {
    fn status(&self) -> &PipelineStatus;
    fn status_mut(&mut self) -> &mut PipelineStatus;

    /// Every secret key this pipeline depends on.
    fn secret_refs(&self) -> Vec<&SecretKeyRef>;

    /// Client certificate and key, if the output declares TLS client material.
    fn tls_client_material(&self) -> Option<(Option<&ValueType>, Option<&ValueType>)>;

    fn conditions(&self) -> &[Condition] {
        &self.status().conditions
    }
}

fn otlp_tls_material(otlp: Option<&OtlpOutput>) -> Option<(Option<&ValueType>, Option<&ValueType>)> {
    let tls = otlp?.tls.as_ref()?;
    if tls.cert.is_none() && tls.key.is_none() {
        return None;
    }
    Some((tls.cert.as_ref(), tls.key.as_ref()))
}

// --- TracePipeline ---

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct TracePipelineOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub otlp: Option<OtlpOutput>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct TracePipelineSpec {
    pub output: TracePipelineOutput,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TracePipeline {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: TracePipelineSpec,
    #[serde(default)]
    pub status: PipelineStatus,
}

impl TracePipeline {
    pub fn new(name: impl Into<String>, spec: TracePipelineSpec) -> Self {
        Self {
            api_version: TELEMETRY_API_VERSION.to_string(),
            kind: "TracePipeline".to_string(),
            metadata: ObjectMeta::named(name),
            spec,
            status: PipelineStatus::default(),
        }
    }
}

crate::impl_resource!(
    TracePipeline,
    ResourceKind::TracePipeline,
    TELEMETRY_API_VERSION
);

impl Pipeline for TracePipeline {
    fn status(&self) -> &PipelineStatus {
        &self.status
    }

    fn status_mut(&mut self) -> &mut PipelineStatus {
        &mut self.status
    }

    fn secret_refs(&self) -> Vec<&SecretKeyRef> {
        self.spec
            .output
            .otlp
            .iter()
            .flat_map(|o| o.value_refs())
            .filter_map(|v| v.secret_key_ref())
            .collect()
    }

    fn tls_client_material(&self) -> Option<(Option<&ValueType>, Option<&ValueType>)> {
        otlp_tls_material(self.spec.output.otlp.as_ref())
    }
}

// --- MetricPipeline ---

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct MetricInputToggle {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct MetricPipelineInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<MetricInputToggle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prometheus: Option<MetricInputToggle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub istio: Option<MetricInputToggle>,
}

impl MetricPipelineInput {
    pub fn runtime_enabled(&self) -> bool {
        self.runtime.as_ref().is_some_and(|i| i.enabled)
    }

    pub fn prometheus_enabled(&self) -> bool {
        self.prometheus.as_ref().is_some_and(|i| i.enabled)
    }

    pub fn istio_enabled(&self) -> bool {
        self.istio.as_ref().is_some_and(|i| i.enabled)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct MetricPipelineOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub otlp: Option<OtlpOutput>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct MetricPipelineSpec {
    #[serde(default)]
    pub input: MetricPipelineInput,
    pub output: MetricPipelineOutput,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct MetricPipeline {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: MetricPipelineSpec,
    #[serde(default)]
    pub status: PipelineStatus,
}

impl MetricPipeline {
    pub fn new(name: impl Into<String>, spec: MetricPipelineSpec) -> Self {
        Self {
            api_version: TELEMETRY_API_VERSION.to_string(),
            kind: "MetricPipeline".to_string(),
            metadata: ObjectMeta::named(name),
            spec,
            status: PipelineStatus::default(),
        }
    }
}

crate::impl_resource!(
    MetricPipeline,
    ResourceKind::MetricPipeline,
    TELEMETRY_API_VERSION
);

impl Pipeline for MetricPipeline {
    fn status(&self) -> &PipelineStatus {
        &self.status
    }

    fn status_mut(&mut self) -> &mut PipelineStatus {
        &mut self.status
    }

    fn secret_refs(&self) -> Vec<&SecretKeyRef> {
        self.spec
            .output
            .otlp
            .iter()
            .flat_map(|o| o.value_refs())
            .filter_map(|v| v.secret_key_ref())
            .collect()
    }

    fn tls_client_material(&self) -> Option<(Option<&ValueType>, Option<&ValueType>)> {
        otlp_tls_material(self.spec.output.otlp.as_ref())
    }
}

// --- LogPipeline ---

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct InputNamespaces {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub system: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct InputContainers {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ApplicationInput {
    #[serde(default)]
    pub namespaces: InputNamespaces,
    #[serde(default)]
    pub containers: InputContainers,
    #[serde(rename = "keepAnnotations", default)]
    pub keep_annotations: bool,
    #[serde(rename = "dropLabels", default)]
    pub drop_labels: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct LogPipelineInput {
    #[serde(default)]
    pub application: ApplicationInput,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct LogFilter {
    #[serde(default)]
    pub custom: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct LogTlsConfig {
    #[serde(default)]
    pub disabled: bool,
    #[serde(rename = "skipCertificateValidation", default)]
    pub skip_certificate_validation: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<ValueType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert: Option<ValueType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<ValueType>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct HttpOutput {
    pub host: ValueType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<ValueType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<ValueType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compress: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default)]
    pub tls: LogTlsConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct LogPipelineOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpOutput>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct FileMount {
    pub name: String,
    pub content: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct VariableRef {
    pub name: String,
    #[serde(rename = "valueFrom")]
    pub value_from: ValueFromSource,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct LogPipelineSpec {
    #[serde(default)]
    pub input: LogPipelineInput,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<LogFilter>,
    pub output: LogPipelineOutput,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileMount>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<VariableRef>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LogPipeline {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: LogPipelineSpec,
    #[serde(default)]
    pub status: PipelineStatus,
}

impl LogPipeline {
    pub fn new(name: impl Into<String>, spec: LogPipelineSpec) -> Self {
        Self {
            api_version: TELEMETRY_API_VERSION.to_string(),
            kind: "LogPipeline".to_string(),
            metadata: ObjectMeta::named(name),
            spec,
            status: PipelineStatus::default(),
        }
    }
}

crate::impl_resource!(
    LogPipeline,
    ResourceKind::LogPipeline,
    TELEMETRY_API_VERSION
);

impl Pipeline for LogPipeline {
    fn status(&self) -> &PipelineStatus {
        &self.status
    }

    fn status_mut(&mut self) -> &mut PipelineStatus {
        &mut self.status
    }

    fn secret_refs(&self) -> Vec<&SecretKeyRef> {
        let mut refs: Vec<&SecretKeyRef> = self
            .spec
            .variables
            .iter()
            .filter_map(|v| v.value_from.secret_key_ref.as_ref())
            .collect();
        if let Some(http) = &self.spec.output.http {
            let values = [
                Some(&http.host),
                http.user.as_ref(),
                http.password.as_ref(),
                http.tls.ca.as_ref(),
                http.tls.cert.as_ref(),
                http.tls.key.as_ref(),
            ];
            refs.extend(values.into_iter().flatten().filter_map(|v| v.secret_key_ref()));
        }
        refs
    }

    fn tls_client_material(&self) -> Option<(Option<&ValueType>, Option<&ValueType>)> {
        let tls = &self.spec.output.http.as_ref()?.tls;
        if tls.disabled || (tls.cert.is_none() && tls.key.is_none()) {
            return None;
        }
        Some((tls.cert.as_ref(), tls.key.as_ref()))
    }
}

// --- LogParser ---

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct LogParserSpec {
    #[serde(default)]
    pub parser: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LogParser {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: LogParserSpec,
    #[serde(default)]
    pub status: PipelineStatus,
}

impl LogParser {
    pub fn new(name: impl Into<String>, parser: impl Into<String>) -> Self {
        Self {
            api_version: TELEMETRY_API_VERSION.to_string(),
            kind: "LogParser".to_string(),
            metadata: ObjectMeta::named(name),
            spec: LogParserSpec {
                parser: parser.into(),
            },
            status: PipelineStatus::default(),
        }
    }
}

crate::impl_resource!(LogParser, ResourceKind::LogParser, TELEMETRY_API_VERSION);

// --- Telemetry ---

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub enum ScalingStrategyType {
    #[default]
    Static,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct StaticScaling {
    #[serde(default)]
    pub replicas: i32,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct Scaling {
    #[serde(rename = "type", default)]
    pub scaling_type: ScalingStrategyType,
    #[serde(rename = "static", default, skip_serializing_if = "Option::is_none")]
    pub static_scaling: Option<StaticScaling>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct GatewaySpec {
    #[serde(default)]
    pub scaling: Scaling,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct SignalSpec {
    #[serde(default)]
    pub gateway: GatewaySpec,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct TelemetrySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<SignalSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<SignalSpec>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub enum TelemetryState {
    #[default]
    Ready,
    Warning,
    Deleting,
    Error,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct TelemetryStatus {
    #[serde(default)]
    pub state: TelemetryState,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Telemetry {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: TelemetrySpec,
    #[serde(default)]
    pub status: TelemetryStatus,
}

impl Telemetry {
    pub fn new(metadata: ObjectMeta, spec: TelemetrySpec) -> Self {
        Self {
            api_version: OPERATOR_API_VERSION.to_string(),
            kind: "Telemetry".to_string(),
            metadata,
            spec,
            status: TelemetryStatus::default(),
        }
    }
}

crate::impl_resource!(Telemetry, ResourceKind::Telemetry, OPERATOR_API_VERSION);

// --- PipelineLock ---

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct PipelineLockSpec {
    /// Holder pipeline names, in slot order.
    #[serde(default)]
    pub holders: Vec<String>,
    #[serde(rename = "maxHolders", default)]
    pub max_holders: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PipelineLock {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: PipelineLockSpec,
}

impl PipelineLock {
    pub fn new(metadata: ObjectMeta, spec: PipelineLockSpec) -> Self {
        Self {
            api_version: TELEMETRY_API_VERSION.to_string(),
            kind: "PipelineLock".to_string(),
            metadata,
            spec,
        }
    }
}

crate::impl_resource!(
    PipelineLock,
    ResourceKind::PipelineLock,
    TELEMETRY_API_VERSION
);
