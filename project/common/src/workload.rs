//! Cluster objects managed on behalf of the pipelines.

use crate::{ObjectMeta, ResourceKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const CORE_API_VERSION: &str = "v1";
pub const APPS_API_VERSION: &str = "apps/v1";
pub const NETWORKING_API_VERSION: &str = "networking.k8s.io/v1";
pub const APIEXTENSIONS_API_VERSION: &str = "apiextensions.k8s.io/v1";

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ContainerPort {
    pub name: String,
    #[serde(rename = "containerPort")]
    pub container_port: i32,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "TCP".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ResourceRequirements {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct VolumeMount {
    pub name: String,
    #[serde(rename = "mountPath")]
    pub mount_path: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<ContainerPort>,
    /// Secret whose keys are exposed as environment variables.
    #[serde(rename = "envFromSecret", default, skip_serializing_if = "Option::is_none")]
    pub env_from_secret: Option<String>,
    #[serde(default)]
    pub resources: ResourceRequirements,
    #[serde(rename = "volumeMounts", default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct Volume {
    pub name: String,
    #[serde(rename = "configMap", default, skip_serializing_if = "Option::is_none")]
    pub config_map: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct PodSpec {
    #[serde(default)]
    pub containers: Vec<ContainerSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
    #[serde(
        rename = "priorityClassName",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub priority_class_name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct PodTemplateSpec {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PodSpec,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct LabelSelector {
    #[serde(rename = "matchLabels", default)]
    pub match_labels: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct DeploymentSpec {
    pub replicas: i32,
    #[serde(default)]
    pub selector: LabelSelector,
    #[serde(default)]
    pub template: PodTemplateSpec,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct DeploymentStatus {
    #[serde(default)]
    pub replicas: i32,
    #[serde(rename = "readyReplicas", default)]
    pub ready_replicas: i32,
    #[serde(rename = "availableReplicas", default)]
    pub available_replicas: i32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Deployment {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: DeploymentSpec,
    #[serde(default)]
    pub status: DeploymentStatus,
}

impl Deployment {
    pub fn new(metadata: ObjectMeta, spec: DeploymentSpec) -> Self {
        Self {
            api_version: APPS_API_VERSION.to_string(),
            kind: "Deployment".to_string(),
            metadata,
            spec,
            status: DeploymentStatus::default(),
        }
    }
}

crate::impl_resource!(Deployment, ResourceKind::Deployment, APPS_API_VERSION);

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct DaemonSetSpec {
    #[serde(default)]
    pub selector: LabelSelector,
    #[serde(default)]
    pub template: PodTemplateSpec,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct DaemonSetStatus {
    #[serde(rename = "desiredNumberScheduled", default)]
    pub desired_number_scheduled: i32,
    #[serde(rename = "numberReady", default)]
    pub number_ready: i32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DaemonSet {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: DaemonSetSpec,
    #[serde(default)]
    pub status: DaemonSetStatus,
}

impl DaemonSet {
    pub fn new(metadata: ObjectMeta, spec: DaemonSetSpec) -> Self {
        Self {
            api_version: APPS_API_VERSION.to_string(),
            kind: "DaemonSet".to_string(),
            metadata,
            spec,
            status: DaemonSetStatus::default(),
        }
    }
}

crate::impl_resource!(DaemonSet, ResourceKind::DaemonSet, APPS_API_VERSION);

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ConfigMap {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl ConfigMap {
    pub fn new(metadata: ObjectMeta, data: BTreeMap<String, String>) -> Self {
        Self {
            api_version: CORE_API_VERSION.to_string(),
            kind: "ConfigMap".to_string(),
            metadata,
            data,
        }
    }
}

crate::impl_resource!(ConfigMap, ResourceKind::ConfigMap, CORE_API_VERSION);

/// Secret values are kept as plain strings; encoding at rest is the store's concern.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Secret {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl Secret {
    pub fn new(metadata: ObjectMeta, data: BTreeMap<String, String>) -> Self {
        Self {
            api_version: CORE_API_VERSION.to_string(),
            kind: "Secret".to_string(),
            metadata,
            data,
        }
    }
}

crate::impl_resource!(Secret, ResourceKind::Secret, CORE_API_VERSION);

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ServicePort {
    pub name: String,
    pub port: i32,
    #[serde(rename = "targetPort")]
    pub target_port: i32,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ServiceSpec {
    #[serde(default)]
    pub selector: BTreeMap<String, String>,
    #[serde(default)]
    pub ports: Vec<ServicePort>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Service {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: ServiceSpec,
}

impl Service {
    pub fn new(metadata: ObjectMeta, spec: ServiceSpec) -> Self {
        Self {
            api_version: CORE_API_VERSION.to_string(),
            kind: "Service".to_string(),
            metadata,
            spec,
        }
    }
}

crate::impl_resource!(Service, ResourceKind::Service, CORE_API_VERSION);

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct NetworkPolicySpec {
    #[serde(rename = "podSelector", default)]
    pub pod_selector: LabelSelector,
    /// TCP ports that accept ingress traffic from anywhere.
    #[serde(rename = "ingressPorts", default)]
    pub ingress_ports: Vec<i32>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct NetworkPolicy {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: NetworkPolicySpec,
}

impl NetworkPolicy {
    pub fn new(metadata: ObjectMeta, spec: NetworkPolicySpec) -> Self {
        Self {
            api_version: NETWORKING_API_VERSION.to_string(),
            kind: "NetworkPolicy".to_string(),
            metadata,
            spec,
        }
    }
}

crate::impl_resource!(
    NetworkPolicy,
    ResourceKind::NetworkPolicy,
    NETWORKING_API_VERSION
);

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct CustomResourceDefinitionSpec {
    pub group: String,
    pub kind: String,
    pub plural: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CustomResourceDefinition {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: CustomResourceDefinitionSpec,
}

impl CustomResourceDefinition {
    pub fn new(spec: CustomResourceDefinitionSpec) -> Self {
        Self {
            api_version: APIEXTENSIONS_API_VERSION.to_string(),
            kind: "CustomResourceDefinition".to_string(),
            metadata: ObjectMeta::named(format!("{}.{}", spec.plural, spec.group)),
            spec,
        }
    }
}

crate::impl_resource!(
    CustomResourceDefinition,
    ResourceKind::CustomResourceDefinition,
    APIEXTENSIONS_API_VERSION
);
