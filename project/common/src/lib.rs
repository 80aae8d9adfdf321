use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

pub mod condition;
pub mod telemetry;
pub mod workload;

pub use condition::*;
pub use telemetry::*;
pub use workload::*;

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ObjectMeta {
    pub name: String,
    // empty for cluster-scoped objects
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Uuid::is_nil")]
    pub uid: Uuid,
    /// Incremented by the registry every time `spec` changes.
    #[serde(default)]
    pub generation: i64,
    #[serde(
        rename = "creationTimestamp",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub creation_timestamp: Option<DateTime<Utc>>,
    #[serde(
        rename = "deletionTimestamp",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    #[serde(
        rename = "ownerReferences",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub owner_references: Vec<OwnerReference>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ObjectMeta {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    pub fn is_being_deleted(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn key(&self) -> NamespacedName {
        NamespacedName::new(self.namespace.clone(), self.name.clone())
    }
}

/// Identifies an object by namespace and name. Cluster-scoped objects use an empty namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn cluster(name: impl Into<String>) -> Self {
        Self::new(String::new(), name)
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct OwnerReference {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: ResourceKind,
    pub name: String,
    pub uid: Uuid,
    #[serde(default)]
    pub controller: bool,
    #[serde(rename = "blockOwnerDeletion", default)]
    pub block_owner_deletion: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    LogPipeline,
    MetricPipeline,
    TracePipeline,
    LogParser,
    Telemetry,
    PipelineLock,
    Deployment,
    DaemonSet,
    ConfigMap,
    Secret,
    Service,
    NetworkPolicy,
    CustomResourceDefinition,
}

impl ResourceKind {
    /// Path segment used for registry keys, e.g. `/registry/tracepipelines/`.
    pub fn plural(&self) -> &'static str {
        match self {
            ResourceKind::LogPipeline => "logpipelines",
            ResourceKind::MetricPipeline => "metricpipelines",
            ResourceKind::TracePipeline => "tracepipelines",
            ResourceKind::LogParser => "logparsers",
            ResourceKind::Telemetry => "telemetries",
            ResourceKind::PipelineLock => "pipelinelocks",
            ResourceKind::Deployment => "deployments",
            ResourceKind::DaemonSet => "daemonsets",
            ResourceKind::ConfigMap => "configmaps",
            ResourceKind::Secret => "secrets",
            ResourceKind::Service => "services",
            ResourceKind::NetworkPolicy => "networkpolicies",
            ResourceKind::CustomResourceDefinition => "customresourcedefinitions",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Common surface of every object kept in the registry.
pub trait Resource: Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static {
    const KIND: ResourceKind;
    const API_VERSION: &'static str;

    fn metadata(&self) -> &ObjectMeta;
    fn metadata_mut(&mut self) -> &mut ObjectMeta;

    fn name(&self) -> &str {
        &self.metadata().name
    }

    fn key(&self) -> NamespacedName {
        self.metadata().key()
    }
}

macro_rules! impl_resource {
    ($ty:ty, $kind:expr, $api_version:expr) => {
        impl $crate::Resource for $ty {
            const KIND: $crate::ResourceKind = $kind;
            const API_VERSION: &'static str = $api_version;

            fn metadata(&self) -> &$crate::ObjectMeta {
                &self.metadata
            }

            fn metadata_mut(&mut self) -> &mut $crate::ObjectMeta {
                &mut self.metadata
            }
        }
    };
}
pub(crate) use impl_resource;

/// Build an owner reference pointing at `owner`, marking it as the managing controller.
pub fn controller_reference<R: Resource>(owner: &R) -> OwnerReference {
    OwnerReference {
        api_version: R::API_VERSION.to_string(),
        kind: R::KIND,
        name: owner.name().to_string(),
        uid: owner.metadata().uid,
        controller: true,
        block_owner_deletion: Some(true),
    }
}
