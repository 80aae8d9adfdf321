//! Idempotent application of the collector workloads and their supporting objects.

pub mod fluentbit;
pub mod otelcollector;

use crate::api::{Registry, Versioned};
use crate::protocol::config::ResourceSettings;
use anyhow::Result;
use common::{OwnerReference, Resource, ResourceRequirements, controller_reference};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};

/// Pod-template annotation that changes whenever the rendered config does.
pub const CHECKSUM_ANNOTATION: &str = "checksum/config";
pub const NAME_LABEL: &str = "app.kubernetes.io/name";

/// Owner reference to a pipeline. Several pipelines own the same shared objects, so none of
/// them is marked as the managing controller.
pub fn owner_reference<R: Resource>(owner: &R) -> OwnerReference {
    OwnerReference {
        controller: false,
        ..controller_reference(owner)
    }
}

/// SHA-256 over every config entry and env var, in key order.
pub fn config_checksum(config: &BTreeMap<String, String>, env: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (k, v) in config.iter().chain(env.iter()) {
        hasher.update(k.as_bytes());
        hasher.update([0]);
        hasher.update(v.as_bytes());
        hasher.update([0]);
    }
    format!("{:x}", hasher.finalize())
}

pub fn selector_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(NAME_LABEL.to_string(), name.to_string())])
}

/// Limits grow linearly with the number of deployed pipelines.
pub fn resource_requirements(settings: &ResourceSettings, multiplier: u32) -> ResourceRequirements {
    let cpu = settings.base_cpu_limit_millis + settings.per_pipeline_cpu_limit_millis * multiplier;
    let memory =
        settings.base_memory_limit_mib + settings.per_pipeline_memory_limit_mib * multiplier;
    ResourceRequirements {
        limits: BTreeMap::from([
            ("cpu".to_string(), format!("{cpu}m")),
            ("memory".to_string(), format!("{memory}Mi")),
        ]),
        requests: BTreeMap::from([
            ("cpu".to_string(), format!("{}m", settings.cpu_request_millis)),
            ("memory".to_string(), format!("{}Mi", settings.memory_request_mib)),
        ]),
    }
}

/// Apply `desired`, adding `owner` to the owners recorded on the stored copy and dropping
/// references to owners that no longer exist.
pub async fn apply_owned<T: Resource>(
    registry: &Registry,
    desired: T,
    owner: &OwnerReference,
) -> Result<Versioned<T>> {
    apply_owned_with(registry, desired, owner, |_, _| {}).await
}

/// `apply_owned` with `carry_over` copying fields another writer owns from the stored copy.
pub async fn apply_owned_with<T, F>(
    registry: &Registry,
    desired: T,
    owner: &OwnerReference,
    mut carry_over: F,
) -> Result<Versioned<T>>
where
    T: Resource,
    F: FnMut(&T, &mut T),
{
    let mut stale = HashSet::new();
    if let Some(current) = registry.get::<T>(&desired.key()).await? {
        for existing in &current.object.metadata().owner_references {
            if existing.uid != owner.uid && !registry.owner_exists(existing).await? {
                log::debug!("dropping owner {} {} of {}", existing.kind, existing.name, desired.name());
                stale.insert(existing.uid);
            }
        }
    }

    registry
        .apply_with(&desired, |current, desired| {
            let mut owners = current
                .map(|c| c.metadata().owner_references.clone())
                .unwrap_or_default();
            owners.retain(|o| !stale.contains(&o.uid));
            match owners.iter_mut().find(|o| o.uid == owner.uid) {
                Some(existing) => *existing = owner.clone(),
                None => owners.push(owner.clone()),
            }
            desired.metadata_mut().owner_references = owners;
            if let Some(current) = current {
                carry_over(current, desired);
            }
        })
        .await
}
