use crate::api::memstore::MemoryStore;
use crate::api::store::ClusterStore;
use crate::errors::{ControllerError, is_already_exists, is_conflict};
use anyhow::{Context, Result};
use chrono::Utc;
use common::{NamespacedName, ObjectMeta, OwnerReference, Resource, ResourceKind};
use serde::Deserialize;
use serde_yaml::Value;
use std::sync::Arc;
use uuid::Uuid;

/// Attempts made by `update_with` and `apply` before giving up on a conflicting key.
pub const MAX_CONFLICT_RETRIES: usize = 5;

/// An object together with the store revision it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub object: T,
    pub revision: i64,
}

pub fn registry_prefix(kind: ResourceKind) -> String {
    format!("/registry/{}/", kind.plural())
}

/// `/registry/<plural>/<name>` for cluster-scoped objects, `/registry/<plural>/<ns>/<name>` otherwise.
pub fn registry_key(kind: ResourceKind, key: &NamespacedName) -> String {
    if key.namespace.is_empty() {
        format!("{}{}", registry_prefix(kind), key.name)
    } else {
        format!("{}{}/{}", registry_prefix(kind), key.namespace, key.name)
    }
}

/// Typed object access over a `ClusterStore`.
#[derive(Clone)]
pub struct Registry {
    store: Arc<dyn ClusterStore>,
}

impl Registry {
    pub fn new(store: Arc<dyn ClusterStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    pub async fn get<T: Resource>(&self, key: &NamespacedName) -> Result<Option<Versioned<T>>> {
        let path = registry_key(T::KIND, key);
        let Some(kv) = self.store.get(&path).await? else {
            return Ok(None);
        };
        let object: T = serde_yaml::from_str(&kv.value)
            .with_context(|| format!("failed to decode {path}"))?;
        Ok(Some(Versioned {
            object,
            revision: kv.mod_revision,
        }))
    }

    /// Every object of kind `T` across namespaces, ordered by name.
    pub async fn list<T: Resource>(&self) -> Result<Vec<Versioned<T>>> {
        let items = self.store.list(&registry_prefix(T::KIND)).await?;
        let mut objects: Vec<Versioned<T>> = items
            .into_iter()
            .filter_map(|kv| match serde_yaml::from_str::<T>(&kv.value) {
                Ok(object) => Some(Versioned {
                    object,
                    revision: kv.mod_revision,
                }),
                Err(e) => {
                    log::warn!("skipping undecodable object at {}: {e}", kv.key);
                    None
                }
            })
            .collect();
        objects.sort_by(|a, b| {
            a.object
                .name()
                .cmp(b.object.name())
                .then_with(|| a.object.metadata().namespace.cmp(&b.object.metadata().namespace))
        });
        Ok(objects)
    }

    /// Store a new object. Fails with `AlreadyExists` if the key is taken.
    pub async fn create<T: Resource>(&self, mut object: T) -> Result<Versioned<T>> {
        let path = registry_key(T::KIND, &object.key());
        let meta = object.metadata_mut();
        if meta.uid.is_nil() {
            meta.uid = Uuid::new_v4();
        }
        if meta.creation_timestamp.is_none() {
            meta.creation_timestamp = Some(Utc::now());
        }
        meta.generation = 1;
        let yaml = serde_yaml::to_string(&object)?;
        match self.store.compare_and_put(&path, 0, &yaml).await? {
            Some(revision) => Ok(Versioned { object, revision }),
            None => Err(ControllerError::AlreadyExists { key: path }.into()),
        }
    }

    /// Write back an object read at `current.revision`.
    ///
    /// Fails with `Conflict` if the stored object moved on or vanished. Identity fields are
    /// taken from the stored copy and `generation` is bumped when `spec` differs. An object
    /// marked for deletion with no finalizers left is removed instead of written.
    pub async fn update<T: Resource>(&self, current: &Versioned<T>) -> Result<Versioned<T>> {
        let path = registry_key(T::KIND, &current.object.key());
        let stored = self
            .store
            .get(&path)
            .await?
            .filter(|kv| kv.mod_revision == current.revision)
            .ok_or_else(|| ControllerError::Conflict { key: path.clone() })?;
        let stored: T = serde_yaml::from_str(&stored.value)
            .with_context(|| format!("failed to decode {path}"))?;

        let mut object = current.object.clone();
        {
            let old = stored.metadata();
            let meta = object.metadata_mut();
            meta.uid = old.uid;
            meta.creation_timestamp = old.creation_timestamp;
            meta.generation = old.generation;
            if old.deletion_timestamp.is_some() {
                meta.deletion_timestamp = old.deletion_timestamp;
            }
        }
        if spec_of(&stored)? != spec_of(&object)? {
            object.metadata_mut().generation += 1;
        }

        if object.metadata().is_being_deleted() && object.metadata().finalizers.is_empty() {
            self.store.delete(&path).await?;
            log::debug!("removed {path} after its last finalizer was cleared");
            return Ok(Versioned {
                object,
                revision: current.revision,
            });
        }

        let yaml = serde_yaml::to_string(&object)?;
        match self
            .store
            .compare_and_put(&path, current.revision, &yaml)
            .await?
        {
            Some(revision) => Ok(Versioned { object, revision }),
            None => Err(ControllerError::Conflict { key: path }.into()),
        }
    }

    /// Request deletion. Objects holding finalizers only get a deletion timestamp.
    pub async fn delete<T: Resource>(&self, key: &NamespacedName) -> Result<()> {
        for _ in 0..MAX_CONFLICT_RETRIES {
            let Some(mut current) = self.get::<T>(key).await? else {
                return Ok(());
            };
            let meta = current.object.metadata_mut();
            if meta.finalizers.is_empty() {
                self.store.delete(&registry_key(T::KIND, key)).await?;
                return Ok(());
            }
            if meta.deletion_timestamp.is_some() {
                return Ok(());
            }
            meta.deletion_timestamp = Some(Utc::now());
            match self.update(&current).await {
                Ok(_) => return Ok(()),
                Err(e) if is_conflict(&e) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(ControllerError::Conflict {
            key: registry_key(T::KIND, key),
        })
        .context("giving up on delete")
    }

    /// Create `desired` or converge the stored copy onto it.
    ///
    /// Server-managed metadata and any stored `status` are kept. Nothing is written when the
    /// stored object already matches, so calling this every pass is cheap.
    pub async fn apply<T: Resource>(&self, desired: &T) -> Result<Versioned<T>> {
        self.apply_with(desired, |_, _| {}).await
    }

    /// `apply` with `adjust` run on every attempt, against the stored copy read in that attempt.
    ///
    /// Fields that several writers share (owner references) must be merged here, so a write
    /// racing with another writer never drops what the other one added.
    pub async fn apply_with<T, F>(&self, desired: &T, mut adjust: F) -> Result<Versioned<T>>
    where
        T: Resource,
        F: FnMut(Option<&T>, &mut T),
    {
        let key = desired.key();
        for _ in 0..MAX_CONFLICT_RETRIES {
            let current = self.get::<T>(&key).await?;
            let mut desired = desired.clone();
            adjust(current.as_ref().map(|c| &c.object), &mut desired);
            let Some(current) = current else {
                match self.create(desired).await {
                    Ok(created) => return Ok(created),
                    Err(e) if is_already_exists(&e) => continue,
                    Err(e) => return Err(e),
                }
            };

            let merged = merge_for_apply(&current.object, &desired)?;
            if serde_yaml::to_value(&merged)? == serde_yaml::to_value(&current.object)? {
                return Ok(current);
            }
            match self
                .update(&Versioned {
                    object: merged,
                    revision: current.revision,
                })
                .await
            {
                Ok(updated) => return Ok(updated),
                Err(e) if is_conflict(&e) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(ControllerError::Conflict {
            key: registry_key(T::KIND, &key),
        })
        .context("giving up on apply")
    }

    /// Whether the object an owner reference points to still exists with the same uid.
    /// Owners are cluster-scoped pipelines and parsers.
    pub async fn owner_exists(&self, owner: &OwnerReference) -> Result<bool> {
        let path = registry_key(owner.kind, &NamespacedName::cluster(owner.name.clone()));
        let Some(kv) = self.store.get(&path).await? else {
            return Ok(false);
        };
        let head: ObjectHead = serde_yaml::from_str(&kv.value)
            .with_context(|| format!("failed to decode {path}"))?;
        Ok(head.metadata.uid == owner.uid)
    }

    /// Read-modify-write with retry on conflict.
    ///
    /// `mutate` returns whether anything changed; unchanged objects are not written. Returns
    /// `None` if the object does not exist.
    pub async fn update_with<T, F>(&self, key: &NamespacedName, mut mutate: F) -> Result<Option<T>>
    where
        T: Resource,
        F: FnMut(&mut T) -> bool,
    {
        for _ in 0..MAX_CONFLICT_RETRIES {
            let Some(mut current) = self.get::<T>(key).await? else {
                return Ok(None);
            };
            if !mutate(&mut current.object) {
                return Ok(Some(current.object));
            }
            match self.update(&current).await {
                Ok(updated) => return Ok(Some(updated.object)),
                Err(e) if is_conflict(&e) => {
                    log::debug!("conflict updating {key}, retrying");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Err(ControllerError::Conflict {
            key: registry_key(T::KIND, key),
        })
        .context("retries exhausted")
    }
}

fn spec_of<T: Resource>(object: &T) -> Result<Value> {
    let value = serde_yaml::to_value(object)?;
    Ok(value.get("spec").cloned().unwrap_or(Value::Null))
}

#[derive(Deserialize)]
struct ObjectHead {
    metadata: ObjectMeta,
}

fn merge_for_apply<T: Resource>(current: &T, desired: &T) -> Result<T> {
    let mut value = serde_yaml::to_value(desired)?;
    if let (Some(status), Value::Mapping(map)) =
        (serde_yaml::to_value(current)?.get("status").cloned(), &mut value)
    {
        map.insert(Value::from("status"), status);
    }
    let mut merged: T = serde_yaml::from_value(value)?;
    let old = current.metadata();
    let meta = merged.metadata_mut();
    meta.uid = old.uid;
    meta.creation_timestamp = old.creation_timestamp;
    meta.generation = old.generation;
    meta.deletion_timestamp = old.deletion_timestamp;
    meta.finalizers = old.finalizers.clone();
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{
        ConfigMap, Deployment, DeploymentSpec, ObjectMeta, OtlpOutput, TracePipeline,
        TracePipelineOutput, TracePipelineSpec,
    };
    use std::collections::BTreeMap;

    fn trace_pipeline(name: &str, endpoint: &str) -> TracePipeline {
        TracePipeline::new(
            name,
            TracePipelineSpec {
                output: TracePipelineOutput {
                    otlp: Some(OtlpOutput::grpc(endpoint)),
                },
            },
        )
    }

    #[test]
    fn test_registry_keys() {
        assert_eq!(
            registry_key(ResourceKind::TracePipeline, &NamespacedName::cluster("p1")),
            "/registry/tracepipelines/p1"
        );
        assert_eq!(
            registry_key(
                ResourceKind::ConfigMap,
                &NamespacedName::new("kyma-system", "cfg")
            ),
            "/registry/configmaps/kyma-system/cfg"
        );
    }

    #[tokio::test]
    async fn test_create_assigns_identity_and_rejects_duplicates() {
        let registry = Registry::in_memory();
        let created = registry
            .create(trace_pipeline("p1", "http://a"))
            .await
            .unwrap();
        assert!(!created.object.metadata.uid.is_nil());
        assert!(created.object.metadata.creation_timestamp.is_some());
        assert_eq!(created.object.metadata.generation, 1);

        let err = registry
            .create(trace_pipeline("p1", "http://a"))
            .await
            .unwrap_err();
        assert!(is_already_exists(&err));
    }

    #[tokio::test]
    async fn test_update_detects_stale_revision_and_bumps_generation() {
        let registry = Registry::in_memory();
        let created = registry
            .create(trace_pipeline("p1", "http://a"))
            .await
            .unwrap();

        let mut changed = created.clone();
        changed.object.spec = trace_pipeline("p1", "http://b").spec;
        let updated = registry.update(&changed).await.unwrap();
        assert_eq!(updated.object.metadata.generation, 2);

        // status-only change keeps the generation
        let mut status_only = updated.clone();
        status_only.object.status.phase = Some(common::PipelinePhase::Running);
        let updated = registry.update(&status_only).await.unwrap();
        assert_eq!(updated.object.metadata.generation, 2);

        // writing from the first read must conflict
        let err = registry.update(&created).await.unwrap_err();
        assert!(is_conflict(&err));
    }

    #[tokio::test]
    async fn test_delete_honours_finalizers() {
        let registry = Registry::in_memory();
        let mut p = trace_pipeline("p1", "http://a");
        p.metadata.finalizers.push("telemetry.kyma-project.io/finalizer".into());
        registry.create(p).await.unwrap();

        let key = NamespacedName::cluster("p1");
        registry.delete::<TracePipeline>(&key).await.unwrap();
        let marked = registry.get::<TracePipeline>(&key).await.unwrap().unwrap();
        assert!(marked.object.metadata.is_being_deleted());

        let mut cleared = marked.clone();
        cleared.object.metadata.finalizers.clear();
        registry.update(&cleared).await.unwrap();
        assert!(registry.get::<TracePipeline>(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_apply_is_idempotent_and_keeps_status() {
        let registry = Registry::in_memory();
        let desired = Deployment::new(
            ObjectMeta::namespaced("kyma-system", "gw"),
            DeploymentSpec {
                replicas: 2,
                ..Default::default()
            },
        );
        let first = registry.apply(&desired).await.unwrap();
        let again = registry.apply(&desired).await.unwrap();
        assert_eq!(first.revision, again.revision);

        let key = desired.key();
        registry
            .update_with::<Deployment, _>(&key, |d| {
                d.status.ready_replicas = 2;
                true
            })
            .await
            .unwrap();

        let mut scaled = desired.clone();
        scaled.spec.replicas = 3;
        let applied = registry.apply(&scaled).await.unwrap();
        assert_eq!(applied.object.spec.replicas, 3);
        assert_eq!(applied.object.status.ready_replicas, 2);
        assert_eq!(applied.object.metadata.generation, 2);
    }

    #[tokio::test]
    async fn test_list_is_sorted_by_name() {
        let registry = Registry::in_memory();
        for name in ["c", "a", "b"] {
            registry
                .create(ConfigMap::new(ObjectMeta::named(name), BTreeMap::new()))
                .await
                .unwrap();
        }
        let names: Vec<String> = registry
            .list::<ConfigMap>()
            .await
            .unwrap()
            .into_iter()
            .map(|v| v.object.metadata.name)
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }
}
