use crate::api::Registry;
use crate::errors::{ControllerError, is_already_exists};
use anyhow::{Context, Result};
use common::{NamespacedName, ObjectMeta, PipelineLock, PipelineLockSpec, Resource};

/// Caps how many pipelines of one kind are deployed at once.
///
/// Holder names are kept in a `PipelineLock` object. Every acquisition recomputes the whole
/// holder list and writes it back with a compare-and-swap, so two racing passes cannot both
/// win; the loser gets a `Conflict` and has to rerun its pass.
pub struct ResourceCountLock {
    registry: Registry,
    name: NamespacedName,
    max_pipelines: usize,
}

impl ResourceCountLock {
    pub fn new(registry: Registry, name: NamespacedName, max_pipelines: usize) -> Self {
        Self {
            registry,
            name,
            max_pipelines,
        }
    }

    pub fn max_pipelines(&self) -> usize {
        self.max_pipelines
    }

    /// Recompute and persist the holder list, then check that `owner` holds a slot.
    ///
    /// A pipeline that is being deleted never needs a slot and always passes.
    pub async fn try_acquire_lock<P: Resource>(&self, owner: &P) -> Result<()> {
        let pipelines = self
            .registry
            .list::<P>()
            .await
            .context("failed to list pipelines for lock")?;
        let live: Vec<&P> = pipelines.iter().map(|p| &p.object).collect();

        let current = self.registry.get::<PipelineLock>(&self.name).await?;
        let persisted = current
            .as_ref()
            .map(|c| c.object.spec.holders.as_slice())
            .unwrap_or_default();
        let holders = compute_holders(persisted, &live, self.max_pipelines);

        match current {
            None => {
                let lock = PipelineLock::new(
                    ObjectMeta::namespaced(self.name.namespace.clone(), self.name.name.clone()),
                    PipelineLockSpec {
                        holders: holders.clone(),
                        max_holders: self.max_pipelines,
                    },
                );
                if let Err(e) = self.registry.create(lock).await {
                    if is_already_exists(&e) {
                        return Err(ControllerError::Conflict {
                            key: self.name.to_string(),
                        }
                        .into());
                    }
                    return Err(e);
                }
                log::debug!("created lock {} with holders {holders:?}", self.name);
            }
            Some(mut current)
                if current.object.spec.holders != holders
                    || current.object.spec.max_holders != self.max_pipelines =>
            {
                current.object.spec.holders = holders.clone();
                current.object.spec.max_holders = self.max_pipelines;
                self.registry
                    .update(&current)
                    .await
                    .with_context(|| format!("failed to persist lock {}", self.name))?;
                log::debug!("lock {} holders are now {holders:?}", self.name);
            }
            Some(_) => {}
        }

        if owner.metadata().is_being_deleted() || holders.iter().any(|h| h == owner.name()) {
            return Ok(());
        }
        Err(ControllerError::MaxPipelinesExceeded.into())
    }

    /// Membership in the persisted holder list. Does not recompute anything.
    pub async fn is_lock_holder<P: Resource>(&self, pipeline: &P) -> Result<bool> {
        Ok(self
            .registry
            .get::<PipelineLock>(&self.name)
            .await?
            .is_some_and(|lock| lock.object.spec.holders.iter().any(|h| h == pipeline.name())))
    }
}

/// Holder list for a snapshot of pipelines.
///
/// Surviving holders keep their slot in their persisted order. Free slots go to the remaining
/// live pipelines by creation timestamp, then name. Pipelines being deleted are never holders.
pub fn compute_holders<P: Resource>(persisted: &[String], pipelines: &[&P], max: usize) -> Vec<String> {
    let live: Vec<&P> = pipelines
        .iter()
        .copied()
        .filter(|p| !p.metadata().is_being_deleted())
        .collect();

    let mut holders: Vec<String> = Vec::new();
    for name in persisted {
        if !holders.contains(name) && live.iter().any(|p| p.name() == name.as_str()) {
            holders.push(name.clone());
        }
    }

    let mut waiting: Vec<&P> = live
        .into_iter()
        .filter(|p| !holders.iter().any(|h| h == p.name()))
        .collect();
    waiting.sort_by(|a, b| {
        a.metadata()
            .creation_timestamp
            .cmp(&b.metadata().creation_timestamp)
            .then_with(|| a.name().cmp(b.name()))
    });

    holders.extend(waiting.into_iter().map(|p| p.name().to_string()));
    holders.truncate(max);
    holders
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{is_conflict, is_max_pipelines_exceeded};
    use chrono::{Duration, TimeZone, Utc};
    use common::{TracePipeline, TracePipelineSpec};

    fn pipeline(name: &str, created_secs: i64) -> TracePipeline {
        let mut p = TracePipeline::new(name, TracePipelineSpec::default());
        p.metadata.creation_timestamp =
            Some(Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(created_secs));
        p
    }

    fn lock_name() -> NamespacedName {
        NamespacedName::new("kyma-system", "telemetry-tracepipeline-lock")
    }

    #[test]
    fn test_holders_ordered_by_creation_then_name() {
        let (a, b, c) = (pipeline("a", 5), pipeline("b", 1), pipeline("c", 1));
        let holders = compute_holders(&[], &[&a, &b, &c], 5);
        assert_eq!(holders, vec!["b", "c", "a"]);
    }

    #[test]
    fn test_holders_never_exceed_max_and_are_deterministic() {
        let pipelines: Vec<TracePipeline> =
            (0..10).map(|i| pipeline(&format!("p{i}"), 10 - i)).collect();
        let refs: Vec<&TracePipeline> = pipelines.iter().collect();
        let mut reversed = refs.clone();
        reversed.reverse();
        for max in 0..12 {
            let first = compute_holders(&[], &refs, max);
            assert!(first.len() <= max);
            assert_eq!(first, compute_holders(&[], &reversed, max));
        }
    }

    #[test]
    fn test_existing_holders_keep_their_slot() {
        let (old, new) = (pipeline("zz-old", 10), pipeline("aa-new", 0));
        let holders = compute_holders(&["zz-old".to_string()], &[&old, &new], 1);
        assert_eq!(holders, vec!["zz-old"]);

        // a deleted holder frees its slot
        let mut old = old;
        old.metadata.deletion_timestamp = Some(Utc::now());
        let holders = compute_holders(&["zz-old".to_string()], &[&old, &new], 1);
        assert_eq!(holders, vec!["aa-new"]);
    }

    #[tokio::test]
    async fn test_try_acquire_lock_denies_beyond_max() {
        let registry = Registry::in_memory();
        let p1 = registry.create(pipeline("p1", 0)).await.unwrap().object;
        let p2 = registry.create(pipeline("p2", 1)).await.unwrap().object;
        let lock = ResourceCountLock::new(registry.clone(), lock_name(), 1);

        let err = lock.try_acquire_lock(&p2).await.unwrap_err();
        assert!(is_max_pipelines_exceeded(&err));
        lock.try_acquire_lock(&p1).await.unwrap();

        assert!(lock.is_lock_holder(&p1).await.unwrap());
        assert!(!lock.is_lock_holder(&p2).await.unwrap());
    }

    #[tokio::test]
    async fn test_zero_max_admits_nobody() {
        let registry = Registry::in_memory();
        let p1 = registry.create(pipeline("p1", 0)).await.unwrap().object;
        let lock = ResourceCountLock::new(registry, lock_name(), 0);
        let err = lock.try_acquire_lock(&p1).await.unwrap_err();
        assert!(is_max_pipelines_exceeded(&err));
    }

    #[tokio::test]
    async fn test_stale_write_surfaces_conflict() {
        let registry = Registry::in_memory();
        let p1 = registry.create(pipeline("p1", 0)).await.unwrap().object;
        let lock = ResourceCountLock::new(registry.clone(), lock_name(), 2);
        lock.try_acquire_lock(&p1).await.unwrap();

        // another writer moves the lock on between our read and write
        let stale = registry
            .get::<PipelineLock>(&lock_name())
            .await
            .unwrap()
            .unwrap();
        let mut other = stale.clone();
        other.object.spec.holders.push("ghost".to_string());
        registry.update(&other).await.unwrap();

        let mut ours = stale;
        ours.object.spec.holders.clear();
        let err = registry.update(&ours).await.unwrap_err();
        assert!(is_conflict(&err));
    }
}
