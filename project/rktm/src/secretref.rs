use crate::api::Registry;
use anyhow::Result;
use common::{NamespacedName, Pipeline, Secret, SecretKeyRef, ValueType};

/// Value of a single secret key, `None` if either the secret or the key is missing.
pub async fn get_secret_value(registry: &Registry, key_ref: &SecretKeyRef) -> Result<Option<String>> {
    let name = NamespacedName::new(key_ref.namespace.clone(), key_ref.name.clone());
    Ok(registry
        .get::<Secret>(&name)
        .await?
        .and_then(|secret| secret.object.data.get(&key_ref.key).cloned()))
}

/// Resolve an inline value or secret reference.
pub async fn resolve_value(registry: &Registry, value: &ValueType) -> Result<Option<String>> {
    if let Some(inline) = value.value.as_deref().filter(|v| !v.is_empty()) {
        return Ok(Some(inline.to_string()));
    }
    match value.secret_key_ref() {
        Some(key_ref) => get_secret_value(registry, key_ref).await,
        None => Ok(None),
    }
}

/// True if any secret key the pipeline references cannot be resolved.
pub async fn references_non_existent_secret<P: Pipeline>(registry: &Registry, pipeline: &P) -> Result<bool> {
    for key_ref in pipeline.secret_refs() {
        if get_secret_value(registry, key_ref).await?.is_none() {
            log::debug!(
                "pipeline {} references missing secret key {}/{}:{}",
                pipeline.name(),
                key_ref.namespace,
                key_ref.name,
                key_ref.key
            );
            return Ok(true);
        }
    }
    Ok(false)
}
