//! Selection of the pipelines that go into the rendered configuration.

use crate::api::Registry;
use crate::lock::ResourceCountLock;
use crate::secretref::references_non_existent_secret;
use crate::tlscert::{TlsCertValidator, is_cert_about_to_expire, tls_cert_error};
use anyhow::Result;
use common::Pipeline;

/// Whether `pipeline` may be deployed.
///
/// Invalid pipelines are excluded rather than failing the pass, so one broken pipeline never
/// blocks the others. Errors returned here are infrastructure errors.
pub async fn is_reconcilable<P: Pipeline>(
    registry: &Registry,
    tls_validator: &dyn TlsCertValidator,
    lock: &ResourceCountLock,
    pipeline: &P,
) -> Result<bool> {
    let name = pipeline.name();
    if pipeline.metadata().is_being_deleted() {
        return Ok(false);
    }
    if references_non_existent_secret(registry, pipeline).await? {
        log::debug!("excluding pipeline {name}: referenced secret missing");
        return Ok(false);
    }
    if let Some((cert, key)) = pipeline.tls_client_material() {
        if let Err(e) = tls_validator.validate_certificate(cert, key).await {
            match tls_cert_error(&e) {
                Some(tls) if is_cert_about_to_expire(&e) => {
                    log::warn!("pipeline {name}: {tls}");
                }
                Some(tls) => {
                    log::debug!("excluding pipeline {name}: {tls}");
                    return Ok(false);
                }
                None => return Err(e),
            }
        }
    }
    lock.is_lock_holder(pipeline).await
}

/// The reconcilable subset of `pipelines`, in input order.
pub async fn reconcilable_pipelines<P: Pipeline>(
    registry: &Registry,
    tls_validator: &dyn TlsCertValidator,
    lock: &ResourceCountLock,
    pipelines: &[P],
) -> Result<Vec<P>> {
    let mut selected = Vec::new();
    for pipeline in pipelines {
        if is_reconcilable(registry, tls_validator, lock, pipeline).await? {
            selected.push(pipeline.clone());
        }
    }
    Ok(selected)
}
