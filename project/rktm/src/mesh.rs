use crate::api::Registry;
use common::{CustomResourceDefinition, NamespacedName};

/// CRD whose presence means the Istio service mesh is installed.
pub const PEER_AUTHENTICATION_CRD: &str = "peerauthentications.security.istio.io";

/// Detects an active service mesh so collectors can open the sidecar port.
#[derive(Clone)]
pub struct IstioStatusChecker {
    registry: Registry,
}

impl IstioStatusChecker {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    /// Lookup failures count as "no mesh".
    pub async fn is_istio_active(&self) -> bool {
        match self
            .registry
            .get::<CustomResourceDefinition>(&NamespacedName::cluster(PEER_AUTHENTICATION_CRD))
            .await
        {
            Ok(crd) => crd.is_some(),
            Err(e) => {
                log::warn!("failed to check for istio CRD, assuming no mesh: {e:#}");
                false
            }
        }
    }
}
