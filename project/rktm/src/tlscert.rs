use crate::api::Registry;
use crate::secretref::resolve_value;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use common::ValueType;
use std::io::Cursor;
use thiserror::Error;
use x509_parser::prelude::{FromDer, X509Certificate};

/// Certificates expiring within this window are reported but still deployed.
pub const CERT_EXPIRY_ALERT_DAYS: i64 = 30;

#[derive(Debug, Error)]
pub enum TlsCertError {
    #[error("certificate and private key must both be set")]
    MissingValue,

    #[error("failed to decode PEM block containing certificate")]
    CertDecodeFailed,

    #[error("failed to decode PEM block containing private key")]
    KeyDecodeFailed,

    #[error("failed to parse certificate: {0}")]
    CertParseFailed(String),

    #[error("cert expired on {not_after}")]
    Expired { not_after: DateTime<Utc> },

    #[error("cert is about to expire, it is valid until {not_after}")]
    AboutToExpire { not_after: DateTime<Utc> },
}

impl TlsCertError {
    /// Only the expiry warning lets a pipeline through.
    pub fn is_soft(&self) -> bool {
        matches!(self, TlsCertError::AboutToExpire { .. })
    }
}

pub fn tls_cert_error(err: &anyhow::Error) -> Option<&TlsCertError> {
    err.chain().find_map(|cause| cause.downcast_ref::<TlsCertError>())
}

pub fn is_cert_about_to_expire(err: &anyhow::Error) -> bool {
    tls_cert_error(err).is_some_and(TlsCertError::is_soft)
}

#[async_trait]
pub trait TlsCertValidator: Send + Sync {
    /// Fails with a `TlsCertError` when the material is unusable or close to expiry. Other
    /// errors come from resolving the values and are transient.
    async fn validate_certificate(
        &self,
        cert: Option<&ValueType>,
        key: Option<&ValueType>,
    ) -> Result<()>;
}

/// Validates client certificates resolved from inline values or secrets.
pub struct Validator {
    registry: Registry,
}

impl Validator {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl TlsCertValidator for Validator {
    async fn validate_certificate(
        &self,
        cert: Option<&ValueType>,
        key: Option<&ValueType>,
    ) -> Result<()> {
        let (Some(cert), Some(key)) = (cert, key) else {
            return Err(TlsCertError::MissingValue.into());
        };
        let cert_pem = resolve_value(&self.registry, cert).await?;
        let key_pem = resolve_value(&self.registry, key).await?;
        let (Some(cert_pem), Some(key_pem)) = (cert_pem, key_pem) else {
            return Err(TlsCertError::MissingValue.into());
        };
        validate_pem(&cert_pem, &key_pem, Utc::now())?;
        Ok(())
    }
}

/// Check a PEM certificate and key against `now`.
pub fn validate_pem(cert_pem: &str, key_pem: &str, now: DateTime<Utc>) -> Result<(), TlsCertError> {
    let cert_der = rustls_pemfile::certs(&mut Cursor::new(cert_pem.as_bytes()))
        .next()
        .and_then(|c| c.ok())
        .ok_or(TlsCertError::CertDecodeFailed)?;

    match rustls_pemfile::private_key(&mut Cursor::new(key_pem.as_bytes())) {
        Ok(Some(_)) => {}
        _ => return Err(TlsCertError::KeyDecodeFailed),
    }

    let (_, parsed) = X509Certificate::from_der(cert_der.as_ref())
        .map_err(|e| TlsCertError::CertParseFailed(e.to_string()))?;
    let not_after = DateTime::<Utc>::from_timestamp(parsed.validity().not_after.timestamp(), 0)
        .ok_or_else(|| TlsCertError::CertParseFailed("notAfter out of range".to_string()))?;

    if now > not_after {
        return Err(TlsCertError::Expired { not_after });
    }
    if not_after - now <= Duration::days(CERT_EXPIRY_ALERT_DAYS) {
        return Err(TlsCertError::AboutToExpire { not_after });
    }
    Ok(())
}
