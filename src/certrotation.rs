//! Creation and rotation of signer, CA bundle and target certificates.
//!
//! Objects are read through a reflector store, falling back to the API server
//! when the cache has not seen them yet, and written through an
//! [`ObjectStore`]. Validity bookkeeping lives in annotations on the secrets
//! so a certificate can be forced due by moving its not-after annotation.

use std::{collections::BTreeMap, sync::Arc, time::Duration as StdDuration};

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::{
    ResourceExt,
    api::ObjectMeta,
    runtime::reflector::{ObjectRef, Store},
};

#[cfg(test)]
use mockall::automock;

use crate::{Result, events_helper::EventRecorder, store::ObjectStore};

mod bundle;
pub mod crypto;
mod signer;
mod target;

pub use bundle::CaBundleConfigMap;
pub use crypto::{CertInfo, CertificateAuthority, TrustedCertificate};
pub use signer::RotatedSigningCaSecret;
pub use target::RotatedTargetSecret;

pub static CERTIFICATE_NOT_BEFORE_ANNOTATION: &str = "certrotation.operator.io/certificate-not-before";
pub static CERTIFICATE_NOT_AFTER_ANNOTATION: &str = "certrotation.operator.io/certificate-not-after";
pub static CERTIFICATE_ISSUER_ANNOTATION: &str = "certrotation.operator.io/certificate-issuer";
pub static CERTIFICATE_HOSTNAMES_ANNOTATION: &str = "certrotation.operator.io/certificate-hostnames";

pub static TLS_CERT_KEY: &str = "tls.crt";
pub static TLS_PRIVATE_KEY_KEY: &str = "tls.key";
pub static CA_CERT_KEY: &str = "ca.crt";
pub static CA_BUNDLE_KEY: &str = "ca-bundle.crt";

/// Kind of leaf certificate a target secret holds
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TargetCertCreator {
    /// Server certificate valid for these DNS names
    Serving { hostnames: Vec<String> },
    /// Client certificate for this user identity
    Client { user: String },
}

impl TargetCertCreator {
    /// Serving certificate for the in-cluster names of `service` in `namespace`
    pub fn for_service(service: &str, namespace: &str) -> Self {
        TargetCertCreator::Serving {
            hostnames: vec![
                service.to_string(),
                format!("{service}.{namespace}"),
                format!("{service}.{namespace}.svc"),
            ],
        }
    }
}

/// The three rotation protocols the certificate manager delegates to
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Rotation: Send + Sync {
    /// Return the current CA, creating or rotating its key pair when due
    async fn ensure_signing_cert_key_pair(
        &self,
        signer: RotatedSigningCaSecret,
    ) -> Result<CertificateAuthority>;

    /// Publish `ca` in the bundle and return the trusted certificates, current first
    async fn ensure_config_map_ca_bundle(
        &self,
        bundle: CaBundleConfigMap,
        ca: CertificateAuthority,
    ) -> Result<Vec<TrustedCertificate>>;

    /// Create or rotate the leaf key pair signed by `ca`
    async fn ensure_target_cert_key_pair(
        &self,
        target: RotatedTargetSecret,
        ca: CertificateAuthority,
        bundle: Vec<TrustedCertificate>,
    ) -> Result<()>;
}

/// Rotation backed by rcgen, persisting into secrets and config maps
#[derive(Clone)]
pub struct CertRotation {
    client: Arc<dyn ObjectStore>,
    recorder: Arc<dyn EventRecorder>,
}

impl CertRotation {
    pub fn new(client: Arc<dyn ObjectStore>, recorder: Arc<dyn EventRecorder>) -> Self {
        Self { client, recorder }
    }
}

#[async_trait]
impl Rotation for CertRotation {
    async fn ensure_signing_cert_key_pair(
        &self,
        signer: RotatedSigningCaSecret,
    ) -> Result<CertificateAuthority> {
        signer
            .ensure_signing_cert_key_pair(self.client.as_ref(), self.recorder.as_ref())
            .await
    }

    async fn ensure_config_map_ca_bundle(
        &self,
        bundle: CaBundleConfigMap,
        ca: CertificateAuthority,
    ) -> Result<Vec<TrustedCertificate>> {
        bundle
            .ensure_config_map_ca_bundle(self.client.as_ref(), self.recorder.as_ref(), &ca)
            .await
    }

    async fn ensure_target_cert_key_pair(
        &self,
        target: RotatedTargetSecret,
        ca: CertificateAuthority,
        bundle: Vec<TrustedCertificate>,
    ) -> Result<()> {
        target
            .ensure_target_cert_key_pair(self.client.as_ref(), self.recorder.as_ref(), &ca, &bundle)
            .await
    }
}

fn cached_secret(lister: &Store<Secret>, namespace: &str, name: &str) -> Option<Secret> {
    lister
        .get(&ObjectRef::new(name).within(namespace))
        .map(|s| (*s).clone())
}

fn cached_config_map(lister: &Store<ConfigMap>, namespace: &str, name: &str) -> Option<ConfigMap> {
    lister
        .get(&ObjectRef::new(name).within(namespace))
        .map(|cm| (*cm).clone())
}

/// Freshest known copy of a secret: the one handed in, else the cache, else
/// a direct read. `None` when the secret does not exist.
async fn current_secret(
    client: &dyn ObjectStore,
    lister: &Store<Secret>,
    known: Option<Secret>,
    namespace: &str,
    name: &str,
) -> Result<Option<Secret>> {
    if let Some(secret) = known.or_else(|| cached_secret(lister, namespace, name)) {
        return Ok(Some(secret));
    }
    match client.get_secret(namespace, name).await {
        Ok(secret) => Ok(Some(secret)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

async fn current_config_map(
    client: &dyn ObjectStore,
    lister: &Store<ConfigMap>,
    namespace: &str,
    name: &str,
) -> Result<Option<ConfigMap>> {
    if let Some(config_map) = cached_config_map(lister, namespace, name) {
        return Ok(Some(config_map));
    }
    match client.get_config_map(namespace, name).await {
        Ok(config_map) => Ok(Some(config_map)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Update a secret read from the server, create one that was never stored.
///
/// A create racing another writer is retried as an update of the live object.
async fn apply_secret(client: &dyn ObjectStore, namespace: &str, mut secret: Secret) -> Result<Secret> {
    if secret.metadata.resource_version.is_some() {
        return client.update_secret(namespace, secret).await;
    }
    match client.create_secret(namespace, secret.clone()).await {
        Err(e) if e.is_already_exists() => {
            let live = client.get_secret(namespace, &secret.name_any()).await?;
            secret.metadata.resource_version = live.metadata.resource_version;
            client.update_secret(namespace, secret).await
        }
        result => result,
    }
}

fn new_meta(namespace: &str, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        ..ObjectMeta::default()
    }
}

fn annotation<'a>(meta: &'a ObjectMeta, key: &str) -> Option<&'a str> {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

fn parse_time_annotation(meta: &ObjectMeta, key: &str) -> Option<DateTime<Utc>> {
    annotation(meta, key)
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn set_validity_annotations(meta: &mut ObjectMeta, info: &CertInfo) {
    let annotations = meta.annotations.get_or_insert_with(BTreeMap::new);
    annotations.insert(
        CERTIFICATE_NOT_BEFORE_ANNOTATION.to_string(),
        info.not_before.to_rfc3339_opts(SecondsFormat::Secs, true),
    );
    annotations.insert(
        CERTIFICATE_NOT_AFTER_ANNOTATION.to_string(),
        info.not_after.to_rfc3339_opts(SecondsFormat::Secs, true),
    );
}

/// Reason the certificate recorded in `meta` must be replaced, if any.
///
/// Due once expired, past 80% of its validity window, or past not-before plus
/// `refresh`.
fn needs_rotation(meta: &ObjectMeta, refresh: StdDuration, now: DateTime<Utc>) -> Option<String> {
    let Some(not_before) = parse_time_annotation(meta, CERTIFICATE_NOT_BEFORE_ANNOTATION) else {
        return Some(format!("missing {CERTIFICATE_NOT_BEFORE_ANNOTATION}"));
    };
    let Some(not_after) = parse_time_annotation(meta, CERTIFICATE_NOT_AFTER_ANNOTATION) else {
        return Some(format!("missing {CERTIFICATE_NOT_AFTER_ANNOTATION}"));
    };
    if now >= not_after {
        return Some(format!("already expired at {not_after}"));
    }
    let validity = not_after - not_before;
    let latest = not_after - validity / 5;
    if now >= latest {
        return Some(format!("past its latest possible time {latest}"));
    }
    let refresh_at = Duration::from_std(refresh)
        .ok()
        .and_then(|r| not_before.checked_add_signed(r))
        .unwrap_or(not_after);
    if now >= refresh_at {
        return Some(format!("past its refresh time {refresh_at}"));
    }
    None
}
