use std::time::Duration as StdDuration;

use chrono::Utc;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::reflector::Store;
use tracing::*;

use super::{
    CertificateAuthority, TLS_CERT_KEY, TLS_PRIVATE_KEY_KEY, apply_secret, current_secret,
    needs_rotation, new_meta, set_validity_annotations,
};
use crate::{
    Error, Result,
    events_helper::{EventRecorder, emit_info},
    helper::{secret_text, set_secret_text},
    store::ObjectStore,
};

/// A CA key pair kept in a secret
#[derive(Clone)]
pub struct RotatedSigningCaSecret {
    pub name: String,
    pub namespace: String,
    pub validity: StdDuration,
    pub refresh: StdDuration,
    /// Latest copy the caller wrote, newer than anything the lister holds
    pub secret: Option<Secret>,
    pub lister: Store<Secret>,
}

impl RotatedSigningCaSecret {
    pub async fn ensure_signing_cert_key_pair(
        &self,
        client: &dyn ObjectStore,
        recorder: &dyn EventRecorder,
    ) -> Result<CertificateAuthority> {
        let current = current_secret(
            client,
            &self.lister,
            self.secret.clone(),
            &self.namespace,
            &self.name,
        )
        .await?;
        let mut secret = current.unwrap_or_else(|| Secret {
            metadata: new_meta(&self.namespace, &self.name),
            ..Secret::default()
        });

        let now = Utc::now();
        let reason = match load_ca(&secret) {
            Ok(ca) => match needs_rotation(&secret.metadata, self.refresh, now) {
                None => return Ok(ca),
                Some(reason) => reason,
            },
            Err(e) => format!("without a usable key pair ({e})"),
        };

        info!(
            "Rotating signing CA {}/{}: {}",
            self.namespace, self.name, reason
        );
        let common_name = format!("{}_{}@{}", self.namespace, self.name, now.timestamp());
        let ca = CertificateAuthority::generate(&common_name, self.validity)?;
        set_secret_text(&mut secret, TLS_CERT_KEY, &ca.cert_pem);
        set_secret_text(&mut secret, TLS_PRIVATE_KEY_KEY, ca.key_pem());
        set_validity_annotations(&mut secret.metadata, &ca.info);

        let secret = apply_secret(client, &self.namespace, secret).await?;
        emit_info(
            recorder,
            &secret,
            "SignerUpdated",
            "Rotated",
            Some(format!(
                "Signing CA `{}` rotated because it is {}",
                common_name, reason
            )),
        )
        .await;
        Ok(ca)
    }
}

fn load_ca(secret: &Secret) -> Result<CertificateAuthority> {
    let cert = secret_text(secret, TLS_CERT_KEY)
        .ok_or_else(|| Error::InvalidCertificate(format!("missing {TLS_CERT_KEY}")))?;
    let key = secret_text(secret, TLS_PRIVATE_KEY_KEY)
        .ok_or_else(|| Error::InvalidCertificate(format!("missing {TLS_PRIVATE_KEY_KEY}")))?;
    CertificateAuthority::from_pem(&cert, &key)
}
