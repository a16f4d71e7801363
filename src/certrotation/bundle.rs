use std::collections::BTreeMap;

use chrono::Utc;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::reflector::Store;
use tracing::*;

use super::{
    CA_BUNDLE_KEY, CertificateAuthority, TrustedCertificate, current_config_map,
    crypto::{encode_bundle, parse_certificates},
    new_meta,
};
use crate::{
    Result,
    events_helper::{EventRecorder, emit_info},
    store::ObjectStore,
};

/// A config map publishing every CA that still signs live certificates
#[derive(Clone)]
pub struct CaBundleConfigMap {
    pub name: String,
    pub namespace: String,
    pub lister: Store<ConfigMap>,
}

impl CaBundleConfigMap {
    pub async fn ensure_config_map_ca_bundle(
        &self,
        client: &dyn ObjectStore,
        recorder: &dyn EventRecorder,
        ca: &CertificateAuthority,
    ) -> Result<Vec<TrustedCertificate>> {
        let current = current_config_map(client, &self.lister, &self.namespace, &self.name).await?;
        match self.publish(client, recorder, ca, current).await {
            Err(e) if e.is_conflict() || e.is_already_exists() => {
                debug!(
                    "CA bundle {}/{} changed since it was cached, rereading",
                    self.namespace, self.name
                );
                let live = match client.get_config_map(&self.namespace, &self.name).await {
                    Ok(config_map) => Some(config_map),
                    Err(e) if e.is_not_found() => None,
                    Err(e) => return Err(e),
                };
                self.publish(client, recorder, ca, live).await
            }
            result => result,
        }
    }

    async fn publish(
        &self,
        client: &dyn ObjectStore,
        recorder: &dyn EventRecorder,
        ca: &CertificateAuthority,
        current: Option<ConfigMap>,
    ) -> Result<Vec<TrustedCertificate>> {
        let exists = current.is_some();
        let mut config_map = current.unwrap_or_else(|| ConfigMap {
            metadata: new_meta(&self.namespace, &self.name),
            ..ConfigMap::default()
        });

        let published = config_map
            .data
            .as_ref()
            .and_then(|d| d.get(CA_BUNDLE_KEY))
            .cloned()
            .unwrap_or_default();
        let existing = match parse_certificates(&published) {
            Ok(certs) => certs,
            Err(e) => {
                warn!(
                    "Discarding unreadable CA bundle {}/{}: {}",
                    self.namespace, self.name, e
                );
                Vec::new()
            }
        };

        let certs = merge_bundle(ca.trusted(), existing);
        let bundle = encode_bundle(&certs);
        if exists && bundle == published {
            return Ok(certs);
        }

        info!(
            "Updating CA bundle {}/{} with {} certificate(s)",
            self.namespace,
            self.name,
            certs.len()
        );
        config_map
            .data
            .get_or_insert_with(BTreeMap::new)
            .insert(CA_BUNDLE_KEY.to_string(), bundle);
        let config_map = if exists {
            client.update_config_map(&self.namespace, config_map).await?
        } else {
            client.create_config_map(&self.namespace, config_map).await?
        };
        emit_info(
            recorder,
            &config_map,
            "CABundleUpdated",
            "Updated",
            Some(format!(
                "CA bundle now trusts `{}` and {} older certificate(s)",
                ca.info.common_name,
                certs.len() - 1
            )),
        )
        .await;
        Ok(certs)
    }
}

/// Current CA first, then every earlier certificate that is still valid
fn merge_bundle(current: TrustedCertificate, existing: Vec<TrustedCertificate>) -> Vec<TrustedCertificate> {
    let now = Utc::now();
    let mut certs = vec![current];
    for cert in existing {
        if cert.info.is_expired(now) || certs.iter().any(|c| c.pem == cert.pem) {
            continue;
        }
        certs.push(cert);
    }
    certs
}
