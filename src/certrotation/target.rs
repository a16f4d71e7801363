use std::{collections::BTreeMap, time::Duration as StdDuration};

use chrono::Utc;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::reflector::Store;
use tracing::*;

use super::{
    CA_CERT_KEY, CERTIFICATE_HOSTNAMES_ANNOTATION, CERTIFICATE_ISSUER_ANNOTATION,
    CertificateAuthority, TLS_CERT_KEY, TLS_PRIVATE_KEY_KEY, TargetCertCreator,
    TrustedCertificate, annotation, apply_secret, current_secret,
    crypto::{encode_bundle, parse_certificates},
    needs_rotation, new_meta, set_validity_annotations,
};
use crate::{
    Result,
    events_helper::{EventRecorder, emit_info},
    helper::{secret_text, set_secret_text},
    store::ObjectStore,
};

/// A leaf key pair signed by the current CA and kept in a secret
#[derive(Clone)]
pub struct RotatedTargetSecret {
    pub name: String,
    pub namespace: String,
    pub validity: StdDuration,
    pub refresh: StdDuration,
    pub creator: TargetCertCreator,
    /// Latest copy the caller wrote, newer than anything the lister holds
    pub secret: Option<Secret>,
    pub lister: Store<Secret>,
}

impl RotatedTargetSecret {
    pub async fn ensure_target_cert_key_pair(
        &self,
        client: &dyn ObjectStore,
        recorder: &dyn EventRecorder,
        ca: &CertificateAuthority,
        bundle: &[TrustedCertificate],
    ) -> Result<()> {
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

        let Some(reason) = self.rotation_reason(&secret, ca) else {
            return Ok(());
        };
        info!(
            "Rotating target certificate {}/{}: {}",
            self.namespace, self.name, reason
        );

        let issued = match &self.creator {
            TargetCertCreator::Serving { hostnames } => ca.sign_serving(hostnames, self.validity)?,
            TargetCertCreator::Client { user } => ca.sign_client(user, self.validity)?,
        };
        set_secret_text(&mut secret, TLS_CERT_KEY, &issued.cert_pem);
        set_secret_text(&mut secret, TLS_PRIVATE_KEY_KEY, &issued.key_pem);
        set_secret_text(&mut secret, CA_CERT_KEY, &encode_bundle(bundle));
        set_validity_annotations(&mut secret.metadata, &issued.info);
        let annotations = secret.metadata.annotations.get_or_insert_with(BTreeMap::new);
        annotations.insert(
            CERTIFICATE_ISSUER_ANNOTATION.to_string(),
            ca.info.common_name.clone(),
        );
        if let TargetCertCreator::Serving { hostnames } = &self.creator {
            annotations.insert(
                CERTIFICATE_HOSTNAMES_ANNOTATION.to_string(),
                hostnames_annotation(hostnames),
            );
        }

        let secret = apply_secret(client, &self.namespace, secret).await?;
        emit_info(
            recorder,
            &secret,
            "TargetUpdated",
            "Rotated",
            Some(format!(
                "Certificate `{}` issued by `{}` because it is {}",
                issued.info.common_name, ca.info.common_name, reason
            )),
        )
        .await;
        Ok(())
    }

    fn rotation_reason(&self, secret: &Secret, ca: &CertificateAuthority) -> Option<String> {
        for key in [TLS_CERT_KEY, TLS_PRIVATE_KEY_KEY] {
            if secret_text(secret, key).is_none_or(|v| v.is_empty()) {
                return Some(format!("missing {key}"));
            }
        }
        match annotation(&secret.metadata, CERTIFICATE_ISSUER_ANNOTATION) {
            Some(issuer) if issuer == ca.info.common_name => {}
            Some(issuer) => {
                return Some(format!(
                    "issued by `{issuer}` instead of `{}`",
                    ca.info.common_name
                ));
            }
            None => return Some(format!("missing {CERTIFICATE_ISSUER_ANNOTATION}")),
        }
        // issuer names repeat when a CA is rotated twice within one second
        let published_ca = secret_text(secret, CA_CERT_KEY)
            .and_then(|pem| parse_certificates(&pem).ok())
            .and_then(|certs| certs.into_iter().next());
        if published_ca.is_none_or(|first| first.pem != ca.cert_pem) {
            return Some(format!("not issued by the current CA `{}`", ca.info.common_name));
        }
        if let TargetCertCreator::Serving { hostnames } = &self.creator {
            let wanted = hostnames_annotation(hostnames);
            if annotation(&secret.metadata, CERTIFICATE_HOSTNAMES_ANNOTATION) != Some(wanted.as_str()) {
                return Some(format!("not valid for hostnames {wanted}"));
            }
        }
        needs_rotation(&secret.metadata, self.refresh, Utc::now())
    }
}

fn hostnames_annotation(hostnames: &[String]) -> String {
    let mut sorted = hostnames.to_vec();
    sorted.sort();
    sorted.dedup();
    sorted.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        certrotation::crypto::CertInfo,
        events_helper::NoopRecorder,
        store::memory::{MemoryStore, Verb},
    };

    const DAY: StdDuration = StdDuration::from_secs(24 * 3600);

    fn target(store: &MemoryStore, creator: TargetCertCreator) -> RotatedTargetSecret {
        RotatedTargetSecret {
            name: "tls".into(),
            namespace: "ns1".into(),
            validity: 10 * DAY,
            refresh: 5 * DAY,
            creator,
            secret: None,
            lister: store.listers().get("ns1").unwrap().secrets.clone(),
        }
    }

    fn leaf(store: &MemoryStore) -> CertInfo {
        let secret = store.secret("ns1", "tls").expect("secret");
        let pem = secret_text(&secret, TLS_CERT_KEY).expect("tls.crt");
        parse_certificates(&pem).unwrap().remove(0).info
    }

    #[tokio::test]
    async fn serving_certificate_is_issued_for_service_names() {
        let store = MemoryStore::new(&["ns1"]);
        let ca = CertificateAuthority::generate("ns1_ca@1", 30 * DAY).unwrap();
        target(&store, TargetCertCreator::for_service("svc", "ns1"))
            .ensure_target_cert_key_pair(&store, &NoopRecorder, &ca, &[ca.trusted()])
            .await
            .expect("target");

        let info = leaf(&store);
        assert_eq!(info.dns_names, vec!["svc", "svc.ns1", "svc.ns1.svc"]);
        assert_eq!(info.issuer_common_name, "ns1_ca@1");
        assert!(info.server_auth);

        let secret = store.secret("ns1", "tls").unwrap();
        assert_eq!(secret_text(&secret, CA_CERT_KEY), Some(ca.cert_pem.clone()));
        assert_eq!(
            annotation(&secret.metadata, CERTIFICATE_HOSTNAMES_ANNOTATION),
            Some("svc,svc.ns1,svc.ns1.svc")
        );
        assert_eq!(store.writes()[0].verb, Verb::Create);
    }

    #[tokio::test]
    async fn client_certificate_is_issued_for_user() {
        let store = MemoryStore::new(&["ns1"]);
        let ca = CertificateAuthority::generate("ns1_ca@1", 30 * DAY).unwrap();
        target(&store, TargetCertCreator::Client { user: "alice".into() })
            .ensure_target_cert_key_pair(&store, &NoopRecorder, &ca, &[ca.trusted()])
            .await
            .expect("target");

        let info = leaf(&store);
        assert_eq!(info.common_name, "alice");
        assert!(info.client_auth);
        assert!(!info.server_auth);
        let secret = store.secret("ns1", "tls").unwrap();
        assert_eq!(annotation(&secret.metadata, CERTIFICATE_HOSTNAMES_ANNOTATION), None);
    }

    #[tokio::test]
    async fn current_target_is_left_alone() {
        let store = MemoryStore::new(&["ns1"]);
        let ca = CertificateAuthority::generate("ns1_ca@1", 30 * DAY).unwrap();
        let creator = TargetCertCreator::for_service("svc", "ns1");
        target(&store, creator.clone())
            .ensure_target_cert_key_pair(&store, &NoopRecorder, &ca, &[ca.trusted()])
            .await
            .unwrap();
        store.clear_writes();
        target(&store, creator)
            .ensure_target_cert_key_pair(&store, &NoopRecorder, &ca, &[ca.trusted()])
            .await
            .unwrap();
        assert!(store.writes().is_empty());
    }

    #[tokio::test]
    async fn new_issuer_reissues_target() {
        let store = MemoryStore::new(&["ns1"]);
        let old = CertificateAuthority::generate("ns1_ca@1", 30 * DAY).unwrap();
        let new = CertificateAuthority::generate("ns1_ca@2", 30 * DAY).unwrap();
        let creator = TargetCertCreator::Client { user: "alice".into() };
        target(&store, creator.clone())
            .ensure_target_cert_key_pair(&store, &NoopRecorder, &old, &[old.trusted()])
            .await
            .unwrap();
        store.clear_writes();

        target(&store, creator)
            .ensure_target_cert_key_pair(&store, &NoopRecorder, &new, &[new.trusted(), old.trusted()])
            .await
            .unwrap();
        assert_eq!(store.writes().len(), 1);
        assert_eq!(store.writes()[0].verb, Verb::Update);
        assert_eq!(leaf(&store).issuer_common_name, "ns1_ca@2");
        let secret = store.secret("ns1", "tls").unwrap();
        let trusted = parse_certificates(&secret_text(&secret, CA_CERT_KEY).unwrap()).unwrap();
        assert_eq!(trusted.len(), 2);
    }

    #[tokio::test]
    async fn ca_with_same_common_name_reissues_target() {
        let store = MemoryStore::new(&["ns1"]);
        let old = CertificateAuthority::generate("ns1_ca@1", 30 * DAY).unwrap();
        let new = CertificateAuthority::generate("ns1_ca@1", 30 * DAY).unwrap();
        let creator = TargetCertCreator::Client { user: "alice".into() };
        target(&store, creator.clone())
            .ensure_target_cert_key_pair(&store, &NoopRecorder, &old, &[old.trusted()])
            .await
            .unwrap();
        store.clear_writes();

        target(&store, creator)
            .ensure_target_cert_key_pair(&store, &NoopRecorder, &new, &[new.trusted(), old.trusted()])
            .await
            .unwrap();
        assert_eq!(store.writes().len(), 1);
    }

    #[tokio::test]
    async fn changed_hostnames_reissue_target() {
        let store = MemoryStore::new(&["ns1"]);
        let ca = CertificateAuthority::generate("ns1_ca@1", 30 * DAY).unwrap();
        target(&store, TargetCertCreator::for_service("svc", "ns1"))
            .ensure_target_cert_key_pair(&store, &NoopRecorder, &ca, &[ca.trusted()])
            .await
            .unwrap();
        store.clear_writes();

        target(&store, TargetCertCreator::for_service("other", "ns1"))
            .ensure_target_cert_key_pair(&store, &NoopRecorder, &ca, &[ca.trusted()])
            .await
            .unwrap();
        assert_eq!(store.writes().len(), 1);
        assert_eq!(leaf(&store).dns_names, vec!["other", "other.ns1", "other.ns1.svc"]);
    }

    #[test]
    fn hostnames_annotation_is_sorted() {
        let names = vec!["b".to_string(), "a".to_string(), "b".to_string()];
        assert_eq!(hostnames_annotation(&names), "a,b");
    }
}
