use chrono::Utc;
use k8s_openapi::api::core::v1::Secret;
use kube::api::ObjectMeta;
use tracing::*;

use super::{
    CertManager,
    cache::CertListers,
    cert_config::{apply_cert_config, fingerprint},
    types::{CertificateConfig, CertificateDefinition, ResourceRef, Stages, TargetKind, TargetStage},
};
use crate::{
    Result,
    certrotation::{
        CaBundleConfigMap, CertificateAuthority, RotatedSigningCaSecret, RotatedTargetSecret,
        TargetCertCreator, TrustedCertificate,
    },
};

impl CertManager {
    /// Reconcile `definitions` in order, each one signer first, then bundle,
    /// then target.
    ///
    /// Every definition is validated and every namespace it touches is
    /// resolved before the first write. The pass stops at the first error and
    /// returns it; definitions already handled are not rolled back.
    pub async fn sync(&self, definitions: &[CertificateDefinition]) -> Result<()> {
        let mut plans = Vec::with_capacity(definitions.len());
        for definition in definitions {
            let stages = definition.stages()?;
            for ns in definition.namespaces() {
                self.listers.get(ns)?;
            }
            plans.push((definition, stages));
        }

        for (definition, stages) in plans {
            debug!("Syncing certificates of signer {}", definition.signer_secret);
            let ca = self.ensure_signer(definition).await?;
            let (bundle, target) = match stages {
                Stages::SignerOnly => continue,
                Stages::SignerAndBundle { bundle } => (bundle, None),
                Stages::Full { bundle, target } => (bundle, Some(target)),
            };
            let trusted = self.ensure_cert_bundle(bundle, &ca).await?;
            if let Some(target) = target {
                self.ensure_target(&target, &ca, trusted).await?;
            }
        }
        Ok(())
    }

    pub(super) async fn ensure_signer(
        &self,
        definition: &CertificateDefinition,
    ) -> Result<CertificateAuthority> {
        let signer = &definition.signer_secret;
        let listers = self.listers.get(&signer.namespace)?;
        let secret = self.ensure_secret_exists(listers, signer).await?;
        let secret = self
            .ensure_cert_config(secret, signer, &definition.signer_config)
            .await?;

        self.rotation
            .ensure_signing_cert_key_pair(RotatedSigningCaSecret {
                name: signer.name.clone(),
                namespace: signer.namespace.clone(),
                validity: definition.signer_config.lifetime(),
                refresh: definition.signer_config.refresh(),
                secret: Some(secret),
                lister: listers.secrets.clone(),
            })
            .await
    }

    pub(super) async fn ensure_cert_bundle(
        &self,
        bundle: &ResourceRef,
        ca: &CertificateAuthority,
    ) -> Result<Vec<TrustedCertificate>> {
        let listers = self.listers.get(&bundle.namespace)?;
        self.rotation
            .ensure_config_map_ca_bundle(
                CaBundleConfigMap {
                    name: bundle.name.clone(),
                    namespace: bundle.namespace.clone(),
                    lister: listers.config_maps.clone(),
                },
                ca.clone(),
            )
            .await
    }

    pub(super) async fn ensure_target(
        &self,
        target: &TargetStage<'_>,
        ca: &CertificateAuthority,
        bundle: Vec<TrustedCertificate>,
    ) -> Result<()> {
        let secret_ref = target.secret;
        let listers = self.listers.get(&secret_ref.namespace)?;
        let secret = self.ensure_secret_exists(listers, secret_ref).await?;
        let secret = self
            .ensure_cert_config(secret, secret_ref, &target.config)
            .await?;

        let creator = match &target.kind {
            TargetKind::Serving { service } => {
                TargetCertCreator::for_service(service, &secret_ref.namespace)
            }
            TargetKind::Client { user } => TargetCertCreator::Client { user: user.clone() },
        };
        self.rotation
            .ensure_target_cert_key_pair(
                RotatedTargetSecret {
                    name: secret_ref.name.clone(),
                    namespace: secret_ref.namespace.clone(),
                    validity: target.config.lifetime(),
                    refresh: target.config.refresh(),
                    creator,
                    secret: Some(secret),
                    lister: listers.secrets.clone(),
                },
                ca.clone(),
                bundle,
            )
            .await
    }

    /// Cached secret, or a new empty one when the cache has none
    pub(super) async fn ensure_secret_exists(
        &self,
        listers: &CertListers,
        secret_ref: &ResourceRef,
    ) -> Result<Secret> {
        let ResourceRef { namespace, name } = secret_ref;
        if let Some(secret) = listers.secret(namespace, name) {
            return Ok(secret);
        }

        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                ..ObjectMeta::default()
            },
            ..Secret::default()
        };
        match self.client.create_secret(namespace, secret).await {
            Ok(secret) => {
                info!("Created secret {}", secret_ref);
                Ok(secret)
            }
            Err(e) if e.is_already_exists() => {
                debug!("Secret {} appeared before the cache saw it", secret_ref);
                self.client.get_secret(namespace, name).await
            }
            Err(e) => Err(e),
        }
    }

    /// Persist the fingerprint of `config` on `secret` when it drifted,
    /// forcing the certificate due.
    pub(super) async fn ensure_cert_config(
        &self,
        secret: Secret,
        secret_ref: &ResourceRef,
        config: &CertificateConfig,
    ) -> Result<Secret> {
        let desired = fingerprint(config)?;
        let Some(updated) = apply_cert_config(&secret, &desired, Utc::now()) else {
            return Ok(secret);
        };
        info!("Certificate config of {} changed to {}", secret_ref, desired);
        self.client
            .update_secret(&secret_ref.namespace, updated)
            .await
    }
}
