use std::time::Duration as StdDuration;

use duration_string::DurationString;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::{Error, Result};

/// Namespace and name of a Secret or ConfigMap
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    pub namespace: String,
    pub name: String,
}

impl ResourceRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Desired validity and renewal lead time of a certificate
#[derive(Deserialize, Serialize, Clone, Copy, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CertificateConfig {
    pub lifetime: DurationString,
    pub refresh: DurationString,
}

impl CertificateConfig {
    pub fn new(lifetime: StdDuration, refresh: StdDuration) -> Self {
        Self {
            lifetime: DurationString::new(lifetime),
            refresh: DurationString::new(refresh),
        }
    }

    pub fn lifetime(&self) -> StdDuration {
        self.lifetime.into()
    }

    pub fn refresh(&self) -> StdDuration {
        self.refresh.into()
    }
}

/// One signer, optionally followed by a trust bundle and a leaf certificate
#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CertificateDefinition {
    pub signer_secret: ResourceRef,
    pub signer_config: CertificateConfig,
    pub cert_bundle_configmap: Option<ResourceRef>,
    pub target_secret: Option<ResourceRef>,
    pub target_config: Option<CertificateConfig>,
    pub target_service: Option<String>,
    pub target_user: Option<String>,
}

/// What the leaf certificate is bound to
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TargetKind {
    /// Serving certificate for the DNS names of a service
    Serving { service: String },
    /// Client certificate for a user identity
    Client { user: String },
}

#[derive(Clone, Debug)]
pub struct TargetStage<'a> {
    pub secret: &'a ResourceRef,
    pub config: CertificateConfig,
    pub kind: TargetKind,
}

/// Stages to run for a definition, always in signer, bundle, target order
#[derive(Clone, Debug)]
pub enum Stages<'a> {
    SignerOnly,
    SignerAndBundle {
        bundle: &'a ResourceRef,
    },
    Full {
        bundle: &'a ResourceRef,
        target: TargetStage<'a>,
    },
}

impl CertificateDefinition {
    /// Check the definition and derive its stage pipeline.
    ///
    /// A target without a bundle is never reached, so it is accepted and ignored.
    pub fn stages(&self) -> Result<Stages<'_>> {
        check_ref("signerSecret", &self.signer_secret)?;
        let Some(bundle) = &self.cert_bundle_configmap else {
            return Ok(Stages::SignerOnly);
        };
        check_ref("certBundleConfigmap", bundle)?;
        let Some(secret) = &self.target_secret else {
            return Ok(Stages::SignerAndBundle { bundle });
        };
        check_ref("targetSecret", secret)?;
        let config = self.target_config.ok_or_else(|| {
            Error::InvalidDefinition(format!("targetSecret {secret} requires targetConfig"))
        })?;
        let kind = match (&self.target_service, &self.target_user) {
            (Some(service), None) if !service.is_empty() => TargetKind::Serving {
                service: service.clone(),
            },
            (None, Some(user)) if !user.is_empty() => TargetKind::Client { user: user.clone() },
            (Some(_), Some(_)) => {
                return Err(Error::InvalidDefinition(format!(
                    "targetSecret {secret} sets both targetService and targetUser"
                )));
            }
            _ => {
                return Err(Error::InvalidDefinition(format!(
                    "targetSecret {secret} requires a non-empty targetService or targetUser"
                )));
            }
        };
        Ok(Stages::Full {
            bundle,
            target: TargetStage {
                secret,
                config,
                kind,
            },
        })
    }

    /// Every namespace any stage of this definition reads from
    pub fn namespaces(&self) -> Vec<&str> {
        let mut namespaces = vec![self.signer_secret.namespace.as_str()];
        if let Some(bundle) = &self.cert_bundle_configmap {
            namespaces.push(bundle.namespace.as_str());
            if let Some(target) = &self.target_secret {
                namespaces.push(target.namespace.as_str());
            }
        }
        namespaces
    }
}

fn check_ref(field: &str, r: &ResourceRef) -> Result<()> {
    if r.namespace.is_empty() || r.name.is_empty() {
        return Err(Error::InvalidDefinition(format!(
            "{field} needs both namespace and name, got `{r}`"
        )));
    }
    Ok(())
}

/// Validate a whole list before anything is written for it
pub fn validate_definitions(definitions: &[CertificateDefinition]) -> Result<()> {
    for definition in definitions {
        definition.stages()?;
    }
    Ok(())
}
