use std::{collections::BTreeMap, time::Duration as StdDuration};

use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::core::v1::Secret;
use serde::{Deserialize, Serialize};

use super::types::CertificateConfig;
use crate::{Error, Result, certrotation::CERTIFICATE_NOT_AFTER_ANNOTATION};

/// Annotation holding the policy a managed secret was last reconciled with
pub static CERT_CONFIG_ANNOTATION: &str = "certrotation.operator.io/certConfig";

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
struct SerializedCertConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    lifetime: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    refresh: String,
}

/// Canonical annotation value for a certificate config
pub fn fingerprint(config: &CertificateConfig) -> Result<String> {
    let scc = SerializedCertConfig {
        lifetime: format_duration(config.lifetime()),
        refresh: format_duration(config.refresh()),
    };
    serde_json::to_string(&scc).map_err(Error::SerializationError)
}

/// Returns the secret to persist when its recorded policy differs from `desired`.
///
/// A present not-after annotation is moved to `now` so the rotation library
/// treats the certificate as expired on its next pass.
pub fn apply_cert_config(secret: &Secret, desired: &str, now: DateTime<Utc>) -> Option<Secret> {
    let current = secret
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(CERT_CONFIG_ANNOTATION));
    if current.map(String::as_str) == Some(desired) {
        return None;
    }

    let mut updated = secret.clone();
    let annotations = updated.metadata.annotations.get_or_insert_with(BTreeMap::new);
    if let Some(not_after) = annotations.get_mut(CERTIFICATE_NOT_AFTER_ANNOTATION) {
        *not_after = now.to_rfc3339_opts(SecondsFormat::Secs, true);
    }
    annotations.insert(CERT_CONFIG_ANNOTATION.to_string(), desired.to_string());
    Some(updated)
}

/// Render a duration as hours, minutes and seconds, e.g. `720h0m0s`, `1m30s`, `1.5s`, `250ms`.
pub fn format_duration(d: StdDuration) -> String {
    if d.is_zero() {
        return "0s".to_string();
    }
    let nanos = d.subsec_nanos();
    let secs = d.as_secs();
    if secs == 0 {
        return if nanos % 1_000_000 == 0 {
            format!("{}ms", nanos / 1_000_000)
        } else if nanos >= 1_000_000 {
            format!("{}ms", trim_fraction(u64::from(nanos / 1_000_000), nanos % 1_000_000, 6))
        } else if nanos % 1_000 == 0 {
            format!("{}µs", nanos / 1_000)
        } else if nanos >= 1_000 {
            format!("{}µs", trim_fraction(u64::from(nanos / 1_000), nanos % 1_000, 3))
        } else {
            format!("{nanos}ns")
        };
    }

    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = trim_fraction(secs % 60, nanos, 9);
    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}

fn trim_fraction(whole: u64, fraction: u32, digits: usize) -> String {
    if fraction == 0 {
        return whole.to_string();
    }
    let fraction = format!("{fraction:0digits$}");
    format!("{whole}.{}", fraction.trim_end_matches('0'))
}
