//! Keeps signer, CA bundle and target certificates of a list of
//! [`CertificateDefinition`]s in place, reading through per-namespace caches.

mod cache;
mod cert_config;
mod main;
mod sync;
mod types;

pub use cache::{CertListers, ListerMap, start_informers, wait_for_cache_sync};
pub use cert_config::{CERT_CONFIG_ANNOTATION, apply_cert_config, fingerprint, format_duration};
pub use main::{CertManager, Diagnostics, State, run};
pub use types::{
    CertificateConfig, CertificateDefinition, ResourceRef, Stages, TargetKind, TargetStage,
    validate_definitions,
};
