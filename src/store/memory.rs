//! In-memory object store for tests. Every successful write is recorded and
//! mirrored into reflector stores. Listers see it immediately unless the
//! cache is held, which queues watch events like a lagging watch would.

use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::{
    Resource, ResourceExt,
    core::ErrorResponse,
    runtime::{reflector::store::Writer, watcher},
};

use super::ObjectStore;
use crate::{
    Error, Result,
    cert_manager::{CertListers, ListerMap},
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verb {
    Create,
    Update,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Write {
    pub verb: Verb,
    pub kind: &'static str,
    pub namespace: String,
    pub name: String,
}

struct Namespace {
    secrets: Writer<Secret>,
    config_maps: Writer<ConfigMap>,
}

#[derive(Default)]
struct Inner {
    namespaces: BTreeMap<String, Namespace>,
    secrets: BTreeMap<(String, String), Secret>,
    config_maps: BTreeMap<(String, String), ConfigMap>,
    writes: Vec<Write>,
    version: u64,
    held: bool,
    pending_secrets: Vec<Secret>,
    pending_config_maps: Vec<ConfigMap>,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// A store watching `namespaces`, with synced and empty caches
    pub fn new(namespaces: &[&str]) -> Self {
        let mut inner = Inner::default();
        for ns in namespaces {
            let mut secrets = Writer::<Secret>::default();
            secrets.apply_watcher_event(&watcher::Event::Init);
            secrets.apply_watcher_event(&watcher::Event::InitDone);
            let mut config_maps = Writer::<ConfigMap>::default();
            config_maps.apply_watcher_event(&watcher::Event::Init);
            config_maps.apply_watcher_event(&watcher::Event::InitDone);
            inner.namespaces.insert(
                ns.to_string(),
                Namespace {
                    secrets,
                    config_maps,
                },
            );
        }
        Self {
            inner: Mutex::new(inner),
        }
    }

    pub fn listers(&self) -> ListerMap {
        self.lock()
            .namespaces
            .iter()
            .map(|(ns, w)| {
                (
                    ns.clone(),
                    CertListers {
                        secrets: w.secrets.as_reader(),
                        config_maps: w.config_maps.as_reader(),
                    },
                )
            })
            .collect()
    }

    pub fn writes(&self) -> Vec<Write> {
        self.lock().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.lock().writes.clear();
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.lock()
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn config_map(&self, namespace: &str, name: &str) -> Option<ConfigMap> {
        self.lock()
            .config_maps
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Replace an object behind the operator's back, bypassing the write log
    pub fn tamper_secret(&self, secret: Secret) {
        let mut inner = self.lock();
        let key = (secret.namespace().unwrap_or_default(), secret.name_any());
        inner.mirror_secret(secret.clone());
        inner.secrets.insert(key, secret);
    }

    /// Stop delivering writes to the listers until [`MemoryStore::flush_cache`]
    pub fn hold_cache(&self) {
        self.lock().held = true;
    }

    /// Deliver every queued write to the listers and stop holding them back
    pub fn flush_cache(&self) {
        let mut inner = self.lock();
        inner.held = false;
        for secret in std::mem::take(&mut inner.pending_secrets) {
            inner.mirror_secret(secret);
        }
        for config_map in std::mem::take(&mut inner.pending_config_maps) {
            inner.mirror_config_map(config_map);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("store lock poisoned")
    }
}

pub(crate) fn api_error(code: u16, reason: &str, message: String) -> Error {
    Error::KubeError(kube::Error::Api(ErrorResponse {
        status: "Failure".into(),
        message,
        reason: reason.into(),
        code,
    }))
}

impl Inner {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    fn mirror_secret(&mut self, secret: Secret) {
        if self.held {
            self.pending_secrets.push(secret);
            return;
        }
        let namespace = secret.namespace().unwrap_or_default();
        if let Some(ns) = self.namespaces.get_mut(&namespace) {
            ns.secrets.apply_watcher_event(&watcher::Event::Apply(secret));
        }
    }

    fn mirror_config_map(&mut self, config_map: ConfigMap) {
        if self.held {
            self.pending_config_maps.push(config_map);
            return;
        }
        let namespace = config_map.namespace().unwrap_or_default();
        if let Some(ns) = self.namespaces.get_mut(&namespace) {
            ns.config_maps
                .apply_watcher_event(&watcher::Event::Apply(config_map));
        }
    }

    fn record(&mut self, verb: Verb, kind: &'static str, namespace: &str, name: &str) {
        self.writes.push(Write {
            verb,
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
    }
}

fn prepare<K: Resource>(obj: &mut K, namespace: &str, version: String) {
    let meta = obj.meta_mut();
    meta.namespace = Some(namespace.to_string());
    meta.resource_version = Some(version);
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret> {
        self.secret(namespace, name)
            .ok_or_else(|| api_error(404, "NotFound", format!("secrets \"{name}\" not found")))
    }

    async fn create_secret(&self, namespace: &str, mut secret: Secret) -> Result<Secret> {
        let mut inner = self.lock();
        let key = (namespace.to_string(), secret.name_any());
        if inner.secrets.contains_key(&key) {
            return Err(api_error(
                409,
                "AlreadyExists",
                format!("secrets \"{}\" already exists", key.1),
            ));
        }
        let version = inner.next_version();
        prepare(&mut secret, namespace, version);
        inner.mirror_secret(secret.clone());
        inner.record(Verb::Create, "Secret", namespace, &key.1);
        inner.secrets.insert(key, secret.clone());
        Ok(secret)
    }

    async fn update_secret(&self, namespace: &str, mut secret: Secret) -> Result<Secret> {
        let mut inner = self.lock();
        let key = (namespace.to_string(), secret.name_any());
        let Some(current) = inner.secrets.get(&key) else {
            return Err(api_error(404, "NotFound", format!("secrets \"{}\" not found", key.1)));
        };
        if current.resource_version() != secret.resource_version() {
            return Err(api_error(
                409,
                "Conflict",
                format!("the object has been modified: secrets \"{}\"", key.1),
            ));
        }
        let version = inner.next_version();
        prepare(&mut secret, namespace, version);
        inner.mirror_secret(secret.clone());
        inner.record(Verb::Update, "Secret", namespace, &key.1);
        inner.secrets.insert(key, secret.clone());
        Ok(secret)
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap> {
        self.config_map(namespace, name).ok_or_else(|| {
            api_error(404, "NotFound", format!("configmaps \"{name}\" not found"))
        })
    }

    async fn create_config_map(&self, namespace: &str, mut config_map: ConfigMap) -> Result<ConfigMap> {
        let mut inner = self.lock();
        let key = (namespace.to_string(), config_map.name_any());
        if inner.config_maps.contains_key(&key) {
            return Err(api_error(
                409,
                "AlreadyExists",
                format!("configmaps \"{}\" already exists", key.1),
            ));
        }
        let version = inner.next_version();
        prepare(&mut config_map, namespace, version);
        inner.mirror_config_map(config_map.clone());
        inner.record(Verb::Create, "ConfigMap", namespace, &key.1);
        inner.config_maps.insert(key, config_map.clone());
        Ok(config_map)
    }

    async fn update_config_map(&self, namespace: &str, mut config_map: ConfigMap) -> Result<ConfigMap> {
        let mut inner = self.lock();
        let key = (namespace.to_string(), config_map.name_any());
        let Some(current) = inner.config_maps.get(&key) else {
            return Err(api_error(
                404,
                "NotFound",
                format!("configmaps \"{}\" not found", key.1),
            ));
        };
        if current.resource_version() != config_map.resource_version() {
            return Err(api_error(
                409,
                "Conflict",
                format!("the object has been modified: configmaps \"{}\"", key.1),
            ));
        }
        let version = inner.next_version();
        prepare(&mut config_map, namespace, version);
        inner.mirror_config_map(config_map.clone());
        inner.record(Verb::Update, "ConfigMap", namespace, &key.1);
        inner.config_maps.insert(key, config_map.clone());
        Ok(config_map)
    }
}
