use std::{collections::BTreeMap, fmt::Debug, sync::Arc};

use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::{
    Client, Resource,
    api::Api,
    runtime::{
        WatchStreamExt,
        reflector::{self, ObjectRef, Store},
        watcher,
    },
};
use serde::de::DeserializeOwned;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::{Error, Result};

/// Read-only cached views of one namespace
#[derive(Clone)]
pub struct CertListers {
    pub secrets: Store<Secret>,
    pub config_maps: Store<ConfigMap>,
}

impl CertListers {
    pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.secrets
            .get(&ObjectRef::new(name).within(namespace))
            .map(|s| (*s).clone())
    }

    pub fn config_map(&self, namespace: &str, name: &str) -> Option<ConfigMap> {
        self.config_maps
            .get(&ObjectRef::new(name).within(namespace))
            .map(|cm| (*cm).clone())
    }
}

/// Listers of every watched namespace, fixed once the caches have synced
#[derive(Clone, Default)]
pub struct ListerMap(Arc<BTreeMap<String, CertListers>>);

impl ListerMap {
    pub fn get(&self, namespace: &str) -> Result<&CertListers> {
        self.0
            .get(namespace)
            .ok_or_else(|| Error::NoCacheForNamespace(namespace.to_string()))
    }

    pub fn namespaces(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

impl FromIterator<(String, CertListers)> for ListerMap {
    fn from_iter<I: IntoIterator<Item = (String, CertListers)>>(iter: I) -> Self {
        Self(Arc::new(iter.into_iter().collect()))
    }
}

/// Start secret and config map watches for each namespace and wait until all
/// of them completed their initial listing.
///
/// The watches keep running until `cancel` fires. Fails with
/// [`Error::CacheSyncTimeout`] when `sync_timeout` elapses or `cancel` fires
/// before every cache is synced.
pub async fn start_informers(
    client: Client,
    namespaces: &[String],
    cancel: CancellationToken,
    sync_timeout: Duration,
) -> Result<ListerMap> {
    let deadline = Instant::now() + sync_timeout;
    let mut listers = BTreeMap::new();
    for ns in namespaces {
        if listers.contains_key(ns) {
            continue;
        }
        let ns_listers = CertListers {
            secrets: spawn_reflector(Api::<Secret>::namespaced(client.clone(), ns), cancel.clone()),
            config_maps: spawn_reflector(
                Api::<ConfigMap>::namespaced(client.clone(), ns),
                cancel.clone(),
            ),
        };
        wait_for_cache_sync(ns, &ns_listers, deadline, &cancel).await?;
        info!("Caches for namespace {} synced", ns);
        listers.insert(ns.clone(), ns_listers);
    }
    Ok(ListerMap(Arc::new(listers)))
}

fn spawn_reflector<K>(api: Api<K>, cancel: CancellationToken) -> Store<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let (reader, writer) = reflector::store();
    let stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .reflect(writer);
    tokio::spawn(async move {
        let watch = stream.for_each(|event| {
            if let Err(e) = event {
                warn!("watch failed: {e}");
            }
            futures::future::ready(())
        });
        tokio::select! {
            _ = cancel.cancelled() => debug!("watch stopped"),
            _ = watch => warn!("watch stream ended"),
        }
    });
    reader
}

/// Block until both caches of `ns` are ready, the deadline passes or `cancel` fires
pub async fn wait_for_cache_sync(
    ns: &str,
    listers: &CertListers,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<()> {
    let synced = async {
        listers.secrets.wait_until_ready().await?;
        listers.config_maps.wait_until_ready().await
    };
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::CacheSyncTimeout(format!(
            "cancelled while waiting for namespace {ns}"
        ))),
        res = tokio::time::timeout_at(deadline, synced) => match res {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::CacheSyncTimeout(format!("namespace {ns}: {e}"))),
            Err(_) => Err(Error::CacheSyncTimeout(format!(
                "timed out waiting for namespace {ns}"
            ))),
        },
    }
}
