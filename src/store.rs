use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::{
    Client,
    api::{Api, PostParams, ResourceExt},
};

#[cfg(test)]
use mockall::automock;

use crate::{Error, Result};

#[cfg(test)]
pub(crate) mod memory;

/// Direct reads and writes against the cluster object store.
///
/// Listers serve cached reads; every write goes through here. `create` fails
/// with `AlreadyExists` on a race and `get` with `NotFound` when absent, see
/// [`Error::is_already_exists`] and [`Error::is_not_found`]. `update` is
/// optimistic and reports a stale resource version as a conflict.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret>;
    async fn create_secret(&self, namespace: &str, secret: Secret) -> Result<Secret>;
    async fn update_secret(&self, namespace: &str, secret: Secret) -> Result<Secret>;

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap>;
    async fn create_config_map(&self, namespace: &str, config_map: ConfigMap) -> Result<ConfigMap>;
    async fn update_config_map(&self, namespace: &str, config_map: ConfigMap) -> Result<ConfigMap>;
}

#[async_trait]
impl ObjectStore for Client {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret> {
        let api: Api<Secret> = Api::namespaced(self.clone(), namespace);
        api.get(name).await.map_err(Error::KubeError)
    }

    async fn create_secret(&self, namespace: &str, secret: Secret) -> Result<Secret> {
        let api: Api<Secret> = Api::namespaced(self.clone(), namespace);
        api.create(&PostParams::default(), &secret)
            .await
            .map_err(Error::KubeError)
    }

    async fn update_secret(&self, namespace: &str, secret: Secret) -> Result<Secret> {
        let api: Api<Secret> = Api::namespaced(self.clone(), namespace);
        api.replace(&secret.name_any(), &PostParams::default(), &secret)
            .await
            .map_err(Error::KubeError)
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap> {
        let api: Api<ConfigMap> = Api::namespaced(self.clone(), namespace);
        api.get(name).await.map_err(Error::KubeError)
    }

    async fn create_config_map(&self, namespace: &str, config_map: ConfigMap) -> Result<ConfigMap> {
        let api: Api<ConfigMap> = Api::namespaced(self.clone(), namespace);
        api.create(&PostParams::default(), &config_map)
            .await
            .map_err(Error::KubeError)
    }

    async fn update_config_map(&self, namespace: &str, config_map: ConfigMap) -> Result<ConfigMap> {
        let api: Api<ConfigMap> = Api::namespaced(self.clone(), namespace);
        api.replace(&config_map.name_any(), &PostParams::default(), &config_map)
            .await
            .map_err(Error::KubeError)
    }
}
