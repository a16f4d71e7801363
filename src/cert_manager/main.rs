use std::sync::Arc;

use chrono::{DateTime, Utc};
use kube::{
    client::Client,
    runtime::events::{Recorder, Reporter},
};
use serde::Serialize;
use tokio::{sync::RwLock, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::*;

use super::cache::{ListerMap, start_informers};
use crate::{
    Error, Result,
    certrotation::{CertRotation, Rotation},
    config::Settings,
    events_helper::EventRecorder,
    store::ObjectStore,
};

pub static MANAGER_NAME: &str = "cert-rotator";

/// Reconciles certificate definitions against cached cluster state
#[derive(Clone)]
pub struct CertManager {
    /// Direct reads and writes
    pub(super) client: Arc<dyn ObjectStore>,
    /// Key pair and bundle maintenance
    pub(super) rotation: Arc<dyn Rotation>,
    /// Synced listers of every watched namespace
    pub(super) listers: ListerMap,
}

impl CertManager {
    pub fn new(client: Arc<dyn ObjectStore>, rotation: Arc<dyn Rotation>, listers: ListerMap) -> Self {
        Self {
            client,
            rotation,
            listers,
        }
    }

    /// Watch `namespaces` and return a manager once every cache has synced.
    ///
    /// Watches stop when `cancel` fires.
    pub async fn start(
        client: Client,
        namespaces: &[String],
        recorder: Arc<dyn EventRecorder>,
        cancel: CancellationToken,
        sync_timeout: std::time::Duration,
    ) -> Result<Self> {
        let listers = start_informers(client.clone(), namespaces, cancel, sync_timeout).await?;
        let store: Arc<dyn ObjectStore> = Arc::new(client);
        let rotation = Arc::new(CertRotation::new(store.clone(), recorder));
        Ok(Self::new(store, rotation, listers))
    }

    pub fn listers(&self) -> &ListerMap {
        &self.listers
    }
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_sync: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub definitions: usize,
    pub syncs: u64,
    #[serde(skip)]
    pub reporter: Reporter,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_sync: None,
            last_error: None,
            definitions: 0,
            syncs: 0,
            reporter: MANAGER_NAME.into(),
        }
    }
}

impl Diagnostics {
    fn recorder(&self, client: Client) -> Recorder {
        Recorder::new(client, self.reporter.clone())
    }

    fn record_sync(&mut self, definitions: usize, result: &Result<()>) {
        self.last_sync = Some(Utc::now());
        self.definitions = definitions;
        self.syncs += 1;
        self.last_error = result.as_ref().err().map(ToString::to_string);
    }
}

/// State shared between the sync loop and the web server
#[derive(Clone, Default)]
pub struct State {
    diagnostics: Arc<RwLock<Diagnostics>>,
}

impl State {
    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    /// Healthy until a sync has failed, cleared by the next successful one
    pub async fn healthy(&self) -> bool {
        self.diagnostics.read().await.last_error.is_none()
    }

    async fn record_sync(&self, definitions: usize, result: &Result<()>) {
        self.diagnostics.write().await.record_sync(definitions, result);
    }
}

/// Bootstrap the caches, then sync every definition once per resync interval
/// until `cancel` fires.
pub async fn run(state: State, settings: Settings, cancel: CancellationToken) -> Result<()> {
    let client = Client::try_default().await.map_err(Error::KubeError)?;
    let recorder = state.diagnostics.read().await.recorder(client.clone());
    info!("Watching namespaces {:?}", settings.namespaces);
    let manager = CertManager::start(
        client,
        &settings.namespaces,
        Arc::new(recorder),
        cancel.clone(),
        settings.cache_sync_timeout,
    )
    .await?;

    let mut ticker = tokio::time::interval(settings.resync_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Stopping certificate sync");
                return Ok(());
            }
            _ = ticker.tick() => {}
        }
        let result = manager.sync(&settings.definitions).await;
        match &result {
            Ok(()) => debug!("Synced {} definition(s)", settings.definitions.len()),
            Err(e) => warn!("sync failed: {}", e),
        }
        state.record_sync(settings.definitions.len(), &result).await;
    }
}
