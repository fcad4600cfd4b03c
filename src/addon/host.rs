//! Host registry of add-on instances.
//!
//! The host maps add-on ids to their supervisors and routes calls to them.
//! Entries are only removed when the host is disposed.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::{Value, json};
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::AddonError;
use super::descriptor::DescriptorResolver;
use super::manifest::{AddonCatalog, AddonManifest};
use super::protocol::{
    AddonCommand, CommandList, METHOD_GET_COMMANDS, METHOD_PING, METHOD_RUN_COMMAND,
    RunCommandParams,
};
use super::supervisor::{AddonInstance, ManifestLaunch, StatusSnapshot};
use crate::config::HostConfig;

/// Registry of running out-of-process add-ons.
pub struct AddonHost {
    /// Host configuration.
    config: HostConfig,
    /// Resolver shared by all instances.
    resolver: DescriptorResolver,
    /// Supervisors by add-on id.
    instances: RwLock<HashMap<String, Arc<AddonInstance>>>,
    /// Set once by `dispose`.
    disposed: AtomicBool,
}

impl AddonHost {
    /// Creates an empty host.
    #[must_use]
    pub fn new(config: HostConfig) -> Self {
        Self {
            resolver: config.resolver(),
            config,
            instances: RwLock::new(HashMap::new()),
            disposed: AtomicBool::new(false),
        }
    }

    /// Host configuration.
    #[must_use]
    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Returns true once `dispose` has run.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn ensure_live(&self) -> Result<(), AddonError> {
        if self.is_disposed() {
            return Err(AddonError::HostDisposed);
        }
        Ok(())
    }

    /// Out-of-process, non-disabled manifests in startup order (name, then id).
    #[must_use]
    pub fn enabled_manifests<C: AddonCatalog + ?Sized>(&self, catalog: &C) -> Vec<AddonManifest> {
        let mut manifests: Vec<AddonManifest> = catalog
            .manifests()
            .into_iter()
            .filter(|m| m.is_out_of_process() && !self.config.is_disabled(&m.id))
            .collect();
        manifests.sort_by(|a, b| {
            a.sort_name()
                .to_lowercase()
                .cmp(&b.sort_name().to_lowercase())
                .then_with(|| a.id.cmp(&b.id))
        });
        manifests
    }

    /// Starts every enabled out-of-process add-on in the catalog.
    ///
    /// Returns an error message per add-on that failed to start.
    pub async fn start_all_enabled<C: AddonCatalog + ?Sized>(
        &self,
        catalog: &C,
    ) -> BTreeMap<String, String> {
        let mut failures = BTreeMap::new();
        for manifest in self.enabled_manifests(catalog) {
            info!("Starting add-on {} ({})", manifest.sort_name(), manifest.id);
            if let Err(e) = self.try_start(&manifest).await {
                warn!("Add-on {} failed to start: {}", manifest.id, e);
                failures.insert(manifest.id.clone(), e.to_string());
            }
        }
        failures
    }

    /// Starts one add-on, registering it on first use.
    ///
    /// When this call brings a process up and `probe_on_start` is set, the
    /// add-on must answer a ping before this returns.
    pub async fn try_start(&self, manifest: &AddonManifest) -> Result<(), AddonError> {
        self.ensure_live()?;

        let instance = match self.instance(&manifest.id).await {
            Some(instance) => instance,
            None => self.register(manifest).await?,
        };

        let result = if self.config.probe_on_start {
            instance.start_and_probe(METHOD_PING, json!({})).await
        } else {
            instance.ensure_started().await
        };
        if self.is_disposed() {
            instance.stop().await;
            return Err(AddonError::HostDisposed);
        }

        match result {
            Ok(true) => info!("Add-on {} is running", manifest.id),
            Ok(false) => {}
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Resolves the manifest, then inserts a supervisor unless another
    /// caller won the race for the same id.
    async fn register(&self, manifest: &AddonManifest) -> Result<Arc<AddonInstance>, AddonError> {
        self.resolver.resolve(manifest)?;

        let candidate = Arc::new(AddonInstance::new(
            manifest.id.clone(),
            ManifestLaunch::new(manifest.clone(), self.resolver.clone()),
            self.config.instance_options(),
        ));

        let mut instances = self.instances.write().await;
        self.ensure_live()?;
        let instance = instances
            .entry(manifest.id.clone())
            .or_insert(candidate);
        Ok(Arc::clone(instance))
    }

    async fn instance(&self, addon_id: &str) -> Option<Arc<AddonInstance>> {
        self.instances.read().await.get(addon_id).cloned()
    }

    /// Calls a method on a started add-on.
    pub async fn try_invoke(
        &self,
        addon_id: &str,
        method: &str,
        params: Value,
    ) -> Result<Value, AddonError> {
        self.ensure_live()?;
        let instance = self
            .instance(addon_id)
            .await
            .ok_or_else(|| AddonError::NotStarted(addon_id.to_string()))?;
        instance.try_invoke(method, params).await
    }

    /// Lists the commands an add-on exposes.
    pub async fn get_commands(&self, addon_id: &str) -> Result<Vec<AddonCommand>, AddonError> {
        let result = self
            .try_invoke(addon_id, METHOD_GET_COMMANDS, json!({}))
            .await?;
        let list: CommandList = serde_json::from_value(result)?;
        Ok(list.commands)
    }

    /// Runs one of an add-on's commands.
    pub async fn run_command(&self, addon_id: &str, command_id: &str) -> Result<Value, AddonError> {
        let params = serde_json::to_value(RunCommandParams {
            id: command_id.to_string(),
        })?;
        self.try_invoke(addon_id, METHOD_RUN_COMMAND, params).await
    }

    /// Stops an add-on's process. Returns false for unknown ids.
    pub async fn try_stop(&self, addon_id: &str) -> Result<bool, AddonError> {
        self.ensure_live()?;
        match self.instance(addon_id).await {
            Some(instance) => {
                instance.stop().await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Status of every registered add-on, ordered by id.
    pub async fn snapshots(&self) -> Result<Vec<StatusSnapshot>, AddonError> {
        self.ensure_live()?;
        let instances = self.instances.read().await;
        let mut snapshots: Vec<StatusSnapshot> =
            instances.values().map(|i| i.snapshot()).collect();
        snapshots.sort_by(|a, b| a.addon_id.cmp(&b.addon_id));
        Ok(snapshots)
    }

    /// Number of registered add-ons.
    pub async fn len(&self) -> usize {
        self.instances.read().await.len()
    }

    /// Returns true if no add-on is registered.
    pub async fn is_empty(&self) -> bool {
        self.instances.read().await.is_empty()
    }

    /// Stops every add-on and clears the registry. Safe to call twice.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        let drained: Vec<Arc<AddonInstance>> = {
            let mut instances = self.instances.write().await;
            instances.drain().map(|(_, instance)| instance).collect()
        };

        let count = drained.len();
        for instance in drained {
            instance.stop().await;
        }
        info!("Add-on host disposed ({} add-on(s) stopped)", count);
    }
}
