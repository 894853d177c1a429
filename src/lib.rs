// Flotilla - workload-aware node autoscaler core
// Watches pending pods that fit nowhere, plans the cheapest set of new
// nodes to run them, and later removes or replaces nodes the cluster no
// longer needs

pub mod api;
pub mod batcher;
pub mod cluster_state;
pub mod consolidation;
pub mod controllers;
pub mod instance_types;
pub mod node_template;
pub mod provider;
pub mod requirements;
pub mod resources;
pub mod scheduler;
pub mod topology;
pub mod volumes;

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::Pod;
use crate::batcher::{BatcherConfig, PodBatcher};
use crate::cluster_state::ClusterState;
use crate::consolidation::{
    build_candidates, Command, Consolidation, ConsolidationConfig,
};
use crate::controllers::{ControllerConfig, StateReconciler};
use crate::instance_types::{Catalog, InstanceType};
use crate::provider::{CloudProvider, Launcher, ProviderError};
use crate::scheduler::{Scheduler, SchedulerConfig, SchedulingResults};

/// Optional behaviors, off by default
#[derive(Clone, Copy, Debug, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct FeatureGates {
    pub drift: bool,
    pub spot_to_spot_consolidation: bool,
}

/// Aggregated configuration for the whole engine
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub batcher: BatcherConfig,
    pub scheduler: SchedulerConfig,
    pub consolidation: ConsolidationConfig,
    pub controllers: ControllerConfig,
    pub feature_gates: FeatureGates,
}

impl EngineConfig {
    /// Parse configuration from JSON; absent fields keep their defaults
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// The autoscaler core: cluster mirror, provisioning pass, disruption
/// planning and the provider seam, wired together
pub struct Engine {
    state: Arc<ClusterState>,
    reconciler: StateReconciler,
    catalog: Catalog,
    scheduler: Scheduler,
    consolidation: Consolidation,
    launcher: Launcher,
    provider: Arc<dyn CloudProvider>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(provider: Arc<dyn CloudProvider>, config: EngineConfig) -> Self {
        let state = Arc::new(ClusterState::new());
        let mut consolidation_config = config.consolidation.clone();
        consolidation_config.drift = config.feature_gates.drift;
        consolidation_config.spot_to_spot = config.feature_gates.spot_to_spot_consolidation;

        Self {
            reconciler: StateReconciler::new(state.clone(), config.controllers.clone()),
            catalog: Catalog::new(),
            scheduler: Scheduler::new(config.scheduler.clone()),
            consolidation: Consolidation::new(
                consolidation_config,
                Scheduler::new(config.scheduler.clone()),
            ),
            launcher: Launcher::new(provider.clone()),
            provider,
            state,
            config,
        }
    }

    pub fn state(&self) -> Arc<ClusterState> {
        self.state.clone()
    }

    pub fn reconciler(&self) -> &StateReconciler {
        &self.reconciler
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start the background reconciler workers
    pub fn start(&self) {
        self.reconciler.start();
        info!("engine started");
    }

    pub fn stop(&self) {
        self.reconciler.stop();
    }

    /// Re-fetch instance types for every known pool
    pub async fn refresh_catalog(&self) -> Result<(), ProviderError> {
        for pool in self.state.pools() {
            let types = self.provider.get_instance_types(&pool).await?;
            self.catalog.update(&pool.name, types);
        }
        Ok(())
    }

    fn catalog_map(&self) -> HashMap<String, Arc<Vec<Arc<InstanceType>>>> {
        let mut map = HashMap::new();
        for pool in self.state.pools() {
            if let Some(types) = self.catalog.get(&pool.name) {
                map.insert(pool.name.clone(), types);
            }
        }
        map
    }

    /// A feed for unschedulable-pod observations plus the batcher that
    /// windows them for `run`
    pub fn pod_feed(&self) -> (tokio::sync::mpsc::UnboundedSender<Arc<Pod>>, PodBatcher) {
        PodBatcher::new(self.config.batcher.clone())
    }

    /// The provisioning loop: batch pending pods, provision, repeat until
    /// cancelled
    pub async fn run(&self, mut batcher: PodBatcher, cancel: CancellationToken) {
        loop {
            let batch = batcher.next_batch(&cancel).await;
            if batch.is_empty() {
                // Only cancellation or a closed feed yields an empty batch
                break;
            }
            debug!(pods = batch.len(), "provisioning batch");
            self.provision(batch, &cancel).await;
        }
    }

    /// One provisioning pass: schedule the batch against a fresh snapshot,
    /// then launch the resulting claims. Launched claims enter the mirror
    /// as in-flight nodes so the next pass packs onto them. Claims that
    /// fail to launch simply re-enter via their pods next pass.
    pub async fn provision(
        &self,
        pods: Vec<Arc<Pod>>,
        cancel: &CancellationToken,
    ) -> SchedulingResults {
        let snapshot = self.state.snapshot();
        let catalog = self.catalog_map();
        let mut results = self.scheduler.schedule(&snapshot, &catalog, &pods, cancel);
        if results.aborted {
            return results;
        }

        for claim in &mut results.new_claims {
            match self.launcher.launch(claim).await {
                Ok(machine) => {
                    debug!(claim = %claim.meta.name, instance_type = %machine.instance_type,
                           "claim launched");
                    self.state.apply_node_claim(claim.clone());
                    // Anything new to schedule must re-reckon with the fleet
                    self.consolidation.reset();
                }
                Err(err) => {
                    warn!(claim = %claim.meta.name, %err, "claim launch failed");
                }
            }
        }
        results
    }

    /// One disruption pass: empty nodes first, then the single-node solver,
    /// then the multi-node binary search; validate the winner on a fresh
    /// snapshot after the validation window, then execute it.
    pub async fn disrupt(&self, cancel: &CancellationToken) -> Command {
        let snapshot = self.state.snapshot();
        let catalog = self.catalog_map();
        let candidates =
            build_candidates(&snapshot, &catalog, self.config.feature_gates.drift);
        if candidates.iter().any(|c| c.drifted) {
            self.consolidation.reset();
        }
        if self.consolidation.is_consolidated() {
            debug!("fleet already consolidated, skipping attempt");
            return Command::no_op();
        }

        let budgets = self.budgets();
        let mut command = self
            .consolidation
            .consolidate_empty(&candidates, budgets.clone());
        if command.is_no_op() {
            command = self.consolidation.consolidate_single(
                &snapshot,
                &catalog,
                &candidates,
                budgets.clone(),
                cancel,
            );
        }
        if command.is_no_op() {
            command = self.consolidation.consolidate_multi(
                &snapshot,
                &catalog,
                &candidates,
                budgets,
                cancel,
            );
        }
        if command.is_no_op() {
            return command;
        }

        // Let the cluster settle for the validation window, then prove the
        // command still holds before acting on it
        tokio::time::sleep(self.config.consolidation.validation_ttl).await;
        let fresh = self.state.snapshot();
        if !self
            .consolidation
            .validate(&fresh, &catalog, &command, cancel)
        {
            return Command::no_op();
        }

        self.execute(command).await
    }

    /// Mark victims, launch replacements first, then delete the victims.
    /// A failed replacement launch abandons the command and unmarks.
    async fn execute(&self, mut command: Command) -> Command {
        let victim_keys: Vec<String> = command
            .candidates
            .iter()
            .map(|c| c.node_key.clone())
            .collect();
        self.state.mark_for_deletion(&victim_keys);

        for claim in &mut command.replacements {
            match self.launcher.launch(claim).await {
                Ok(machine) => {
                    debug!(claim = %claim.meta.name, instance_type = %machine.instance_type,
                           "replacement launched");
                    self.state.apply_node_claim(claim.clone());
                }
                Err(err) => {
                    warn!(%err, "replacement launch failed, abandoning command");
                    self.state.unmark_for_deletion(&victim_keys);
                    return Command::no_op();
                }
            }
        }

        for candidate in &command.candidates {
            if let Err(err) = self.provider.delete(&candidate.node_key).await {
                warn!(node = %candidate.node_name, %err, "delete failed, will retry");
            }
        }
        info!(
            victims = command.candidates.len(),
            replacements = command.replacements.len(),
            "disruption command executed"
        );
        self.consolidation.reset();
        command
    }

    fn budgets(&self) -> HashMap<String, u32> {
        self.state
            .pools()
            .iter()
            .map(|p| (p.name.clone(), p.disruption_budget))
            .collect()
    }
}
