// Flotilla consolidation - disruption planning: prove the cluster stays
// feasible without a set of nodes, then emit a delete or replace command
//
// The multi-node solver binary-searches the largest disruptable candidate
// prefix under a wall-clock timeout; every command is re-validated on a
// fresh snapshot before emission.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::api::{NodeClaim, Pod};
use crate::cluster_state::{ClusterSnapshot, SnapshotNode};
use crate::instance_types::{filter_by_price, InstanceType};
use crate::requirements::{CAPACITY_TYPE_SPOT, INSTANCE_TYPE_LABEL};
use crate::scheduler::Scheduler;

/// Consolidation configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidationConfig {
    /// Wall-clock bound on one multi-node attempt
    pub multi_node_timeout: Duration,
    /// Candidates considered per attempt
    pub batch_max: usize,
    /// How long a validation snapshot is trusted
    pub validation_ttl: Duration,
    /// Whether replacements may stay within the spot tier
    pub spot_to_spot: bool,
    /// Whether drifted nodes become candidates regardless of utilization
    pub drift: bool,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            multi_node_timeout: Duration::from_secs(60),
            batch_max: 100,
            validation_ttl: Duration::from_secs(10),
            spot_to_spot: false,
            drift: false,
        }
    }
}

#[derive(Default)]
pub struct ConsolidationMetrics {
    pub attempts: AtomicU64,
    pub timeouts: AtomicU64,
    pub deletes_emitted: AtomicU64,
    pub replaces_emitted: AtomicU64,
    pub noops: AtomicU64,
    pub validation_failures: AtomicU64,
    pub avg_solve_time_us: AtomicU64,
}

impl ConsolidationMetrics {
    fn observe_solve(&self, duration_us: u64) {
        let current = self.avg_solve_time_us.load(Ordering::SeqCst);
        self.avg_solve_time_us
            .store((current * 7 + duration_us) / 8, Ordering::SeqCst);
    }
}

/// A node eligible for disruption
#[derive(Clone, Debug)]
pub struct Candidate {
    pub node_key: String,
    pub node_name: String,
    pub pool: String,
    pub instance_type: Option<String>,
    pub capacity_type: Option<String>,
    /// Price of the node's current offering, when the catalog still knows it
    pub price: Option<f64>,
    pub reschedulable_pods: Vec<Arc<Pod>>,
    /// Lower cost means likelier to consolidate; least-utilized first
    pub disruption_cost: f64,
    pub created: u64,
    pub drifted: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandAction {
    NoOp,
    Delete,
    Replace,
}

/// The output of disruption planning
#[derive(Clone, Debug)]
pub struct Command {
    pub action: CommandAction,
    pub candidates: Vec<Candidate>,
    pub replacements: Vec<NodeClaim>,
}

impl Command {
    pub fn no_op() -> Self {
        Self {
            action: CommandAction::NoOp,
            candidates: Vec::new(),
            replacements: Vec::new(),
        }
    }

    pub fn is_no_op(&self) -> bool {
        self.action == CommandAction::NoOp
    }
}

/// Build disruption candidates from a snapshot. A node qualifies when it is
/// initialized, managed by a known pool, not already going away, and pinned
/// by nothing that cannot be rescheduled.
pub fn build_candidates(
    snapshot: &ClusterSnapshot,
    catalog: &HashMap<String, Arc<Vec<Arc<InstanceType>>>>,
    drift_enabled: bool,
) -> Vec<Candidate> {
    let mut out = Vec::new();
    for node in &snapshot.nodes {
        if !node.initialized || node.marked_for_deletion {
            continue;
        }
        let pool_name = match &node.pool {
            Some(p) => p.clone(),
            None => continue,
        };
        let pool = match snapshot.pools.iter().find(|p| p.name == pool_name) {
            Some(p) => p.clone(),
            None => continue,
        };
        if !node.blocking_pods().is_empty() {
            continue;
        }

        let instance_type = node.instance_type().map(|s| s.to_string());
        let catalog_entry = instance_type
            .as_deref()
            .and_then(|name| lookup_instance(catalog, &pool_name, name));
        let price = match (&catalog_entry, node.capacity_type(), node.zone()) {
            (Some(it), Some(ct), Some(zone)) => {
                it.offerings.get(ct, zone).map(|o| o.price)
            }
            _ => None,
        };

        let drifted = drift_enabled && is_drifted(node, &pool, catalog_entry.is_some());

        out.push(Candidate {
            node_key: node.key.clone(),
            node_name: node.name.clone(),
            pool: pool_name,
            instance_type,
            capacity_type: node.capacity_type().map(|s| s.to_string()),
            price,
            reschedulable_pods: node.reschedulable_pods(),
            disruption_cost: utilization(node),
            created: node.created,
            drifted,
        });
    }
    rank_candidates(&mut out);
    out
}

fn lookup_instance(
    catalog: &HashMap<String, Arc<Vec<Arc<InstanceType>>>>,
    pool: &str,
    name: &str,
) -> Option<Arc<InstanceType>> {
    catalog
        .get(pool)
        .and_then(|types| types.iter().find(|it| it.name == name).cloned())
}

/// A node drifts when its labels no longer satisfy the pool's requirements
/// or its instance type left the catalog
fn is_drifted(node: &SnapshotNode, pool: &crate::api::NodePool, in_catalog: bool) -> bool {
    if !in_catalog {
        return true;
    }
    pool.requirements
        .iter()
        .any(|r| !r.matches(node.labels.get(&r.key).map(|s| s.as_str())))
}

/// Average cpu/memory utilization of a node, the likelihood proxy
fn utilization(node: &SnapshotNode) -> f64 {
    let alloc = &node.allocatable;
    let used = node.pod_requests.sum(&node.daemon_requests);
    let mut ratios = Vec::new();
    for name in ["cpu", "memory"] {
        let capacity = alloc.get(name);
        if capacity > 0 {
            ratios.push(used.get(name) as f64 / capacity as f64);
        }
    }
    if ratios.is_empty() {
        return 1.0;
    }
    ratios.iter().sum::<f64>() / ratios.len() as f64
}

/// Order by decreasing consolidation likelihood: drifted nodes first, then
/// least-utilized, tie-broken by lifetime (older first)
pub fn rank_candidates(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        b.drifted
            .cmp(&a.drifted)
            .then_with(|| a.disruption_cost.total_cmp(&b.disruption_cost))
            .then_with(|| a.created.cmp(&b.created))
            .then_with(|| a.node_name.cmp(&b.node_name))
    });
}

pub struct Consolidation {
    config: ConsolidationConfig,
    scheduler: Scheduler,
    metrics: Arc<ConsolidationMetrics>,
    /// Latched when a full attempt proved there is nothing left to do
    consolidated: AtomicBool,
}

impl Consolidation {
    pub fn new(config: ConsolidationConfig, scheduler: Scheduler) -> Self {
        Self {
            config,
            scheduler,
            metrics: Arc::new(ConsolidationMetrics::default()),
            consolidated: AtomicBool::new(false),
        }
    }

    pub fn metrics(&self) -> Arc<ConsolidationMetrics> {
        self.metrics.clone()
    }

    /// True when the last attempt proved a no-op with nothing held back by
    /// budgets; resets on any cluster-shape signal worth re-checking
    pub fn is_consolidated(&self) -> bool {
        self.consolidated.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.consolidated.store(false, Ordering::SeqCst);
    }

    /// Walk candidates in order, keeping those whose pool still has budget.
    /// Returns the kept list and whether anything was dropped for budget
    /// reasons (which blocks the consolidated latch).
    fn budget_filter(
        &self,
        candidates: Vec<Candidate>,
        mut budgets: HashMap<String, u32>,
    ) -> (Vec<Candidate>, bool) {
        let mut kept = Vec::new();
        let mut dropped = false;
        for c in candidates {
            match budgets.get_mut(&c.pool) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    kept.push(c);
                }
                _ => dropped = true,
            }
        }
        (kept, dropped)
    }

    /// Delete nodes that hold nothing reschedulable at all; no simulation
    /// needed.
    pub fn consolidate_empty(
        &self,
        candidates: &[Candidate],
        budgets: HashMap<String, u32>,
    ) -> Command {
        let empty: Vec<Candidate> = candidates
            .iter()
            .filter(|c| c.reschedulable_pods.is_empty())
            .cloned()
            .collect();
        let (kept, dropped) = self.budget_filter(empty, budgets);
        if kept.is_empty() {
            return self.finish(Command::no_op(), dropped);
        }
        self.finish(
            Command {
                action: CommandAction::Delete,
                candidates: kept,
                replacements: Vec::new(),
            },
            dropped,
        )
    }

    /// Try candidates one at a time; the first that yields a valid command
    /// wins.
    pub fn consolidate_single(
        &self,
        snapshot: &ClusterSnapshot,
        catalog: &HashMap<String, Arc<Vec<Arc<InstanceType>>>>,
        candidates: &[Candidate],
        budgets: HashMap<String, u32>,
        cancel: &CancellationToken,
    ) -> Command {
        self.metrics.attempts.fetch_add(1, Ordering::SeqCst);
        let start = Instant::now();
        let (kept, dropped) = self.budget_filter(candidates.to_vec(), budgets);

        for candidate in kept.iter().take(self.config.batch_max) {
            if cancel.is_cancelled() {
                break;
            }
            if let Some(command) =
                self.try_prefix(snapshot, catalog, std::slice::from_ref(candidate), cancel)
            {
                self.metrics.observe_solve(start.elapsed().as_micros() as u64);
                return self.finish(command, dropped);
            }
        }
        self.metrics.observe_solve(start.elapsed().as_micros() as u64);
        self.finish(Command::no_op(), dropped)
    }

    /// Binary-search the largest candidate prefix that can be removed while
    /// keeping every workload feasible, with at most one replacement node.
    /// On timeout the last valid command is returned.
    pub fn consolidate_multi(
        &self,
        snapshot: &ClusterSnapshot,
        catalog: &HashMap<String, Arc<Vec<Arc<InstanceType>>>>,
        candidates: &[Candidate],
        budgets: HashMap<String, u32>,
        cancel: &CancellationToken,
    ) -> Command {
        self.metrics.attempts.fetch_add(1, Ordering::SeqCst);
        let start = Instant::now();
        let deadline = start + self.config.multi_node_timeout;

        let (mut kept, dropped) = self.budget_filter(candidates.to_vec(), budgets);
        kept.truncate(self.config.batch_max);
        if kept.len() < 2 {
            // A lone candidate is the single-node solver's job
            return self.finish(Command::no_op(), dropped);
        }

        let mut last_valid: Option<Command> = None;
        let mut interrupted = false;
        let mut lo = 2usize;
        let mut hi = kept.len();
        while lo <= hi {
            if cancel.is_cancelled() {
                interrupted = true;
                break;
            }
            if Instant::now() >= deadline {
                self.metrics.timeouts.fetch_add(1, Ordering::SeqCst);
                debug!("multi-node consolidation timed out, keeping last valid command");
                interrupted = true;
                break;
            }
            let mid = (lo + hi) / 2;
            match self.try_prefix(snapshot, catalog, &kept[..mid], cancel) {
                Some(command) => {
                    trace!(prefix = mid, "prefix is consolidatable");
                    last_valid = Some(command);
                    lo = mid + 1;
                }
                None => {
                    trace!(prefix = mid, "prefix is not consolidatable");
                    hi = mid - 1;
                }
            }
        }

        self.metrics.observe_solve(start.elapsed().as_micros() as u64);
        // An interrupted search proved nothing; never latch off its no-op
        self.finish(
            last_valid.unwrap_or_else(Command::no_op),
            dropped || interrupted,
        )
    }

    /// Simulate removing a candidate prefix: every reschedulable pod must
    /// land somewhere, with at most one replacement claim, strictly cheaper
    /// than any candidate sharing an instance type with it.
    fn try_prefix(
        &self,
        snapshot: &ClusterSnapshot,
        catalog: &HashMap<String, Arc<Vec<Arc<InstanceType>>>>,
        victims: &[Candidate],
        cancel: &CancellationToken,
    ) -> Option<Command> {
        let keys: BTreeSet<String> = victims.iter().map(|c| c.node_key.clone()).collect();
        let reduced = snapshot.without_nodes(&keys);
        let pods: Vec<Arc<Pod>> = victims
            .iter()
            .flat_map(|c| c.reschedulable_pods.iter().cloned())
            .collect();

        let results = self.scheduler.schedule(&reduced, catalog, &pods, cancel);
        if results.aborted || !results.unschedulable.is_empty() {
            return None;
        }
        if results.new_claims.len() > 1 {
            // Replacing many nodes with many nodes is churn for nothing;
            // only single-replacement commands are emitted here
            return None;
        }

        let mut replacements = results.new_claims;
        if let Some(claim) = replacements.first_mut() {
            if !self.config.spot_to_spot
                && !victims.is_empty()
                && victims
                    .iter()
                    .all(|c| c.capacity_type.as_deref() == Some(CAPACITY_TYPE_SPOT))
            {
                return None;
            }
            if !apply_same_type_filter(claim, victims) {
                return None;
            }
        }

        Some(Command {
            action: if replacements.is_empty() {
                CommandAction::Delete
            } else {
                CommandAction::Replace
            },
            candidates: victims.to_vec(),
            replacements,
        })
    }

    /// Re-run the simulation on a fresh snapshot before emission. Pod churn
    /// that invalidated the command abandons it without error.
    pub fn validate(
        &self,
        fresh: &ClusterSnapshot,
        catalog: &HashMap<String, Arc<Vec<Arc<InstanceType>>>>,
        command: &Command,
        cancel: &CancellationToken,
    ) -> bool {
        if command.is_no_op() {
            return true;
        }
        // Every victim must still exist and still be free of pods we
        // cannot move
        let mut fresh_victims = Vec::new();
        for candidate in &command.candidates {
            let node = match fresh.node(&candidate.node_key) {
                Some(node) => node,
                None => {
                    debug!(node = %candidate.node_name, "victim disappeared, abandoning command");
                    self.metrics
                        .validation_failures
                        .fetch_add(1, Ordering::SeqCst);
                    return false;
                }
            };
            if !node.blocking_pods().is_empty() {
                debug!(node = %candidate.node_name,
                       "victim gained unmovable pods, abandoning command");
                self.metrics
                    .validation_failures
                    .fetch_add(1, Ordering::SeqCst);
                return false;
            }
            let mut refreshed = candidate.clone();
            refreshed.reschedulable_pods = node.reschedulable_pods();
            fresh_victims.push(refreshed);
        }

        match self.try_prefix(fresh, catalog, &fresh_victims, cancel) {
            Some(revalidated) => {
                if revalidated.replacements.len() > command.replacements.len() {
                    self.metrics
                        .validation_failures
                        .fetch_add(1, Ordering::SeqCst);
                    debug!("command now needs more replacements, abandoning");
                    return false;
                }
                true
            }
            None => {
                self.metrics
                    .validation_failures
                    .fetch_add(1, Ordering::SeqCst);
                debug!("command no longer simulates cleanly, abandoning");
                false
            }
        }
    }

    /// Book-keep the outcome: a clean no-op with nothing budget-dropped
    /// latches the consolidated flag; anything else clears it.
    fn finish(&self, command: Command, budget_dropped: bool) -> Command {
        if command.is_no_op() {
            self.metrics.noops.fetch_add(1, Ordering::SeqCst);
            self.consolidated
                .store(!budget_dropped, Ordering::SeqCst);
        } else {
            match command.action {
                CommandAction::Delete => {
                    self.metrics.deletes_emitted.fetch_add(1, Ordering::SeqCst)
                }
                CommandAction::Replace => {
                    self.metrics.replaces_emitted.fetch_add(1, Ordering::SeqCst)
                }
                CommandAction::NoOp => 0,
            };
            self.consolidated.store(false, Ordering::SeqCst);
        }
        command
    }
}

/// If any candidate's instance type appears among the replacement's
/// options, the replacement must be strictly cheaper than the cheapest such
/// candidate. With no shared type every option is kept.
pub fn apply_same_type_filter(claim: &mut NodeClaim, victims: &[Candidate]) -> bool {
    let option_names: BTreeSet<&str> = claim
        .instance_type_options
        .iter()
        .map(|it| it.name.as_str())
        .collect();
    let max_price = victims
        .iter()
        .filter(|c| {
            c.instance_type
                .as_deref()
                .map_or(false, |t| option_names.contains(t))
        })
        .filter_map(|c| c.price)
        .min_by(|a, b| a.total_cmp(b));
    let max_price = match max_price {
        Some(p) => p,
        None => return true,
    };
    claim.instance_type_options =
        filter_by_price(&claim.instance_type_options, &claim.requirements, max_price);
    if claim.instance_type_options.is_empty() {
        return false;
    }
    // The narrowed options also narrow the instance-type requirement
    let names: Vec<String> = claim
        .instance_type_options
        .iter()
        .map(|it| it.name.clone())
        .collect();
    let _ = claim
        .requirements
        .add(&crate::requirements::Requirement::is_in(
            INSTANCE_TYPE_LABEL,
            names,
        ));
    !claim.instance_type_options.is_empty()
}
