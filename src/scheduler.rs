// Flotilla scheduler - fits a batch of pending pods onto existing capacity
// first, then onto the fewest new node templates that cover the remainder
//
// A pass is single-threaded and deterministic over an immutable snapshot:
// running it twice on the same inputs produces the same bindings.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::api::{
    host_ports_conflict, tolerates_all, HostPort, NodeClaim, Pod, TopologySpreadConstraint,
    UnsatisfiablePolicy, WeightedNodeSelectorTerm,
};
use crate::cluster_state::{ClusterSnapshot, SnapshotNode};
use crate::instance_types::InstanceType;
use crate::node_template::{NodeTemplate, Unfit};
use crate::requirements::{
    Requirement, Requirements, RestrictedLabelPolicy, HOSTNAME_LABEL, ZONE_LABEL,
};
use crate::resources::Resources;
use crate::topology::{PodTopologyView, Topology};
use crate::volumes::{VolumeResolver, VolumeUsage};

/// Scheduler configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Extra label domains pods may select on despite the restricted-domain
    /// deny-list
    pub allowed_label_domains: Vec<String>,
}

/// Pass counters, updated with the usual moving-average smoothing
#[derive(Default)]
pub struct SchedulerMetrics {
    pub passes: AtomicU64,
    pub pods_scheduled: AtomicU64,
    pub pods_unschedulable: AtomicU64,
    pub nodes_planned: AtomicU64,
    pub avg_pass_time_us: AtomicU64,
    pub peak_pass_time_us: AtomicU64,
}

impl SchedulerMetrics {
    fn observe_pass(&self, duration_us: u64) {
        self.passes.fetch_add(1, Ordering::SeqCst);
        let current = self.avg_pass_time_us.load(Ordering::SeqCst);
        let next = (current * 7 + duration_us) / 8;
        self.avg_pass_time_us.store(next, Ordering::SeqCst);
        if duration_us > self.peak_pass_time_us.load(Ordering::SeqCst) {
            self.peak_pass_time_us.store(duration_us, Ordering::SeqCst);
        }
    }
}

/// A pod bound to an existing or in-flight node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Binding {
    pub pod_uid: String,
    pub node_key: String,
    pub node_name: String,
}

/// Output of one scheduling pass
#[derive(Debug, Default)]
pub struct SchedulingResults {
    pub bindings: Vec<Binding>,
    pub new_claims: Vec<NodeClaim>,
    pub unschedulable: Vec<(String, String)>,
    /// True when the pass was abandoned by cancellation
    pub aborted: bool,
}

/// A pod under scheduling: its effective requirements plus the preference
/// stack that relaxation pops from
struct SchedulingPod {
    pod: Arc<Pod>,
    requirements: Requirements,
    /// Remaining required node-selector terms; the OR is realized by
    /// dropping terms left-to-right, never the last
    or_terms: Vec<Vec<Requirement>>,
    /// Remaining preferred terms, sorted by descending weight so the
    /// weakest (ties resolved in favor of earlier terms) pops off the end
    preferred: Vec<WeightedNodeSelectorTerm>,
    active_spread: Vec<TopologySpreadConstraint>,
    last_error: Option<String>,
}

impl SchedulingPod {
    fn new(pod: Arc<Pod>, policy: &RestrictedLabelPolicy) -> Result<Self, String> {
        let mut preferred = pod.preferred_node_affinity.clone();
        preferred.sort_by_key(|t| std::cmp::Reverse(t.weight));
        let mut out = Self {
            or_terms: pod.required_node_affinity.clone(),
            active_spread: pod.topology_spread.clone(),
            preferred,
            requirements: Requirements::new(),
            last_error: None,
            pod,
        };
        out.rebuild()?;
        policy
            .validate(&out.requirements)
            .map_err(|e| e.to_string())?;
        Ok(out)
    }

    /// Recompute effective requirements: node selector, the current OR
    /// term, and every still-active preferred term treated as required
    fn rebuild(&mut self) -> Result<(), String> {
        let mut reqs = Requirements::from_labels(&self.pod.node_selector);
        if let Some(term) = self.or_terms.first() {
            for r in term {
                reqs.add(r).map_err(|e| e.to_string())?;
            }
        }
        for term in &self.preferred {
            for r in &term.requirements {
                reqs.add(r).map_err(|e| e.to_string())?;
            }
        }
        self.requirements = reqs;
        Ok(())
    }

    /// Drop the weakest remaining preference. Required constraints are
    /// never relaxed, except that leading node-selector terms of an OR may
    /// be dropped while more than one remains.
    fn relax(&mut self) -> Option<String> {
        if let Some(term) = self.preferred.pop() {
            if self.rebuild().is_err() {
                return None;
            }
            return Some(format!("preferred term (weight {})", term.weight));
        }
        if let Some(pos) = self
            .active_spread
            .iter()
            .rposition(|c| c.when_unsatisfiable == UnsatisfiablePolicy::ScheduleAnyway)
        {
            let c = self.active_spread.remove(pos);
            return Some(format!("best-effort spread over {}", c.topology_key));
        }
        if self.or_terms.len() > 1 {
            self.or_terms.remove(0);
            if self.rebuild().is_err() {
                return None;
            }
            return Some("leading node-selector term".to_string());
        }
        None
    }

    fn view(&self) -> PodTopologyView<'_> {
        PodTopologyView {
            pod: &self.pod,
            active_spread: &self.active_spread,
        }
    }
}

/// An existing or in-flight node as a placement target, with remaining
/// capacity tracked as the pass binds pods to it
struct ExistingNode {
    node: SnapshotNode,
    requirements: Requirements,
    available: Resources,
    host_ports: Vec<HostPort>,
    volumes: VolumeUsage,
    limits: BTreeMap<String, i32>,
}

impl ExistingNode {
    fn new(node: SnapshotNode, csi_limits: &HashMap<String, BTreeMap<String, i32>>) -> Self {
        Self {
            requirements: node.requirements(),
            available: node.available(),
            host_ports: node.host_ports.clone(),
            volumes: node.volumes.clone(),
            limits: csi_limits.get(&node.name).cloned().unwrap_or_default(),
            node,
        }
    }

    fn try_add(
        &mut self,
        pod: &SchedulingPod,
        topology: &Topology,
        volume_additions: &[(String, String)],
    ) -> Result<(), Unfit> {
        if !tolerates_all(&pod.pod.tolerations, &self.node.taints) {
            let offending = self
                .node
                .taints
                .iter()
                .find(|t| !pod.pod.tolerations.iter().any(|tol| tol.tolerates(t)))
                .map(|t| t.key.clone())
                .unwrap_or_default();
            return Err(Unfit::UntoleratedTaint(offending));
        }
        if !self.requirements.strictly_compatible(&pod.requirements) {
            return Err(Unfit::IncompatibleRequirements(format!(
                "labels of node {} do not satisfy the pod requirements",
                self.node.name
            )));
        }
        topology.tighten(&pod.view(), &self.requirements)?;
        let requests = pod.pod.requests();
        if !requests.fits(&self.available) {
            return Err(Unfit::InsufficientResources);
        }
        if host_ports_conflict(&self.host_ports, &pod.pod.host_ports) {
            return Err(Unfit::HostPortConflict);
        }
        if !self.volumes.fits(volume_additions, &self.limits) {
            return Err(Unfit::VolumeLimit);
        }

        self.available = self.available.saturating_sub(&requests);
        self.host_ports.extend(pod.pod.host_ports.iter().cloned());
        for (driver, claim) in volume_additions {
            self.volumes.add(driver, claim);
        }
        Ok(())
    }
}

enum Placement {
    Existing(usize),
    Template(usize),
}

pub struct Scheduler {
    policy: RestrictedLabelPolicy,
    metrics: Arc<SchedulerMetrics>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            policy: RestrictedLabelPolicy::new(config.allowed_label_domains),
            metrics: Arc::new(SchedulerMetrics::default()),
        }
    }

    pub fn metrics(&self) -> Arc<SchedulerMetrics> {
        self.metrics.clone()
    }

    /// Run one scheduling pass over an immutable snapshot.
    ///
    /// `catalog` maps pool name to its instance types; pools come from the
    /// snapshot. The cancellation token is honored at pod boundaries and
    /// abandons the pass.
    pub fn schedule(
        &self,
        snapshot: &ClusterSnapshot,
        catalog: &HashMap<String, Arc<Vec<Arc<InstanceType>>>>,
        pods: &[Arc<Pod>],
        cancel: &CancellationToken,
    ) -> SchedulingResults {
        let start = Instant::now();
        let mut results = SchedulingResults::default();

        let mut pending = Vec::new();
        for pod in pods {
            match SchedulingPod::new(pod.clone(), &self.policy) {
                Ok(sp) => pending.push(sp),
                Err(reason) => {
                    results.unschedulable.push((pod.uid().to_string(), reason));
                }
            }
        }
        // Total order: priority, then restrictiveness (constraint count and
        // request magnitude), with a stable creation-time tie-break
        pending.sort_by(|a, b| {
            b.pod
                .priority
                .cmp(&a.pod.priority)
                .then_with(|| {
                    b.requirements
                        .keys()
                        .count()
                        .cmp(&a.requirements.keys().count())
                })
                .then_with(|| b.pod.requests().cpu().cmp(&a.pod.requests().cpu()))
                .then_with(|| b.pod.requests().memory().cmp(&a.pod.requests().memory()))
                .then_with(|| {
                    a.pod
                        .meta
                        .creation_timestamp
                        .cmp(&b.pod.meta.creation_timestamp)
                })
                .then_with(|| a.pod.meta.uid.cmp(&b.pod.meta.uid))
        });

        // Placement targets: initialized nodes lead, then in-flight by
        // creation time. Nodes already marked for deletion are not targets.
        let mut existing: Vec<ExistingNode> = snapshot
            .nodes
            .iter()
            .filter(|n| !n.marked_for_deletion)
            .cloned()
            .map(|n| ExistingNode::new(n, &snapshot.csi_limits))
            .collect();
        existing.sort_by(|a, b| {
            b.node
                .initialized
                .cmp(&a.node.initialized)
                .then_with(|| a.node.created.cmp(&b.node.created))
                .then_with(|| a.node.name.cmp(&b.node.name))
        });

        let topology_keys = collect_topology_keys(pods);
        let universe = domain_universe(snapshot, catalog, &topology_keys);
        let tracked: Vec<(BTreeMap<String, String>, Vec<Arc<Pod>>)> = snapshot
            .nodes
            .iter()
            .filter(|n| !n.marked_for_deletion)
            .map(|n| (n.labels.clone(), n.pods.clone()))
            .collect();
        let pod_refs: Vec<&Pod> = pending.iter().map(|sp| sp.pod.as_ref()).collect();
        let mut topology = Topology::build(&pod_refs, &tracked, &universe);

        let resolver = VolumeResolver {
            claims: &snapshot.volume_claims,
            storage_classes: &snapshot.storage_classes,
        };
        let mut pools: Vec<_> = snapshot.pools.clone();
        pools.sort_by(|a, b| b.weight.cmp(&a.weight).then_with(|| a.name.cmp(&b.name)));

        let mut templates: Vec<NodeTemplate> = Vec::new();
        let mut template_counter = 0usize;

        for mut sp in pending {
            if cancel.is_cancelled() {
                debug!("scheduling pass cancelled");
                results.aborted = true;
                break;
            }
            let volume_additions = match resolver.drivers_for(&sp.pod) {
                Ok(v) => v,
                Err(err) => {
                    results
                        .unschedulable
                        .push((sp.pod.uid().to_string(), err.to_string()));
                    continue;
                }
            };

            loop {
                match self.place(
                    &sp,
                    &mut existing,
                    &mut templates,
                    &mut template_counter,
                    &pools,
                    catalog,
                    snapshot,
                    &mut topology,
                    &volume_additions,
                ) {
                    Ok(Placement::Existing(i)) => {
                        let node = &existing[i].node;
                        trace!(pod = %sp.pod.meta.qualified_name(),
                               node = %node.name, "bound to existing node");
                        topology.record(&sp.pod, &existing[i].requirements);
                        results.bindings.push(Binding {
                            pod_uid: sp.pod.uid().to_string(),
                            node_key: node.key.clone(),
                            node_name: node.name.clone(),
                        });
                        break;
                    }
                    Ok(Placement::Template(i)) => {
                        trace!(pod = %sp.pod.meta.qualified_name(),
                               template = %templates[i].hostname, "placed on new node");
                        topology.record(&sp.pod, &templates[i].requirements);
                        break;
                    }
                    Err(reason) => {
                        sp.last_error = Some(reason);
                        match sp.relax() {
                            Some(dropped) => {
                                trace!(pod = %sp.pod.meta.qualified_name(), %dropped,
                                       "relaxed preference and retrying");
                            }
                            None => {
                                let reason = sp
                                    .last_error
                                    .take()
                                    .unwrap_or_else(|| "unschedulable".to_string());
                                results
                                    .unschedulable
                                    .push((sp.pod.uid().to_string(), reason));
                                break;
                            }
                        }
                    }
                }
            }
        }

        for template in &templates {
            results
                .new_claims
                .push(template.finalize(&snapshot.daemonsets, now_epoch()));
        }

        self.metrics
            .pods_scheduled
            .fetch_add(results.bindings.len() as u64, Ordering::SeqCst);
        self.metrics
            .pods_unschedulable
            .fetch_add(results.unschedulable.len() as u64, Ordering::SeqCst);
        self.metrics
            .nodes_planned
            .fetch_add(results.new_claims.len() as u64, Ordering::SeqCst);
        self.metrics
            .observe_pass(start.elapsed().as_micros() as u64);
        results
    }

    /// One placement attempt for one pod at its current relaxation level
    #[allow(clippy::too_many_arguments)]
    fn place(
        &self,
        sp: &SchedulingPod,
        existing: &mut [ExistingNode],
        templates: &mut Vec<NodeTemplate>,
        template_counter: &mut usize,
        pools: &[Arc<crate::api::NodePool>],
        catalog: &HashMap<String, Arc<Vec<Arc<InstanceType>>>>,
        snapshot: &ClusterSnapshot,
        topology: &mut Topology,
        volume_additions: &[(String, String)],
    ) -> Result<Placement, String> {
        let mut last_error = String::from("no nodes or pools available");

        for (i, node) in existing.iter_mut().enumerate() {
            match node.try_add(sp, topology, volume_additions) {
                Ok(()) => return Ok(Placement::Existing(i)),
                Err(err) => last_error = err.to_string(),
            }
        }

        for (i, template) in templates.iter_mut().enumerate() {
            match template.try_add(
                &sp.pod,
                &sp.requirements,
                &sp.view(),
                topology,
                volume_additions,
            ) {
                Ok(()) => return Ok(Placement::Template(i)),
                Err(err) => last_error = err.to_string(),
            }
        }

        // Open a new template: pools are pre-sorted by descending weight;
        // within the best feasible weight tier the cheapest option wins.
        let mut best: Option<(NodeTemplate, Topology, f64, i32)> = None;
        for pool in pools {
            if let Some((_, _, _, w)) = &best {
                if pool.weight < *w {
                    break;
                }
            }
            let types = match catalog.get(&pool.name) {
                Some(types) => types,
                None => continue,
            };
            let mut template = match NodeTemplate::new(
                pool.clone(),
                types,
                &snapshot.daemonsets,
                *template_counter,
            ) {
                Ok(t) => t,
                Err(err) => {
                    last_error = err.to_string();
                    continue;
                }
            };
            // The trial topology knows the new hostname domain; it becomes
            // real only if this template is chosen
            let mut trial = topology.clone();
            trial.register_domain(HOSTNAME_LABEL, &template.hostname);
            match template.try_add(
                &sp.pod,
                &sp.requirements,
                &sp.view(),
                &trial,
                volume_additions,
            ) {
                Ok(()) => {
                    let price = template.price().unwrap_or(f64::INFINITY);
                    let better = match &best {
                        Some((_, _, best_price, _)) => price < *best_price,
                        None => true,
                    };
                    if better {
                        best = Some((template, trial, price, pool.weight));
                    }
                }
                Err(err) => last_error = err.to_string(),
            }
        }

        if let Some((template, trial, _, _)) = best {
            *topology = trial;
            *template_counter += 1;
            templates.push(template);
            return Ok(Placement::Template(templates.len() - 1));
        }
        Err(last_error)
    }
}

fn now_epoch() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Topology keys any pending pod constrains on
fn collect_topology_keys(pods: &[Arc<Pod>]) -> BTreeSet<String> {
    let mut keys = BTreeSet::new();
    for pod in pods {
        for c in &pod.topology_spread {
            keys.insert(c.topology_key.clone());
        }
        for t in pod.pod_affinity.iter().chain(&pod.pod_anti_affinity) {
            keys.insert(t.topology_key.clone());
        }
    }
    keys
}

/// The known domain values per topology key: existing node labels, pool
/// requirement values, and for zones whatever the catalog can sell
fn domain_universe(
    snapshot: &ClusterSnapshot,
    catalog: &HashMap<String, Arc<Vec<Arc<InstanceType>>>>,
    keys: &BTreeSet<String>,
) -> BTreeMap<String, BTreeSet<String>> {
    let mut universe: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for key in keys {
        let entry = universe.entry(key.clone()).or_default();
        for node in &snapshot.nodes {
            if node.marked_for_deletion {
                continue;
            }
            if let Some(v) = node.labels.get(key) {
                entry.insert(v.clone());
            }
        }
        for pool in &snapshot.pools {
            if let Some(v) = pool.labels.get(key) {
                entry.insert(v.clone());
            }
            for r in &pool.requirements {
                if r.key == *key {
                    entry.extend(r.values.iter().cloned());
                }
            }
            if let Some(types) = catalog.get(&pool.name) {
                for it in types.iter() {
                    if let Some(values) = it.requirements.get(key).and_then(|kr| kr.values()) {
                        entry.extend(values.iter().cloned());
                    }
                    if key == ZONE_LABEL {
                        for offering in it.offerings.available() {
                            entry.insert(offering.zone.clone());
                        }
                    }
                }
            }
        }
    }
    universe
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{LabelSelector, NodePool};
    use crate::instance_types::{Offering, Offerings};
    use crate::requirements::{ARCH_LABEL, CAPACITY_TYPE_LABEL, INSTANCE_TYPE_LABEL};
    use crate::resources::{CPU, MEMORY, PODS};

    const GI: i64 = 1 << 30;

    fn instance(
        name: &str,
        cpu: i64,
        memory: i64,
        zones: &[&str],
        price: f64,
    ) -> Arc<InstanceType> {
        let mut requirements = Requirements::new();
        requirements
            .add(&Requirement::is_in(INSTANCE_TYPE_LABEL, [name]))
            .unwrap();
        requirements
            .add(&Requirement::is_in(ARCH_LABEL, ["amd64"]))
            .unwrap();
        Arc::new(InstanceType {
            name: name.to_string(),
            capacity: Resources::new()
                .with(CPU, cpu)
                .with(MEMORY, memory)
                .with(PODS, 110),
            overhead: Resources::new().with(CPU, 100).with(MEMORY, 200 << 20),
            requirements,
            offerings: Offerings(
                zones
                    .iter()
                    .map(|z| Offering {
                        zone: z.to_string(),
                        capacity_type: "on-demand".to_string(),
                        price,
                        available: true,
                    })
                    .collect(),
            ),
        })
    }

    fn snapshot_with_pool(pool: NodePool) -> ClusterSnapshot {
        ClusterSnapshot {
            pools: vec![Arc::new(pool)],
            ..ClusterSnapshot::default()
        }
    }

    fn catalog_for(
        pool: &str,
        types: Vec<Arc<InstanceType>>,
    ) -> HashMap<String, Arc<Vec<Arc<InstanceType>>>> {
        let mut map = HashMap::new();
        map.insert(pool.to_string(), Arc::new(types));
        map
    }

    fn mem_pod(name: &str, memory: i64) -> Arc<Pod> {
        let mut pod = Pod::new(name);
        pod.node_selector
            .insert(ARCH_LABEL.to_string(), "amd64".to_string());
        pod.container_requests = vec![Resources::new().with(MEMORY, memory)];
        Arc::new(pod)
    }

    fn schedule(
        snapshot: &ClusterSnapshot,
        catalog: &HashMap<String, Arc<Vec<Arc<InstanceType>>>>,
        pods: Vec<Arc<Pod>>,
    ) -> SchedulingResults {
        Scheduler::new(SchedulerConfig::default()).schedule(
            snapshot,
            catalog,
            &pods,
            &CancellationToken::new(),
        )
    }

    #[test]
    fn test_bin_packing_two_per_node() {
        // 40 pods of 1.8Gi; the only instance type fits exactly two
        let snapshot = snapshot_with_pool(NodePool::new("default"));
        let catalog = catalog_for(
            "default",
            vec![instance(
                "default-instance-type",
                4000,
                4 * GI,
                &["zone-1"],
                1.0,
            )],
        );
        let pods: Vec<Arc<Pod>> = (0..40)
            .map(|i| mem_pod(&format!("p{:02}", i), (18 * GI) / 10))
            .collect();

        let results = schedule(&snapshot, &catalog, pods);
        assert!(results.unschedulable.is_empty());
        assert_eq!(results.new_claims.len(), 20);
        for claim in &results.new_claims {
            assert!(!claim.instance_type_options.is_empty());
            assert_eq!(
                claim.instance_type_options[0].name,
                "default-instance-type"
            );
        }
    }

    #[test]
    fn test_small_and_large_co_pack() {
        // 40 large (1.8Gi) plus 20 small (400Mi) share 20 nodes
        let snapshot = snapshot_with_pool(NodePool::new("default"));
        let catalog = catalog_for(
            "default",
            vec![instance(
                "default-instance-type",
                16000,
                4 * GI + (500 << 20),
                &["zone-1"],
                1.0,
            )],
        );
        let mut pods: Vec<Arc<Pod>> = (0..40)
            .map(|i| mem_pod(&format!("large-{:02}", i), (18 * GI) / 10))
            .collect();
        pods.extend((0..20).map(|i| mem_pod(&format!("small-{:02}", i), 400 << 20)));

        let results = schedule(&snapshot, &catalog, pods);
        assert!(results.unschedulable.is_empty());
        assert_eq!(results.new_claims.len(), 20);
        // Every node carries two large and one small
        for claim in &results.new_claims {
            assert_eq!(claim.resource_requests.pods(), 3);
        }
    }

    #[test]
    fn test_cheapest_instance_chosen_but_all_options_kept() {
        let snapshot = snapshot_with_pool(NodePool::new("default"));
        let catalog = catalog_for(
            "default",
            vec![
                instance("small", 2000, 4 * GI, &["zone-1"], 2.0),
                instance("medium", 4000, 8 * GI, &["zone-1"], 3.0),
                instance("large", 8000, 16 * GI, &["zone-1"], 1.0),
            ],
        );
        let results = schedule(&snapshot, &catalog, vec![mem_pod("p", GI)]);
        assert_eq!(results.new_claims.len(), 1);
        let claim = &results.new_claims[0];
        // All three are viable and all three ride along to the provider
        let mut names: Vec<_> = claim
            .instance_type_options
            .iter()
            .map(|o| o.name.clone())
            .collect();
        names.sort();
        assert_eq!(names, vec!["large", "medium", "small"]);
        // The cheapest option prices the claim
        assert_eq!(
            crate::instance_types::cheapest_price(
                &claim.instance_type_options,
                &claim.requirements
            ),
            Some(1.0)
        );
    }

    #[test]
    fn test_in_flight_packing_across_zones() {
        // Pod A forced a zone-2 node earlier; it is now in-flight.
        let mut node = SnapshotNode {
            key: "claim/n1".to_string(),
            name: "n1".to_string(),
            labels: BTreeMap::new(),
            taints: Vec::new(),
            allocatable: Resources::new()
                .with(CPU, 3900)
                .with(MEMORY, 8 * GI)
                .with(PODS, 110),
            daemon_requests: Resources::new(),
            pod_requests: Resources::new(),
            host_ports: Vec::new(),
            volumes: VolumeUsage::new(),
            pods: Vec::new(),
            initialized: false,
            in_flight: true,
            marked_for_deletion: false,
            created: 1,
            pool: Some("default".to_string()),
        };
        node.labels
            .insert(ZONE_LABEL.to_string(), "zone-2".to_string());
        node.labels
            .insert(ARCH_LABEL.to_string(), "amd64".to_string());
        node.labels
            .insert(HOSTNAME_LABEL.to_string(), "n1".to_string());

        let mut snapshot = snapshot_with_pool(NodePool::new("default"));
        snapshot.nodes = vec![node];
        let catalog = catalog_for(
            "default",
            vec![instance(
                "m",
                4000,
                8 * GI,
                &["zone-1", "zone-2", "zone-3"],
                1.0,
            )],
        );

        let mut pod_b = Pod::new("b");
        pod_b.container_requests = vec![Resources::new().with(CPU, 500)];
        pod_b.required_node_affinity =
            vec![vec![Requirement::is_in(ZONE_LABEL, ["zone-1", "zone-2"])]];
        let mut pod_c = Pod::new("c");
        pod_c.container_requests = vec![Resources::new().with(CPU, 500)];
        pod_c.required_node_affinity =
            vec![vec![Requirement::is_in(ZONE_LABEL, ["zone-1", "zone-3"])]];

        let results = schedule(&snapshot, &catalog, vec![Arc::new(pod_b), Arc::new(pod_c)]);
        assert!(results.unschedulable.is_empty());
        // B lands on the in-flight node, C needs a fresh one
        assert_eq!(results.bindings.len(), 1);
        assert_eq!(results.bindings[0].pod_uid, "b");
        assert_eq!(results.bindings[0].node_name, "n1");
        assert_eq!(results.new_claims.len(), 1);
    }

    #[test]
    fn test_topology_spread_converges_across_passes() {
        let snapshot = snapshot_with_pool(NodePool::new("default"));
        let catalog = catalog_for(
            "default",
            vec![instance(
                "m",
                16000,
                32 * GI,
                &["zone-1", "zone-2", "zone-3"],
                1.0,
            )],
        );
        let spread_pod = |name: &str| -> Arc<Pod> {
            let mut pod = Pod::new(name);
            pod.meta.labels.insert("app".to_string(), "web".to_string());
            pod.container_requests = vec![Resources::new().with(CPU, 100)];
            pod.topology_spread = vec![TopologySpreadConstraint {
                max_skew: 1,
                topology_key: ZONE_LABEL.to_string(),
                when_unsatisfiable: UnsatisfiablePolicy::DoNotSchedule,
                selector: LabelSelector::labels(&[("app", "web")]),
            }];
            Arc::new(pod)
        };

        let first: Vec<Arc<Pod>> = (0..4).map(|i| spread_pod(&format!("p{}", i))).collect();
        let results = schedule(&snapshot, &catalog, first);
        assert!(results.unschedulable.is_empty());
        // 4 pods across 3 zones: one zone holds two
        assert_eq!(results.new_claims.len(), 3);
        let mut per_zone: Vec<i64> = results
            .new_claims
            .iter()
            .map(|c| c.resource_requests.pods())
            .collect();
        per_zone.sort();
        assert_eq!(per_zone, vec![1, 1, 2]);

        // Second wave: those claims are now in-flight nodes; five more pods
        // settle at 3/3/3 with no new nodes.
        let mut snapshot2 = snapshot.clone();
        for (i, claim) in results.new_claims.iter().enumerate() {
            let mut labels = claim.requirements.labels();
            labels.insert(ARCH_LABEL.to_string(), "amd64".to_string());
            labels.insert(HOSTNAME_LABEL.to_string(), format!("default-{}", i));
            let mut pods_on_node: Vec<Arc<Pod>> = Vec::new();
            for j in 0..claim.resource_requests.pods() {
                let mut p = Pod::new(&format!("existing-{}-{}", i, j));
                p.meta.labels.insert("app".to_string(), "web".to_string());
                p.container_requests = vec![Resources::new().with(CPU, 100)];
                pods_on_node.push(Arc::new(p));
            }
            let pod_requests = pods_on_node.iter().fold(Resources::new(), |mut acc, p| {
                acc.add(&p.requests());
                acc
            });
            snapshot2.nodes.push(SnapshotNode {
                key: format!("claim/{}", i),
                name: format!("default-{}", i),
                labels,
                taints: Vec::new(),
                allocatable: Resources::new()
                    .with(CPU, 15900)
                    .with(MEMORY, 32 * GI)
                    .with(PODS, 110),
                daemon_requests: Resources::new(),
                pod_requests,
                host_ports: Vec::new(),
                volumes: VolumeUsage::new(),
                pods: pods_on_node,
                initialized: false,
                in_flight: true,
                marked_for_deletion: false,
                created: i as u64,
                pool: Some("default".to_string()),
            });
        }

        let second: Vec<Arc<Pod>> = (4..9).map(|i| spread_pod(&format!("p{}", i))).collect();
        let results2 = schedule(&snapshot2, &catalog, second);
        assert!(results2.unschedulable.is_empty());
        assert!(results2.new_claims.is_empty());
        assert_eq!(results2.bindings.len(), 5);
    }

    #[test]
    fn test_pod_larger_than_any_instance_is_unschedulable() {
        let snapshot = snapshot_with_pool(NodePool::new("default"));
        let catalog = catalog_for(
            "default",
            vec![instance("small", 2000, 4 * GI, &["zone-1"], 1.0)],
        );
        let results = schedule(&snapshot, &catalog, vec![mem_pod("p", 64 * GI)]);
        assert_eq!(results.unschedulable.len(), 1);
        assert!(results.new_claims.is_empty());
    }

    #[test]
    fn test_exact_fit_schedules() {
        let snapshot = snapshot_with_pool(NodePool::new("default"));
        // Allocatable memory is exactly 4Gi after overhead
        let catalog = catalog_for(
            "default",
            vec![instance(
                "snug",
                4000,
                4 * GI + (200 << 20),
                &["zone-1"],
                1.0,
            )],
        );
        let mut pod = Pod::new("p");
        pod.container_requests = vec![Resources::new().with(MEMORY, 4 * GI)];
        let results = schedule(&snapshot, &catalog, vec![Arc::new(pod)]);
        assert!(results.unschedulable.is_empty());
        assert_eq!(results.new_claims.len(), 1);
    }

    #[test]
    fn test_preference_relaxation_recovers() {
        let snapshot = snapshot_with_pool(NodePool::new("default"));
        let catalog = catalog_for("default", vec![instance("m", 4000, 8 * GI, &["zone-1"], 1.0)]);
        let mut pod = Pod::new("p");
        pod.container_requests = vec![Resources::new().with(CPU, 100)];
        // The preference asks for a zone nothing can provide
        pod.preferred_node_affinity = vec![WeightedNodeSelectorTerm {
            weight: 10,
            requirements: vec![Requirement::is_in(ZONE_LABEL, ["zone-99"])],
        }];
        let results = schedule(&snapshot, &catalog, vec![Arc::new(pod)]);
        assert!(results.unschedulable.is_empty());
        assert_eq!(results.new_claims.len(), 1);
    }

    #[test]
    fn test_equal_weight_preferences_drop_in_term_order() {
        let mut pod = Pod::new("p");
        pod.preferred_node_affinity = vec![
            WeightedNodeSelectorTerm {
                weight: 10,
                requirements: vec![Requirement::is_in("first", ["a"])],
            },
            WeightedNodeSelectorTerm {
                weight: 10,
                requirements: vec![Requirement::is_in("second", ["b"])],
            },
        ];
        let mut sp = SchedulingPod::new(Arc::new(pod), &RestrictedLabelPolicy::default()).unwrap();
        sp.relax().unwrap();
        // The later term of equal weight goes first
        assert!(sp.requirements.has("first"));
        assert!(!sp.requirements.has("second"));
    }

    #[test]
    fn test_restricted_label_rejected() {
        let snapshot = snapshot_with_pool(NodePool::new("default"));
        let catalog = catalog_for("default", vec![instance("m", 4000, 8 * GI, &["zone-1"], 1.0)]);
        let mut pod = Pod::new("p");
        pod.node_selector
            .insert("node.kubernetes.io/private".to_string(), "x".to_string());
        let results = schedule(&snapshot, &catalog, vec![Arc::new(pod)]);
        assert_eq!(results.unschedulable.len(), 1);
        assert!(results.unschedulable[0].1.contains("restricted"));
    }

    #[test]
    fn test_pool_weight_then_price() {
        let mut heavy = NodePool::new("heavy");
        heavy.weight = 100;
        let light = NodePool::new("light");
        let snapshot = ClusterSnapshot {
            pools: vec![Arc::new(light), Arc::new(heavy)],
            ..ClusterSnapshot::default()
        };
        let mut catalog = catalog_for(
            "heavy",
            vec![instance("expensive", 4000, 8 * GI, &["zone-1"], 9.0)],
        );
        catalog.insert(
            "light".to_string(),
            Arc::new(vec![instance("cheap", 4000, 8 * GI, &["zone-1"], 1.0)]),
        );

        let results = schedule(&snapshot, &catalog, vec![mem_pod("p", GI)]);
        assert_eq!(results.new_claims.len(), 1);
        // Weight outranks price across pools
        assert_eq!(results.new_claims[0].pool, "heavy");
    }

    #[test]
    fn test_scheduling_is_idempotent() {
        let snapshot = snapshot_with_pool(NodePool::new("default"));
        let catalog = catalog_for(
            "default",
            vec![
                instance("small", 2000, 4 * GI, &["zone-1"], 2.0),
                instance("large", 8000, 16 * GI, &["zone-1"], 1.0),
            ],
        );
        let pods: Vec<Arc<Pod>> = (0..7)
            .map(|i| mem_pod(&format!("p{}", i), GI + ((i as i64 * 100) << 20)))
            .collect();

        let a = schedule(&snapshot, &catalog, pods.clone());
        let b = schedule(&snapshot, &catalog, pods);
        assert_eq!(a.bindings, b.bindings);
        assert_eq!(a.new_claims.len(), b.new_claims.len());
        for (ca, cb) in a.new_claims.iter().zip(&b.new_claims) {
            assert_eq!(ca.pool, cb.pool);
            assert_eq!(ca.resource_requests, cb.resource_requests);
        }
    }

    #[test]
    fn test_existing_capacity_preferred_over_new_nodes() {
        let node = SnapshotNode {
            key: "provider://1".to_string(),
            name: "node-1".to_string(),
            labels: [
                (ARCH_LABEL.to_string(), "amd64".to_string()),
                (HOSTNAME_LABEL.to_string(), "node-1".to_string()),
                (CAPACITY_TYPE_LABEL.to_string(), "on-demand".to_string()),
            ]
            .into_iter()
            .collect(),
            taints: Vec::new(),
            allocatable: Resources::new()
                .with(CPU, 4000)
                .with(MEMORY, 8 * GI)
                .with(PODS, 110),
            daemon_requests: Resources::new().with(CPU, 200),
            pod_requests: Resources::new(),
            host_ports: Vec::new(),
            volumes: VolumeUsage::new(),
            pods: Vec::new(),
            initialized: true,
            in_flight: false,
            marked_for_deletion: false,
            created: 1,
            pool: None,
        };
        let mut snapshot = snapshot_with_pool(NodePool::new("default"));
        snapshot.nodes = vec![node];
        let catalog = catalog_for("default", vec![instance("m", 4000, 8 * GI, &["zone-1"], 1.0)]);

        let results = schedule(&snapshot, &catalog, vec![mem_pod("p", GI)]);
        assert_eq!(results.bindings.len(), 1);
        assert!(results.new_claims.is_empty());
    }
}
