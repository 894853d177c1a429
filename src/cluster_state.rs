// Flotilla cluster state - typed in-memory mirror of nodes, claims, pods
// and their supporting objects, with snapshot reads for scheduling passes
//
// Writers are the per-kind reconcilers; readers take a deep snapshot at the
// start of a pass and never observe mid-pass mutation.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use crate::api::{
    CsiNode, DaemonSet, HostPort, Node, NodeClaim, NodeClaimPhase, NodePool,
    PersistentVolumeClaim, Pod, StorageClass, Taint,
};
use crate::requirements::{Requirements, HOSTNAME_LABEL, POOL_LABEL};
use crate::requirements::{CAPACITY_TYPE_LABEL, INSTANCE_TYPE_LABEL, ZONE_LABEL};
use crate::resources::{component_min, Resources};
use crate::volumes::{self, VolumeResolver, VolumeUsage};

/// State bookkeeping counters
#[derive(Default)]
pub struct StateMetrics {
    pub updates: AtomicU64,
    pub deletes: AtomicU64,
    pub snapshots: AtomicU64,
    /// Observations referencing objects we do not know about
    pub inconsistencies: AtomicU64,
}

/// The union the scheduler works with: an existing Node, an in-flight
/// NodeClaim, or both once the machine has registered
#[derive(Clone, Debug)]
pub struct StateNode {
    pub key: String,
    pub node: Option<Node>,
    pub claim: Option<NodeClaim>,
    pub pod_uids: BTreeSet<String>,
    pub marked_for_deletion: bool,
}

impl StateNode {
    pub fn name(&self) -> String {
        if let Some(node) = &self.node {
            return node.meta.name.clone();
        }
        if let Some(claim) = &self.claim {
            if let Some(name) = &claim.node_name {
                return name.clone();
            }
            return claim.meta.name.clone();
        }
        self.key.clone()
    }

    /// Concrete labels: the node's once registered, otherwise the labels
    /// implied by the claim's single-valued requirements plus the
    /// provisional hostname
    pub fn labels(&self) -> BTreeMap<String, String> {
        if let Some(node) = &self.node {
            return node.meta.labels.clone();
        }
        let mut labels = BTreeMap::new();
        if let Some(claim) = &self.claim {
            labels = claim.requirements.labels();
            labels.insert(POOL_LABEL.to_string(), claim.pool.clone());
            labels
                .entry(HOSTNAME_LABEL.to_string())
                .or_insert_with(|| self.name());
        }
        labels
    }

    /// Schedulability-relevant taints. Startup taints are removed by the
    /// node bootstrap and never block placement decisions.
    pub fn taints(&self) -> Vec<Taint> {
        let raw = if let Some(node) = &self.node {
            node.taints.clone()
        } else if let Some(claim) = &self.claim {
            claim.taints.clone()
        } else {
            Vec::new()
        };
        let startup: &[Taint] = self
            .claim
            .as_ref()
            .map_or(&[], |c| c.startup_taints.as_slice());
        raw.into_iter().filter(|t| !startup.contains(t)).collect()
    }

    pub fn in_flight(&self) -> bool {
        self.node.is_none()
    }

    /// Registered, ready, reporting allocatable, and past its startup taints
    pub fn initialized(&self) -> bool {
        let node = match &self.node {
            Some(node) => node,
            None => return false,
        };
        if !node.ready || node.allocatable.is_empty() {
            return false;
        }
        if let Some(claim) = &self.claim {
            if node.taints.iter().any(|t| claim.startup_taints.contains(t)) {
                return false;
            }
        }
        true
    }

    /// Once the kubelet reports status, the node's view is authoritative;
    /// extended resources it zeroed are simply absent. Before that, the
    /// conservative estimate is the component-wise minimum across the
    /// claim's remaining instance-type options.
    pub fn allocatable(&self) -> Resources {
        if let Some(node) = &self.node {
            if !node.allocatable.is_empty() {
                return node.allocatable.clone();
            }
        }
        if let Some(claim) = &self.claim {
            let options: Vec<Resources> = claim
                .instance_type_options
                .iter()
                .map(|it| it.allocatable())
                .collect();
            return component_min(options.iter());
        }
        Resources::new()
    }

    pub fn created(&self) -> u64 {
        if let Some(claim) = &self.claim {
            return claim.meta.creation_timestamp;
        }
        self.node
            .as_ref()
            .map_or(0, |n| n.meta.creation_timestamp)
    }

    fn claim_key(claim: &NodeClaim) -> String {
        match &claim.provider_id {
            Some(id) => id.clone(),
            None => format!("claim/{}", claim.meta.name),
        }
    }
}

/// A node as seen by one scheduling pass: immutable, with the derived
/// quantities precomputed
#[derive(Clone, Debug)]
pub struct SnapshotNode {
    pub key: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub taints: Vec<Taint>,
    pub allocatable: Resources,
    /// Requests of daemonset pods, observed or estimated
    pub daemon_requests: Resources,
    /// Requests of everything else bound to the node
    pub pod_requests: Resources,
    pub host_ports: Vec<HostPort>,
    pub volumes: VolumeUsage,
    pub pods: Vec<Arc<Pod>>,
    pub initialized: bool,
    pub in_flight: bool,
    pub marked_for_deletion: bool,
    pub created: u64,
    pub pool: Option<String>,
}

impl SnapshotNode {
    pub fn requirements(&self) -> Requirements {
        Requirements::from_labels(&self.labels)
    }

    /// Capacity left for additional non-daemonset pods
    pub fn available(&self) -> Resources {
        self.allocatable
            .saturating_sub(&self.daemon_requests)
            .saturating_sub(&self.pod_requests)
    }

    pub fn instance_type(&self) -> Option<&str> {
        self.labels.get(INSTANCE_TYPE_LABEL).map(|s| s.as_str())
    }

    pub fn capacity_type(&self) -> Option<&str> {
        self.labels.get(CAPACITY_TYPE_LABEL).map(|s| s.as_str())
    }

    pub fn zone(&self) -> Option<&str> {
        self.labels.get(ZONE_LABEL).map(|s| s.as_str())
    }

    pub fn reschedulable_pods(&self) -> Vec<Arc<Pod>> {
        self.pods
            .iter()
            .filter(|p| p.is_reschedulable())
            .cloned()
            .collect()
    }

    /// Pods that pin the node in place: anything bound that the disruption
    /// machinery is not allowed to move
    pub fn blocking_pods(&self) -> Vec<Arc<Pod>> {
        self.pods
            .iter()
            .filter(|p| p.is_active() && !p.is_reschedulable() && !p.is_daemonset_pod())
            .cloned()
            .collect()
    }
}

/// Immutable deep copy of cluster state used by one scheduling or
/// consolidation pass
#[derive(Clone, Default)]
pub struct ClusterSnapshot {
    pub nodes: Vec<SnapshotNode>,
    pub pods: HashMap<String, Arc<Pod>>,
    pub daemonsets: Vec<Arc<DaemonSet>>,
    pub csi_limits: HashMap<String, BTreeMap<String, i32>>,
    pub storage_classes: HashMap<String, Arc<StorageClass>>,
    pub volume_claims: HashMap<String, Arc<PersistentVolumeClaim>>,
    pub pools: Vec<Arc<NodePool>>,
}

impl ClusterSnapshot {
    pub fn node(&self, key: &str) -> Option<&SnapshotNode> {
        self.nodes.iter().find(|n| n.key == key)
    }

    /// Remove candidate nodes from scheduling consideration, as done when
    /// simulating their disruption
    pub fn without_nodes(&self, keys: &BTreeSet<String>) -> ClusterSnapshot {
        let mut out = self.clone();
        out.nodes.retain(|n| !keys.contains(&n.key));
        out
    }
}

/// Aggregate resource requests of daemonsets that would land on a node with
/// the given taints and requirements. Used to reserve overhead on
/// hypothetical and in-flight nodes before their daemonset pods exist.
pub fn daemonset_overhead(
    daemonsets: &[Arc<DaemonSet>],
    taints: &[Taint],
    node_requirements: &Requirements,
    strict: bool,
) -> Resources {
    let mut out = Resources::new();
    for ds in daemonsets {
        let pod = &ds.pod_template;
        if !crate::api::tolerates_all(&pod.tolerations, taints) {
            continue;
        }
        let mut pod_reqs = Requirements::from_labels(&pod.node_selector);
        if let Some(term) = pod.required_node_affinity.first() {
            if Requirements::try_from_requirements(term.iter())
                .map(|r| pod_reqs.merge(&r))
                .is_err()
            {
                continue;
            }
        }
        let landing = if strict {
            node_requirements.strictly_compatible(&pod_reqs)
        } else {
            node_requirements.compatible(&pod_reqs)
        };
        if landing {
            out.add(&pod.requests());
        }
    }
    out
}

/// The in-memory cluster mirror. One writer per resource kind (the
/// reconcilers), many snapshot readers.
#[derive(Default)]
pub struct ClusterState {
    nodes: RwLock<HashMap<String, StateNode>>,
    /// node name -> state node key
    node_names: RwLock<HashMap<String, String>>,
    pods: RwLock<HashMap<String, Arc<Pod>>>,
    /// pod uid -> state node key
    bindings: RwLock<HashMap<String, String>>,
    daemonsets: RwLock<HashMap<String, Arc<DaemonSet>>>,
    csi_nodes: RwLock<HashMap<String, BTreeMap<String, i32>>>,
    storage_classes: RwLock<HashMap<String, Arc<StorageClass>>>,
    volume_claims: RwLock<HashMap<String, Arc<PersistentVolumeClaim>>>,
    pools: RwLock<HashMap<String, Arc<NodePool>>>,
    revision: AtomicU64,
    metrics: StateMetrics,
}

impl ClusterState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metrics(&self) -> &StateMetrics {
        &self.metrics
    }

    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    fn bump(&self) {
        self.revision.fetch_add(1, Ordering::SeqCst);
        self.metrics.updates.fetch_add(1, Ordering::SeqCst);
    }

    // Pool bookkeeping

    pub fn apply_pool(&self, pool: NodePool) {
        let mut pools = self.pools.write().unwrap();
        pools.insert(pool.name.clone(), Arc::new(pool));
        drop(pools);
        self.bump();
    }

    pub fn delete_pool(&self, name: &str) {
        let mut pools = self.pools.write().unwrap();
        pools.remove(name);
        drop(pools);
        self.metrics.deletes.fetch_add(1, Ordering::SeqCst);
    }

    pub fn pools(&self) -> Vec<Arc<NodePool>> {
        let pools = self.pools.read().unwrap();
        let mut out: Vec<_> = pools.values().cloned().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn pool(&self, name: &str) -> Option<Arc<NodePool>> {
        self.pools.read().unwrap().get(name).cloned()
    }

    // Node and claim bookkeeping

    /// Observe a node claim. An in-flight claim becomes its own StateNode
    /// until the machine registers; once the claim carries a provider id the
    /// entry is re-keyed so the Node observation lands in the same place.
    pub fn apply_node_claim(&self, claim: NodeClaim) {
        let key = StateNode::claim_key(&claim);
        let staging_key = format!("claim/{}", claim.meta.name);
        let mut nodes = self.nodes.write().unwrap();

        // Migrate the pre-launch entry, merging with any entry the Node
        // observation already created under the provider id
        let staged = if key != staging_key {
            nodes.remove(&staging_key)
        } else {
            None
        };
        let existing = nodes.remove(&key);
        let mut entry = match (staged, existing) {
            (Some(mut staged), Some(existing)) => {
                staged.node = staged.node.or(existing.node);
                staged.pod_uids.extend(existing.pod_uids);
                staged.marked_for_deletion |= existing.marked_for_deletion;
                staged
            }
            (Some(staged), None) => staged,
            (None, Some(existing)) => existing,
            (None, None) => StateNode {
                key: key.clone(),
                node: None,
                claim: None,
                pod_uids: BTreeSet::new(),
                marked_for_deletion: false,
            },
        };
        entry.key = key.clone();
        entry.claim = Some(claim);
        nodes.insert(key, entry);
        drop(nodes);
        self.bump();
    }

    pub fn delete_node_claim(&self, name: &str) {
        let mut nodes = self.nodes.write().unwrap();
        let key = nodes
            .values()
            .find(|sn| sn.claim.as_ref().map(|c| c.meta.name.as_str()) == Some(name))
            .map(|sn| sn.key.clone());
        if let Some(key) = key {
            if let Some(entry) = nodes.get_mut(&key) {
                entry.claim = None;
                if entry.node.is_none() {
                    nodes.remove(&key);
                }
            }
        }
        drop(nodes);
        self.metrics.deletes.fetch_add(1, Ordering::SeqCst);
    }

    /// Observe a node. Joins the claim with the same provider id when one
    /// is already tracked, advancing it to Registered.
    pub fn apply_node(&self, node: Node) {
        let key = node.provider_id.clone();
        let mut nodes = self.nodes.write().unwrap();
        let mut entry = nodes.remove(&key).unwrap_or(StateNode {
            key: key.clone(),
            node: None,
            claim: None,
            pod_uids: BTreeSet::new(),
            marked_for_deletion: false,
        });
        if let Some(claim) = &mut entry.claim {
            claim.advance(NodeClaimPhase::Registered);
            claim.node_name = Some(node.meta.name.clone());
        }
        let name = node.meta.name.clone();
        entry.node = Some(node);
        if entry.initialized() {
            if let Some(claim) = &mut entry.claim {
                claim.advance(NodeClaimPhase::Initialized);
            }
        }
        nodes.insert(key.clone(), entry);
        drop(nodes);
        self.node_names.write().unwrap().insert(name, key);
        self.bump();
    }

    pub fn delete_node(&self, name: &str) {
        let key = self.node_names.write().unwrap().remove(name);
        if let Some(key) = key {
            let mut orphaned: Vec<String> = Vec::new();
            {
                let mut nodes = self.nodes.write().unwrap();
                if let Some(entry) = nodes.get_mut(&key) {
                    entry.node = None;
                    orphaned = std::mem::take(&mut entry.pod_uids).into_iter().collect();
                    if entry.claim.is_none() {
                        nodes.remove(&key);
                    }
                }
            }
            let mut bindings = self.bindings.write().unwrap();
            for uid in &orphaned {
                bindings.remove(uid);
            }
        }
        self.metrics.deletes.fetch_add(1, Ordering::SeqCst);
    }

    /// Flag nodes whose pods should be treated as reschedulable by the next
    /// pass
    pub fn mark_for_deletion(&self, keys: &[String]) {
        let mut nodes = self.nodes.write().unwrap();
        for key in keys {
            if let Some(entry) = nodes.get_mut(key) {
                entry.marked_for_deletion = true;
            }
        }
        drop(nodes);
        self.bump();
    }

    pub fn unmark_for_deletion(&self, keys: &[String]) {
        let mut nodes = self.nodes.write().unwrap();
        for key in keys {
            if let Some(entry) = nodes.get_mut(key) {
                entry.marked_for_deletion = false;
            }
        }
        drop(nodes);
        self.bump();
    }

    pub fn node_count(&self) -> usize {
        self.nodes.read().unwrap().len()
    }

    // Pod bookkeeping

    /// Observe a pod. A binding to an unknown node is an eventually
    /// consistent artifact: it is logged, counted, and the pod is skipped
    /// for this pass rather than failing the reconciler.
    pub fn apply_pod(&self, pod: Arc<Pod>) {
        let uid = pod.uid().to_string();
        self.pods.write().unwrap().insert(uid.clone(), pod.clone());

        let previous = self.bindings.read().unwrap().get(&uid).cloned();
        let target = match (&pod.node_name, pod.is_active()) {
            (Some(name), true) => {
                let key = self.node_names.read().unwrap().get(name).cloned();
                match key {
                    Some(key) => Some(key),
                    None => {
                        self.metrics.inconsistencies.fetch_add(1, Ordering::SeqCst);
                        warn!(pod = %pod.meta.qualified_name(), node = %name,
                              "pod references unknown node, skipping binding");
                        None
                    }
                }
            }
            _ => None,
        };

        if previous != target {
            let mut nodes = self.nodes.write().unwrap();
            if let Some(prev) = &previous {
                if let Some(entry) = nodes.get_mut(prev) {
                    entry.pod_uids.remove(&uid);
                }
            }
            if let Some(next) = &target {
                if let Some(entry) = nodes.get_mut(next) {
                    entry.pod_uids.insert(uid.clone());
                }
            }
            drop(nodes);
            let mut bindings = self.bindings.write().unwrap();
            match target {
                Some(next) => {
                    bindings.insert(uid, next);
                }
                None => {
                    bindings.remove(&uid);
                }
            }
        }
        self.bump();
    }

    pub fn delete_pod(&self, uid: &str) {
        self.pods.write().unwrap().remove(uid);
        let binding = self.bindings.write().unwrap().remove(uid);
        if let Some(key) = binding {
            if let Some(entry) = self.nodes.write().unwrap().get_mut(&key) {
                entry.pod_uids.remove(uid);
            }
        }
        self.metrics.deletes.fetch_add(1, Ordering::SeqCst);
    }

    pub fn pod_binding(&self, uid: &str) -> Option<String> {
        self.bindings.read().unwrap().get(uid).cloned()
    }

    // Supporting kinds

    pub fn apply_daemonset(&self, ds: DaemonSet) {
        self.daemonsets
            .write()
            .unwrap()
            .insert(ds.meta.qualified_name(), Arc::new(ds));
        self.bump();
    }

    pub fn delete_daemonset(&self, qualified_name: &str) {
        self.daemonsets.write().unwrap().remove(qualified_name);
        self.metrics.deletes.fetch_add(1, Ordering::SeqCst);
    }

    pub fn apply_csi_node(&self, csi: CsiNode) {
        self.csi_nodes
            .write()
            .unwrap()
            .insert(csi.node_name.clone(), csi.driver_limits);
        self.bump();
    }

    pub fn delete_csi_node(&self, node_name: &str) {
        self.csi_nodes.write().unwrap().remove(node_name);
        self.metrics.deletes.fetch_add(1, Ordering::SeqCst);
    }

    pub fn apply_storage_class(&self, sc: StorageClass) {
        self.storage_classes
            .write()
            .unwrap()
            .insert(sc.meta.name.clone(), Arc::new(sc));
        self.bump();
    }

    pub fn delete_storage_class(&self, name: &str) {
        self.storage_classes.write().unwrap().remove(name);
        self.metrics.deletes.fetch_add(1, Ordering::SeqCst);
    }

    pub fn apply_volume_claim(&self, pvc: PersistentVolumeClaim) {
        self.volume_claims
            .write()
            .unwrap()
            .insert(pvc.meta.qualified_name(), Arc::new(pvc));
        self.bump();
    }

    pub fn delete_volume_claim(&self, qualified_name: &str) {
        self.volume_claims.write().unwrap().remove(qualified_name);
        self.metrics.deletes.fetch_add(1, Ordering::SeqCst);
    }

    /// The cluster default storage class under the documented tie-breaks
    pub fn default_storage_class(&self) -> Option<Arc<StorageClass>> {
        volumes::default_storage_class(&self.storage_classes.read().unwrap())
    }

    // Snapshot

    /// Deep copy for one pass. Derived quantities (daemonset overhead,
    /// bound requests, port and volume usage) are computed here so the pass
    /// itself never touches shared state.
    pub fn snapshot(&self) -> ClusterSnapshot {
        self.metrics.snapshots.fetch_add(1, Ordering::SeqCst);

        let pods = self.pods.read().unwrap().clone();
        let daemonsets: Vec<Arc<DaemonSet>> = {
            let map = self.daemonsets.read().unwrap();
            let mut out: Vec<_> = map.values().cloned().collect();
            out.sort_by(|a, b| a.meta.name.cmp(&b.meta.name));
            out
        };
        let storage_classes = self.storage_classes.read().unwrap().clone();
        let volume_claims = self.volume_claims.read().unwrap().clone();
        let csi_limits = self.csi_nodes.read().unwrap().clone();
        let resolver = VolumeResolver {
            claims: &volume_claims,
            storage_classes: &storage_classes,
        };

        let mut nodes = Vec::new();
        {
            let state_nodes = self.nodes.read().unwrap();
            for sn in state_nodes.values() {
                let labels = sn.labels();
                let taints = sn.taints();
                let in_flight = sn.in_flight();

                let mut bound = Vec::new();
                let mut daemon_requests = Resources::new();
                let mut pod_requests = Resources::new();
                let mut host_ports = Vec::new();
                let mut volume_usage = VolumeUsage::new();
                for uid in &sn.pod_uids {
                    let pod = match pods.get(uid) {
                        Some(pod) => pod.clone(),
                        None => continue,
                    };
                    if pod.is_active() {
                        if pod.is_daemonset_pod() {
                            daemon_requests.add(&pod.requests());
                        } else {
                            pod_requests.add(&pod.requests());
                        }
                        host_ports.extend(pod.host_ports.iter().cloned());
                        match resolver.drivers_for(&pod) {
                            Ok(drivers) => {
                                for (driver, claim) in drivers {
                                    volume_usage.add(&driver, &claim);
                                }
                            }
                            Err(err) => {
                                debug!(pod = %pod.meta.qualified_name(), %err,
                                       "volume resolution failed, not counting");
                            }
                        }
                    }
                    bound.push(pod);
                }
                if in_flight {
                    // No daemonset pods exist yet; reserve their estimate
                    daemon_requests = daemonset_overhead(
                        &daemonsets,
                        &taints,
                        &Requirements::from_labels(&labels),
                        true,
                    );
                }

                let pool = sn
                    .claim
                    .as_ref()
                    .map(|c| c.pool.clone())
                    .or_else(|| labels.get(POOL_LABEL).cloned());

                nodes.push(SnapshotNode {
                    key: sn.key.clone(),
                    name: sn.name(),
                    allocatable: sn.allocatable(),
                    initialized: sn.initialized(),
                    in_flight,
                    marked_for_deletion: sn.marked_for_deletion,
                    created: sn.created(),
                    labels,
                    taints,
                    daemon_requests,
                    pod_requests,
                    host_ports,
                    volumes: volume_usage,
                    pods: bound,
                    pool,
                });
            }
        }
        nodes.sort_by(|a, b| a.key.cmp(&b.key));

        ClusterSnapshot {
            nodes,
            pods,
            daemonsets,
            csi_limits,
            storage_classes,
            volume_claims,
            pools: self.pools(),
        }
    }
}
