// Flotilla object model - the orchestrator-shaped resources the core
// consumes: pods, nodes, pools, claims, daemonsets, CSI nodes and storage
// classes, with the matching helpers scheduling needs

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::instance_types::InstanceType;
use crate::requirements::Requirement;
use crate::resources::{Resources, PODS};

/// Common object metadata
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    /// Seconds since the epoch, as reported by the orchestrator
    pub creation_timestamp: u64,
    pub deletion_timestamp: Option<u64>,
    pub owner_references: Vec<OwnerReference>,
}

impl ObjectMeta {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            uid: name.to_string(),
            ..Self::default()
        }
    }

    pub fn qualified_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.namespace, self.name)
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OwnerReference {
    pub kind: String,
    pub name: String,
    pub controller: bool,
}

/// Taint effects
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaintEffect {
    NoSchedule,
    PreferNoSchedule,
    NoExecute,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Taint {
    pub key: String,
    pub value: Option<String>,
    pub effect: TaintEffect,
}

impl Taint {
    pub fn new(key: &str, value: Option<&str>, effect: TaintEffect) -> Self {
        Self {
            key: key.to_string(),
            value: value.map(|v| v.to_string()),
            effect,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TolerationOperator {
    Equal,
    Exists,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Toleration {
    /// None tolerates every key
    pub key: Option<String>,
    pub operator: TolerationOperator,
    pub value: Option<String>,
    /// None tolerates every effect
    pub effect: Option<TaintEffect>,
    pub toleration_seconds: Option<i64>,
}

impl Toleration {
    pub fn exists(key: &str) -> Self {
        Self {
            key: Some(key.to_string()),
            operator: TolerationOperator::Exists,
            value: None,
            effect: None,
            toleration_seconds: None,
        }
    }

    pub fn equal(key: &str, value: &str) -> Self {
        Self {
            key: Some(key.to_string()),
            operator: TolerationOperator::Equal,
            value: Some(value.to_string()),
            effect: None,
            toleration_seconds: None,
        }
    }

    pub fn tolerates(&self, taint: &Taint) -> bool {
        if let Some(effect) = self.effect {
            if effect != taint.effect {
                return false;
            }
        }
        match self.operator {
            TolerationOperator::Exists => match &self.key {
                Some(key) => *key == taint.key,
                // Empty key with Exists tolerates everything
                None => true,
            },
            TolerationOperator::Equal => {
                self.key.as_deref() == Some(taint.key.as_str())
                    && self.value == taint.value
            }
        }
    }
}

/// True when every blocking taint is tolerated. PreferNoSchedule never
/// blocks placement.
pub fn tolerates_all(tolerations: &[Toleration], taints: &[Taint]) -> bool {
    taints.iter().all(|taint| {
        taint.effect == TaintEffect::PreferNoSchedule
            || tolerations.iter().any(|t| t.tolerates(taint))
    })
}

/// Label selector over pods
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LabelSelector {
    pub match_labels: BTreeMap<String, String>,
    pub match_expressions: Vec<Requirement>,
}

impl LabelSelector {
    pub fn labels(labels: &[(&str, &str)]) -> Self {
        Self {
            match_labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            match_expressions: Vec::new(),
        }
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
            && self
                .match_expressions
                .iter()
                .all(|r| r.matches(labels.get(&r.key).map(|s| s.as_str())))
    }
}

/// One required pod-affinity or anti-affinity term
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PodAffinityTerm {
    pub selector: LabelSelector,
    pub topology_key: String,
}

/// A preferred node-affinity term: ANDed requirements with a weight
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WeightedNodeSelectorTerm {
    pub weight: i32,
    pub requirements: Vec<Requirement>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnsatisfiablePolicy {
    DoNotSchedule,
    ScheduleAnyway,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TopologySpreadConstraint {
    pub max_skew: i32,
    pub topology_key: String,
    pub when_unsatisfiable: UnsatisfiablePolicy,
    pub selector: LabelSelector,
}

/// A volume a pod mounts, by claim name. The claim resolves to a storage
/// class, the storage class to a CSI driver.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PodVolume {
    pub name: String,
    pub claim_name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostPort {
    pub port: i32,
    pub protocol: String,
}

impl HostPort {
    pub fn tcp(port: i32) -> Self {
        Self {
            port,
            protocol: "TCP".to_string(),
        }
    }
}

/// True when any added port is already claimed
pub fn host_ports_conflict(existing: &[HostPort], added: &[HostPort]) -> bool {
    added.iter().any(|p| existing.contains(p))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// The pod abstraction scheduling operates on
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Pod {
    pub meta: ObjectMeta,
    pub phase: PodPhase,
    /// Node the pod is bound to, once scheduled
    pub node_name: Option<String>,
    pub priority: i32,
    /// Per-container resource requests
    pub container_requests: Vec<Resources>,
    /// Per-init-container requests; the pod needs the maximum of these
    pub init_container_requests: Vec<Resources>,
    /// Runtime-class overhead added on top of container requests
    pub overhead: Resources,
    pub node_selector: BTreeMap<String, String>,
    /// Required node affinity: OR of ANDed requirement terms
    pub required_node_affinity: Vec<Vec<Requirement>>,
    /// Preferred node affinity, weighted
    pub preferred_node_affinity: Vec<WeightedNodeSelectorTerm>,
    pub pod_affinity: Vec<PodAffinityTerm>,
    pub pod_anti_affinity: Vec<PodAffinityTerm>,
    pub topology_spread: Vec<TopologySpreadConstraint>,
    pub tolerations: Vec<Toleration>,
    pub volumes: Vec<PodVolume>,
    pub host_ports: Vec<HostPort>,
}

impl Pod {
    pub fn new(name: &str) -> Self {
        Self {
            meta: ObjectMeta {
                namespace: "default".to_string(),
                ..ObjectMeta::named(name)
            },
            phase: PodPhase::Pending,
            node_name: None,
            priority: 0,
            container_requests: Vec::new(),
            init_container_requests: Vec::new(),
            overhead: Resources::new(),
            node_selector: BTreeMap::new(),
            required_node_affinity: Vec::new(),
            preferred_node_affinity: Vec::new(),
            pod_affinity: Vec::new(),
            pod_anti_affinity: Vec::new(),
            topology_spread: Vec::new(),
            tolerations: Vec::new(),
            volumes: Vec::new(),
            host_ports: Vec::new(),
        }
    }

    pub fn uid(&self) -> &str {
        &self.meta.uid
    }

    /// Effective requests: the greater of app-container sums and the
    /// largest init container, plus runtime overhead, plus the implicit
    /// one-pod slot.
    pub fn requests(&self) -> Resources {
        let mut app = Resources::new();
        for r in &self.container_requests {
            app.add(r);
        }
        let mut out = app;
        for r in &self.init_container_requests {
            out = out.max(r);
        }
        out.add(&self.overhead);
        out.set(PODS, out.get(PODS) + 1);
        out
    }

    pub fn is_terminating(&self) -> bool {
        self.meta.deletion_timestamp.is_some()
    }

    pub fn controller_ref(&self) -> Option<&OwnerReference> {
        self.meta.owner_references.iter().find(|o| o.controller)
    }

    pub fn is_owned_by(&self, kind: &str) -> bool {
        self.controller_ref().map_or(false, |o| o.kind == kind)
    }

    /// Pods whose controller will recreate them elsewhere may be disrupted;
    /// daemonset pods and bare pods must stay with their node.
    pub fn is_reschedulable(&self) -> bool {
        if self.is_terminating() {
            return false;
        }
        match self.controller_ref() {
            Some(owner) => matches!(owner.kind.as_str(), "ReplicaSet" | "StatefulSet" | "Job"),
            None => false,
        }
    }

    pub fn is_daemonset_pod(&self) -> bool {
        self.is_owned_by("DaemonSet")
    }

    /// Finished pods no longer consume capacity
    pub fn is_active(&self) -> bool {
        !matches!(self.phase, PodPhase::Succeeded | PodPhase::Failed)
    }
}

/// An observed machine
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node {
    pub meta: ObjectMeta,
    pub provider_id: String,
    pub taints: Vec<Taint>,
    /// Reported by the kubelet once the node registers; empty until then
    pub allocatable: Resources,
    pub capacity: Resources,
    pub ready: bool,
}

/// A provisioning template: what kind of nodes a pool may create
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodePool {
    pub name: String,
    /// Tiebreak among pools; higher wins
    pub weight: i32,
    pub labels: BTreeMap<String, String>,
    pub taints: Vec<Taint>,
    /// Taints present at boot and removed once the node initializes; they
    /// never block scheduling decisions
    pub startup_taints: Vec<Taint>,
    pub requirements: Vec<Requirement>,
    /// Maximum concurrent disruptions within a rolling window
    pub disruption_budget: u32,
}

impl NodePool {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            weight: 0,
            labels: BTreeMap::new(),
            taints: Vec::new(),
            startup_taints: Vec::new(),
            requirements: Vec::new(),
            disruption_budget: 10,
        }
    }
}

/// NodeClaim lifecycle. Transitions are monotonic, except that any phase
/// may move to Terminating.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeClaimPhase {
    Pending,
    Launched,
    Registered,
    Initialized,
    Terminating,
}

/// A request for one new node against a pool
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeClaim {
    pub meta: ObjectMeta,
    pub pool: String,
    /// Accumulated requirements, including chosen zone, capacity-type and
    /// instance-type subsets
    pub requirements: crate::requirements::Requirements,
    /// Candidate instance types, non-empty at emission
    #[serde(skip)]
    pub instance_type_options: Vec<Arc<InstanceType>>,
    /// Requests of the pods this claim was created for, plus daemonset
    /// overhead
    pub resource_requests: Resources,
    pub taints: Vec<Taint>,
    pub startup_taints: Vec<Taint>,
    pub phase: NodeClaimPhase,
    pub provider_id: Option<String>,
    pub node_name: Option<String>,
}

impl NodeClaim {
    /// Apply a phase transition, ignoring regressions
    pub fn advance(&mut self, phase: NodeClaimPhase) {
        if phase == NodeClaimPhase::Terminating || phase > self.phase {
            self.phase = phase;
        }
    }
}

/// A daemonset, reduced to the canonical pod its controller stamps out
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DaemonSet {
    pub meta: ObjectMeta,
    pub pod_template: Pod,
}

/// Per-driver volume attachment limits reported for one node
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CsiNode {
    pub node_name: String,
    pub driver_limits: BTreeMap<String, i32>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageClass {
    pub meta: ObjectMeta,
    pub provisioner: String,
    pub is_default: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistentVolumeClaim {
    pub meta: ObjectMeta,
    /// None selects the cluster default class
    pub storage_class_name: Option<String>,
}
