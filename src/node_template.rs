// Flotilla node template - a candidate future node accumulating the
// requirements, overhead and pods of a provisioning decision in progress

use std::sync::Arc;

use thiserror::Error;

use crate::api::{
    host_ports_conflict, tolerates_all, DaemonSet, HostPort, NodeClaim, NodeClaimPhase, NodePool,
    ObjectMeta, Pod,
};
use crate::cluster_state::daemonset_overhead;
use crate::instance_types::{
    cheapest_price, filter_by_resources, filter_compatible, InstanceType,
};
use crate::requirements::{
    Requirement, RequirementError, Requirements, HOSTNAME_LABEL, POOL_LABEL,
};
use crate::resources::Resources;
use crate::topology::{PodTopologyView, Topology, TopologyError};
use crate::volumes::VolumeUsage;

/// Why a pod did not fit a candidate node
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Unfit {
    #[error("untolerated taint {0}")]
    UntoleratedTaint(String),
    #[error("incompatible requirements: {0}")]
    IncompatibleRequirements(String),
    #[error("topology: {0}")]
    Topology(String),
    #[error("no instance type satisfies the accumulated requirements and requests")]
    NoInstanceType,
    #[error("insufficient remaining resources")]
    InsufficientResources,
    #[error("host port already in use")]
    HostPortConflict,
    #[error("per-driver volume limit exceeded")]
    VolumeLimit,
}

impl From<TopologyError> for Unfit {
    fn from(err: TopologyError) -> Self {
        Unfit::Topology(err.to_string())
    }
}

/// A hypothetical node opened during a scheduling pass. Requirements only
/// tighten and instance-type options only narrow as pods are added; a pod
/// fits only if at least one option can host everything placed so far.
#[derive(Clone, Debug)]
pub struct NodeTemplate {
    pub pool: Arc<NodePool>,
    /// Provisional hostname; each template is its own hostname domain
    pub hostname: String,
    pub requirements: Requirements,
    pub options: Vec<Arc<InstanceType>>,
    pub daemon_requests: Resources,
    pub pod_requests: Resources,
    pub pods: Vec<Arc<Pod>>,
    pub host_ports: Vec<HostPort>,
    pub volumes: VolumeUsage,
}

impl NodeTemplate {
    pub fn new(
        pool: Arc<NodePool>,
        instance_types: &[Arc<InstanceType>],
        daemonsets: &[Arc<DaemonSet>],
        index: usize,
    ) -> Result<Self, RequirementError> {
        let hostname = format!("{}-{}", pool.name, index);
        let mut requirements = Requirements::from_labels(&pool.labels);
        for r in &pool.requirements {
            requirements.add(r)?;
        }
        requirements.add(&Requirement::is_in(POOL_LABEL, [pool.name.clone()]))?;
        requirements.add(&Requirement::is_in(HOSTNAME_LABEL, [hostname.clone()]))?;

        let daemon_requests = daemonset_overhead(daemonsets, &pool.taints, &requirements, false);
        let options = filter_compatible(instance_types, &requirements);
        Ok(Self {
            pool,
            hostname,
            requirements,
            options,
            daemon_requests,
            pod_requests: Resources::new(),
            pods: Vec::new(),
            host_ports: Vec::new(),
            volumes: VolumeUsage::new(),
        })
    }

    /// The cheapest price any remaining option can be had for
    pub fn price(&self) -> Option<f64> {
        cheapest_price(&self.options, &self.requirements)
    }

    /// Attempt to place a pod. Commits the narrowed requirements, options
    /// and bookkeeping only when every check passes; on failure the
    /// template is untouched.
    pub fn try_add(
        &mut self,
        pod: &Arc<Pod>,
        pod_requirements: &Requirements,
        view: &PodTopologyView<'_>,
        topology: &Topology,
        volume_additions: &[(String, String)],
    ) -> Result<(), Unfit> {
        if !tolerates_all(&pod.tolerations, &self.pool.taints) {
            let offending = self
                .pool
                .taints
                .iter()
                .find(|t| !pod.tolerations.iter().any(|tol| tol.tolerates(t)))
                .map(|t| t.key.clone())
                .unwrap_or_default();
            return Err(Unfit::UntoleratedTaint(offending));
        }

        let merged = self.requirements.intersection(pod_requirements);
        if let Some(bad) = merged.unsatisfiable() {
            return Err(Unfit::IncompatibleRequirements(bad.to_string()));
        }
        let tightened = topology.tighten(view, &merged)?;

        let mut total = self.daemon_requests.sum(&self.pod_requests);
        total.add(&pod.requests());
        let options = filter_compatible(&self.options, &tightened);
        if options.is_empty() {
            return Err(Unfit::NoInstanceType);
        }
        let options = filter_by_resources(&options, &total);
        if options.is_empty() {
            return Err(Unfit::InsufficientResources);
        }

        if host_ports_conflict(&self.host_ports, &pod.host_ports) {
            return Err(Unfit::HostPortConflict);
        }
        // No CSINode exists for a hypothetical node; the default per-driver
        // limit applies
        if !self.volumes.fits(volume_additions, &Default::default()) {
            return Err(Unfit::VolumeLimit);
        }

        self.requirements = tightened;
        self.options = options;
        self.pod_requests.add(&pod.requests());
        self.pods.push(pod.clone());
        self.host_ports.extend(pod.host_ports.iter().cloned());
        for (driver, claim) in volume_additions {
            self.volumes.add(driver, claim);
        }
        Ok(())
    }

    /// Close the template into a claim: the conjunction of every placed
    /// pod's requirements, overhead recomputed against the final
    /// requirement set, and options re-filtered to cover the total.
    pub fn finalize(&self, daemonsets: &[Arc<DaemonSet>], now: u64) -> NodeClaim {
        let daemon_requests =
            daemonset_overhead(daemonsets, &self.pool.taints, &self.requirements, false);
        let total = daemon_requests.sum(&self.pod_requests);
        let mut options = filter_by_resources(&self.options, &total);
        if options.is_empty() {
            // The recomputed overhead can only have shrunk; fall back to
            // the options proven viable during the pass
            options = self.options.clone();
        }

        // The provisional hostname never constrains the real machine
        let mut requirements = self.requirements.clone();
        requirements.remove(HOSTNAME_LABEL);

        NodeClaim {
            meta: ObjectMeta {
                creation_timestamp: now,
                ..ObjectMeta::named(&self.hostname)
            },
            pool: self.pool.name.clone(),
            requirements,
            instance_type_options: options,
            resource_requests: total,
            taints: self.pool.taints.clone(),
            startup_taints: self.pool.startup_taints.clone(),
            phase: NodeClaimPhase::Pending,
            provider_id: None,
            node_name: None,
        }
    }
}
