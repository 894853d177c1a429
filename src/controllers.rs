// Flotilla reconcilers - typed cluster events flowing through a
// prioritized queue into the state mirror
//
// One logical writer per resource kind; the queue gives node-lifecycle
// events precedence over pod churn, and supporting kinds trail behind.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::api::{
    CsiNode, DaemonSet, Node, NodeClaim, NodePool, PersistentVolumeClaim, Pod, StorageClass,
};
use crate::cluster_state::ClusterState;

/// Everything the informers can tell us
#[derive(Clone, Debug)]
pub enum ClusterEvent {
    PodApplied(Arc<Pod>),
    PodDeleted { uid: String },
    NodeApplied(Box<Node>),
    NodeDeleted { name: String },
    NodeClaimApplied(Box<NodeClaim>),
    NodeClaimDeleted { name: String },
    PoolApplied(Box<NodePool>),
    PoolDeleted { name: String },
    DaemonSetApplied(Box<DaemonSet>),
    DaemonSetDeleted { qualified_name: String },
    CsiNodeApplied(Box<CsiNode>),
    CsiNodeDeleted { node_name: String },
    StorageClassApplied(Box<StorageClass>),
    StorageClassDeleted { name: String },
    VolumeClaimApplied(Box<PersistentVolumeClaim>),
    VolumeClaimDeleted { qualified_name: String },
}

/// Queue tiers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventPriority {
    Critical,
    High,
    Normal,
    Low,
}

impl ClusterEvent {
    /// Node lifecycle outranks pod churn outranks supporting kinds
    pub fn priority(&self) -> EventPriority {
        match self {
            ClusterEvent::NodeDeleted { .. } | ClusterEvent::NodeClaimDeleted { .. } => {
                EventPriority::Critical
            }
            ClusterEvent::NodeApplied(_)
            | ClusterEvent::NodeClaimApplied(_)
            | ClusterEvent::PodDeleted { .. } => EventPriority::High,
            ClusterEvent::PodApplied(_) => EventPriority::Normal,
            _ => EventPriority::Low,
        }
    }

    fn dedup_key(&self) -> String {
        match self {
            ClusterEvent::PodApplied(pod) => format!("pod/{}", pod.uid()),
            ClusterEvent::PodDeleted { uid } => format!("pod-del/{}", uid),
            ClusterEvent::NodeApplied(node) => format!("node/{}", node.provider_id),
            ClusterEvent::NodeDeleted { name } => format!("node-del/{}", name),
            ClusterEvent::NodeClaimApplied(claim) => format!("claim/{}", claim.meta.name),
            ClusterEvent::NodeClaimDeleted { name } => format!("claim-del/{}", name),
            ClusterEvent::PoolApplied(pool) => format!("pool/{}", pool.name),
            ClusterEvent::PoolDeleted { name } => format!("pool-del/{}", name),
            ClusterEvent::DaemonSetApplied(ds) => format!("ds/{}", ds.meta.qualified_name()),
            ClusterEvent::DaemonSetDeleted { qualified_name } => {
                format!("ds-del/{}", qualified_name)
            }
            ClusterEvent::CsiNodeApplied(csi) => format!("csi/{}", csi.node_name),
            ClusterEvent::CsiNodeDeleted { node_name } => format!("csi-del/{}", node_name),
            ClusterEvent::StorageClassApplied(sc) => format!("sc/{}", sc.meta.name),
            ClusterEvent::StorageClassDeleted { name } => format!("sc-del/{}", name),
            ClusterEvent::VolumeClaimApplied(pvc) => {
                format!("pvc/{}", pvc.meta.qualified_name())
            }
            ClusterEvent::VolumeClaimDeleted { qualified_name } => {
                format!("pvc-del/{}", qualified_name)
            }
        }
    }
}

/// Priority queue with recent-duplicate suppression
struct EventQueue {
    critical: VecDeque<ClusterEvent>,
    high: VecDeque<ClusterEvent>,
    normal: VecDeque<ClusterEvent>,
    low: VecDeque<ClusterEvent>,
    dedup_map: HashMap<String, Instant>,
}

impl EventQueue {
    fn new() -> Self {
        Self {
            critical: VecDeque::new(),
            high: VecDeque::new(),
            normal: VecDeque::new(),
            low: VecDeque::new(),
            dedup_map: HashMap::new(),
        }
    }

    fn push(&mut self, event: ClusterEvent) {
        match event.priority() {
            EventPriority::Critical => self.critical.push_back(event),
            EventPriority::High => self.high.push_back(event),
            EventPriority::Normal => self.normal.push_back(event),
            EventPriority::Low => self.low.push_back(event),
        }
    }

    fn pop(&mut self) -> Option<ClusterEvent> {
        if let Some(event) = self.critical.pop_front() {
            return Some(event);
        }
        if let Some(event) = self.high.pop_front() {
            return Some(event);
        }
        if let Some(event) = self.normal.pop_front() {
            return Some(event);
        }
        self.low.pop_front()
    }

    fn depth(&self) -> usize {
        self.critical.len() + self.high.len() + self.normal.len() + self.low.len()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub worker_threads: usize,
    /// Suppress identical events re-observed within this window; zero
    /// disables suppression
    pub dedup_window: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            worker_threads: 2,
            dedup_window: Duration::ZERO,
        }
    }
}

#[derive(Default)]
pub struct ControllerMetrics {
    pub total_events: AtomicU64,
    pub deduplicated: AtomicU64,
    pub queue_depth: AtomicU64,
    pub avg_processing_time_us: AtomicU64,
    pub peak_processing_time_us: AtomicU64,
}

/// Applies cluster events to the state mirror via background workers
pub struct StateReconciler {
    state: Arc<ClusterState>,
    queue: Arc<Mutex<EventQueue>>,
    metrics: Arc<ControllerMetrics>,
    config: ControllerConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl StateReconciler {
    pub fn new(state: Arc<ClusterState>, config: ControllerConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            state,
            queue: Arc::new(Mutex::new(EventQueue::new())),
            metrics: Arc::new(ControllerMetrics::default()),
            config,
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn metrics(&self) -> Arc<ControllerMetrics> {
        self.metrics.clone()
    }

    pub fn enqueue(&self, event: ClusterEvent) {
        let mut queue = self.queue.lock().unwrap();
        if self.config.dedup_window > Duration::ZERO {
            let key = event.dedup_key();
            if let Some(last_seen) = queue.dedup_map.get(&key) {
                if last_seen.elapsed() < self.config.dedup_window {
                    self.metrics.deduplicated.fetch_add(1, Ordering::SeqCst);
                    return;
                }
            }
            queue.dedup_map.insert(key, Instant::now());
        }
        queue.push(event);
        self.metrics
            .queue_depth
            .store(queue.depth() as u64, Ordering::SeqCst);
    }

    /// Spawn the worker tasks
    pub fn start(&self) {
        for worker_id in 0..self.config.worker_threads {
            let queue = Arc::clone(&self.queue);
            let state = Arc::clone(&self.state);
            let metrics = Arc::clone(&self.metrics);
            let mut shutdown_rx = self.shutdown_rx.clone();

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() {
                                break;
                            }
                        }
                        _ = tokio::time::sleep(Duration::from_millis(10)) => {
                            loop {
                                let event = { queue.lock().unwrap().pop() };
                                match event {
                                    Some(event) => {
                                        Self::process(&state, &metrics, event);
                                        metrics.queue_depth.store(
                                            queue.lock().unwrap().depth() as u64,
                                            Ordering::SeqCst,
                                        );
                                    }
                                    None => break,
                                }
                            }
                        }
                    }
                }
                debug!(worker_id, "reconciler worker stopped");
            });
        }
        info!(
            workers = self.config.worker_threads,
            "state reconcilers started"
        );
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Apply every queued event on the caller's thread. Used by tests and
    /// by callers that need the mirror current before taking a snapshot.
    pub fn drain(&self) {
        loop {
            let event = { self.queue.lock().unwrap().pop() };
            match event {
                Some(event) => Self::process(&self.state, &self.metrics, event),
                None => break,
            }
        }
        self.metrics.queue_depth.store(0, Ordering::SeqCst);
    }

    fn process(state: &ClusterState, metrics: &ControllerMetrics, event: ClusterEvent) {
        let start = Instant::now();
        match event {
            ClusterEvent::PodApplied(pod) => state.apply_pod(pod),
            ClusterEvent::PodDeleted { uid } => state.delete_pod(&uid),
            ClusterEvent::NodeApplied(node) => state.apply_node(*node),
            ClusterEvent::NodeDeleted { name } => state.delete_node(&name),
            ClusterEvent::NodeClaimApplied(claim) => state.apply_node_claim(*claim),
            ClusterEvent::NodeClaimDeleted { name } => state.delete_node_claim(&name),
            ClusterEvent::PoolApplied(pool) => state.apply_pool(*pool),
            ClusterEvent::PoolDeleted { name } => state.delete_pool(&name),
            ClusterEvent::DaemonSetApplied(ds) => state.apply_daemonset(*ds),
            ClusterEvent::DaemonSetDeleted { qualified_name } => {
                state.delete_daemonset(&qualified_name)
            }
            ClusterEvent::CsiNodeApplied(csi) => state.apply_csi_node(*csi),
            ClusterEvent::CsiNodeDeleted { node_name } => state.delete_csi_node(&node_name),
            ClusterEvent::StorageClassApplied(sc) => state.apply_storage_class(*sc),
            ClusterEvent::StorageClassDeleted { name } => state.delete_storage_class(&name),
            ClusterEvent::VolumeClaimApplied(pvc) => state.apply_volume_claim(*pvc),
            ClusterEvent::VolumeClaimDeleted { qualified_name } => {
                state.delete_volume_claim(&qualified_name)
            }
        }

        metrics.total_events.fetch_add(1, Ordering::SeqCst);
        let duration_us = start.elapsed().as_micros() as u64;
        let current = metrics.avg_processing_time_us.load(Ordering::SeqCst);
        metrics
            .avg_processing_time_us
            .store((current * 7 + duration_us) / 8, Ordering::SeqCst);
        if duration_us > metrics.peak_processing_time_us.load(Ordering::SeqCst) {
            metrics
                .peak_processing_time_us
                .store(duration_us, Ordering::SeqCst);
        }
    }
}
