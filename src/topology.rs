// Flotilla topology tracker - per-domain pod counts backing topology
// spread, pod affinity and pod anti-affinity decisions
//
// Affinity is modeled as "at least one match in the chosen domain",
// anti-affinity as "zero matches", spread as "skew stays within MaxSkew".

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use thiserror::Error;

use crate::api::{LabelSelector, Pod, TopologySpreadConstraint, UnsatisfiablePolicy};
use crate::requirements::{Requirement, Requirements};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("no viable {key} domain for {constraint}")]
    NoViableDomain { key: String, constraint: String },
}

/// The three constraint families sharing the domain-count machinery
#[derive(Clone, Debug, PartialEq)]
pub enum TopologyKind {
    Spread {
        max_skew: i32,
        policy: UnsatisfiablePolicy,
    },
    Affinity,
    AntiAffinity,
}

/// Counts of selector-matching pods per domain value of one topology key
#[derive(Clone, Debug)]
pub struct TopologyGroup {
    pub kind: TopologyKind,
    pub key: String,
    pub namespace: String,
    pub selector: LabelSelector,
    domains: BTreeMap<String, u32>,
}

impl TopologyGroup {
    fn counts_pod(&self, pod: &Pod) -> bool {
        pod.meta.namespace == self.namespace && self.selector.matches(&pod.meta.labels)
    }

    fn describe(&self) -> String {
        match &self.kind {
            TopologyKind::Spread { max_skew, .. } => {
                format!("spread(maxSkew={})", max_skew)
            }
            TopologyKind::Affinity => "pod affinity".to_string(),
            TopologyKind::AntiAffinity => "pod anti-affinity".to_string(),
        }
    }

    /// Domain values currently allowed for a pod joining this group,
    /// narrowed to a single deterministic choice.
    fn next_domain(&self, pod: &Pod, node_requirements: &Requirements) -> Option<String> {
        let node_allowed: Vec<(String, u32)> = self
            .domains
            .iter()
            .filter(|(d, _)| node_requirements.intersects(&self.key, d))
            .map(|(d, c)| (d.clone(), *c))
            .collect();
        if node_allowed.is_empty() {
            return None;
        }
        match &self.kind {
            TopologyKind::Spread { max_skew, .. } => {
                let min = self.domains.values().copied().min().unwrap_or(0);
                let mut best: Option<(String, u32)> = None;
                for (domain, count) in node_allowed {
                    if count as i64 + 1 - min as i64 > *max_skew as i64 {
                        continue;
                    }
                    // Lowest count wins; BTreeMap order breaks ties
                    let take = match &best {
                        Some((_, best_count)) => count < *best_count,
                        None => true,
                    };
                    if take {
                        best = Some((domain, count));
                    }
                }
                best.map(|(d, _)| d)
            }
            TopologyKind::Affinity => {
                // Prefer the domain that already holds the most matches;
                // self-affinity seeds the first domain arbitrarily and later
                // pods then follow it
                let mut best: Option<(String, u32)> = None;
                for (domain, count) in &node_allowed {
                    if *count == 0 {
                        continue;
                    }
                    let take = match &best {
                        Some((_, best_count)) => count > best_count,
                        None => true,
                    };
                    if take {
                        best = Some((domain.clone(), *count));
                    }
                }
                match best {
                    Some((d, _)) => Some(d),
                    None if self.counts_pod(pod) => {
                        node_allowed.into_iter().next().map(|(d, _)| d)
                    }
                    None => None,
                }
            }
            TopologyKind::AntiAffinity => node_allowed
                .into_iter()
                .find(|(_, count)| *count == 0)
                .map(|(d, _)| d),
        }
    }
}

/// The pod-side view used for topology queries: the pod itself plus the
/// spread constraints still active after preference relaxation
pub struct PodTopologyView<'a> {
    pub pod: &'a Pod,
    pub active_spread: &'a [TopologySpreadConstraint],
}

impl<'a> PodTopologyView<'a> {
    pub fn required(pod: &'a Pod) -> Self {
        Self {
            pod,
            active_spread: &pod.topology_spread,
        }
    }
}

/// Pass-local domain-count tracker built from a cluster snapshot and the
/// batch of pods being scheduled
#[derive(Clone, Default)]
pub struct Topology {
    groups: Vec<TopologyGroup>,
    /// Which (group, domain) registrations each pod contributed, so a
    /// placement can be undone
    recorded: HashMap<String, Vec<(usize, String)>>,
}

impl Topology {
    /// Build groups for every constraint carried by the pending pods, then
    /// seed domain counts from the known domain universe and the pods
    /// already bound to existing nodes.
    pub fn build(
        pending: &[&Pod],
        existing: &[(BTreeMap<String, String>, Vec<Arc<Pod>>)],
        universe: &BTreeMap<String, BTreeSet<String>>,
    ) -> Self {
        let mut topology = Self::default();
        for pod in pending {
            for c in &pod.topology_spread {
                topology.ensure_group(
                    TopologyKind::Spread {
                        max_skew: c.max_skew,
                        policy: c.when_unsatisfiable,
                    },
                    &c.topology_key,
                    &pod.meta.namespace,
                    &c.selector,
                );
            }
            for term in &pod.pod_affinity {
                topology.ensure_group(
                    TopologyKind::Affinity,
                    &term.topology_key,
                    &pod.meta.namespace,
                    &term.selector,
                );
            }
            for term in &pod.pod_anti_affinity {
                topology.ensure_group(
                    TopologyKind::AntiAffinity,
                    &term.topology_key,
                    &pod.meta.namespace,
                    &term.selector,
                );
            }
        }

        for group in &mut topology.groups {
            if let Some(values) = universe.get(&group.key) {
                for v in values {
                    group.domains.entry(v.clone()).or_insert(0);
                }
            }
            for (labels, pods) in existing {
                let domain = match labels.get(&group.key) {
                    Some(d) => d.clone(),
                    None => continue,
                };
                let matching = pods
                    .iter()
                    .filter(|pod| pod.is_active() && group.counts_pod(pod))
                    .count();
                let entry = group.domains.entry(domain).or_insert(0);
                *entry += matching as u32;
            }
        }
        topology
    }

    fn ensure_group(
        &mut self,
        kind: TopologyKind,
        key: &str,
        namespace: &str,
        selector: &LabelSelector,
    ) {
        let exists = self.groups.iter().any(|g| {
            g.kind == kind && g.key == key && g.namespace == namespace && g.selector == *selector
        });
        if !exists {
            self.groups.push(TopologyGroup {
                kind,
                key: key.to_string(),
                namespace: namespace.to_string(),
                selector: selector.clone(),
                domains: BTreeMap::new(),
            });
        }
    }

    /// Make a new domain value known to every group tracking the key.
    /// Hypothetical nodes register their provisional hostname here, which is
    /// what makes each new node count as its own hostname domain.
    pub fn register_domain(&mut self, key: &str, value: &str) {
        for group in &mut self.groups {
            if group.key == key {
                group.domains.entry(value.to_string()).or_insert(0);
            }
        }
    }

    /// Narrow a candidate node's requirements to domains that keep every
    /// constraint the pod participates in satisfiable.
    pub fn tighten(
        &self,
        view: &PodTopologyView<'_>,
        node_requirements: &Requirements,
    ) -> Result<Requirements, TopologyError> {
        let mut out = node_requirements.clone();
        for group in &self.groups {
            if !self.group_applies(group, view) {
                continue;
            }
            match group.next_domain(view.pod, &out) {
                Some(domain) => {
                    // Infallible: the domain came from an In construction
                    let _ = out.add(&Requirement::is_in(&group.key, [domain]));
                }
                None => {
                    return Err(TopologyError::NoViableDomain {
                        key: group.key.clone(),
                        constraint: group.describe(),
                    });
                }
            }
        }
        Ok(out)
    }

    /// Count a placed pod into every group whose selector it matches
    pub fn record(&mut self, pod: &Pod, node_requirements: &Requirements) {
        let mut recorded = Vec::new();
        for (idx, group) in self.groups.iter_mut().enumerate() {
            if !group.counts_pod(pod) {
                continue;
            }
            let domain = match node_requirements.single(&group.key) {
                Some(d) => d.to_string(),
                // The node does not pin this key to one value; nothing
                // sound to count
                None => continue,
            };
            *group.domains.entry(domain.clone()).or_insert(0) += 1;
            recorded.push((idx, domain));
        }
        if !recorded.is_empty() {
            self.recorded.insert(pod.uid().to_string(), recorded);
        }
    }

    /// Undo a tentative registration
    pub fn unregister(&mut self, pod_uid: &str) {
        if let Some(entries) = self.recorded.remove(pod_uid) {
            for (idx, domain) in entries {
                if let Some(count) = self.groups[idx].domains.get_mut(&domain) {
                    *count = count.saturating_sub(1);
                }
            }
        }
    }

    fn group_applies(&self, group: &TopologyGroup, view: &PodTopologyView<'_>) -> bool {
        if view.pod.meta.namespace != group.namespace {
            return false;
        }
        match &group.kind {
            TopologyKind::Spread { max_skew, policy } => view.active_spread.iter().any(|c| {
                c.max_skew == *max_skew
                    && c.when_unsatisfiable == *policy
                    && c.topology_key == group.key
                    && c.selector == group.selector
            }),
            TopologyKind::Affinity => view
                .pod
                .pod_affinity
                .iter()
                .any(|t| t.topology_key == group.key && t.selector == group.selector),
            TopologyKind::AntiAffinity => view
                .pod
                .pod_anti_affinity
                .iter()
                .any(|t| t.topology_key == group.key && t.selector == group.selector),
        }
    }

    #[cfg(test)]
    pub fn domain_counts(&self, key: &str) -> BTreeMap<String, u32> {
        self.groups
            .iter()
            .find(|g| g.key == key)
            .map(|g| g.domains.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::PodAffinityTerm;
    use crate::requirements::{HOSTNAME_LABEL, ZONE_LABEL};

    fn spread_pod(name: &str, max_skew: i32) -> Pod {
        let mut pod = Pod::new(name);
        pod.meta.labels.insert("app".to_string(), "web".to_string());
        pod.topology_spread = vec![TopologySpreadConstraint {
            max_skew,
            topology_key: ZONE_LABEL.to_string(),
            when_unsatisfiable: UnsatisfiablePolicy::DoNotSchedule,
            selector: LabelSelector::labels(&[("app", "web")]),
        }];
        pod
    }

    fn zone_universe() -> BTreeMap<String, BTreeSet<String>> {
        let mut u = BTreeMap::new();
        u.insert(
            ZONE_LABEL.to_string(),
            ["zone-1", "zone-2", "zone-3"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        );
        u
    }

    fn any_zone() -> Requirements {
        Requirements::new()
    }

    #[test]
    fn test_spread_fills_domains_evenly() {
        let pods: Vec<Pod> = (0..4).map(|i| spread_pod(&format!("p{}", i), 1)).collect();
        let refs: Vec<&Pod> = pods.iter().collect();
        let mut topology = Topology::build(&refs, &[], &zone_universe());

        let mut chosen = Vec::new();
        for pod in &pods {
            let view = PodTopologyView::required(pod);
            let reqs = topology.tighten(&view, &any_zone()).unwrap();
            let zone = reqs.single(ZONE_LABEL).unwrap().to_string();
            topology.record(pod, &reqs);
            chosen.push(zone);
        }
        // Three distinct zones first, then re-use is allowed again
        assert_eq!(chosen[..3], ["zone-1", "zone-2", "zone-3"]);
        let counts = topology.domain_counts(ZONE_LABEL);
        let max = counts.values().max().unwrap();
        let min = counts.values().min().unwrap();
        assert!(max - min <= 1);
    }

    #[test]
    fn test_spread_rejects_overfull_domain() {
        let pod = spread_pod("p", 1);
        let refs = [&pod];
        let mut topology = Topology::build(&refs, &[], &zone_universe());
        // Force two pods worth of count into zone-1
        let mut pinned = Requirements::new();
        pinned
            .add(&Requirement::is_in(ZONE_LABEL, ["zone-1"]))
            .unwrap();
        topology.record(&spread_pod("a", 1), &pinned);
        topology.record(&spread_pod("b", 1), &pinned);

        let view = PodTopologyView::required(&pod);
        // A node pinned to zone-1 cannot take another matching pod
        let err = topology.tighten(&view, &pinned).unwrap_err();
        assert!(matches!(err, TopologyError::NoViableDomain { .. }));
        // An unpinned candidate can still pick zone-2
        let reqs = topology.tighten(&view, &any_zone()).unwrap();
        assert_eq!(reqs.single(ZONE_LABEL).unwrap(), "zone-2");
    }

    #[test]
    fn test_self_affinity_seeds_then_sticks() {
        let mut pod_a = Pod::new("a");
        pod_a.meta.labels.insert("app".to_string(), "db".to_string());
        pod_a.pod_affinity = vec![PodAffinityTerm {
            selector: LabelSelector::labels(&[("app", "db")]),
            topology_key: ZONE_LABEL.to_string(),
        }];
        let mut pod_b = pod_a.clone();
        pod_b.meta.name = "b".to_string();
        pod_b.meta.uid = "b".to_string();

        let refs = [&pod_a, &pod_b];
        let mut topology = Topology::build(&refs, &[], &zone_universe());

        let reqs_a = topology
            .tighten(&PodTopologyView::required(&pod_a), &any_zone())
            .unwrap();
        let seeded = reqs_a.single(ZONE_LABEL).unwrap().to_string();
        topology.record(&pod_a, &reqs_a);

        let reqs_b = topology
            .tighten(&PodTopologyView::required(&pod_b), &any_zone())
            .unwrap();
        // The second pod follows the seeded domain instead of opening a new one
        assert_eq!(reqs_b.single(ZONE_LABEL).unwrap(), seeded);
    }

    #[test]
    fn test_anti_affinity_requires_empty_domain() {
        let mut pod = Pod::new("p");
        pod.meta.labels.insert("app".to_string(), "web".to_string());
        pod.pod_anti_affinity = vec![PodAffinityTerm {
            selector: LabelSelector::labels(&[("app", "web")]),
            topology_key: HOSTNAME_LABEL.to_string(),
        }];

        let mut peer = Pod::new("peer");
        peer.meta.labels.insert("app".to_string(), "web".to_string());

        let node_labels: BTreeMap<String, String> =
            [(HOSTNAME_LABEL.to_string(), "node-1".to_string())]
                .into_iter()
                .collect();
        let existing = vec![(node_labels, vec![Arc::new(peer)])];

        let refs = [&pod];
        let mut topology = Topology::build(&refs, &existing, &BTreeMap::new());

        // Only node-1 exists and it already hosts a matching pod
        let mut on_node_1 = Requirements::new();
        on_node_1
            .add(&Requirement::is_in(HOSTNAME_LABEL, ["node-1"]))
            .unwrap();
        assert!(topology
            .tighten(&PodTopologyView::required(&pod), &on_node_1)
            .is_err());

        // A hypothetical node is its own hostname domain
        topology.register_domain(HOSTNAME_LABEL, "pool-a-1");
        let reqs = topology
            .tighten(&PodTopologyView::required(&pod), &any_zone())
            .unwrap();
        assert_eq!(reqs.single(HOSTNAME_LABEL).unwrap(), "pool-a-1");
    }

    #[test]
    fn test_unregister_reverses_counts() {
        let pod = spread_pod("p", 1);
        let refs = [&pod];
        let mut topology = Topology::build(&refs, &[], &zone_universe());
        let reqs = topology
            .tighten(&PodTopologyView::required(&pod), &any_zone())
            .unwrap();
        topology.record(&pod, &reqs);
        assert_eq!(topology.domain_counts(ZONE_LABEL)["zone-1"], 1);
        topology.unregister(pod.uid());
        assert_eq!(topology.domain_counts(ZONE_LABEL)["zone-1"], 0);
    }
}
