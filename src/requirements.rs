// Flotilla requirements algebra - label-selector constraints as per-key sets
// Evaluation is a match over the operator tag against a label map, and
// combination is set intersection with retained conflict diagnostics

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Domain owned by the autoscaler itself
pub const DOMAIN: &str = "flotilla.sh";

/// Well-known node label keys
pub const ARCH_LABEL: &str = "kubernetes.io/arch";
pub const OS_LABEL: &str = "kubernetes.io/os";
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";
pub const ZONE_LABEL: &str = "topology.kubernetes.io/zone";
pub const REGION_LABEL: &str = "topology.kubernetes.io/region";
pub const INSTANCE_TYPE_LABEL: &str = "node.kubernetes.io/instance-type";
pub const CAPACITY_TYPE_LABEL: &str = "flotilla.sh/capacity-type";
pub const POOL_LABEL: &str = "flotilla.sh/pool";

/// Capacity-type label values
pub const CAPACITY_TYPE_ON_DEMAND: &str = "on-demand";
pub const CAPACITY_TYPE_SPOT: &str = "spot";

/// Label domains reserved for the orchestrator and the autoscaler
const RESTRICTED_DOMAINS: &[&str] = &["kubernetes.io", "k8s.io", DOMAIN];

/// Reserved-domain keys that pods may nevertheless select on
const WELL_KNOWN_LABELS: &[&str] = &[
    ARCH_LABEL,
    OS_LABEL,
    HOSTNAME_LABEL,
    ZONE_LABEL,
    REGION_LABEL,
    INSTANCE_TYPE_LABEL,
    CAPACITY_TYPE_LABEL,
    POOL_LABEL,
];

/// Selector operators
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
    Gt,
    Lt,
}

/// A single label-selector requirement as written on a pod, pool or
/// instance type
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub key: String,
    pub operator: Operator,
    pub values: Vec<String>,
}

impl Requirement {
    pub fn is_in<S: Into<String>>(key: &str, values: impl IntoIterator<Item = S>) -> Self {
        Self {
            key: key.to_string(),
            operator: Operator::In,
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn not_in<S: Into<String>>(key: &str, values: impl IntoIterator<Item = S>) -> Self {
        Self {
            key: key.to_string(),
            operator: Operator::NotIn,
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn exists(key: &str) -> Self {
        Self {
            key: key.to_string(),
            operator: Operator::Exists,
            values: Vec::new(),
        }
    }

    pub fn does_not_exist(key: &str) -> Self {
        Self {
            key: key.to_string(),
            operator: Operator::DoesNotExist,
            values: Vec::new(),
        }
    }

    pub fn gt(key: &str, bound: i64) -> Self {
        Self {
            key: key.to_string(),
            operator: Operator::Gt,
            values: vec![bound.to_string()],
        }
    }

    pub fn lt(key: &str, bound: i64) -> Self {
        Self {
            key: key.to_string(),
            operator: Operator::Lt,
            values: vec![bound.to_string()],
        }
    }

    /// Evaluate against a single label value (None when the key is absent)
    pub fn matches(&self, label: Option<&str>) -> bool {
        match self.operator {
            Operator::In => label.map_or(false, |v| self.values.iter().any(|x| x == v)),
            Operator::NotIn => label.map_or(true, |v| !self.values.iter().any(|x| x == v)),
            Operator::Exists => label.is_some(),
            Operator::DoesNotExist => label.is_none(),
            Operator::Gt => match (label.and_then(|v| v.parse::<i64>().ok()), self.bound()) {
                (Some(v), Some(b)) => v > b,
                _ => false,
            },
            Operator::Lt => match (label.and_then(|v| v.parse::<i64>().ok()), self.bound()) {
                (Some(v), Some(b)) => v < b,
                _ => false,
            },
        }
    }

    fn bound(&self) -> Option<i64> {
        if self.values.len() != 1 {
            return None;
        }
        self.values[0].parse().ok()
    }
}

/// Errors raised while constructing requirements
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequirementError {
    #[error("operator {operator:?} on key {key:?} requires exactly one integer value")]
    InvalidNumericBound { key: String, operator: Operator },
    #[error("label key {key:?} is restricted")]
    RestrictedLabel { key: String },
}

/// The effective constraint on one label key: an allowed (or excluded) value
/// set plus optional numeric bounds.
///
/// `complement == true` means `values` is an exclusion set over an unbounded
/// domain (NotIn / Exists); `complement == false` means `values` enumerates
/// the allowed set (In / DoesNotExist). `absence_ok` records whether a node
/// without the key at all still satisfies the constraint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRequirement {
    pub key: String,
    complement: bool,
    values: BTreeSet<String>,
    greater_than: Option<i64>,
    less_than: Option<i64>,
    absence_ok: bool,
    /// Human-readable record of the intersection that emptied this
    /// constraint, kept for diagnostics
    conflict: Option<String>,
}

impl KeyRequirement {
    /// Unconstrained: any value, or no value at all
    pub fn any(key: &str) -> Self {
        Self {
            key: key.to_string(),
            complement: true,
            values: BTreeSet::new(),
            greater_than: None,
            less_than: None,
            absence_ok: true,
            conflict: None,
        }
    }

    pub fn from_requirement(r: &Requirement) -> Result<Self, RequirementError> {
        let mut out = Self {
            key: r.key.clone(),
            complement: false,
            values: BTreeSet::new(),
            greater_than: None,
            less_than: None,
            absence_ok: false,
            conflict: None,
        };
        match r.operator {
            Operator::In => {
                out.values = r.values.iter().cloned().collect();
            }
            Operator::NotIn => {
                out.complement = true;
                out.values = r.values.iter().cloned().collect();
                out.absence_ok = true;
            }
            Operator::Exists => {
                out.complement = true;
            }
            Operator::DoesNotExist => {
                out.absence_ok = true;
            }
            Operator::Gt => {
                out.complement = true;
                out.greater_than = Some(Self::numeric_bound(r)?);
            }
            Operator::Lt => {
                out.complement = true;
                out.less_than = Some(Self::numeric_bound(r)?);
            }
        }
        Ok(out)
    }

    fn numeric_bound(r: &Requirement) -> Result<i64, RequirementError> {
        if r.values.len() == 1 {
            if let Ok(b) = r.values[0].parse() {
                return Ok(b);
            }
        }
        Err(RequirementError::InvalidNumericBound {
            key: r.key.clone(),
            operator: r.operator,
        })
    }

    /// Set intersection of two constraints on the same key
    pub fn intersect(&self, other: &KeyRequirement) -> KeyRequirement {
        let greater_than = match (self.greater_than, other.greater_than) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        let less_than = match (self.less_than, other.less_than) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        let (complement, mut values) = match (self.complement, other.complement) {
            // Both exclusion sets: exclusions accumulate
            (true, true) => (true, self.values.union(&other.values).cloned().collect()),
            // One enumerated set minus the other side's exclusions
            (true, false) => (false, other.values.difference(&self.values).cloned().collect()),
            (false, true) => (false, self.values.difference(&other.values).cloned().collect()),
            // Both enumerated: plain intersection
            (false, false) => (
                false,
                self.values
                    .intersection(&other.values)
                    .cloned()
                    .collect::<BTreeSet<_>>(),
            ),
        };

        // Numeric bounds prune enumerated values; non-numeric entries cannot
        // satisfy a numeric bound
        if !complement && (greater_than.is_some() || less_than.is_some()) {
            values.retain(|v| match v.parse::<i64>() {
                Ok(n) => {
                    greater_than.map_or(true, |g| n > g) && less_than.map_or(true, |l| n < l)
                }
                Err(_) => false,
            });
        }

        let mut out = KeyRequirement {
            key: self.key.clone(),
            complement,
            values,
            greater_than,
            less_than,
            absence_ok: self.absence_ok && other.absence_ok,
            conflict: self.conflict.clone().or_else(|| other.conflict.clone()),
        };
        if !out.is_satisfiable() && self.is_satisfiable() && other.is_satisfiable() {
            out.conflict = Some(format!("{} excludes {}", self, other));
        }
        out
    }

    /// At least one concrete value remains, or absence is acceptable
    pub fn is_satisfiable(&self) -> bool {
        self.absence_ok || self.has_candidate_value()
    }

    fn has_candidate_value(&self) -> bool {
        if self.complement {
            // Unbounded domain minus finitely many exclusions is empty only
            // when the numeric window closes
            match (self.greater_than, self.less_than) {
                (Some(g), Some(l)) => l - g >= 2,
                _ => true,
            }
        } else {
            !self.values.is_empty()
        }
    }

    /// Membership test for one concrete value
    pub fn intersects_value(&self, value: &str) -> bool {
        if self.greater_than.is_some() || self.less_than.is_some() {
            let n = match value.parse::<i64>() {
                Ok(n) => n,
                Err(_) => return false,
            };
            if self.greater_than.map_or(false, |g| n <= g) {
                return false;
            }
            if self.less_than.map_or(false, |l| n >= l) {
                return false;
            }
        }
        if self.complement {
            !self.values.contains(value)
        } else {
            self.values.contains(value)
        }
    }

    /// Evaluate against a node label (None when the key is absent)
    pub fn matches_label(&self, label: Option<&str>) -> bool {
        match label {
            Some(v) => self.intersects_value(v),
            None => self.absence_ok,
        }
    }

    /// Enumerable allowed values; None for unbounded (Exists-style) keys
    pub fn values(&self) -> Option<&BTreeSet<String>> {
        if self.complement {
            None
        } else {
            Some(&self.values)
        }
    }

    /// An arbitrary-but-deterministic allowed value, when one is enumerable
    pub fn any_value(&self) -> Option<&str> {
        self.values().and_then(|v| v.iter().next()).map(|s| s.as_str())
    }

    /// True only when the constraint demands the key be present
    pub fn requires_existence(&self) -> bool {
        !self.absence_ok
    }

    pub fn conflict(&self) -> Option<&str> {
        self.conflict.as_deref()
    }
}

impl fmt::Display for KeyRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.complement {
            if self.values.is_empty() && self.greater_than.is_none() && self.less_than.is_none() {
                if self.absence_ok {
                    return write!(f, "{} unconstrained", self.key);
                }
                return write!(f, "{} Exists", self.key);
            }
            write!(f, "{} NotIn {:?}", self.key, self.values)?;
        } else if self.values.is_empty() {
            if self.absence_ok {
                return write!(f, "{} DoesNotExist", self.key);
            }
            return write!(f, "{} In []", self.key);
        } else {
            write!(f, "{} In {:?}", self.key, self.values)?;
        }
        if let Some(g) = self.greater_than {
            write!(f, " >{}", g)?;
        }
        if let Some(l) = self.less_than {
            write!(f, " <{}", l)?;
        }
        Ok(())
    }
}

/// A bag of per-key constraints. Adding a requirement for a key that already
/// has one intersects the two; an emptied intersection leaves the bag
/// unsatisfiable but keeps the conflicting pair for diagnostics.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirements {
    by_key: BTreeMap<String, KeyRequirement>,
}

impl Requirements {
    pub fn new() -> Self {
        Self::default()
    }

    /// One In-constraint per label, the requirement view of a concrete node
    pub fn from_labels(labels: &BTreeMap<String, String>) -> Self {
        let mut out = Self::new();
        for (key, value) in labels {
            out.by_key.insert(
                key.clone(),
                KeyRequirement {
                    key: key.clone(),
                    complement: false,
                    values: [value.clone()].into_iter().collect(),
                    greater_than: None,
                    less_than: None,
                    absence_ok: false,
                    conflict: None,
                },
            );
        }
        out
    }

    pub fn try_from_requirements<'a>(
        reqs: impl IntoIterator<Item = &'a Requirement>,
    ) -> Result<Self, RequirementError> {
        let mut out = Self::new();
        for r in reqs {
            out.add(r)?;
        }
        Ok(out)
    }

    /// Intersect a requirement into the bag. Errors only on malformed input;
    /// conflicts leave the bag unsatisfiable instead.
    pub fn add(&mut self, r: &Requirement) -> Result<(), RequirementError> {
        let incoming = KeyRequirement::from_requirement(r)?;
        self.add_key_requirement(incoming);
        Ok(())
    }

    fn add_key_requirement(&mut self, incoming: KeyRequirement) {
        match self.by_key.get(&incoming.key) {
            Some(existing) => {
                let merged = existing.intersect(&incoming);
                self.by_key.insert(incoming.key.clone(), merged);
            }
            None => {
                self.by_key.insert(incoming.key.clone(), incoming);
            }
        }
    }

    /// Intersect every constraint of `other` into self
    pub fn merge(&mut self, other: &Requirements) {
        for kr in other.by_key.values() {
            self.add_key_requirement(kr.clone());
        }
    }

    pub fn intersection(&self, other: &Requirements) -> Requirements {
        let mut out = self.clone();
        out.merge(other);
        out
    }

    pub fn get(&self, key: &str) -> Option<&KeyRequirement> {
        self.by_key.get(key)
    }

    /// Drop the constraint on a key entirely
    pub fn remove(&mut self, key: &str) {
        self.by_key.remove(key);
    }

    pub fn has(&self, key: &str) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.by_key.keys().map(|k| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &KeyRequirement> {
        self.by_key.values()
    }

    /// First unsatisfiable key constraint, if any
    pub fn unsatisfiable(&self) -> Option<&KeyRequirement> {
        self.by_key.values().find(|kr| !kr.is_satisfiable())
    }

    pub fn is_satisfiable(&self) -> bool {
        self.unsatisfiable().is_none()
    }

    /// True iff for every shared key the intersection is non-empty. Keys
    /// present on only one side are compatible: the other side can still
    /// adopt the constraint.
    pub fn compatible(&self, other: &Requirements) -> bool {
        for (key, theirs) in &other.by_key {
            if let Some(ours) = self.by_key.get(key) {
                if !ours.intersect(theirs).is_satisfiable() {
                    return false;
                }
            }
        }
        true
    }

    /// Compatibility against a closed label set: every constraint of `other`
    /// that demands the key exist must find it here. Used when matching pods
    /// against existing nodes, whose labels are facts rather than choices.
    pub fn strictly_compatible(&self, other: &Requirements) -> bool {
        for (key, theirs) in &other.by_key {
            match self.by_key.get(key) {
                Some(ours) => {
                    if !ours.intersect(theirs).is_satisfiable() {
                        return false;
                    }
                }
                None => {
                    if theirs.requires_existence() {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Membership test respecting NotIn and the numeric operators.
    /// Unconstrained keys intersect everything.
    pub fn intersects(&self, key: &str, value: &str) -> bool {
        self.by_key
            .get(key)
            .map_or(true, |kr| kr.intersects_value(value))
    }

    /// Evaluate a concrete label map against every constraint
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.by_key
            .values()
            .all(|kr| kr.matches_label(labels.get(&kr.key).map(|s| s.as_str())))
    }

    /// Concrete labels implied by single-valued In constraints
    pub fn labels(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        for kr in self.by_key.values() {
            if let Some(values) = kr.values() {
                if values.len() == 1 {
                    if let Some(v) = values.iter().next() {
                        out.insert(kr.key.clone(), v.clone());
                    }
                }
            }
        }
        out
    }

    /// The single allowed value for a key, when it is fully determined
    pub fn single(&self, key: &str) -> Option<&str> {
        let kr = self.by_key.get(key)?;
        let values = kr.values()?;
        if values.len() == 1 {
            values.iter().next().map(|s| s.as_str())
        } else {
            None
        }
    }
}

/// Deny-list enforcement for label keys reserved to the orchestrator, with a
/// configurable allow-list of subdomains that bypass it.
#[derive(Clone, Debug, Default)]
pub struct RestrictedLabelPolicy {
    allowed_domains: Vec<String>,
}

impl RestrictedLabelPolicy {
    pub fn new(allowed_domains: Vec<String>) -> Self {
        Self { allowed_domains }
    }

    /// Reject requirements that select on reserved keys
    pub fn validate(&self, requirements: &Requirements) -> Result<(), RequirementError> {
        for key in requirements.keys() {
            if self.is_restricted(key) {
                return Err(RequirementError::RestrictedLabel {
                    key: key.to_string(),
                });
            }
        }
        Ok(())
    }

    fn is_restricted(&self, key: &str) -> bool {
        if WELL_KNOWN_LABELS.contains(&key) {
            return false;
        }
        let prefix = match key.split_once('/') {
            Some((prefix, _)) => prefix,
            None => return false,
        };
        if self
            .allowed_domains
            .iter()
            .any(|d| prefix == d || prefix.ends_with(&format!(".{}", d)))
        {
            return false;
        }
        RESTRICTED_DOMAINS
            .iter()
            .any(|d| prefix == *d || prefix.ends_with(&format!(".{}", d)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kr(r: Requirement) -> KeyRequirement {
        KeyRequirement::from_requirement(&r).unwrap()
    }

    #[test]
    fn test_in_intersection() {
        let a = kr(Requirement::is_in("zone", ["a", "b"]));
        let b = kr(Requirement::is_in("zone", ["b", "c"]));
        let out = a.intersect(&b);
        assert_eq!(
            out.values().unwrap().iter().collect::<Vec<_>>(),
            vec!["b"]
        );
        assert!(out.is_satisfiable());
    }

    #[test]
    fn test_in_not_in_difference() {
        let a = kr(Requirement::is_in("zone", ["a", "b"]));
        let b = kr(Requirement::not_in("zone", ["b"]));
        let out = a.intersect(&b);
        assert_eq!(
            out.values().unwrap().iter().collect::<Vec<_>>(),
            vec!["a"]
        );
    }

    #[test]
    fn test_exists_never_widens() {
        let a = kr(Requirement::is_in("zone", ["a"]));
        let b = kr(Requirement::exists("zone"));
        let out = a.intersect(&b);
        assert_eq!(
            out.values().unwrap().iter().collect::<Vec<_>>(),
            vec!["a"]
        );
        // Exists forbids absence even though In came first
        assert!(!out.matches_label(None));
    }

    #[test]
    fn test_conflict_is_retained() {
        let mut reqs = Requirements::new();
        reqs.add(&Requirement::is_in("zone", ["a"])).unwrap();
        reqs.add(&Requirement::is_in("zone", ["b"])).unwrap();
        let bad = reqs.unsatisfiable().expect("must be unsatisfiable");
        assert!(bad.conflict().is_some());
    }

    #[test]
    fn test_does_not_exist_conflicts_with_in() {
        let a = kr(Requirement::does_not_exist("gpu"));
        let b = kr(Requirement::is_in("gpu", ["a100"]));
        assert!(!a.intersect(&b).is_satisfiable());
        // But DoesNotExist on both sides stays satisfiable through absence
        let c = kr(Requirement::does_not_exist("gpu"));
        assert!(a.intersect(&c).is_satisfiable());
    }

    #[test]
    fn test_numeric_bounds() {
        let a = kr(Requirement::gt("slots", 2));
        let b = kr(Requirement::lt("slots", 5));
        let out = a.intersect(&b);
        assert!(out.intersects_value("3"));
        assert!(out.intersects_value("4"));
        assert!(!out.intersects_value("2"));
        assert!(!out.intersects_value("5"));
        assert!(!out.intersects_value("banana"));

        let closed = kr(Requirement::gt("slots", 2)).intersect(&kr(Requirement::lt("slots", 3)));
        assert!(!closed.is_satisfiable());
    }

    #[test]
    fn test_numeric_bounds_filter_enumerated_values() {
        let a = kr(Requirement::is_in("slots", ["1", "4", "9"]));
        let out = a.intersect(&kr(Requirement::gt("slots", 3)));
        let values: Vec<_> = out.values().unwrap().iter().collect();
        assert_eq!(values, vec!["4", "9"]);
    }

    #[test]
    fn test_compatible_shares_keys_only() {
        let mut a = Requirements::new();
        a.add(&Requirement::is_in("zone", ["a", "b"])).unwrap();
        let mut b = Requirements::new();
        b.add(&Requirement::is_in("zone", ["b"])).unwrap();
        b.add(&Requirement::is_in("arch", ["arm64"])).unwrap();
        // `a` has no arch constraint, so it can still adopt one
        assert!(a.compatible(&b));

        let mut c = Requirements::new();
        c.add(&Requirement::is_in("zone", ["c"])).unwrap();
        assert!(!a.compatible(&c));
    }

    #[test]
    fn test_strict_compatibility_against_node_labels() {
        let labels: BTreeMap<String, String> =
            [("zone".to_string(), "a".to_string())].into_iter().collect();
        let node = Requirements::from_labels(&labels);

        let mut wants_arch = Requirements::new();
        wants_arch.add(&Requirement::is_in("arch", ["amd64"])).unwrap();
        // The node has no arch label: loose compat passes, strict fails
        assert!(node.compatible(&wants_arch));
        assert!(!node.strictly_compatible(&wants_arch));

        let mut not_in = Requirements::new();
        not_in.add(&Requirement::not_in("arch", ["arm64"])).unwrap();
        // NotIn tolerates absent keys
        assert!(node.strictly_compatible(&not_in));
    }

    #[test]
    fn test_intersects_membership() {
        let mut reqs = Requirements::new();
        reqs.add(&Requirement::not_in("zone", ["b"])).unwrap();
        assert!(reqs.intersects("zone", "a"));
        assert!(!reqs.intersects("zone", "b"));
        assert!(reqs.intersects("unconstrained-key", "anything"));
    }

    #[test]
    fn test_labels_from_single_valued_keys() {
        let mut reqs = Requirements::new();
        reqs.add(&Requirement::is_in("zone", ["a"])).unwrap();
        reqs.add(&Requirement::is_in("arch", ["amd64", "arm64"])).unwrap();
        let labels = reqs.labels();
        assert_eq!(labels.get("zone").map(|s| s.as_str()), Some("a"));
        assert!(!labels.contains_key("arch"));
    }

    #[test]
    fn test_restricted_labels() {
        let policy = RestrictedLabelPolicy::new(vec!["allowed.kubernetes.io".to_string()]);

        let mut reserved = Requirements::new();
        reserved
            .add(&Requirement::is_in("node.kubernetes.io/secret", ["x"]))
            .unwrap();
        assert!(policy.validate(&reserved).is_err());

        let mut well_known = Requirements::new();
        well_known
            .add(&Requirement::is_in(ARCH_LABEL, ["amd64"]))
            .unwrap();
        assert!(policy.validate(&well_known).is_ok());

        let mut allowed = Requirements::new();
        allowed
            .add(&Requirement::is_in("allowed.kubernetes.io/team", ["a"]))
            .unwrap();
        assert!(policy.validate(&allowed).is_ok());

        let mut plain = Requirements::new();
        plain.add(&Requirement::is_in("app", ["web"])).unwrap();
        assert!(policy.validate(&plain).is_ok());
    }
}
