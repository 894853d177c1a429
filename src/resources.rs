// Flotilla resource vectors - named quantities for scheduling arithmetic
// CPU is tracked in millicores, memory and storage in bytes, pods as a count

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Well-known resource names
pub const CPU: &str = "cpu";
pub const MEMORY: &str = "memory";
pub const PODS: &str = "pods";
pub const EPHEMERAL_STORAGE: &str = "ephemeral-storage";

/// A vector of named resource quantities.
///
/// Quantities are signed so that intermediate arithmetic can go negative;
/// `fits` and `allocatable` style consumers clamp at the edges.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    quantities: BTreeMap<String, i64>,
}

impl Resources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style helper for fixtures and catalog construction
    pub fn with(mut self, name: &str, quantity: i64) -> Self {
        self.quantities.insert(name.to_string(), quantity);
        self
    }

    /// Quantity for a resource name, zero when absent
    pub fn get(&self, name: &str) -> i64 {
        self.quantities.get(name).copied().unwrap_or(0)
    }

    pub fn set(&mut self, name: &str, quantity: i64) {
        self.quantities.insert(name.to_string(), quantity);
    }

    pub fn cpu(&self) -> i64 {
        self.get(CPU)
    }

    pub fn memory(&self) -> i64 {
        self.get(MEMORY)
    }

    pub fn pods(&self) -> i64 {
        self.get(PODS)
    }

    /// True when every quantity is zero
    pub fn is_empty(&self) -> bool {
        self.quantities.values().all(|q| *q == 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.quantities.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Component-wise addition
    pub fn add(&mut self, other: &Resources) {
        for (name, quantity) in &other.quantities {
            *self.quantities.entry(name.clone()).or_insert(0) += quantity;
        }
    }

    pub fn sum(&self, other: &Resources) -> Resources {
        let mut out = self.clone();
        out.add(other);
        out
    }

    /// Component-wise subtraction, clamped at zero
    pub fn saturating_sub(&self, other: &Resources) -> Resources {
        let mut out = self.clone();
        for (name, quantity) in &other.quantities {
            let entry = out.quantities.entry(name.clone()).or_insert(0);
            *entry = (*entry - quantity).max(0);
        }
        out
    }

    /// Component-wise maximum, used for init-container request folding
    pub fn max(&self, other: &Resources) -> Resources {
        let mut out = self.clone();
        for (name, quantity) in &other.quantities {
            let entry = out.quantities.entry(name.clone()).or_insert(0);
            *entry = (*entry).max(*quantity);
        }
        out
    }

    /// True when these requests fit within `available` on every dimension.
    ///
    /// A zero (or negative) request always fits, even for resource names the
    /// available side has never heard of. This is what makes a pod requesting
    /// `example.com/gpu: 0` schedulable on instance types without GPUs.
    pub fn fits(&self, available: &Resources) -> bool {
        self.quantities
            .iter()
            .all(|(name, quantity)| *quantity <= 0 || *quantity <= available.get(name))
    }

    /// Names of resources with a positive quantity
    pub fn positive_names(&self) -> impl Iterator<Item = &str> {
        self.quantities
            .iter()
            .filter(|(_, q)| **q > 0)
            .map(|(k, _)| k.as_str())
    }
}

/// Component-wise minimum across a set of vectors, the conservative estimate
/// used for in-flight nodes whose final instance type is not yet known.
///
/// Only resource names present in every vector survive; a name missing from
/// any one vector has an effective minimum of zero.
pub fn component_min<'a>(mut vectors: impl Iterator<Item = &'a Resources>) -> Resources {
    let mut out = match vectors.next() {
        Some(first) => first.clone(),
        None => return Resources::new(),
    };
    for v in vectors {
        let names: Vec<String> = out.quantities.keys().cloned().collect();
        for name in names {
            let m = out.get(&name).min(v.get(&name));
            out.set(&name, m);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fits_zero_quantity_extended_resource() {
        let requests = Resources::new()
            .with(CPU, 500)
            .with("example.com/gpu", 0);
        let available = Resources::new().with(CPU, 1000).with(MEMORY, 1 << 30);

        // The node offers no GPUs at all, but a zero request still fits.
        assert!(requests.fits(&available));

        let wants_gpu = Resources::new().with("example.com/gpu", 1);
        assert!(!wants_gpu.fits(&available));
    }

    #[test]
    fn test_saturating_sub_clamps() {
        let a = Resources::new().with(CPU, 100);
        let b = Resources::new().with(CPU, 250).with(MEMORY, 10);
        let out = a.saturating_sub(&b);
        assert_eq!(out.cpu(), 0);
        assert_eq!(out.memory(), 0);
    }

    #[test]
    fn test_component_min() {
        let a = Resources::new().with(CPU, 4000).with(MEMORY, 8).with(PODS, 110);
        let b = Resources::new().with(CPU, 2000).with(MEMORY, 16);
        let m = component_min([a, b].iter());
        assert_eq!(m.cpu(), 2000);
        assert_eq!(m.memory(), 8);
        // `pods` missing from one vector, so its minimum is zero
        assert_eq!(m.pods(), 0);
    }

    #[test]
    fn test_max_folds_init_containers() {
        let app = Resources::new().with(CPU, 300).with(MEMORY, 200);
        let init = Resources::new().with(CPU, 1000);
        let folded = app.max(&init);
        assert_eq!(folded.cpu(), 1000);
        assert_eq!(folded.memory(), 200);
    }
}
