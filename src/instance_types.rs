// Flotilla instance-type catalog - typed machine families and their
// purchasable offerings, with the price and resource filters used by
// provisioning and consolidation

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::requirements::{Requirements, CAPACITY_TYPE_LABEL, ZONE_LABEL};
use crate::resources::Resources;

/// A purchasable (zone, capacity-type, price, availability) tuple
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Offering {
    pub zone: String,
    pub capacity_type: String,
    pub price: f64,
    pub available: bool,
}

impl Offering {
    /// True when this offering satisfies the zone and capacity-type subsets
    /// accumulated on a claim
    pub fn satisfies(&self, requirements: &Requirements) -> bool {
        requirements.intersects(ZONE_LABEL, &self.zone)
            && requirements.intersects(CAPACITY_TYPE_LABEL, &self.capacity_type)
    }
}

/// Ordered list of offerings for one instance type
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Offerings(pub Vec<Offering>);

impl Offerings {
    pub fn get(&self, capacity_type: &str, zone: &str) -> Option<&Offering> {
        self.0
            .iter()
            .find(|o| o.capacity_type == capacity_type && o.zone == zone)
    }

    pub fn available(&self) -> impl Iterator<Item = &Offering> {
        self.0.iter().filter(|o| o.available)
    }

    /// Cheapest available offering satisfying the requirements
    pub fn cheapest_satisfying(&self, requirements: &Requirements) -> Option<&Offering> {
        self.available()
            .filter(|o| o.satisfies(requirements))
            .min_by(|a, b| a.price.total_cmp(&b.price))
    }
}

/// An instance family the cloud provider can launch. Immutable after load
/// and shared by reference throughout a pass.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstanceType {
    pub name: String,
    /// Raw machine capacity
    pub capacity: Resources,
    /// System-reserved plus kubelet overhead, subtracted from capacity
    pub overhead: Resources,
    /// Labels this machine will carry, as requirements (architecture, OS,
    /// instance-type, arbitrary extended labels)
    pub requirements: Requirements,
    pub offerings: Offerings,
}

impl InstanceType {
    /// Capacity remaining for workloads after overhead
    pub fn allocatable(&self) -> Resources {
        self.capacity.saturating_sub(&self.overhead)
    }

    /// Price of the cheapest offering satisfying the requirements
    pub fn price_for(&self, requirements: &Requirements) -> Option<f64> {
        self.offerings
            .cheapest_satisfying(requirements)
            .map(|o| o.price)
    }

    /// An instance type is kept iff its own requirements intersect the
    /// claim's on every key and at least one available offering satisfies
    /// the zone and capacity-type subsets.
    pub fn compatible(&self, requirements: &Requirements) -> bool {
        self.requirements.compatible(requirements)
            && self.offerings.cheapest_satisfying(requirements).is_some()
    }
}

/// Retain only options compatible with the requirements
pub fn filter_compatible(
    options: &[Arc<InstanceType>],
    requirements: &Requirements,
) -> Vec<Arc<InstanceType>> {
    options
        .iter()
        .filter(|it| it.compatible(requirements))
        .cloned()
        .collect()
}

/// Retain only options whose minimum satisfying offering is strictly
/// cheaper than `max_price`
pub fn filter_by_price(
    options: &[Arc<InstanceType>],
    requirements: &Requirements,
    max_price: f64,
) -> Vec<Arc<InstanceType>> {
    options
        .iter()
        .filter(|it| match it.price_for(requirements) {
            Some(price) => price < max_price,
            None => false,
        })
        .cloned()
        .collect()
}

/// Retain only options whose allocatable covers the requests on every
/// dimension
pub fn filter_by_resources(
    options: &[Arc<InstanceType>],
    requests: &Resources,
) -> Vec<Arc<InstanceType>> {
    options
        .iter()
        .filter(|it| requests.fits(&it.allocatable()))
        .cloned()
        .collect()
}

/// Cheapest price across a set of options for the given requirements
pub fn cheapest_price(options: &[Arc<InstanceType>], requirements: &Requirements) -> Option<f64> {
    options
        .iter()
        .filter_map(|it| it.price_for(requirements))
        .min_by(|a, b| a.total_cmp(b))
}

/// Per-pool instance-type cache. Refreshed periodically from the cloud
/// provider; readers get a reference-stable snapshot that stays valid for
/// the whole pass even if a refresh lands mid-way.
#[derive(Default)]
pub struct Catalog {
    by_pool: RwLock<HashMap<String, Arc<Vec<Arc<InstanceType>>>>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Swap in a freshly fetched instance-type list for a pool
    pub fn update(&self, pool: &str, types: Vec<Arc<InstanceType>>) {
        let mut by_pool = self.by_pool.write().unwrap();
        by_pool.insert(pool.to_string(), Arc::new(types));
    }

    pub fn remove(&self, pool: &str) {
        let mut by_pool = self.by_pool.write().unwrap();
        by_pool.remove(pool);
    }

    pub fn get(&self, pool: &str) -> Option<Arc<Vec<Arc<InstanceType>>>> {
        let by_pool = self.by_pool.read().unwrap();
        by_pool.get(pool).cloned()
    }

    /// Look up one instance type by name across all pools
    pub fn find(&self, name: &str) -> Option<Arc<InstanceType>> {
        let by_pool = self.by_pool.read().unwrap();
        for types in by_pool.values() {
            if let Some(it) = types.iter().find(|it| it.name == name) {
                return Some(it.clone());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requirements::{Requirement, INSTANCE_TYPE_LABEL};
    use crate::resources::{CPU, MEMORY, PODS};

    fn instance(name: &str, cpu: i64, price: f64) -> Arc<InstanceType> {
        let mut requirements = Requirements::new();
        requirements
            .add(&Requirement::is_in(INSTANCE_TYPE_LABEL, [name]))
            .unwrap();
        requirements
            .add(&Requirement::is_in("kubernetes.io/arch", ["amd64"]))
            .unwrap();
        Arc::new(InstanceType {
            name: name.to_string(),
            capacity: Resources::new()
                .with(CPU, cpu)
                .with(MEMORY, 8 << 30)
                .with(PODS, 110),
            overhead: Resources::new().with(CPU, 100).with(MEMORY, 500 << 20),
            requirements,
            offerings: Offerings(vec![
                Offering {
                    zone: "zone-1".to_string(),
                    capacity_type: "on-demand".to_string(),
                    price,
                    available: true,
                },
                Offering {
                    zone: "zone-2".to_string(),
                    capacity_type: "spot".to_string(),
                    price: price / 3.0,
                    available: false,
                },
            ]),
        })
    }

    #[test]
    fn test_offering_lookup() {
        let it = instance("m5.large", 2000, 0.096);
        assert!(it.offerings.get("on-demand", "zone-1").is_some());
        assert!(it.offerings.get("on-demand", "zone-3").is_none());
    }

    #[test]
    fn test_price_ignores_unavailable_offerings() {
        let it = instance("m5.large", 2000, 0.096);
        // The spot offering is cheaper but unavailable
        let price = it.price_for(&Requirements::new()).unwrap();
        assert_eq!(price, 0.096);
    }

    #[test]
    fn test_compatible_requires_offering_match() {
        let it = instance("m5.large", 2000, 0.096);
        let mut wants_zone_3 = Requirements::new();
        wants_zone_3
            .add(&Requirement::is_in(ZONE_LABEL, ["zone-3"]))
            .unwrap();
        assert!(!it.compatible(&wants_zone_3));

        let mut wants_zone_1 = Requirements::new();
        wants_zone_1
            .add(&Requirement::is_in(ZONE_LABEL, ["zone-1"]))
            .unwrap();
        assert!(it.compatible(&wants_zone_1));
    }

    #[test]
    fn test_filter_by_price_is_strict() {
        let options = vec![
            instance("small", 1000, 2.0),
            instance("medium", 2000, 3.0),
            instance("large", 4000, 1.0),
        ];
        let reqs = Requirements::new();
        let kept = filter_by_price(&options, &reqs, 2.0);
        let names: Vec<_> = kept.iter().map(|it| it.name.as_str()).collect();
        // Strictly-less-than: the $2 option itself is dropped
        assert_eq!(names, vec!["large"]);
    }

    #[test]
    fn test_filter_by_resources_uses_allocatable() {
        let options = vec![instance("small", 1000, 2.0), instance("large", 4000, 1.0)];
        // 1000m capacity minus 100m overhead cannot host a 950m request
        let kept = filter_by_resources(&options, &Resources::new().with(CPU, 950));
        let names: Vec<_> = kept.iter().map(|it| it.name.as_str()).collect();
        assert_eq!(names, vec!["large"]);
    }

    #[test]
    fn test_catalog_snapshot_swap() {
        let catalog = Catalog::new();
        catalog.update("default", vec![instance("small", 1000, 2.0)]);
        let snapshot = catalog.get("default").unwrap();
        catalog.update("default", vec![instance("large", 4000, 1.0)]);
        // The earlier snapshot still reads the old generation
        assert_eq!(snapshot[0].name, "small");
        assert_eq!(catalog.get("default").unwrap()[0].name, "large");
    }
}
