// Flotilla volume accounting - per-CSI-driver attachment counting and
// storage-class resolution

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use thiserror::Error;

use crate::api::{PersistentVolumeClaim, Pod, StorageClass};

/// In-tree provisioner names and the CSI drivers that replaced them
const IN_TREE_MIGRATIONS: &[(&str, &str)] = &[
    ("kubernetes.io/aws-ebs", "ebs.csi.aws.com"),
    ("kubernetes.io/gce-pd", "pd.csi.storage.gke.io"),
    ("kubernetes.io/azure-disk", "disk.csi.azure.com"),
    ("kubernetes.io/cinder", "cinder.csi.openstack.org"),
    ("kubernetes.io/vsphere-volume", "csi.vsphere.vmware.com"),
];

/// Attachment limit assumed for drivers on nodes that have not reported a
/// CSINode object yet (hypothetical nodes in particular)
pub const DEFAULT_DRIVER_LIMIT: i32 = 26;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VolumeError {
    #[error("persistent volume claim {claim:?} not found")]
    ClaimNotFound { claim: String },
    #[error("no default storage class for claim {claim:?}")]
    NoDefaultStorageClass { claim: String },
    #[error("storage class {class:?} not found")]
    StorageClassNotFound { class: String },
}

/// Resolve a provisioner to the driver that counts against CSINode limits
pub fn csi_driver_for(provisioner: &str) -> &str {
    IN_TREE_MIGRATIONS
        .iter()
        .find(|(in_tree, _)| *in_tree == provisioner)
        .map(|(_, csi)| *csi)
        .unwrap_or(provisioner)
}

/// Pick the default storage class: the newest default-annotated class by
/// creation timestamp, tie-broken by lexicographically smallest name.
pub fn default_storage_class(
    classes: &HashMap<String, Arc<StorageClass>>,
) -> Option<Arc<StorageClass>> {
    classes
        .values()
        .filter(|sc| sc.is_default)
        .max_by(|a, b| {
            a.meta
                .creation_timestamp
                .cmp(&b.meta.creation_timestamp)
                // Reversed name ordering so that max_by picks the smaller name
                .then_with(|| b.meta.name.cmp(&a.meta.name))
        })
        .cloned()
}

/// Per-node attached-volume bookkeeping: driver name to the set of claim
/// names counted against it
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VolumeUsage {
    per_driver: BTreeMap<String, BTreeSet<String>>,
}

impl VolumeUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, driver: &str, claim: &str) {
        self.per_driver
            .entry(driver.to_string())
            .or_default()
            .insert(claim.to_string());
    }

    pub fn remove(&mut self, driver: &str, claim: &str) {
        if let Some(set) = self.per_driver.get_mut(driver) {
            set.remove(claim);
            if set.is_empty() {
                self.per_driver.remove(driver);
            }
        }
    }

    pub fn count(&self, driver: &str) -> i32 {
        self.per_driver.get(driver).map_or(0, |s| s.len() as i32)
    }

    /// Whether the additional volumes fit under the per-driver limits.
    /// A volume already counted on this node costs nothing extra.
    pub fn fits(
        &self,
        additions: &[(String, String)],
        limits: &BTreeMap<String, i32>,
    ) -> bool {
        let mut projected: BTreeMap<&str, i32> = BTreeMap::new();
        for (driver, claim) in additions {
            let already = self
                .per_driver
                .get(driver)
                .map_or(false, |s| s.contains(claim));
            if !already {
                *projected.entry(driver.as_str()).or_insert(0) += 1;
            }
        }
        projected.iter().all(|(driver, added)| {
            let limit = limits.get(*driver).copied().unwrap_or(DEFAULT_DRIVER_LIMIT);
            self.count(driver) + added <= limit
        })
    }
}

/// Resolves pod volumes through claims and storage classes to CSI drivers
pub struct VolumeResolver<'a> {
    pub claims: &'a HashMap<String, Arc<PersistentVolumeClaim>>,
    pub storage_classes: &'a HashMap<String, Arc<StorageClass>>,
}

impl<'a> VolumeResolver<'a> {
    /// (driver, claim-name) pairs this pod would attach
    pub fn drivers_for(&self, pod: &Pod) -> Result<Vec<(String, String)>, VolumeError> {
        let mut out = Vec::new();
        for volume in &pod.volumes {
            let claim_name = match &volume.claim_name {
                Some(name) => name,
                None => continue, // ephemeral or projected volume, not counted
            };
            let key = format!("{}/{}", pod.meta.namespace, claim_name);
            let claim = self
                .claims
                .get(&key)
                .ok_or_else(|| VolumeError::ClaimNotFound { claim: key.clone() })?;
            let class = match &claim.storage_class_name {
                Some(name) => self.storage_classes.get(name).cloned().ok_or_else(|| {
                    VolumeError::StorageClassNotFound {
                        class: name.clone(),
                    }
                })?,
                None => default_storage_class(self.storage_classes).ok_or_else(|| {
                    VolumeError::NoDefaultStorageClass { claim: key.clone() }
                })?,
            };
            out.push((csi_driver_for(&class.provisioner).to_string(), key));
        }
        Ok(out)
    }
}
