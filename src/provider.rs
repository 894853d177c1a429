// Flotilla cloud provider seam - the thin interface the core drives to
// turn node claims into machines, plus the launcher that retries capacity
// failures against the next-cheapest option

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::api::{NodeClaim, NodeClaimPhase, NodePool};
use crate::instance_types::InstanceType;

#[derive(Debug, Error)]
pub enum ProviderError {
    /// The offering could not be fulfilled right now; other options remain
    /// worth trying
    #[error("insufficient capacity for {instance_type} in {zone}")]
    InsufficientCapacity { instance_type: String, zone: String },
    /// The claim itself is unlaunchable; retrying cannot help
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("no instance type options remain for claim {0}")]
    OptionsExhausted(String),
    #[error("provider failure: {0}")]
    Other(String),
}

impl ProviderError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, ProviderError::InsufficientCapacity { .. })
    }
}

/// What the provider resolved a claim into
#[derive(Clone, Debug, PartialEq)]
pub struct CreatedMachine {
    pub provider_id: String,
    pub node_name: String,
    pub instance_type: String,
    pub zone: String,
    pub capacity_type: String,
}

/// A machine observed by reconciliation listing
#[derive(Clone, Debug)]
pub struct Machine {
    pub provider_id: String,
    pub instance_type: String,
}

/// The cloud driver consumed by the core. Implementations live outside this
/// crate; `delete` must be idempotent.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    async fn get_instance_types(
        &self,
        pool: &NodePool,
    ) -> Result<Vec<Arc<InstanceType>>, ProviderError>;

    async fn create(&self, claim: &NodeClaim) -> Result<CreatedMachine, ProviderError>;

    async fn delete(&self, provider_id: &str) -> Result<(), ProviderError>;

    async fn list(&self) -> Result<Vec<Machine>, ProviderError>;
}

#[derive(Default)]
pub struct LaunchMetrics {
    pub launches: AtomicU64,
    pub capacity_retries: AtomicU64,
    pub failures: AtomicU64,
}

/// Drives `create` for a claim, walking options from cheapest to most
/// expensive: an insufficient-capacity failure prunes the failed type from
/// the claim and tries the next one.
pub struct Launcher {
    provider: Arc<dyn CloudProvider>,
    metrics: Arc<LaunchMetrics>,
}

impl Launcher {
    pub fn new(provider: Arc<dyn CloudProvider>) -> Self {
        Self {
            provider,
            metrics: Arc::new(LaunchMetrics::default()),
        }
    }

    pub fn metrics(&self) -> Arc<LaunchMetrics> {
        self.metrics.clone()
    }

    pub async fn launch(&self, claim: &mut NodeClaim) -> Result<CreatedMachine, ProviderError> {
        // Cheapest first; options without a satisfying offering go last
        let requirements = claim.requirements.clone();
        claim.instance_type_options.sort_by(|a, b| {
            let pa = a.price_for(&requirements).unwrap_or(f64::INFINITY);
            let pb = b.price_for(&requirements).unwrap_or(f64::INFINITY);
            pa.total_cmp(&pb).then_with(|| a.name.cmp(&b.name))
        });

        while !claim.instance_type_options.is_empty() {
            match self.provider.create(claim).await {
                Ok(machine) => {
                    claim.provider_id = Some(machine.provider_id.clone());
                    claim.node_name = Some(machine.node_name.clone());
                    // The machine's identity is settled now; the surviving
                    // option is what actually launched
                    claim
                        .instance_type_options
                        .retain(|it| it.name == machine.instance_type);
                    claim.advance(NodeClaimPhase::Launched);
                    self.metrics.launches.fetch_add(1, Ordering::SeqCst);
                    return Ok(machine);
                }
                Err(err) if err.is_retriable() => {
                    self.metrics.capacity_retries.fetch_add(1, Ordering::SeqCst);
                    if let ProviderError::InsufficientCapacity { instance_type, zone } = &err {
                        debug!(%instance_type, %zone, "capacity miss, pruning option");
                        claim
                            .instance_type_options
                            .retain(|it| it.name != *instance_type);
                    }
                }
                Err(err) => {
                    self.metrics.failures.fetch_add(1, Ordering::SeqCst);
                    warn!(claim = %claim.meta.name, %err, "launch failed");
                    claim.advance(NodeClaimPhase::Terminating);
                    return Err(err);
                }
            }
        }
        self.metrics.failures.fetch_add(1, Ordering::SeqCst);
        claim.advance(NodeClaimPhase::Terminating);
        Err(ProviderError::OptionsExhausted(claim.meta.name.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ObjectMeta;
    use crate::instance_types::{Offering, Offerings};
    use crate::requirements::Requirements;
    use crate::resources::{Resources, CPU};
    use std::collections::HashSet;
    use std::sync::Mutex;

    fn instance(name: &str, price: f64) -> Arc<InstanceType> {
        Arc::new(InstanceType {
            name: name.to_string(),
            capacity: Resources::new().with(CPU, 2000),
            overhead: Resources::new(),
            requirements: Requirements::new(),
            offerings: Offerings(vec![Offering {
                zone: "zone-1".to_string(),
                capacity_type: "on-demand".to_string(),
                price,
                available: true,
            }]),
        })
    }

    fn claim(options: Vec<Arc<InstanceType>>) -> NodeClaim {
        NodeClaim {
            meta: ObjectMeta::named("c"),
            pool: "default".to_string(),
            requirements: Requirements::new(),
            instance_type_options: options,
            resource_requests: Resources::new(),
            taints: Vec::new(),
            startup_taints: Vec::new(),
            phase: NodeClaimPhase::Pending,
            provider_id: None,
            node_name: None,
        }
    }

    /// Provider whose named instance types are out of capacity
    struct FlakyProvider {
        exhausted: HashSet<String>,
        attempts: Mutex<Vec<String>>,
        fatal: bool,
    }

    #[async_trait]
    impl CloudProvider for FlakyProvider {
        async fn get_instance_types(
            &self,
            _pool: &NodePool,
        ) -> Result<Vec<Arc<InstanceType>>, ProviderError> {
            Ok(Vec::new())
        }

        async fn create(&self, claim: &NodeClaim) -> Result<CreatedMachine, ProviderError> {
            if self.fatal {
                return Err(ProviderError::InvalidConfig("bad launch template".into()));
            }
            let choice = claim.instance_type_options[0].name.clone();
            self.attempts.lock().unwrap().push(choice.clone());
            if self.exhausted.contains(&choice) {
                return Err(ProviderError::InsufficientCapacity {
                    instance_type: choice,
                    zone: "zone-1".to_string(),
                });
            }
            Ok(CreatedMachine {
                provider_id: format!("provider://{}", choice),
                node_name: "node-1".to_string(),
                instance_type: choice,
                zone: "zone-1".to_string(),
                capacity_type: "on-demand".to_string(),
            })
        }

        async fn delete(&self, _provider_id: &str) -> Result<(), ProviderError> {
            Ok(())
        }

        async fn list(&self) -> Result<Vec<Machine>, ProviderError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_launch_retries_next_cheapest() {
        let provider = Arc::new(FlakyProvider {
            exhausted: ["cheap".to_string()].into_iter().collect(),
            attempts: Mutex::new(Vec::new()),
            fatal: false,
        });
        let launcher = Launcher::new(provider.clone());
        let mut c = claim(vec![instance("pricey", 3.0), instance("cheap", 1.0)]);

        let machine = launcher.launch(&mut c).await.unwrap();
        assert_eq!(machine.instance_type, "pricey");
        assert_eq!(c.phase, NodeClaimPhase::Launched);
        assert_eq!(c.provider_id.as_deref(), Some("provider://pricey"));
        // Cheapest tried first, then pruned
        let attempts = provider.attempts.lock().unwrap().clone();
        assert_eq!(attempts, vec!["cheap", "pricey"]);
        assert_eq!(
            launcher.metrics().capacity_retries.load(Ordering::SeqCst),
            1
        );
    }

    #[tokio::test]
    async fn test_launch_exhausts_options() {
        let provider = Arc::new(FlakyProvider {
            exhausted: ["a".to_string(), "b".to_string()].into_iter().collect(),
            attempts: Mutex::new(Vec::new()),
            fatal: false,
        });
        let launcher = Launcher::new(provider);
        let mut c = claim(vec![instance("a", 1.0), instance("b", 2.0)]);

        let err = launcher.launch(&mut c).await.unwrap_err();
        assert!(matches!(err, ProviderError::OptionsExhausted(_)));
        assert_eq!(c.phase, NodeClaimPhase::Terminating);
    }

    #[tokio::test]
    async fn test_invalid_config_is_fatal() {
        let provider = Arc::new(FlakyProvider {
            exhausted: HashSet::new(),
            attempts: Mutex::new(Vec::new()),
            fatal: true,
        });
        let launcher = Launcher::new(provider);
        let mut c = claim(vec![instance("a", 1.0)]);

        let err = launcher.launch(&mut c).await.unwrap_err();
        assert!(!err.is_retriable());
        assert!(matches!(err, ProviderError::InvalidConfig(_)));
        // Only one attempt: no retry against other options
        assert_eq!(c.instance_type_options.len(), 1);
    }
}
