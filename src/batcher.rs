// Flotilla pod batcher - widens one unschedulable pod into a batching
// window so a pass sees workload bursts whole

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::api::Pod;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BatcherConfig {
    /// Quiet period that closes a window early
    pub idle_duration: Duration,
    /// Hard cap on a window
    pub max_duration: Duration,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            idle_duration: Duration::from_secs(1),
            max_duration: Duration::from_secs(10),
        }
    }
}

/// Collects pending pods into batches. The window opens with the first pod
/// and closes after `idle_duration` of silence or `max_duration` overall,
/// whichever comes first.
pub struct PodBatcher {
    rx: mpsc::UnboundedReceiver<Arc<Pod>>,
    config: BatcherConfig,
}

impl PodBatcher {
    pub fn new(config: BatcherConfig) -> (mpsc::UnboundedSender<Arc<Pod>>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx, config })
    }

    /// The next batch of distinct pods (latest observation per uid), or an
    /// empty batch when cancelled or the feed closed.
    pub async fn next_batch(&mut self, cancel: &CancellationToken) -> Vec<Arc<Pod>> {
        let first = tokio::select! {
            _ = cancel.cancelled() => return Vec::new(),
            pod = self.rx.recv() => match pod {
                Some(pod) => pod,
                None => return Vec::new(),
            },
        };

        let mut batch: HashMap<String, Arc<Pod>> = HashMap::new();
        batch.insert(first.uid().to_string(), first);

        let window_deadline = Instant::now() + self.config.max_duration;
        let mut idle_deadline = Instant::now() + self.config.idle_duration;
        loop {
            let deadline = idle_deadline.min(window_deadline);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep_until(deadline) => break,
                pod = self.rx.recv() => match pod {
                    Some(pod) => {
                        batch.insert(pod.uid().to_string(), pod);
                        idle_deadline = Instant::now() + self.config.idle_duration;
                    }
                    None => break,
                },
            }
        }

        let mut out: Vec<Arc<Pod>> = batch.into_values().collect();
        out.sort_by(|a, b| a.meta.uid.cmp(&b.meta.uid));
        trace!(pods = out.len(), "batch window closed");
        out
    }
}
