//! Dependency health monitor: tracks whether the server's backing store is
//! reachable, as reported by `GET /health`.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::metrics;
use crate::rest::RestClient;

#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// True when the backing store is reachable. Request failures count as
    /// unreachable.
    async fn probe(&self) -> bool;
}

pub struct HttpHealthProbe {
    client: RestClient,
}

impl HttpHealthProbe {
    pub fn new(client: RestClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self) -> bool {
        match self.client.health().await {
            Ok(report) => report.database_connected,
            Err(err) => {
                debug!(target = "taskchat::health", error = %err, "health probe failed");
                false
            }
        }
    }
}

/// Probe whose answer is flipped by hand; used by tests and offline runs.
#[derive(Debug, Clone)]
pub struct ToggleProbe {
    reachable: Arc<AtomicBool>,
}

impl ToggleProbe {
    pub fn new(reachable: bool) -> Self {
        Self {
            reachable: Arc::new(AtomicBool::new(reachable)),
        }
    }

    pub fn set(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }
}

#[async_trait]
impl HealthProbe for ToggleProbe {
    async fn probe(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    Unchanged,
    Recovered,
    Lost,
}

#[derive(Debug)]
pub struct HealthMonitor {
    reachable: bool,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        metrics::BACKING_STORE_REACHABLE.set(1);
        Self { reachable: true }
    }
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reachable(&self) -> bool {
        self.reachable
    }

    pub fn observe(&mut self, reachable: bool) -> HealthTransition {
        if reachable == self.reachable {
            return HealthTransition::Unchanged;
        }
        self.reachable = reachable;
        metrics::BACKING_STORE_REACHABLE.set(reachable as i64);
        if reachable {
            info!(target = "taskchat::health", "backing store reachable again");
            HealthTransition::Recovered
        } else {
            warn!(target = "taskchat::health", "backing store unreachable; degrading");
            HealthTransition::Lost
        }
    }
}
