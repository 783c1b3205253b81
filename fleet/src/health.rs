//! Health supervision for the aggregator.
//!
//! The supervisor keeps an ordered list of named checks and runs exactly
//! one per tick, round-robin, spreading a full pass over the configured
//! period. Observe-only checks are reported but cannot flip the aggregate
//! readiness signal; a partial backend outage therefore never marks the
//! aggregator itself unready.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A single health probe. Runs periodically from the supervisor task, so
/// implementations must do their own locking around shared state.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Returns the failure reason when unhealthy.
    async fn check(&self) -> Result<(), String>;
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckState {
    pub service: String,
    pub healthy: bool,
    pub message: String,
    pub observe_only: bool,
    pub last_checked: u64,
}

/// The document served by the health endpoint.
#[derive(Debug, Serialize)]
pub struct HealthDocument {
    pub healthy: bool,
    pub checks: Vec<CheckState>,
}

struct CheckEntry {
    state: CheckState,
    checker: Arc<dyn HealthCheck>,
}

struct SupervisorState {
    healthy: bool,
    next_index: usize,
    checks: Vec<CheckEntry>,
}

pub struct HealthSupervisor {
    inner: Mutex<SupervisorState>,
    frequency: Duration,
}

impl HealthSupervisor {
    /// `frequency_seconds` is the period over which every registered check
    /// runs once; the per-tick sleep is recomputed as the list changes.
    pub fn new(frequency_seconds: u64) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(SupervisorState {
                healthy: true,
                next_index: 0,
                checks: Vec::new(),
            }),
            frequency: Duration::from_secs(frequency_seconds),
        })
    }

    /// Registers a check, replacing any existing check with the same name.
    pub fn add_check(&self, service: &str, observe_only: bool, checker: Arc<dyn HealthCheck>) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.checks.iter_mut().find(|c| c.state.service == service) {
            entry.state.observe_only = observe_only;
            entry.checker = checker;
            return;
        }
        inner.checks.push(CheckEntry {
            state: CheckState {
                service: service.to_string(),
                healthy: true,
                message: String::new(),
                observe_only,
                last_checked: 0,
            },
            checker,
        });
    }

    pub fn remove_check(&self, service: &str) {
        let mut inner = self.inner.lock();
        inner.checks.retain(|c| c.state.service != service);
    }

    pub fn is_healthy(&self) -> bool {
        self.inner.lock().healthy
    }

    pub fn document(&self) -> HealthDocument {
        let inner = self.inner.lock();
        HealthDocument {
            healthy: inner.healthy,
            checks: inner.checks.iter().map(|c| c.state.clone()).collect(),
        }
    }

    /// Runs checks forever. One check per tick; the aggregate is recomputed
    /// after every run as the AND over all non-observe-only checks.
    pub async fn run(self: Arc<Self>) {
        loop {
            let count = {
                let inner = self.inner.lock();
                inner.checks.len().max(1)
            };
            tokio::time::sleep(self.frequency / count as u32).await;

            let Some((service, checker)) = self.next_check() else {
                continue;
            };

            // The check runs without the supervisor lock held.
            let result = checker.check().await;
            self.record_result(&service, result);
        }
    }

    fn next_check(&self) -> Option<(String, Arc<dyn HealthCheck>)> {
        let mut inner = self.inner.lock();
        if inner.checks.is_empty() {
            return None;
        }
        if inner.next_index >= inner.checks.len() {
            inner.next_index = 0;
        }
        let index = inner.next_index;
        inner.next_index += 1;
        let entry = &inner.checks[index];
        Some((entry.state.service.clone(), entry.checker.clone()))
    }

    fn record_result(&self, service: &str, result: Result<(), String>) {
        let mut inner = self.inner.lock();

        // The entry may have been removed while the check ran.
        if let Some(entry) = inner.checks.iter_mut().find(|c| c.state.service == service) {
            match result {
                Ok(()) => {
                    entry.state.healthy = true;
                    entry.state.message = "OK".to_string();
                }
                Err(reason) => {
                    entry.state.healthy = false;
                    entry.state.message = format!("{service} ERROR {reason}");
                }
            }
            entry.state.last_checked = now_millis();
        }

        inner.healthy = inner
            .checks
            .iter()
            .filter(|c| !c.state.observe_only)
            .all(|c| c.state.healthy);
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
