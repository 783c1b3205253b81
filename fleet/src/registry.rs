//! The backend registry: the union of statically configured clouddrivers
//! and those announced by the controller feed.

use crate::backend::{Backend, BackendRef, BackendSource};
use crate::config::ClouddriverConfig;
use crate::discovery::{Operation, ServiceUpdate};
use crate::health::{HealthCheck, HealthSupervisor};
use async_trait::async_trait;
use http::HeaderMap;
use parking_lot::Mutex;
use shared::client::BackendClient;
use shared::http::combine_url;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

const INITIAL_SYNC_MESSAGE: &str = "initial sync not yet performed";

type Backends = Arc<Mutex<HashMap<String, Backend>>>;

/// Holds the current backend set keyed by identity. Readers see either the
/// pre-update or post-update set, never a torn view; the lock is held only
/// across map access.
pub struct Registry {
    backends: Backends,
    spinnaker_user: String,
    health: Arc<HealthSupervisor>,
    client: BackendClient,
}

impl Registry {
    pub fn new(
        configs: Vec<ClouddriverConfig>,
        spinnaker_user: String,
        health: Arc<HealthSupervisor>,
        client: BackendClient,
    ) -> Arc<Self> {
        let mut backends = HashMap::new();
        for (idx, config) in configs.into_iter().enumerate() {
            let backend = make_configured(idx, config);
            backends.insert(backend.key(), backend);
        }

        let registry = Arc::new(Self {
            backends: Arc::new(Mutex::new(backends)),
            spinnaker_user,
            health,
            client,
        });

        let keys: Vec<String> = registry.backends.lock().keys().cloned().collect();
        for key in keys {
            registry.register_check(&key);
        }

        registry
    }

    pub fn spinnaker_user(&self) -> &str {
        &self.spinnaker_user
    }

    /// Every current backend as a routing ref. When `artifact_endpoints` is
    /// set, backends excluded from artifact routing are skipped.
    pub fn refs(&self, artifact_endpoints: bool) -> Vec<BackendRef> {
        self.backends
            .lock()
            .values()
            .filter(|b| !(artifact_endpoints && b.disable_artifact_accounts))
            .map(Backend::backend_ref)
            .collect()
    }

    /// Applies one discovery event. Updates replace the entry (keeping the
    /// last successful contact time); deletes drop it together with its
    /// health check.
    pub fn apply(&self, update: ServiceUpdate) {
        let key = format!("discovered:{}:{}", update.agent_name, update.name);
        match update.operation {
            Operation::Delete => {
                self.backends.lock().remove(&key);
                self.health.remove_check(&check_name(&key));
            }
            Operation::Update => {
                let mut backend = make_discovered(update);
                {
                    let mut backends = self.backends.lock();
                    if let Some(old) = backends.get(&key) {
                        backend.last_successful_contact = old.last_successful_contact;
                    }
                    backends.insert(key.clone(), backend);
                }
                self.register_check(&key);
            }
        }
    }

    /// Records the outcome of a credentials fetch against every backend at
    /// `url`. A success clears the sync error and counts as contact.
    pub fn record_sync(&self, url: &str, artifact: bool, outcome: Result<(), String>) {
        let mut backends = self.backends.lock();
        for backend in backends.values_mut().filter(|b| b.url == url) {
            let slot = if artifact {
                &mut backend.artifact_sync
            } else {
                &mut backend.account_sync
            };
            match &outcome {
                Ok(()) => {
                    *slot = None;
                    backend.last_successful_contact = Some(SystemTime::now());
                }
                Err(reason) => *slot = Some(reason.clone()),
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn get(&self, key: &str) -> Option<Backend> {
        self.backends.lock().get(key).cloned()
    }

    fn register_check(&self, key: &str) {
        self.health.add_check(
            &check_name(key),
            true,
            Arc::new(BackendCheck {
                backends: self.backends.clone(),
                key: key.to_string(),
                client: self.client.clone(),
            }),
        );
    }
}

fn check_name(key: &str) -> String {
    format!("clouddriver {key}")
}

fn make_configured(idx: usize, config: ClouddriverConfig) -> Backend {
    let name = if config.name.is_empty() {
        format!("clouddriver[{idx}]")
    } else {
        config.name
    };
    let healthcheck_url = if config.healthcheck_url.is_empty() {
        combine_url(&config.url, "/health")
    } else {
        config.healthcheck_url
    };
    let artifact_sync = if config.disable_artifact_accounts {
        None
    } else {
        Some(INITIAL_SYNC_MESSAGE.to_string())
    };

    Backend {
        name,
        url: config.url,
        healthcheck_url,
        ui_url: config.ui_url,
        priority: config.priority,
        disable_artifact_accounts: config.disable_artifact_accounts,
        token: None,
        source: BackendSource::Config,
        last_successful_contact: None,
        account_sync: Some(INITIAL_SYNC_MESSAGE.to_string()),
        artifact_sync,
    }
}

fn make_discovered(update: ServiceUpdate) -> Backend {
    let ui_url = update.annotations.get("uiUrl").cloned().unwrap_or_default();
    let disable_artifact_accounts = update
        .annotations
        .get("disableArtifactAccounts")
        .is_some_and(|v| yesno(v));
    let priority = match update.annotations.get("priority") {
        None => 0,
        Some(raw) if raw.is_empty() => 0,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(
                name = %update.name,
                priority = %raw,
                "Bad priority annotation from controller, using 0"
            );
            0
        }),
    };
    let artifact_sync = if disable_artifact_accounts {
        None
    } else {
        Some(INITIAL_SYNC_MESSAGE.to_string())
    };

    Backend {
        name: update.name,
        healthcheck_url: combine_url(&update.url, "/health"),
        url: update.url,
        ui_url,
        priority,
        disable_artifact_accounts,
        token: update.token,
        source: BackendSource::Discovered {
            agent_name: update.agent_name,
        },
        last_successful_contact: None,
        account_sync: Some(INITIAL_SYNC_MESSAGE.to_string()),
        artifact_sync,
    }
}

fn yesno(s: &str) -> bool {
    let s = s.to_lowercase();
    s == "true" || s == "yes"
}

/// Probes one backend's healthcheck URL. Any 2xx or 3xx is a live backend;
/// a live backend still reports its pending sync error, if any.
struct BackendCheck {
    backends: Backends,
    key: String,
    client: BackendClient,
}

#[async_trait]
impl HealthCheck for BackendCheck {
    async fn check(&self) -> Result<(), String> {
        let (url, token) = {
            let backends = self.backends.lock();
            // Removed while the check was queued; the check itself is about
            // to converge away.
            let Some(backend) = backends.get(&self.key) else {
                return Ok(());
            };
            (backend.healthcheck_url.clone(), backend.token.clone())
        };

        let response = self
            .client
            .get(&url, token.as_deref(), &HeaderMap::new())
            .await
            .map_err(|e| e.to_string())?;

        if !(response.status.is_success() || response.status.is_redirection()) {
            return Err(format!(
                "HTTP status code {} returned",
                response.status.as_u16()
            ));
        }

        let mut backends = self.backends.lock();
        let Some(backend) = backends.get_mut(&self.key) else {
            return Ok(());
        };
        backend.last_successful_contact = Some(SystemTime::now());
        backend.sync_error().map_or(Ok(()), Err)
    }
}
