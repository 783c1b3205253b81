//! Account routing: the `account name → backend` maps and the refresh loop
//! that maintains them.
//!
//! Request handlers read a published snapshot that is swapped atomically at
//! the end of each refresh; readers never block the refresh loop and always
//! observe a self-consistent routing table. Conflicts between backends
//! advertising the same account resolve to the highest priority; on a tie
//! the first one processed stays (processing order is not stable across
//! refreshes).

use crate::backend::{BackendRef, TrackedAccount};
use crate::health::HealthCheck;
use crate::metrics_defs::{ACCOUNT_REFRESH_ACCOUNTS, ACCOUNT_REFRESH_DURATION};
use crate::registry::Registry;
use async_trait::async_trait;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use parking_lot::RwLock;
use shared::client::BackendClient;
use shared::http::combine_url;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::task::JoinSet;
use tokio::time::{Duration, sleep};

pub const CREDENTIALS_UPDATE_FREQUENCY_SECONDS: u64 = 10;

const CREDENTIALS_PATH: &str = "/credentials";
const ARTIFACT_CREDENTIALS_PATH: &str = "/artifacts/credentials";

/// The routing state published by one refresh.
#[derive(Debug, Default)]
pub struct RoutingSnapshot {
    pub cloud_routes: HashMap<String, BackendRef>,
    pub artifact_routes: HashMap<String, BackendRef>,
    pub cloud_accounts: Vec<TrackedAccount>,
    pub artifact_accounts: Vec<TrackedAccount>,
}

pub struct AccountRouter {
    snapshot: RwLock<Arc<RoutingSnapshot>>,
    ready: AtomicBool,
}

impl AccountRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            snapshot: RwLock::new(Arc::new(RoutingSnapshot::default())),
            ready: AtomicBool::new(false),
        })
    }

    pub fn find_cloud_route(&self, account_name: &str) -> Option<BackendRef> {
        self.snapshot.read().cloud_routes.get(account_name).cloned()
    }

    pub fn find_artifact_route(&self, account_name: &str) -> Option<BackendRef> {
        self.snapshot
            .read()
            .artifact_routes
            .get(account_name)
            .cloned()
    }

    /// A copy of the cloud route map; the caller may mutate it freely.
    pub fn cloud_routes(&self) -> HashMap<String, BackendRef> {
        self.snapshot.read().cloud_routes.clone()
    }

    pub fn artifact_routes(&self) -> HashMap<String, BackendRef> {
        self.snapshot.read().artifact_routes.clone()
    }

    pub fn cloud_accounts(&self) -> Vec<TrackedAccount> {
        self.snapshot.read().cloud_accounts.clone()
    }

    pub fn artifact_accounts(&self) -> Vec<TrackedAccount> {
        self.snapshot.read().artifact_accounts.clone()
    }

    /// Backends referenced by at least one route in either map, deduplicated
    /// by URL. This is the fan-out target set: a backend that advertised no
    /// accounts in the last refresh does not participate.
    pub fn healthy_backends(&self) -> Vec<BackendRef> {
        let snapshot = self.snapshot.read();
        let mut healthy: HashMap<&str, &BackendRef> = HashMap::new();
        for backend in snapshot
            .cloud_routes
            .values()
            .chain(snapshot.artifact_routes.values())
        {
            healthy.insert(backend.key(), backend);
        }
        healthy.into_values().cloned().collect()
    }

    /// The required health check: fails until the first refresh completes.
    pub fn sync_check(self: &Arc<Self>) -> Arc<dyn HealthCheck> {
        Arc::new(SyncCheck(self.clone()))
    }

    /// Atomically replaces the published snapshot.
    pub fn publish(&self, snapshot: RoutingSnapshot) {
        *self.snapshot.write() = Arc::new(snapshot);
    }

    /// Refresh loop. The first refresh runs immediately; each subsequent one
    /// starts a full interval after the previous one finished.
    pub async fn run(
        self: Arc<Self>,
        registry: Arc<Registry>,
        client: BackendClient,
        frequency: Duration,
    ) {
        loop {
            self.refresh(&registry, &client).await;
            self.ready.store(true, Ordering::Relaxed);
            sleep(frequency).await;
        }
    }

    pub async fn refresh(&self, registry: &Registry, client: &BackendClient) {
        tracing::debug!("Refreshing account routes");
        let started = Instant::now();
        let headers = polling_headers(registry.spinnaker_user());

        let (cloud, artifact) = tokio::join!(
            fetch_accounts(
                client,
                registry,
                registry.refs(false),
                CREDENTIALS_PATH,
                &headers,
                false,
            ),
            fetch_accounts(
                client,
                registry,
                registry.refs(true),
                ARTIFACT_CREDENTIALS_PATH,
                &headers,
                true,
            ),
        );

        let snapshot = RoutingSnapshot {
            cloud_routes: cloud.0,
            cloud_accounts: cloud.1,
            artifact_routes: artifact.0,
            artifact_accounts: artifact.1,
        };

        tracing::info!(
            cloud_accounts = snapshot.cloud_accounts.len(),
            artifact_accounts = snapshot.artifact_accounts.len(),
            elapsed_millis = started.elapsed().as_millis() as u64,
            "Account refresh complete"
        );
        metrics::histogram!(ACCOUNT_REFRESH_DURATION).record(started.elapsed().as_secs_f64());
        metrics::histogram!(ACCOUNT_REFRESH_ACCOUNTS, "kind" => "cloud")
            .record(snapshot.cloud_accounts.len() as f64);
        metrics::histogram!(ACCOUNT_REFRESH_ACCOUNTS, "kind" => "artifact")
            .record(snapshot.artifact_accounts.len() as f64);

        self.publish(snapshot);
    }
}

struct SyncCheck(Arc<AccountRouter>);

#[async_trait]
impl HealthCheck for SyncCheck {
    async fn check(&self) -> Result<(), String> {
        if self.0.ready.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err("initial account sync not yet performed".to_string())
        }
    }
}

fn polling_headers(spinnaker_user: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(spinnaker_user) {
        headers.insert(HeaderName::from_static("x-spinnaker-user"), value);
    }
    headers.insert(http::header::ACCEPT, HeaderValue::from_static("*/*"));
    headers
}

/// Polls one credentials path on every listed backend in parallel and
/// merges the results. A failing backend is logged, recorded against its
/// sync state, and skipped; the refresh continues with the rest.
async fn fetch_accounts(
    client: &BackendClient,
    registry: &Registry,
    backends: Vec<BackendRef>,
    path: &str,
    headers: &HeaderMap,
    artifact: bool,
) -> (HashMap<String, BackendRef>, Vec<TrackedAccount>) {
    let mut join_set = JoinSet::new();
    for backend in backends {
        let client = client.clone();
        let headers = headers.clone();
        let url = combine_url(&backend.url, path);
        join_set.spawn(async move {
            let outcome = fetch_accounts_from_one(&client, &url, &backend, &headers).await;
            (backend, outcome)
        });
    }

    let mut routes = HashMap::new();
    let mut accounts = Vec::new();

    while let Some(joined) = join_set.join_next().await {
        let (backend, outcome) = match joined {
            Ok(result) => result,
            Err(e) => {
                tracing::error!("Credentials fetch task panicked: {e}");
                continue;
            }
        };
        match outcome {
            Ok(fetched) => {
                registry.record_sync(&backend.url, artifact, Ok(()));
                merge_if_unique(&backend, fetched, &mut routes, &mut accounts);
            }
            Err(reason) => {
                tracing::warn!(url = %backend.url, path, "Unable to fetch credentials: {reason}");
                registry.record_sync(&backend.url, artifact, Err(reason));
            }
        }
    }

    (routes, accounts)
}

async fn fetch_accounts_from_one(
    client: &BackendClient,
    url: &str,
    backend: &BackendRef,
    headers: &HeaderMap,
) -> Result<Vec<TrackedAccount>, String> {
    let response = client
        .get(url, backend.token.as_deref(), headers)
        .await
        .map_err(|e| e.to_string())?;

    if !response.status_ok() {
        return Err(format!("status {}", response.status.as_u16()));
    }

    serde_json::from_slice(&response.body).map_err(|e| format!("unparseable response: {e}"))
}

/// Merge rule for one backend's account list: unseen names are inserted and
/// appended to the account list; a higher-priority backend overwrites the
/// route only (the account stays listed once).
fn merge_if_unique(
    backend: &BackendRef,
    fetched: Vec<TrackedAccount>,
    routes: &mut HashMap<String, BackendRef>,
    accounts: &mut Vec<TrackedAccount>,
) {
    for account in fetched {
        match routes.get(&account.name) {
            None => {
                routes.insert(account.name.clone(), backend.clone());
                accounts.push(account);
            }
            Some(current) if current.priority < backend.priority => {
                routes.insert(account.name.clone(), backend.clone());
            }
            Some(_) => {}
        }
    }
}
