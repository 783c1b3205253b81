//! Controller discovery feed.
//!
//! The controller exposes an inventory of clouddriver services reachable
//! through its agents. The poller fetches the inventory on an interval,
//! diffs it against the previous poll, and emits update/delete events on a
//! channel the registry consumes. The aggregator runs fine with no
//! controller configured; the stream is simply empty.

use serde::Deserialize;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::time::{Duration, sleep};

const BASE_RETRY_DELAY_MILLIS: u64 = 500;
const MAX_RETRY_EXPONENT: u32 = 6;

fn default_poll_frequency() -> u64 {
    30
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ControllerConfig {
    pub url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_poll_frequency")]
    pub poll_frequency: u64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Operation {
    Update,
    Delete,
}

/// One membership event, keyed by the stable `(agent_name, name)` pair.
#[derive(Clone, Debug, PartialEq)]
pub struct ServiceUpdate {
    pub operation: Operation,
    pub agent_name: String,
    pub name: String,
    pub url: String,
    pub token: Option<String>,
    pub annotations: HashMap<String, String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct ServiceRecord {
    #[serde(default)]
    agent_name: String,
    name: String,
    url: String,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    annotations: HashMap<String, String>,
}

impl ServiceRecord {
    fn key(&self) -> (String, String) {
        (self.agent_name.clone(), self.name.clone())
    }

    fn into_update(self, operation: Operation) -> ServiceUpdate {
        ServiceUpdate {
            operation,
            agent_name: self.agent_name,
            name: self.name,
            url: self.url,
            token: self.token,
            annotations: self.annotations,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum DiscoveryError {
    #[error("could not reach controller: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("controller returned status {0}")]
    UnexpectedStatus(u16),
}

struct ControllerClient {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl ControllerClient {
    fn new(config: &ControllerConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: format!("{}/api/v1/services", config.url.trim_end_matches('/')),
            token: config.token.clone(),
        }
    }

    async fn list_services(&self) -> Result<Vec<ServiceRecord>, DiscoveryError> {
        let mut request = self
            .client
            .get(&self.endpoint)
            .query(&[("type", "clouddriver")]);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(DiscoveryError::UnexpectedStatus(response.status().as_u16()));
        }
        Ok(response.json().await?)
    }
}

/// Polls the controller until the receiving side goes away. Transient
/// failures back off exponentially and keep the last known inventory, so a
/// controller blip never mass-deletes the fleet.
pub async fn run(config: ControllerConfig, tx: mpsc::Sender<ServiceUpdate>) {
    let client = ControllerClient::new(&config);
    let poll_interval = Duration::from_secs(config.poll_frequency);
    let mut known: HashMap<(String, String), ServiceRecord> = HashMap::new();
    let mut failures: u32 = 0;

    loop {
        match client.list_services().await {
            Ok(records) => {
                failures = 0;
                for update in diff_services(&mut known, records) {
                    if tx.send(update).await.is_err() {
                        return;
                    }
                }
                sleep(poll_interval).await;
            }
            Err(e) => {
                failures += 1;
                let backoff = Duration::from_millis(
                    BASE_RETRY_DELAY_MILLIS * 2_u64.pow(failures.min(MAX_RETRY_EXPONENT)),
                );
                tracing::warn!(error = %e, backoff_millis = backoff.as_millis() as u64,
                    "Controller poll failed");
                sleep(backoff.min(poll_interval)).await;
            }
        }
    }
}

/// Diffs the freshly polled inventory against the last one. New or changed
/// records become updates, vanished records become deletes.
fn diff_services(
    known: &mut HashMap<(String, String), ServiceRecord>,
    records: Vec<ServiceRecord>,
) -> Vec<ServiceUpdate> {
    let mut updates = Vec::new();
    let mut current = HashMap::new();

    for record in records {
        let key = record.key();
        if known.get(&key) != Some(&record) {
            updates.push(record.clone().into_update(Operation::Update));
        }
        current.insert(key, record);
    }

    for (_, record) in known.drain() {
        if !current.contains_key(&record.key()) {
            updates.push(record.into_update(Operation::Delete));
        }
    }

    *known = current;
    updates
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(agent: &str, name: &str, url: &str) -> ServiceRecord {
        ServiceRecord {
            agent_name: agent.to_string(),
            name: name.to_string(),
            url: url.to_string(),
            token: None,
            annotations: HashMap::new(),
        }
    }

    #[test]
    fn test_diff_emits_updates_for_new_records() {
        let mut known = HashMap::new();
        let updates = diff_services(
            &mut known,
            vec![record("a1", "cd1", "http://one"), record("a1", "cd2", "http://two")],
        );

        assert_eq!(updates.len(), 2);
        assert!(updates.iter().all(|u| u.operation == Operation::Update));
        assert_eq!(known.len(), 2);
    }

    #[test]
    fn test_diff_skips_unchanged_records() {
        let mut known = HashMap::new();
        diff_services(&mut known, vec![record("a1", "cd1", "http://one")]);

        let updates = diff_services(&mut known, vec![record("a1", "cd1", "http://one")]);
        assert!(updates.is_empty());
    }

    #[test]
    fn test_diff_emits_update_for_changed_url() {
        let mut known = HashMap::new();
        diff_services(&mut known, vec![record("a1", "cd1", "http://one")]);

        let updates = diff_services(&mut known, vec![record("a1", "cd1", "http://moved")]);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].operation, Operation::Update);
        assert_eq!(updates[0].url, "http://moved");
    }

    #[test]
    fn test_diff_emits_delete_for_vanished_records() {
        let mut known = HashMap::new();
        diff_services(
            &mut known,
            vec![record("a1", "cd1", "http://one"), record("a1", "cd2", "http://two")],
        );

        let updates = diff_services(&mut known, vec![record("a1", "cd1", "http://one")]);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].operation, Operation::Delete);
        assert_eq!(updates[0].name, "cd2");
        assert_eq!(known.len(), 1);
    }
}
