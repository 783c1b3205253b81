use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// How a backend entered the registry. Config-sourced backends are
/// permanent; discovered ones live until the controller deletes them.
#[derive(Clone, Debug, PartialEq)]
pub enum BackendSource {
    Config,
    Discovered { agent_name: String },
}

/// One clouddriver instance known to the registry.
#[derive(Clone, Debug)]
pub struct Backend {
    pub name: String,
    pub url: String,
    pub healthcheck_url: String,
    pub ui_url: String,
    pub priority: i32,
    pub disable_artifact_accounts: bool,
    pub token: Option<String>,
    pub source: BackendSource,
    pub last_successful_contact: Option<SystemTime>,

    // Sync state per credentials endpoint: None once a fetch has succeeded,
    // otherwise the reason the last attempt failed. Artifact-ineligible
    // backends never carry an artifact sync error.
    pub account_sync: Option<String>,
    pub artifact_sync: Option<String>,
}

impl Backend {
    /// Registry identity key, unique across sources.
    pub fn key(&self) -> String {
        match &self.source {
            BackendSource::Config => format!("config:{}", self.name),
            BackendSource::Discovered { agent_name } => {
                format!("discovered:{}:{}", agent_name, self.name)
            }
        }
    }

    pub fn backend_ref(&self) -> BackendRef {
        BackendRef {
            url: self.url.clone(),
            priority: self.priority,
            token: self.token.clone(),
        }
    }

    /// The error surfaced by this backend's health check, artifact sync
    /// state first.
    pub fn sync_error(&self) -> Option<String> {
        self.artifact_sync
            .clone()
            .or_else(|| self.account_sync.clone())
    }
}

/// The routing triple handed to the dispatch engine. The token never
/// appears in serialized output.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BackendRef {
    pub url: String,
    pub priority: i32,
    #[serde(skip)]
    pub token: Option<String>,
}

impl BackendRef {
    /// Dedup key for fan-out target selection.
    pub fn key(&self) -> &str {
        &self.url
    }
}

/// An account as advertised by a backend's credentials endpoints, kept
/// verbatim for introspection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackedAccount {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub account_type: Option<String>,
}
