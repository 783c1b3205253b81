use serde::Deserialize;

/// One statically configured clouddriver entry. Name and healthcheck URL
/// are defaulted by the registry when absent.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ClouddriverConfig {
    pub name: String,
    pub url: String,
    pub healthcheck_url: String,
    pub disable_artifact_accounts: bool,
    pub priority: i32,
    pub ui_url: String,
}
