use fleet::config::ClouddriverConfig;
use fleet::discovery::ControllerConfig;
use serde::Deserialize;
use shared::client::ClientConfig;
use std::fs::File;
use url::Url;

const DEFAULT_HTTP_LISTEN_PORT: u16 = 7002;
const DEFAULT_SPINNAKER_USER: &str = "anonymous";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub http_listen_port: u16,
    #[serde(default)]
    pub spinnaker_user: String,
    #[serde(default)]
    pub http_client_config: ClientConfig,
    #[serde(default)]
    pub controller: Option<ControllerConfig>,
    #[serde(default)]
    pub clouddrivers: Vec<ClouddriverConfig>,
    #[serde(default)]
    pub metrics: Option<MetricsConfig>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let mut config: Config = serde_yaml::from_reader(file)?;

        config.apply_defaults();
        config.validate()?;
        Ok(config)
    }

    fn apply_defaults(&mut self) {
        if self.http_listen_port == 0 {
            self.http_listen_port = DEFAULT_HTTP_LISTEN_PORT;
        }
        if self.spinnaker_user.is_empty() {
            self.spinnaker_user = DEFAULT_SPINNAKER_USER.to_string();
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (idx, clouddriver) in self.clouddrivers.iter().enumerate() {
            if clouddriver.url.is_empty() {
                return Err(ConfigError::InvalidConfig(format!(
                    "clouddriver index {} missing url",
                    idx + 1
                )));
            }
            if Url::parse(&clouddriver.url).is_err() {
                return Err(ConfigError::InvalidConfig(format!(
                    "clouddriver index {}: malformed URL",
                    idx + 1
                )));
            }
            if !clouddriver.healthcheck_url.is_empty()
                && Url::parse(&clouddriver.healthcheck_url).is_err()
            {
                return Err(ConfigError::InvalidConfig(format!(
                    "clouddriver index {}: malformed healthcheck URL",
                    idx + 1
                )));
            }
        }
        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}
