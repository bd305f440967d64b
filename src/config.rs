//! Configuration file parsing and validation.
//!
//! The YAML document is deserialized with `deny_unknown_fields` so that typos
//! and stale keys are caught at load time rather than silently ignored, then
//! validated into the domain types (`Dsn`, `Evaluator`) before any socket binds.

use std::fs;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::endpoint::{Dsn, DsnError};
use crate::evaluator::{DefaultAction, Evaluator, EvaluatorError};
use crate::geo::{GeoError, GeoLookup, Ip2LocationDatabase};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    pub endpoints: Vec<String>,
    pub metrics: Option<String>,
    pub logger: Option<String>,
    #[serde(default)]
    pub databases: Vec<String>,
    pub default_action: String,
    #[serde(default)]
    pub allowlist: Vec<RuleConfig>,
    #[serde(default)]
    pub blocklist: Vec<RuleConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read configuration file {0:?}: {1}")]
    Read(String, std::io::Error),
    #[error("could not parse configuration file {0:?}: {1}")]
    Parse(String, serde_yaml::Error),
    #[error("invalid default_action {0:?} (expected \"allow\" or \"block\")")]
    InvalidDefaultAction(String),
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(#[from] DsnError),
    #[error("invalid rule: {0}")]
    InvalidRule(#[from] EvaluatorError),
    #[error("could not open IP database: {0}")]
    Database(#[from] GeoError),
    #[error("invalid metrics address {0:?}: {1}")]
    InvalidMetricsAddr(String, std::net::AddrParseError),
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<AppConfig, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.display().to_string(), e))?;
        AppConfig::from_str(&text)
    }

    fn from_str(text: &str) -> Result<AppConfig, ConfigError> {
        serde_yaml::from_str(text).map_err(|e| ConfigError::Parse(text.to_string(), e))
    }

    fn default_action(&self) -> Result<DefaultAction, ConfigError> {
        match self.default_action.as_str() {
            "allow" => Ok(DefaultAction::Allow),
            "block" => Ok(DefaultAction::Block),
            other => Err(ConfigError::InvalidDefaultAction(other.to_string())),
        }
    }

    /// Parses every `endpoints` DSN, failing fast on the first malformed one.
    pub fn dsns(&self) -> Result<Vec<Dsn>, ConfigError> {
        self.endpoints
            .iter()
            .map(|s| s.parse::<Dsn>().map_err(ConfigError::from))
            .collect()
    }

    /// Opens every configured database and builds the `Evaluator`. Database
    /// open failures and malformed rules are both fatal configuration errors.
    pub fn build_evaluator(&self) -> Result<Evaluator, ConfigError> {
        let mut databases: Vec<Box<dyn crate::geo::CountryDatabase>> = Vec::new();
        for path in &self.databases {
            databases.push(Box::new(Ip2LocationDatabase::open(path)?));
        }
        let geo = GeoLookup::new(databases);

        Ok(Evaluator::new(
            self.default_action()?,
            &self.allowlist,
            &self.blocklist,
            geo,
        )?)
    }

    /// The metrics listen address, if the `metrics` key is set.
    pub fn metrics_addr(&self) -> Result<Option<std::net::SocketAddr>, ConfigError> {
        match &self.metrics {
            None => Ok(None),
            Some(addr) => addr
                .parse()
                .map(Some)
                .map_err(|e| ConfigError::InvalidMetricsAddr(addr.clone(), e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_yaml_document() {
        let yaml = "
endpoints:
  - \"tcp://127.0.0.1:7000?backend=127.0.0.1:7001\"
default_action: allow
";
        let cfg = AppConfig::from_str(yaml).unwrap();
        assert_eq!(cfg.endpoints.len(), 1);
        assert_eq!(cfg.default_action, "allow");
        assert!(cfg.databases.is_empty());
        assert!(cfg.allowlist.is_empty());
    }

    #[test]
    fn parses_a_full_yaml_document() {
        let yaml = "
endpoints:
  - \"udp://127.0.0.1:5050?backend=127.0.0.1:5000&backend=127.0.0.1:5001\"
metrics: \"127.0.0.1:9100\"
logger: info
databases:
  - /etc/geoblock/IP2LOCATION-LITE-DB1.BIN
default_action: block
allowlist:
  - type: country
    value: us
blocklist:
  - type: cidr
    value: 10.0.0.0/8
";
        let cfg = AppConfig::from_str(yaml).unwrap();
        assert_eq!(cfg.databases.len(), 1);
        assert_eq!(cfg.allowlist[0].kind, "country");
        assert_eq!(cfg.blocklist[0].value, "10.0.0.0/8");
        assert_eq!(cfg.metrics_addr().unwrap(), Some("127.0.0.1:9100".parse().unwrap()));
    }

    #[test]
    fn rejects_unknown_top_level_keys() {
        let yaml = "
endpoints: []
default_action: allow
typo_key: true
";
        assert!(AppConfig::from_str(yaml).is_err());
    }

    #[test]
    fn rejects_invalid_default_action() {
        let yaml = "
endpoints:
  - \"tcp://127.0.0.1:7000?backend=127.0.0.1:7001\"
default_action: maybe
";
        let cfg = AppConfig::from_str(yaml).unwrap();
        assert!(matches!(cfg.default_action(), Err(ConfigError::InvalidDefaultAction(_))));
    }

    #[test]
    fn rejects_malformed_endpoint_dsn() {
        let yaml = "
endpoints:
  - \"not a dsn\"
default_action: allow
";
        let cfg = AppConfig::from_str(yaml).unwrap();
        assert!(cfg.dsns().is_err());
    }
}
