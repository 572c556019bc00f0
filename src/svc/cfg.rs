//! # Configuration module
//!
//! This module provides utilities and helpers to interact with the configuration

use std::{
    convert::TryFrom,
    env::{self, VarError},
    path::PathBuf,
    time::Duration,
};

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// -----------------------------------------------------------------------------
// Constants

pub const OPERATOR_LISTEN: &str = "0.0.0.0:8000";
pub const DEFAULT_WAIT_TIMEOUT_SECONDS: u64 = 300;
pub const DEFAULT_NEXT_RECONCILE_SECONDS: i64 = 30;

// -----------------------------------------------------------------------------
// Proxy structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Proxy {
    #[serde(rename = "http")]
    pub http: Option<String>,
    #[serde(rename = "https")]
    pub https: Option<String>,
    #[serde(rename = "no", default = "Default::default")]
    pub no: Vec<String>,
}

// -----------------------------------------------------------------------------
// Operator structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Operator {
    #[serde(rename = "listen")]
    pub listen: String,
}

// -----------------------------------------------------------------------------
// HttpClient structure

/// defaults applied when a `Request`/`DisposableRequest` mapping does not
/// override them
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct HttpClient {
    #[serde(rename = "defaultWaitTimeoutSeconds")]
    pub default_wait_timeout_seconds: u64,
    #[serde(rename = "defaultInsecureSkipTlsVerify")]
    pub default_insecure_skip_tls_verify: bool,
    #[serde(rename = "defaultNextReconcileSeconds")]
    pub default_next_reconcile_seconds: i64,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self {
            default_wait_timeout_seconds: DEFAULT_WAIT_TIMEOUT_SECONDS,
            default_insecure_skip_tls_verify: false,
            default_next_reconcile_seconds: DEFAULT_NEXT_RECONCILE_SECONDS,
        }
    }
}

impl HttpClient {
    pub fn default_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.default_wait_timeout_seconds)
    }

    pub fn default_next_reconcile(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.default_next_reconcile_seconds)
    }
}

// -----------------------------------------------------------------------------
// ConfigurationError enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to load configuration, {0}")]
    Build(ConfigError),
    #[error("failed to deserialize configuration, {0}")]
    Deserialize(ConfigError),
    #[error("failed to set default for key '{0}', {1}")]
    Default(String, ConfigError),
    #[error("failed to retrieve environment variable '{0}', {1}")]
    EnvironmentVariable(&'static str, VarError),
}

// -----------------------------------------------------------------------------
// Sentry structure

#[cfg(feature = "tracker")]
#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct Sentry {
    #[serde(rename = "dsn")]
    pub dsn: Option<String>,
}

// -----------------------------------------------------------------------------
// Configuration structures

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct Configuration {
    #[serde(rename = "proxy")]
    pub proxy: Option<Proxy>,
    #[serde(rename = "httpClient", default = "HttpClient::default")]
    pub http_client: HttpClient,
    #[serde(rename = "operator")]
    pub operator: Operator,
    #[cfg(feature = "tracker")]
    #[serde(rename = "sentry", default = "Default::default")]
    pub sentry: Sentry,
}

impl TryFrom<PathBuf> for Configuration {
    type Error = Error;

    fn try_from(path: PathBuf) -> Result<Self, Self::Error> {
        Config::builder()
            .set_default(
                "httpClient.defaultWaitTimeoutSeconds",
                DEFAULT_WAIT_TIMEOUT_SECONDS as i64,
            )
            .map_err(|err| Error::Default("httpClient.defaultWaitTimeoutSeconds".into(), err))?
            .set_default("httpClient.defaultInsecureSkipTlsVerify", false)
            .map_err(|err| Error::Default("httpClient.defaultInsecureSkipTlsVerify".into(), err))?
            .set_default(
                "httpClient.defaultNextReconcileSeconds",
                DEFAULT_NEXT_RECONCILE_SECONDS,
            )
            .map_err(|err| Error::Default("httpClient.defaultNextReconcileSeconds".into(), err))?
            .set_default("operator.listen", OPERATOR_LISTEN)
            .map_err(|err| Error::Default("operator.listen".into(), err))?
            .add_source(Environment::with_prefix(
                &env!("CARGO_PKG_NAME").replace('-', "_"),
            ))
            .add_source(File::from(path).required(true))
            .build()
            .map_err(Error::Build)?
            .try_deserialize()
            .map_err(Error::Deserialize)
    }
}

impl Configuration {
    pub fn try_default() -> Result<Self, Error> {
        Config::builder()
            .set_default(
                "httpClient.defaultWaitTimeoutSeconds",
                DEFAULT_WAIT_TIMEOUT_SECONDS as i64,
            )
            .map_err(|err| Error::Default("httpClient.defaultWaitTimeoutSeconds".into(), err))?
            .set_default("httpClient.defaultInsecureSkipTlsVerify", false)
            .map_err(|err| Error::Default("httpClient.defaultInsecureSkipTlsVerify".into(), err))?
            .set_default(
                "httpClient.defaultNextReconcileSeconds",
                DEFAULT_NEXT_RECONCILE_SECONDS,
            )
            .map_err(|err| Error::Default("httpClient.defaultNextReconcileSeconds".into(), err))?
            .set_default("operator.listen", OPERATOR_LISTEN)
            .map_err(|err| Error::Default("operator.listen".into(), err))?
            .add_source(Environment::with_prefix(
                &env!("CARGO_PKG_NAME").replace('-', "_"),
            ))
            .add_source(
                File::from(PathBuf::from(format!(
                    "/usr/share/{}/config",
                    env!("CARGO_PKG_NAME")
                )))
                .required(false),
            )
            .add_source(
                File::from(PathBuf::from(format!(
                    "/etc/{}/config",
                    env!("CARGO_PKG_NAME")
                )))
                .required(false),
            )
            .add_source(
                File::from(PathBuf::from(format!(
                    "{}/.config/{}/config",
                    env::var("HOME").map_err(|err| Error::EnvironmentVariable("HOME", err))?,
                    env!("CARGO_PKG_NAME")
                )))
                .required(false),
            )
            .add_source(
                File::from(PathBuf::from(format!(
                    "{}/.local/share/{}/config",
                    env::var("HOME").map_err(|err| Error::EnvironmentVariable("HOME", err))?,
                    env!("CARGO_PKG_NAME")
                )))
                .required(false),
            )
            .add_source(File::from(PathBuf::from("config")).required(false))
            .build()
            .map_err(Error::Build)?
            .try_deserialize()
            .map_err(Error::Deserialize)
    }

    /// prints a message about the build's feature flags and missing values
    pub fn help(&self) {
        #[cfg(feature = "metrics")]
        info!("Build with 'metrics' feature flag");

        #[cfg(feature = "tracker")]
        info!("Build with 'tracker' feature flag");

        #[cfg(feature = "tracker")]
        if self.sentry.dsn.is_none() {
            warn!("Configuration key 'sentry.dsn' is unset, error tracking is disabled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_client_default_wait_timeout_matches_configured_seconds() {
        let http_client = HttpClient {
            default_wait_timeout_seconds: 45,
            default_insecure_skip_tls_verify: false,
            default_next_reconcile_seconds: 30,
        };

        assert_eq!(http_client.default_wait_timeout(), Duration::from_secs(45));
    }
}
