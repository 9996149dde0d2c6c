//! Per-app configuration.

use crate::config::RpcConfig;
use crate::{FleetError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// URI scheme of an app endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Grpc,
    Grpcs,
    Http,
    Https,
    /// Resolved by an external discovery layer; never bound locally.
    Xds,
}

impl Scheme {
    pub fn parse(scheme: &str) -> Option<Self> {
        match scheme {
            "grpc" => Some(Scheme::Grpc),
            "grpcs" => Some(Scheme::Grpcs),
            "http" => Some(Scheme::Http),
            "https" => Some(Scheme::Https),
            "xds" => Some(Scheme::Xds),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Grpc => "grpc",
            Scheme::Grpcs => "grpcs",
            Scheme::Http => "http",
            Scheme::Https => "https",
            Scheme::Xds => "xds",
        }
    }

    /// Whether the scheme requires TLS material.
    pub fn is_secure(&self) -> bool {
        matches!(self, Scheme::Grpcs | Scheme::Https)
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One app of the fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    pub name: String,
    pub uri: String,
    #[serde(default)]
    pub serve: bool,
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<PathBuf>,
    /// Client connect timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout: Option<u64>,
    /// Channel and server options, passed through to the transport.
    #[serde(default)]
    pub options: serde_json::Map<String, serde_json::Value>,
    /// Overrides the fleet-level entry used to spawn this app.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<PathBuf>,
}

impl AppConfig {
    fn parsed_uri(&self) -> Result<Url> {
        Url::parse(&self.uri).map_err(|e| FleetError::Config {
            message: format!("App '{}' has an invalid uri '{}': {}", self.name, self.uri, e),
        })
    }

    /// The scheme of the app's uri.
    pub fn scheme(&self) -> Result<Scheme> {
        let url = self.parsed_uri()?;
        Scheme::parse(url.scheme()).ok_or_else(|| FleetError::Config {
            message: format!(
                "App '{}' uses unsupported scheme '{}' (expected grpc, grpcs, http, https or xds)",
                self.name,
                url.scheme()
            ),
        })
    }

    /// The `host:port` the app listens on and clients connect to.
    ///
    /// `xds` apps have no socket address; their uri is returned unchanged.
    pub fn address(&self) -> Result<String> {
        let url = self.parsed_uri()?;
        if url.scheme() == Scheme::Xds.as_str() {
            return Ok(self.uri.clone());
        }
        let host = url.host_str().ok_or_else(|| FleetError::Config {
            message: format!("App '{}' uri '{}' has no host", self.name, self.uri),
        })?;
        let port = url.port_or_known_default().ok_or_else(|| FleetError::Config {
            message: format!("App '{}' uri '{}' has no port", self.name, self.uri),
        })?;
        Ok(format!("{}:{}", host, port))
    }

    /// True when this app binds a listener: `serve` is set and the scheme is
    /// not `xds`.
    pub fn is_server(&self) -> bool {
        self.serve && !matches!(self.scheme(), Ok(Scheme::Xds))
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
            .map(Duration::from_millis)
            .unwrap_or(RpcConfig::DEFAULT_CONNECT_TIMEOUT)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(FleetError::Config {
                message: "App name must not be empty".to_string(),
            });
        }
        let scheme = self.scheme()?;
        if scheme != Scheme::Xds {
            self.address()?;
        }
        if self.is_server() && scheme.is_secure() && (self.cert.is_none() || self.key.is_none()) {
            return Err(FleetError::Config {
                message: format!(
                    "App '{}' serves over {} but does not configure both cert and key",
                    self.name, scheme
                ),
            });
        }
        Ok(())
    }
}
