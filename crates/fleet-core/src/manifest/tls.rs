//! TLS credential material read from the paths an app declares.

use super::{AppConfig, FleetConfig};
use crate::{FleetError, Result};
use std::path::Path;

/// Raw CA, certificate and key bytes for one app.
///
/// Compared by content, so a reload notices edited files even when the paths
/// stay the same.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsMaterial {
    pub ca: Option<Vec<u8>>,
    pub cert: Option<Vec<u8>>,
    pub key: Option<Vec<u8>>,
}

impl TlsMaterial {
    /// Read every configured credential file of `app`.
    pub async fn load(config: &FleetConfig, app: &AppConfig) -> Result<Self> {
        Ok(Self {
            ca: read_optional(config, app.ca.as_deref()).await?,
            cert: read_optional(config, app.cert.as_deref()).await?,
            key: read_optional(config, app.key.as_deref()).await?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.ca.is_none() && self.cert.is_none() && self.key.is_none()
    }
}

async fn read_optional(config: &FleetConfig, path: Option<&Path>) -> Result<Option<Vec<u8>>> {
    let Some(path) = path else {
        return Ok(None);
    };
    let resolved = config.resolve(path);
    match tokio::fs::read(&resolved).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) => Err(FleetError::Network {
            message: format!("Unreadable TLS material {}", resolved.display()),
            source: Some(e),
        }),
    }
}
