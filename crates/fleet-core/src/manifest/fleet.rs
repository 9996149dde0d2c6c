//! Fleet-level configuration and the shared cell holding its current version.

use super::AppConfig;
use crate::{FleetError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::debug;

/// The parsed fleet config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Default program used to spawn apps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<PathBuf>,
    /// Proto sources and loader options. Carried, not interpreted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protos: Option<serde_json::Value>,
    #[serde(default)]
    pub apps: Vec<AppConfig>,
    /// Absolute path the config was loaded from.
    #[serde(skip)]
    pub path: PathBuf,
}

impl FleetConfig {
    /// Load and validate a fleet config file.
    ///
    /// Only `.json` files are accepted, which keeps the derived control
    /// address of two distinct config files from colliding.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            return Err(FleetError::Config {
                message: format!("Fleet config {} must be a .json file", path.display()),
            });
        }
        let absolute = std::path::absolute(path).map_err(|e| FleetError::io_with_path(e, path))?;
        let text = std::fs::read_to_string(&absolute).map_err(|e| FleetError::Config {
            message: format!("Failed to read fleet config {}: {}", absolute.display(), e),
        })?;
        let config = Self::parse(&text, absolute)?;
        debug!(
            "Loaded fleet config {} ({} apps)",
            config.path.display(),
            config.apps.len()
        );
        Ok(config)
    }

    /// Parse config text as if it had been loaded from `path`.
    pub fn parse(text: &str, path: impl Into<PathBuf>) -> Result<Self> {
        let mut config: FleetConfig = serde_json::from_str(text).map_err(|e| FleetError::Config {
            message: format!("Invalid fleet config: {}", e),
        })?;
        config.path = path.into();
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for app in &self.apps {
            if !seen.insert(app.name.as_str()) {
                return Err(FleetError::Config {
                    message: format!("App name '{}' is declared more than once", app.name),
                });
            }
            app.validate()?;
        }
        Ok(())
    }

    pub fn app(&self, name: &str) -> Option<&AppConfig> {
        self.apps.iter().find(|app| app.name == name)
    }

    /// Directory relative paths in the config are resolved against.
    pub fn dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.dir().join(path)
        }
    }

    /// The program that starts `app`: its own entry, else the fleet default.
    pub fn entry_for(&self, app: &AppConfig) -> Option<PathBuf> {
        app.entry
            .as_deref()
            .or(self.entry.as_deref())
            .map(|entry| self.resolve(entry))
    }
}

/// Shared handle to the current fleet config.
///
/// Readers get an `Arc` snapshot; reload swaps the whole config at once.
#[derive(Debug, Clone)]
pub struct ConfigCell {
    current: Arc<RwLock<Arc<FleetConfig>>>,
}

impl ConfigCell {
    pub fn new(config: FleetConfig) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    pub fn current(&self) -> Arc<FleetConfig> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Publish a new config, returning the one it replaces.
    pub fn replace(&self, config: FleetConfig) -> Arc<FleetConfig> {
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::replace(&mut *guard, Arc::new(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"{
        "namespace": "demo",
        "entry": "bin/run",
        "apps": [
            {"name": "greeter", "uri": "grpc://127.0.0.1:50051", "serve": true,
             "services": ["helloworld.Greeter"], "env": {"MODE": "dev"}},
            {"name": "gateway", "uri": "http://127.0.0.1:8080", "entry": "/opt/gw"}
        ]
    }"#;

    #[test]
    fn test_parse_sample() {
        let config = FleetConfig::parse(SAMPLE, "/srv/fleet/fleet.json").unwrap();
        assert_eq!(config.namespace.as_deref(), Some("demo"));
        assert_eq!(config.apps.len(), 2);
        let greeter = config.app("greeter").unwrap();
        assert!(greeter.serve);
        assert_eq!(greeter.env.get("MODE").map(String::as_str), Some("dev"));
        assert!(config.app("missing").is_none());
    }

    #[test]
    fn test_entry_resolution() {
        let config = FleetConfig::parse(SAMPLE, "/srv/fleet/fleet.json").unwrap();
        let greeter = config.app("greeter").unwrap();
        let gateway = config.app("gateway").unwrap();
        assert_eq!(
            config.entry_for(greeter),
            Some(PathBuf::from("/srv/fleet/bin/run"))
        );
        assert_eq!(config.entry_for(gateway), Some(PathBuf::from("/opt/gw")));
    }

    #[test]
    fn test_duplicate_app_names_rejected() {
        let text = r#"{"apps": [
            {"name": "a", "uri": "grpc://127.0.0.1:1"},
            {"name": "a", "uri": "grpc://127.0.0.1:2"}
        ]}"#;
        let err = FleetConfig::parse(text, "/tmp/fleet.json").unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_load_requires_json_extension() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("fleet.yaml");
        std::fs::write(&path, "{}").unwrap();
        assert!(matches!(
            FleetConfig::load(&path),
            Err(FleetError::Config { .. })
        ));
    }

    #[test]
    fn test_load_from_disk() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("fleet.json");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = FleetConfig::load(&path).unwrap();
        assert!(config.path.is_absolute());
        assert_eq!(config.dir(), temp.path());
    }

    #[test]
    fn test_load_missing_file() {
        let temp = TempDir::new().unwrap();
        let err = FleetConfig::load(temp.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, FleetError::Config { .. }));
    }

    #[test]
    fn test_config_cell_replace() {
        let cell = ConfigCell::new(FleetConfig::parse(SAMPLE, "/a/fleet.json").unwrap());
        let before = cell.current();
        let old = cell.replace(FleetConfig::parse(r#"{"apps": []}"#, "/a/fleet.json").unwrap());
        assert_eq!(old.apps.len(), 2);
        assert_eq!(before.apps.len(), 2);
        assert!(cell.current().apps.is_empty());
    }
}
