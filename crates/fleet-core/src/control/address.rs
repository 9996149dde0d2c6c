//! Control-channel address derived from the fleet config path.

use crate::config::ControlConfig;
use crate::{FleetError, Result};
use std::fmt;
use std::path::{Path, PathBuf};

/// Where the fleet host listens for guests.
///
/// On unix this is a socket file next to the config (`fleet.json` becomes
/// `fleet.sock`). On Windows the same absolute path is mapped into the
/// named-pipe namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ControlAddress {
    path: PathBuf,
    socket_file: PathBuf,
}

impl ControlAddress {
    pub fn for_config(config_path: impl AsRef<Path>) -> Result<Self> {
        let config_path = config_path.as_ref();
        let absolute = std::path::absolute(config_path)
            .map_err(|e| FleetError::io_with_path(e, config_path))?;
        let socket_file = absolute.with_extension(ControlConfig::SOCKET_SUFFIX);

        #[cfg(windows)]
        let path = PathBuf::from(format!(
            "{}{}",
            ControlConfig::PIPE_PREFIX,
            socket_file.display().to_string().replace('\\', "/")
        ));
        #[cfg(not(windows))]
        let path = socket_file.clone();

        Ok(Self { path, socket_file })
    }

    /// The socket path (unix) or pipe name (Windows).
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Advisory lock file that serialises elections for this address.
    pub fn lock_path(&self) -> PathBuf {
        #[cfg(windows)]
        {
            let digest = blake3::hash(self.socket_file.to_string_lossy().as_bytes());
            std::env::temp_dir().join(format!(
                "fleet-{}.{}",
                &digest.to_hex()[..16],
                ControlConfig::LOCK_SUFFIX
            ))
        }
        #[cfg(not(windows))]
        {
            self.socket_file.with_extension(ControlConfig::LOCK_SUFFIX)
        }
    }

    /// Whether a listener artifact currently exists at this address.
    ///
    /// Named pipes leave nothing behind, so on Windows this is always true and
    /// a missing pipe surfaces as a connect error instead.
    pub fn exists(&self) -> bool {
        #[cfg(windows)]
        {
            true
        }
        #[cfg(not(windows))]
        {
            self.path.exists()
        }
    }
}

impl fmt::Display for ControlAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}
