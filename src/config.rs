//! Configuration of a wiki node.

use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::{ids::PeerId, log::SyncOptions};

/// Name of the wiki joined when none is configured.
pub const DEFAULT_WIKI_NAME: &str = "bitxenia-wiki";

/// Error loading a [`WikiConfig`].
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ConfigError {
    #[snafu(display("failed to read {}", path.display()))]
    Read { path: PathBuf, source: io::Error },
    #[snafu(display("failed to parse {}", path.display()))]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Node configuration.
///
/// Usually loaded from a TOML file with [`Self::load`]. Every field is optional in the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WikiConfig {
    /// Name of the catalog log, which identifies the wiki.
    pub wiki_name: String,
    /// Whether this node persistently replicates the wiki and announces it.
    pub collaborator: bool,
    /// Work purely locally: no discovery and no waiting for peers.
    pub offline: bool,
    /// Peers dialed on startup.
    pub bootstrap_peers: Vec<PeerId>,
    /// Delay between full scans of the catalog log.
    pub reconcile_interval_ms: u64,
    /// Delay between provider queries.
    pub discovery_interval_ms: u64,
    /// Delay between announcements.
    pub announce_interval_ms: u64,
    /// Poll period while waiting for a log to sync.
    pub sync_poll_interval_ms: u64,
    /// Bound on waiting for a log to sync.
    pub sync_timeout_ms: u64,
}

impl Default for WikiConfig {
    fn default() -> Self {
        Self {
            wiki_name: DEFAULT_WIKI_NAME.to_string(),
            collaborator: false,
            offline: false,
            bootstrap_peers: Vec::new(),
            reconcile_interval_ms: 60_000,
            discovery_interval_ms: 60_000,
            announce_interval_ms: 60_000,
            sync_poll_interval_ms: 100,
            sync_timeout_ms: 60_000,
        }
    }
}

impl WikiConfig {
    /// Load the config from a file, or the defaults if the file does not exist.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let s = match tokio::fs::read_to_string(path).await {
            Ok(s) => s,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(err) => return Err(err).context(ReadSnafu { path }),
        };
        toml::from_str(&s).context(ParseSnafu { path })
    }

    /// Delay between full scans of the catalog log.
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    /// Delay between provider queries.
    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }

    /// Delay between announcements.
    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms)
    }

    /// Bounds for waiting until a log syncs.
    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            poll_interval: Duration::from_millis(self.sync_poll_interval_ms),
            timeout: Duration::from_millis(self.sync_timeout_ms),
        }
    }
}
