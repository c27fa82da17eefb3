//! A single wiki article and its dedicated log.

use std::collections::HashSet;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tracing::{debug, warn};

use crate::{
    ids::LogAddress,
    log::{
        LogEntry, LogError, LogHandle, LogStore, LogTarget, ReplicatedLog, SyncMode,
        open_and_maybe_sync,
    },
    version::{Version, VersionError, VersionId, VersionManager, compile_text_from_versions},
};

/// Errors of [`Article`] operations.
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum ArticleError {
    #[snafu(transparent)]
    Version { source: VersionError },
    #[snafu(transparent)]
    Log { source: LogError },
    #[snafu(display("Failed to decode version from log entry {:?}", hash))]
    DecodeVersion {
        hash: crate::log::EntryHash,
        source: postcard::Error,
    },
    #[snafu(display("Failed to encode version"))]
    EncodeVersion { source: postcard::Error },
}

/// Metadata of one version, as returned by [`Article::get_versions`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    /// The version id.
    pub id: VersionId,
    /// Creation time, in milliseconds since the UNIX epoch.
    pub date: u64,
    /// The parent version.
    pub parent: Option<VersionId>,
    /// Whether the version lies on the main branch.
    pub main_branch: bool,
}

/// An article: its versions and the log they are replicated through.
#[derive(derive_more::Debug)]
pub struct Article<L> {
    name: String,
    log: LogHandle<L>,
    #[debug("{} versions", versions.lock().len())]
    versions: Mutex<VersionManager>,
}

/// The name of the log holding article `name` of wiki `wiki`.
pub fn log_name(wiki: &str, name: &str) -> String {
    format!("{wiki}::{name}")
}

fn decode_version(entry: &LogEntry) -> Result<Version, ArticleError> {
    postcard::from_bytes(&entry.payload).context(DecodeVersionSnafu { hash: entry.hash })
}

impl<L: ReplicatedLog> Article<L> {
    /// Creates a new article with a fresh log.
    ///
    /// Does not wait for peers, a new article has nobody to sync with.
    pub async fn create<S>(store: &S, wiki: &str, name: &str) -> Result<Self, ArticleError>
    where
        S: LogStore<Log = L>,
    {
        let log_name = log_name(wiki, name);
        let (log, _) =
            open_and_maybe_sync(store, LogTarget::Name(&log_name), SyncMode::Create).await?;
        let article = Self::from_handle(name, log);
        // The log may already hold versions if the name was used before.
        article.refresh().await?;
        Ok(article)
    }

    /// Opens the log of an existing article and replays it.
    ///
    /// With [`SyncMode::WaitForSync`], waits (bounded) for the log to sync first. A timeout is
    /// not an error, the replay then only sees what is stored locally.
    pub async fn open_existing<S>(
        store: &S,
        name: &str,
        address: &LogAddress,
        mode: SyncMode,
    ) -> Result<Self, ArticleError>
    where
        S: LogStore<Log = L>,
    {
        let (log, synced) = open_and_maybe_sync(store, LogTarget::Address(address), mode).await?;
        if !synced {
            debug!(article = %name, "opened article log without sync");
        }
        let article = Self::from_handle(name, log);
        article.refresh().await?;
        Ok(article)
    }

    fn from_handle(name: &str, log: LogHandle<L>) -> Self {
        Self {
            name: name.to_string(),
            log,
            versions: Mutex::new(VersionManager::new()),
        }
    }

    /// The article name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The address of the article log.
    pub fn address(&self) -> LogAddress {
        self.log.address()
    }

    /// The article log.
    pub fn log(&self) -> &LogHandle<L> {
        &self.log
    }

    /// Replays the log, adding versions not yet known.
    ///
    /// Entries that cannot be decoded or conflict with a known version are skipped. Returns
    /// the number of versions added.
    pub async fn refresh(&self) -> Result<usize, ArticleError> {
        let entries = self.log.log().entries().await?;
        let mut versions = self.versions.lock();
        let mut added = 0;
        for entry in &entries {
            let version = match decode_version(entry) {
                Ok(version) => version,
                Err(err) => {
                    warn!(article = %self.name, "skipping log entry: {err:#}");
                    continue;
                }
            };
            match versions.add_version(version) {
                Ok(true) => added += 1,
                Ok(false) => {}
                Err(err) => warn!(article = %self.name, "skipping version: {err:#}"),
            }
        }
        if added > 0 {
            debug!(article = %self.name, added, total = versions.len(), "versions loaded");
        }
        Ok(added)
    }

    /// Writes `content` as a new version derived from `parent`, or as the first version when
    /// `parent` is `None`.
    pub async fn new_content(
        &self,
        content: &str,
        parent: Option<VersionId>,
    ) -> Result<VersionId, ArticleError> {
        let version = {
            let mut versions = self.versions.lock();
            let old_text = match parent {
                Some(parent) => compile_text_from_versions(versions.get_branch(&parent)?)?,
                None => String::new(),
            };
            let version = Version::new(&old_text, content, parent);
            versions.add_version(version.clone())?;
            version
        };
        let payload = postcard::to_allocvec(&version).context(EncodeVersionSnafu)?;
        self.log.log().append(Bytes::from(payload)).await?;
        debug!(article = %self.name, id = %version.id.fmt_short(), "new version");
        Ok(version.id)
    }

    /// The text at `id`, or at the tip of the main branch if `id` is `None`.
    pub fn get_content(&self, id: Option<&VersionId>) -> Result<String, ArticleError> {
        let versions = self.versions.lock();
        let branch = match id {
            Some(id) => versions.get_branch(id)?,
            None => versions.get_main_branch()?,
        };
        Ok(compile_text_from_versions(branch)?)
    }

    /// Metadata of every known version, ordered by date.
    pub fn get_versions(&self) -> Result<Vec<VersionInfo>, ArticleError> {
        let versions = self.versions.lock();
        let main: HashSet<VersionId> = versions
            .get_main_branch()?
            .into_iter()
            .map(|v| v.id)
            .collect();
        let mut infos: Vec<VersionInfo> = versions
            .get_all_versions()
            .map(|v| VersionInfo {
                id: v.id,
                date: v.date,
                parent: v.parent,
                main_branch: main.contains(&v.id),
            })
            .collect();
        infos.sort_by_key(|info| (info.date, info.id));
        Ok(infos)
    }

    /// The tip of the main branch.
    pub fn current_version_id(&self) -> Result<VersionId, ArticleError> {
        Ok(self.versions.lock().current_version_id()?)
    }

    /// Stops replicating the article log.
    pub async fn close(&self) -> Result<(), ArticleError> {
        self.log.log().close().await?;
        Ok(())
    }
}
