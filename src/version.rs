//! Version history of a single article.
//!
//! Every edit of an article is a [`Version`]: a [`Patch`] against the text of its parent
//! version. The versions of an article form a forest, and readers agree on a single
//! [main branch](VersionManager::get_main_branch) through it: the longest chain wins, and among
//! chains of equal length the one whose tip is most recent. Ties on the date are broken by the
//! version id, so the selection is a total order and never depends on the order in which versions
//! were received.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    fmt::{self, Display},
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, Snafu, ensure};

pub use self::patch::{Patch, PatchError, PatchOp};
use crate::ids::{LengthSnafu, ParseError};

mod patch;

/// Identifier of a [`Version`], unique within an article.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VersionId([u8; 16]);

impl VersionId {
    /// Creates a new random id.
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Creates an id from raw bytes.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// The raw bytes of this id.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Format a short representation, for logging.
    pub fn fmt_short(&self) -> String {
        data_encoding::HEXLOWER.encode(&self.0[..4])
    }
}

impl Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", data_encoding::HEXLOWER.encode(&self.0))
    }
}

impl fmt::Debug for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VersionId({})", self.fmt_short())
    }
}

impl FromStr for VersionId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = data_encoding::HEXLOWER_PERMISSIVE
            .decode(s.as_bytes())
            .map_err(|source| ParseError::Encoding { source })?;
        let bytes: [u8; 16] = bytes.as_slice().try_into().ok().context(LengthSnafu {
            expected: 16usize,
            actual: bytes.len(),
        })?;
        Ok(Self(bytes))
    }
}

impl Serialize for VersionId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_string())
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for VersionId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            Self::from_str(&s).map_err(serde::de::Error::custom)
        } else {
            let data: [u8; 16] = Deserialize::deserialize(deserializer)?;
            Ok(Self(data))
        }
    }
}

/// One revision of an article.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    /// Unique id of this version.
    pub id: VersionId,
    /// Creation time, in milliseconds since the UNIX epoch.
    pub date: u64,
    /// Patch from the parent's text to this version's text.
    pub patch: Patch,
    /// The version this one was derived from, `None` for a root.
    pub parent: Option<VersionId>,
}

impl Version {
    /// Creates a new version turning `old_text` into `new_text`.
    pub fn new(old_text: &str, new_text: &str, parent: Option<VersionId>) -> Self {
        Self {
            id: VersionId::random(),
            date: now_millis(),
            patch: Patch::diff(old_text, new_text),
            parent,
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Errors reconstructing the history of an article.
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum VersionError {
    #[snafu(display("Version not found: {id}"))]
    VersionNotFound { id: VersionId },
    #[snafu(display("Article has no versions"))]
    NoVersions {},
    #[snafu(display("Failed to apply patch {index} (version {id})"))]
    PatchApply {
        index: usize,
        id: VersionId,
        source: PatchError,
    },
    #[snafu(display("Version {id} already exists with different content"))]
    DuplicateVersion { id: VersionId },
    #[snafu(display("Parent links starting at {id} form a cycle"))]
    VersionCycle { id: VersionId },
}

/// Rebuilds the text at the end of `branch`, starting from the empty text.
pub fn compile_text_from_versions<'a>(
    branch: impl IntoIterator<Item = &'a Version>,
) -> Result<String, VersionError> {
    let mut text = String::new();
    for (index, version) in branch.into_iter().enumerate() {
        text = version
            .patch
            .apply(&text)
            .context(PatchApplySnafu {
                index,
                id: version.id,
            })?;
    }
    Ok(text)
}

/// All versions of one article known locally.
#[derive(Debug, Clone, Default)]
pub struct VersionManager {
    versions: BTreeMap<VersionId, Version>,
}

impl VersionManager {
    /// Creates an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a version.
    ///
    /// Returns `false` if the exact same version was already present.
    pub fn add_version(&mut self, version: Version) -> Result<bool, VersionError> {
        match self.versions.get(&version.id) {
            Some(existing) if *existing == version => Ok(false),
            Some(_) => DuplicateVersionSnafu { id: version.id }.fail(),
            None => {
                self.versions.insert(version.id, version);
                Ok(true)
            }
        }
    }

    /// Looks up a version by id.
    pub fn get(&self, id: &VersionId) -> Option<&Version> {
        self.versions.get(id)
    }

    /// Number of known versions.
    pub fn len(&self) -> usize {
        self.versions.len()
    }

    /// Whether no version is known.
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// All known versions, ordered by id.
    pub fn get_all_versions(&self) -> impl Iterator<Item = &Version> {
        self.versions.values()
    }

    /// Versions that are nobody's parent.
    pub fn leaves(&self) -> BTreeSet<VersionId> {
        let parents: HashSet<VersionId> =
            self.versions.values().filter_map(|v| v.parent).collect();
        self.versions
            .keys()
            .filter(|id| !parents.contains(id))
            .copied()
            .collect()
    }

    /// Returns the versions from the root down to `id`.
    pub fn get_branch(&self, id: &VersionId) -> Result<Vec<&Version>, VersionError> {
        let mut branch = Vec::new();
        let mut current = Some(*id);
        while let Some(cur) = current {
            let version = self
                .versions
                .get(&cur)
                .context(VersionNotFoundSnafu { id: cur })?;
            ensure!(
                branch.len() < self.versions.len(),
                VersionCycleSnafu { id: *id }
            );
            branch.push(version);
            current = version.parent;
        }
        branch.reverse();
        Ok(branch)
    }

    /// Returns the main branch, from the root down to the preferred leaf.
    ///
    /// Empty if no versions are known.
    pub fn get_main_branch(&self) -> Result<Vec<&Version>, VersionError> {
        match self.main_leaf()? {
            Some(leaf) => self.get_branch(&leaf),
            None => Ok(Vec::new()),
        }
    }

    /// The tip of the main branch.
    pub fn current_version_id(&self) -> Result<VersionId, VersionError> {
        self.main_leaf()?.context(NoVersionsSnafu)
    }

    /// Selects the leaf the main branch ends at.
    fn main_leaf(&self) -> Result<Option<VersionId>, VersionError> {
        let mut memo = HashMap::new();
        let mut best: Option<(usize, u64, VersionId)> = None;
        for leaf in self.leaves() {
            let distance = self.root_distance(&leaf, &mut memo)?;
            let date = self.versions.get(&leaf).map(|v| v.date).unwrap_or_default();
            let key = (distance, date, leaf);
            if best.is_none_or(|best| key > best) {
                best = Some(key);
            }
        }
        Ok(best.map(|(_, _, id)| id))
    }

    /// Number of ancestors of `id`, memoized across calls sharing `memo`.
    fn root_distance(
        &self,
        id: &VersionId,
        memo: &mut HashMap<VersionId, usize>,
    ) -> Result<usize, VersionError> {
        let mut path = Vec::new();
        let mut current = Some(*id);
        let mut known = None;
        while let Some(cur) = current {
            if let Some(distance) = memo.get(&cur) {
                known = Some(*distance);
                break;
            }
            let version = self
                .versions
                .get(&cur)
                .context(VersionNotFoundSnafu { id: cur })?;
            ensure!(
                path.len() < self.versions.len(),
                VersionCycleSnafu { id: *id }
            );
            path.push(cur);
            current = version.parent;
        }

        // `path` runs from `id` up to either a root or the first memoized ancestor.
        let mut next = known.map_or(0, |d| d + 1);
        let mut distance = known.unwrap_or_default();
        for cur in path.into_iter().rev() {
            memo.insert(cur, next);
            distance = next;
            next += 1;
        }
        Ok(distance)
    }
}
