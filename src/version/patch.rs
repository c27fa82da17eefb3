//! Text patches between two revisions of an article.

use serde::{Deserialize, Serialize};
use similar::{ChangeTag, TextDiff};
use snafu::{OptionExt, Snafu, ensure};

/// Error applying a [`Patch`] to a text it was not computed against.
#[allow(missing_docs)]
#[derive(Debug, Snafu, PartialEq, Eq)]
#[non_exhaustive]
pub enum PatchError {
    #[snafu(display("retained span of {len} bytes at offset {offset} exceeds the base text"))]
    RetainOutOfBounds { offset: usize, len: usize },
    #[snafu(display("deleted text does not match the base text at offset {offset}"))]
    DeleteMismatch { offset: usize },
    #[snafu(display("patch left {remaining} bytes of the base text unconsumed"))]
    TrailingText { remaining: usize },
}

/// One step of a [`Patch`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatchOp {
    /// Keep the next `n` bytes of the base text.
    Retain(usize),
    /// Drop the given text, which must be next in the base text.
    Delete(String),
    /// Emit the given text.
    Insert(String),
}

/// Ordered diff operations transforming a parent text into a child text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch(Vec<PatchOp>);

impl Patch {
    /// Computes the patch turning `old` into `new`.
    pub fn diff(old: &str, new: &str) -> Self {
        let diff = TextDiff::from_chars(old, new);
        let mut ops: Vec<PatchOp> = Vec::new();
        for change in diff.iter_all_changes() {
            let value = change.value();
            match (change.tag(), ops.last_mut()) {
                (ChangeTag::Equal, Some(PatchOp::Retain(n))) => *n += value.len(),
                (ChangeTag::Equal, _) => ops.push(PatchOp::Retain(value.len())),
                (ChangeTag::Delete, Some(PatchOp::Delete(s))) => s.push_str(value),
                (ChangeTag::Delete, _) => ops.push(PatchOp::Delete(value.to_string())),
                (ChangeTag::Insert, Some(PatchOp::Insert(s))) => s.push_str(value),
                (ChangeTag::Insert, _) => ops.push(PatchOp::Insert(value.to_string())),
            }
        }
        Self(ops)
    }

    /// Applies the patch to `base`.
    ///
    /// Fails unless `base` is exactly the text the patch was computed against, as far as the
    /// retained lengths and deleted spans can tell.
    pub fn apply(&self, base: &str) -> Result<String, PatchError> {
        let mut out = String::with_capacity(base.len());
        let mut offset: usize = 0;
        for op in &self.0 {
            match op {
                PatchOp::Retain(len) => {
                    let end = offset
                        .checked_add(*len)
                        .filter(|end| *end <= base.len() && base.is_char_boundary(*end))
                        .context(RetainOutOfBoundsSnafu { offset, len: *len })?;
                    out.push_str(&base[offset..end]);
                    offset = end;
                }
                PatchOp::Delete(text) => {
                    ensure!(
                        base[offset..].starts_with(text.as_str()),
                        DeleteMismatchSnafu { offset }
                    );
                    offset += text.len();
                }
                PatchOp::Insert(text) => out.push_str(text),
            }
        }
        ensure!(
            offset == base.len(),
            TrailingTextSnafu {
                remaining: base.len() - offset
            }
        );
        Ok(out)
    }

    /// The operations of this patch.
    pub fn ops(&self) -> &[PatchOp] {
        &self.0
    }

    /// Whether the patch leaves its base unchanged.
    pub fn is_identity(&self) -> bool {
        self.0.iter().all(|op| matches!(op, PatchOp::Retain(_)))
    }
}

impl From<Vec<PatchOp>> for Patch {
    fn from(ops: Vec<PatchOp>) -> Self {
        Self(ops)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn diff_from_empty_is_single_insert() {
        let patch = Patch::diff("", "hello");
        assert_eq!(patch.ops(), &[PatchOp::Insert("hello".into())]);
        assert_eq!(patch.apply("").unwrap(), "hello");
    }

    #[test]
    fn diff_coalesces_runs() {
        let patch = Patch::diff("hello world", "hello there world");
        match patch.ops() {
            [PatchOp::Retain(a), PatchOp::Insert(text), PatchOp::Retain(b)] => {
                assert_eq!(a + b, "hello world".len());
                assert_eq!(text.len(), "there ".len());
            }
            ops => panic!("unexpected ops: {ops:?}"),
        }
        assert_eq!(patch.apply("hello world").unwrap(), "hello there world");
    }

    #[test]
    fn apply_handles_multibyte_text() {
        let old = "añejo café";
        let new = "añejo té con café ☕";
        let patch = Patch::diff(old, new);
        assert_eq!(patch.apply(old).unwrap(), new);
    }

    #[test]
    fn apply_rejects_foreign_base() {
        let patch = Patch::diff("abc", "abXc");
        assert!(patch.apply("zzzzzz").is_err());
        assert_eq!(
            patch.apply("abcdef"),
            Err(PatchError::TrailingText { remaining: 3 })
        );

        let patch = Patch::diff("abc", "ac");
        assert_eq!(
            patch.apply("axc"),
            Err(PatchError::DeleteMismatch { offset: 1 })
        );
    }

    #[test]
    fn apply_rejects_short_base() {
        let patch = Patch::diff("abcdef", "abcdefg");
        assert_eq!(
            patch.apply("abc"),
            Err(PatchError::RetainOutOfBounds { offset: 0, len: 6 })
        );
    }

    #[test]
    fn apply_rejects_oversized_retain() {
        let patch = Patch::from(vec![PatchOp::Retain(1), PatchOp::Retain(usize::MAX)]);
        assert_eq!(
            patch.apply("ab"),
            Err(PatchError::RetainOutOfBounds {
                offset: 1,
                len: usize::MAX
            })
        );
        let patch = Patch::from(vec![PatchOp::Retain(usize::MAX)]);
        assert!(patch.apply("").is_err());
    }

    #[test]
    fn identity_patch() {
        let patch = Patch::diff("same", "same");
        assert!(patch.is_identity());
        assert_eq!(patch.apply("same").unwrap(), "same");
    }
}
