//! Field Projection
//!
//! A projection restricts transposed decoding to a set of field paths,
//! so unneeded columns are never decompressed or copied. A field path is
//! the sequence of field numbers leading to a (possibly nested) field:
//! `[2]` is top-level field 2, `[2, 7]` is field 7 inside the
//! sub-message at field 2.
//!
//! ## Coverage
//! A field survives projection when its path and some projected path are
//! prefix-related in either direction:
//!
//! - projecting `[2]` keeps `[2, 7]` (everything under field 2), and
//! - projecting `[2, 7]` keeps the enclosing field 2 itself, since the
//!   sub-message framing is needed to reach field 7.
//!
//! Records that are not wire-format messages have no field structure and
//! always pass through whole.
//!
//! Projection only affects transposed chunks; simple chunks store records
//! as opaque byte strings and are always decoded in full.

/// A path of field numbers identifying a nested field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath(Vec<u32>);

impl FieldPath {
    pub fn new(fields: impl Into<Vec<u32>>) -> Self {
        Self(fields.into())
    }

    pub fn fields(&self) -> &[u32] {
        &self.0
    }
}

impl From<Vec<u32>> for FieldPath {
    fn from(fields: Vec<u32>) -> Self {
        Self(fields)
    }
}

impl From<&[u32]> for FieldPath {
    fn from(fields: &[u32]) -> Self {
        Self(fields.to_vec())
    }
}

impl<const N: usize> From<[u32; N]> for FieldPath {
    fn from(fields: [u32; N]) -> Self {
        Self(fields.to_vec())
    }
}

/// A set of field paths to retain, or the include-all sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FieldProjection {
    /// `None` means include everything.
    paths: Option<Vec<FieldPath>>,
}

impl FieldProjection {
    /// Include every field (projection disabled).
    pub fn all() -> Self {
        Self { paths: None }
    }

    /// Include only the fields covered by `paths`.
    pub fn new(paths: impl IntoIterator<Item = FieldPath>) -> Self {
        Self {
            paths: Some(paths.into_iter().collect()),
        }
    }

    pub fn includes_all(&self) -> bool {
        self.paths.is_none()
    }

    /// Whether a field at `path` survives this projection.
    pub fn covers(&self, path: &[u32]) -> bool {
        match &self.paths {
            None => true,
            Some(paths) => paths
                .iter()
                .any(|p| path.starts_with(&p.0) || p.0.starts_with(path)),
        }
    }
}
