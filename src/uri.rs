//! TileDB resource identifiers.
//!
//! A [`URI`] names a group, array, fragment, or file on one of the
//! [`Vfs`](crate::vfs::Vfs) backends. It is an immutable `scheme://path`
//! pair in canonical form; two URIs are equal iff their canonical forms are
//! byte equal.

use std::path::PathBuf;

use thiserror::Error;

/// An invalid URI error.
#[derive(Debug, Error)]
#[error("invalid URI `{0}`")]
pub struct UriError(String);

/// A canonical `scheme://path` resource identifier.
///
/// Scheme-less input is interpreted as a path on the local filesystem and
/// canonicalised to a `file://` URI with an absolute path. `.` and `..`
/// segments are resolved textually and repeated separators are collapsed.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct URI(String);

impl URI {
    /// Create a `URI` from `uri`, canonicalising it.
    ///
    /// # Errors
    /// Returns a [`UriError`] if `uri` is empty, has an empty scheme or
    /// path, or is a relative path and the current directory cannot be
    /// resolved.
    pub fn new(uri: &str) -> Result<Self, UriError> {
        if uri.is_empty() {
            return Err(UriError(uri.to_string()));
        }
        if let Some((scheme, path)) = uri.split_once("://") {
            if scheme.is_empty() || path.is_empty() {
                return Err(UriError(uri.to_string()));
            }
            let leading = if path.starts_with('/') { "/" } else { "" };
            Ok(Self(format!(
                "{scheme}://{leading}{}",
                normalize(path.trim_start_matches('/'))
            )))
        } else {
            let path = if uri.starts_with('/') {
                uri.to_string()
            } else {
                let cwd = std::env::current_dir().map_err(|_| UriError(uri.to_string()))?;
                format!("{}/{uri}", cwd.to_string_lossy())
            };
            Ok(Self(format!(
                "file:///{}",
                normalize(path.trim_start_matches('/'))
            )))
        }
    }

    /// The URI scheme (e.g. `file`, `mem`).
    #[must_use]
    pub fn scheme(&self) -> &str {
        self.0.split_once("://").map_or("", |(scheme, _)| scheme)
    }

    /// The path component, i.e. everything after `scheme://`.
    #[must_use]
    pub fn path(&self) -> &str {
        self.0.split_once("://").map_or("", |(_, path)| path)
    }

    /// The canonical form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Append a path segment.
    #[must_use]
    pub fn join(&self, segment: &str) -> Self {
        Self(format!("{}/{}", self.0, segment.trim_matches('/')))
    }

    /// The last path segment (e.g. the fragment name of a fragment URI).
    #[must_use]
    pub fn last_path_part(&self) -> &str {
        self.path().rsplit('/').next().unwrap_or("")
    }

    /// The URI with the last path segment removed, or [`None`] at a root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        let path = self.path().trim_start_matches('/');
        let (parent, _) = path.rsplit_once('/')?;
        let leading = if self.path().starts_with('/') { "/" } else { "" };
        Some(Self(format!("{}://{leading}{parent}", self.scheme())))
    }

    /// Whether this is a `file` scheme URI.
    #[must_use]
    pub fn is_file_scheme(&self) -> bool {
        self.scheme() == "file"
    }

    /// The local filesystem path of a `file` scheme URI.
    #[must_use]
    pub fn to_path(&self) -> PathBuf {
        PathBuf::from(self.path())
    }
}

impl std::fmt::Display for URI {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for URI {
    type Error = UriError;
    fn try_from(uri: &str) -> Result<Self, Self::Error> {
        Self::new(uri)
    }
}

/// Resolve `.`/`..` segments and collapse repeated separators.
/// The input must not have a leading separator.
fn normalize(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            _ => segments.push(segment),
        }
    }
    segments.join("/")
}
