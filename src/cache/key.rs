//! Cache key derivation from registry request paths.
//!
//! Tarball URLs look like `/{name}/-/{name}-{version}.tgz` or, for scoped
//! packages, `/@{scope}/{name}/-/{name}-{version}.tgz`.  Components are kept
//! verbatim and mirrored under the cache root, so the file the populator
//! writes is the file the cache server later resolves for the same path.

use std::fmt;
use std::path::{Path, PathBuf};

/// Minimum number of `/`-separated segments (the empty one before the
/// leading slash included) an artifact path must have.
pub const MIN_SEGMENTS: usize = 4;

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Return `true` when `path` ends in one of the archive `extensions`.
pub fn is_archive_path<S: AsRef<str>>(path: &str, extensions: &[S]) -> bool {
    extensions
        .iter()
        .any(|ext| path.ends_with(ext.as_ref()))
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A request path that cannot be mapped to a location inside the cache root.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathResolutionError {
    #[error("path must start with '/': {0:?}")]
    NotAbsolute(String),
    #[error("path has {found} segments, at least 4 required: {path:?}")]
    TooShort { path: String, found: usize },
    #[error("unsafe path component {component:?} in {path:?}")]
    UnsafeComponent { path: String, component: String },
    #[error("directory component {component:?} looks like an archive in {path:?}")]
    ArchiveDirectory { path: String, component: String },
}

// ---------------------------------------------------------------------------
// CacheKey
// ---------------------------------------------------------------------------

/// Identity of a cached artifact: `(scope, package name, filename)` plus the
/// verbatim components in between.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    components: Vec<String>,
}

impl CacheKey {
    /// Split `path` into components and validate each one.
    ///
    /// The path must be absolute and carry at least [`MIN_SEGMENTS`]
    /// segments.  Components that are empty, `.`/`..`, hidden (leading `.`
    /// or `%2e`), or contain a backslash or NUL are rejected since the path
    /// is client-controlled and ends up as a filesystem location.
    pub fn from_request_path(path: &str) -> Result<Self, PathResolutionError> {
        let Some(rest) = path.strip_prefix('/') else {
            return Err(PathResolutionError::NotAbsolute(path.to_string()));
        };

        let components: Vec<&str> = rest.split('/').collect();
        let found = components.len() + 1;
        if found < MIN_SEGMENTS {
            return Err(PathResolutionError::TooShort {
                path: path.to_string(),
                found,
            });
        }

        for component in &components {
            if !is_safe_component(component) {
                return Err(PathResolutionError::UnsafeComponent {
                    path: path.to_string(),
                    component: (*component).to_string(),
                });
            }
        }

        Ok(Self {
            components: components.into_iter().map(str::to_owned).collect(),
        })
    }

    /// Like [`from_request_path`](Self::from_request_path), but also rejects
    /// paths whose directory components end in one of the archive
    /// `extensions`.  Such a key would create a directory where another
    /// key's archive belongs.
    pub fn for_archive<S: AsRef<str>>(
        path: &str,
        extensions: &[S],
    ) -> Result<Self, PathResolutionError> {
        let key = Self::from_request_path(path)?;
        let dirs = &key.components[..key.components.len() - 1];
        if let Some(dir) = dirs.iter().find(|c| is_archive_path(c.as_str(), extensions)) {
            return Err(PathResolutionError::ArchiveDirectory {
                path: path.to_string(),
                component: dir.clone(),
            });
        }
        Ok(key)
    }

    /// The `@scope` component, if the package is scoped.
    pub fn scope(&self) -> Option<&str> {
        self.components
            .first()
            .map(String::as_str)
            .filter(|c| c.starts_with('@'))
    }

    pub fn package_name(&self) -> &str {
        let idx = usize::from(self.scope().is_some());
        &self.components[idx]
    }

    pub fn filename(&self) -> &str {
        // `from_request_path` guarantees at least three components.
        &self.components[self.components.len() - 1]
    }

    /// Cache-relative path, e.g. `@scope/pkg/-/pkg-1.0.0.tgz`.
    pub fn relative_path(&self) -> PathBuf {
        self.components.iter().collect()
    }

    /// Absolute location of the artifact under `root`.
    pub fn path_in(&self, root: &Path) -> PathBuf {
        root.join(self.relative_path())
    }

    /// The request path this key was derived from.
    pub fn request_path(&self) -> String {
        format!("/{}", self.components.join("/"))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.components.join("/"))
    }
}

fn is_safe_component(component: &str) -> bool {
    // `%2e` decodes to `.`; origins normalise `%2e%2e` like `..`.
    let encoded_dot = component
        .get(..3)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("%2e"));
    !(component.is_empty()
        || encoded_dot
        || component.starts_with('.')
        || component.contains('\\')
        || component.contains('\0'))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // ── is_archive_path ────────────────────────────────────────────────

    #[test]
    fn tarball_is_archive() {
        assert!(is_archive_path("/pkg/-/pkg-1.0.0.tgz", &[".tgz"]));
        assert!(is_archive_path("/@scope/pkg/-/pkg-1.0.0.tgz", &[".tgz"]));
    }

    #[test]
    fn metadata_is_not_archive() {
        assert!(!is_archive_path("/@scope/pkg", &[".tgz"]));
        assert!(!is_archive_path("/pkg", &[".tgz"]));
        assert!(!is_archive_path("/-/v1/search", &[".tgz"]));
    }

    #[test]
    fn extension_must_be_a_suffix() {
        assert!(!is_archive_path("/pkg/-/pkg-1.0.0.tgz.sig", &[".tgz"]));
        assert!(!is_archive_path("/pkg/-/pkg-1.0.0.tgz/", &[".tgz"]));
    }

    #[test]
    fn configured_extensions_are_honoured() {
        let exts = vec![".tgz".to_string(), ".tar.gz".to_string()];
        assert!(is_archive_path("/pkg/-/pkg-1.0.0.tar.gz", &exts[..]));
        assert!(!is_archive_path("/pkg/-/pkg-1.0.0.zip", &exts[..]));
    }

    // ── from_request_path ──────────────────────────────────────────────

    #[test]
    fn unscoped_key() {
        let key = CacheKey::from_request_path("/lodash/-/lodash-4.17.21.tgz").unwrap();
        assert_eq!(key.scope(), None);
        assert_eq!(key.package_name(), "lodash");
        assert_eq!(key.filename(), "lodash-4.17.21.tgz");
        assert_eq!(
            key.relative_path(),
            PathBuf::from("lodash/-/lodash-4.17.21.tgz")
        );
    }

    #[test]
    fn scoped_key() {
        let key = CacheKey::from_request_path("/@scope/pkg/-/pkg-1.0.0.tgz").unwrap();
        assert_eq!(key.scope(), Some("@scope"));
        assert_eq!(key.package_name(), "pkg");
        assert_eq!(key.filename(), "pkg-1.0.0.tgz");
        assert_eq!(key.to_string(), "@scope/pkg/-/pkg-1.0.0.tgz");
        assert_eq!(key.request_path(), "/@scope/pkg/-/pkg-1.0.0.tgz");
    }

    #[test]
    fn components_are_kept_verbatim() {
        let key = CacheKey::from_request_path("/Pkg/-/Pkg-1.0.0.TGZ").unwrap();
        assert_eq!(key.filename(), "Pkg-1.0.0.TGZ");
        let encoded = CacheKey::from_request_path("/@scope%2fpkg/-/pkg-1.0.0.tgz").unwrap();
        assert_eq!(encoded.scope(), Some("@scope%2fpkg"));
    }

    #[test]
    fn path_in_root() {
        let key = CacheKey::from_request_path("/@scope/pkg/-/pkg-1.0.0.tgz").unwrap();
        assert_eq!(
            key.path_in(Path::new("/var/cache/tarcache")),
            PathBuf::from("/var/cache/tarcache/@scope/pkg/-/pkg-1.0.0.tgz")
        );
    }

    #[test]
    fn rejects_short_paths() {
        assert_eq!(
            CacheKey::from_request_path("/pkg-1.0.0.tgz"),
            Err(PathResolutionError::TooShort {
                path: "/pkg-1.0.0.tgz".into(),
                found: 2,
            })
        );
        assert!(matches!(
            CacheKey::from_request_path("/pkg/pkg-1.0.0.tgz"),
            Err(PathResolutionError::TooShort { found: 3, .. })
        ));
    }

    #[test]
    fn three_components_is_enough() {
        assert!(CacheKey::from_request_path("/a/b/c.tgz").is_ok());
    }

    #[test]
    fn rejects_relative_path() {
        assert!(matches!(
            CacheKey::from_request_path("pkg/-/pkg-1.0.0.tgz"),
            Err(PathResolutionError::NotAbsolute(_))
        ));
    }

    #[test]
    fn rejects_traversal() {
        for path in [
            "/../../etc/passwd.tgz",
            "/pkg/../../x.tgz",
            "/pkg/-/../x.tgz",
            "/pkg/./-/x.tgz",
        ] {
            assert!(
                matches!(
                    CacheKey::from_request_path(path),
                    Err(PathResolutionError::UnsafeComponent { .. })
                ),
                "{path} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_percent_encoded_dot_segments() {
        for path in [
            "/evil/%2e%2e/pkg/-/pkg-1.0.0.tgz",
            "/evil/%2E./pkg/-/pkg-1.0.0.tgz",
            "/evil/.%2e/pkg/-/pkg-1.0.0.tgz",
            "/pkg/%2e/-/pkg-1.0.0.tgz",
        ] {
            assert!(
                matches!(
                    CacheKey::from_request_path(path),
                    Err(PathResolutionError::UnsafeComponent { .. })
                ),
                "{path} should be rejected"
            );
        }
        // Encoded characters other than a leading dot stay verbatim.
        assert!(CacheKey::from_request_path("/pkg/-/pkg%2e1.0.0.tgz").is_ok());
    }

    #[test]
    fn archive_keys_reject_archive_named_directories() {
        let err = CacheKey::for_archive("/lodash/-/lodash-4.17.21.tgz/x/y.tgz", &[".tgz"])
            .unwrap_err();
        assert_eq!(
            err,
            PathResolutionError::ArchiveDirectory {
                path: "/lodash/-/lodash-4.17.21.tgz/x/y.tgz".into(),
                component: "lodash-4.17.21.tgz".into(),
            }
        );

        let key = CacheKey::for_archive("/lodash/-/lodash-4.17.21.tgz", &[".tgz"]).unwrap();
        assert_eq!(key.filename(), "lodash-4.17.21.tgz");
    }

    #[test]
    fn rejects_hidden_and_empty_components() {
        assert!(CacheKey::from_request_path("/pkg/-/.pkg-1.0.0.tgz.abc.part").is_err());
        assert!(CacheKey::from_request_path("//pkg/-/pkg-1.0.0.tgz").is_err());
        assert!(CacheKey::from_request_path("/pkg//pkg-1.0.0.tgz").is_err());
    }

    #[test]
    fn rejects_backslash_and_nul() {
        assert!(CacheKey::from_request_path("/pkg/-/..\\x.tgz").is_err());
        assert!(CacheKey::from_request_path("/pkg/-/x\0.tgz").is_err());
    }
}
