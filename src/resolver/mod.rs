//! Module source classification and host-default resolution
//!
//! Every module a context loads is identified by a [`ModuleSource`]:
//! - file paths, resolved Node-style through oxc_resolver
//! - `https:` URLs, fetched over the network
//! - `blob:` URLs, read from the blob store that created them
//! - `data:` URLs, decoded inline

use oxc_resolver::{ResolveOptions, Resolver};
use percent_encoding::{NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

/// Errors that can occur during module resolution
#[derive(Error, Debug)]
pub enum ResolverError {
    #[error("Failed to resolve module '{0}': {1}")]
    ResolutionFailed(String, String),

    #[error("Unsupported URL scheme in '{0}'")]
    UnsupportedScheme(String),

    #[error("Invalid module URL '{0}'")]
    InvalidUrl(String),
}

/// Result type for module resolution operations
pub type ResolverResult<T> = Result<T, ResolverError>;

/// Stand-in file URL for a `blob:` URL, for hook contracts whose URL argument
/// cannot carry the `blob:` scheme
pub const EPHEMERAL_SENTINEL_PREFIX: &str = "file:///.spindle/blob/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    File,
    Remote,
    Ephemeral,
    Data,
}

/// A resolved module location
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ModuleSource {
    File(PathBuf),
    Remote(Url),
    /// The full `blob:` URL, which doubles as the registry token
    Ephemeral(String),
    Data(String),
}

fn has_scheme(specifier: &str, scheme: &str) -> bool {
    specifier
        .get(..scheme.len())
        .is_some_and(|s| s.eq_ignore_ascii_case(scheme))
}

pub fn is_remote(specifier: &str) -> bool {
    has_scheme(specifier, "https:")
}

pub fn is_ephemeral(specifier: &str) -> bool {
    has_scheme(specifier, "blob:")
}

pub fn is_data(specifier: &str) -> bool {
    has_scheme(specifier, "data:")
}

pub fn wrap_ephemeral(url: &str) -> String {
    format!(
        "{EPHEMERAL_SENTINEL_PREFIX}{}",
        utf8_percent_encode(url, NON_ALPHANUMERIC)
    )
}

/// Recover the `blob:` URL from its sentinel form
pub fn unwrap_ephemeral(url: &str) -> Option<String> {
    let encoded = url.strip_prefix(EPHEMERAL_SENTINEL_PREFIX)?;
    percent_decode_str(encoded)
        .decode_utf8()
        .ok()
        .map(|s| s.into_owned())
        .filter(|s| is_ephemeral(s))
}

impl ModuleSource {
    /// Classify an already-resolved module URL or absolute path
    pub fn parse(url: &str) -> Option<Self> {
        if let Some(token) = unwrap_ephemeral(url) {
            return Some(ModuleSource::Ephemeral(token));
        }
        if is_ephemeral(url) {
            return Some(ModuleSource::Ephemeral(url.to_string()));
        }
        if is_data(url) {
            return Some(ModuleSource::Data(url.to_string()));
        }
        if is_remote(url) {
            return Url::parse(url).ok().map(ModuleSource::Remote);
        }
        if has_scheme(url, "file:") {
            return Url::parse(url)
                .ok()
                .and_then(|u| u.to_file_path().ok())
                .map(ModuleSource::File);
        }
        let path = Path::new(url);
        path.is_absolute().then(|| ModuleSource::File(path.to_path_buf()))
    }

    /// Recover the source of a module from the path it was parsed with
    pub fn from_source_path(path: &Path) -> Option<Self> {
        Self::parse(&path.to_string_lossy())
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            ModuleSource::File(_) => SourceKind::File,
            ModuleSource::Remote(_) => SourceKind::Remote,
            ModuleSource::Ephemeral(_) => SourceKind::Ephemeral,
            ModuleSource::Data(_) => SourceKind::Data,
        }
    }

    /// Path handed to the engine with the module's source text
    pub fn source_path(&self) -> PathBuf {
        match self {
            ModuleSource::File(path) => path.clone(),
            other => PathBuf::from(other.to_string()),
        }
    }

    /// Directory that relative file specifiers resolve against, if any
    pub fn directory(&self) -> Option<&Path> {
        match self {
            ModuleSource::File(path) => path.parent(),
            _ => None,
        }
    }
}

impl fmt::Display for ModuleSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleSource::File(path) => write!(f, "{}", path.display()),
            ModuleSource::Remote(url) => write!(f, "{url}"),
            ModuleSource::Ephemeral(url) | ModuleSource::Data(url) => f.write_str(url),
        }
    }
}

/// Node.js-compatible file resolver for ES modules
pub struct ModuleResolver {
    resolver: Resolver,
    base_path: PathBuf,
}

impl ModuleResolver {
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        let options = ResolveOptions {
            condition_names: vec!["import".into(), "default".into()],
            extensions: vec![
                ".ts".into(),
                ".mts".into(),
                ".js".into(),
                ".mjs".into(),
                ".json".into(),
            ],
            main_fields: vec!["module".into(), "main".into()],
            exports_fields: vec![vec!["exports".into()]],
            imports_fields: vec![vec!["imports".into()]],
            ..ResolveOptions::default()
        };

        Self {
            resolver: Resolver::new(options),
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Host-default resolution of `specifier` imported from `parent`.
    ///
    /// URL specifiers with a supported scheme are classified as-is. Everything
    /// else resolves as a file, relative to the parent's directory when the parent
    /// is a file and to the base path otherwise.
    pub fn resolve(
        &self,
        specifier: &str,
        parent: Option<&ModuleSource>,
    ) -> ResolverResult<ModuleSource> {
        if is_data(specifier) || is_ephemeral(specifier) || is_remote(specifier) {
            return ModuleSource::parse(specifier)
                .ok_or_else(|| ResolverError::InvalidUrl(specifier.to_string()));
        }

        let target = if has_scheme(specifier, "file:") {
            Url::parse(specifier)
                .ok()
                .and_then(|u| u.to_file_path().ok())
                .ok_or_else(|| ResolverError::InvalidUrl(specifier.to_string()))?
                .to_string_lossy()
                .into_owned()
        } else if Url::parse(specifier).is_ok_and(|u| u.scheme().len() > 1) {
            return Err(ResolverError::UnsupportedScheme(specifier.to_string()));
        } else {
            specifier.to_string()
        };

        let context = parent
            .and_then(ModuleSource::directory)
            .unwrap_or(&self.base_path);
        match self.resolver.resolve(context, &target) {
            Ok(resolution) => Ok(ModuleSource::File(resolution.path().to_path_buf())),
            Err(error) => Err(ResolverError::ResolutionFailed(
                specifier.to_string(),
                error.to_string(),
            )),
        }
    }
}
