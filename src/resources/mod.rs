//! Project resources: the functions and static assets a project declares.
//!
//! [`discover`] walks the project's functions and assets directories and
//! produces a [`Resources`] listing. Its output feeds the
//! [`RouteTable`](crate::router::RouteTable) and travels inside
//! [`ServerConfig`](crate::config::ServerConfig) to worker processes.
//!
//! Naming conventions:
//!
//! | File                                 | Public path       | Access      |
//! |--------------------------------------|-------------------|-------------|
//! | `functions/hello.sh`                 | `/hello`          | public      |
//! | `functions/admin/stats.protected.sh` | `/admin/stats`    | protected   |
//! | `assets/style.css`                   | `/style.css`      | public      |
//! | `assets/secret.private.json`         | `/secret.json`    | private     |

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Directory names probed, in order, when no functions directory is configured.
pub const FUNCTIONS_DIRS: [&str; 2] = ["functions", "src"];

/// Directory names probed, in order, when no assets directory is configured.
pub const ASSETS_DIRS: [&str; 2] = ["assets", "static"];

/// Visibility of a resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    #[default]
    Public,
    Protected,
    Private,
}

impl Access {
    fn suffix(self) -> Option<&'static str> {
        match self {
            Self::Public => None,
            Self::Protected => Some(".protected"),
            Self::Private => Some(".private"),
        }
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Public => "public",
            Self::Protected => "protected",
            Self::Private => "private",
        })
    }
}

/// One function or static asset known to the project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDescriptor {
    /// Display name; the public path without its leading slash.
    pub name: String,
    /// Public URL path, always starting with `/`.
    pub path: String,
    /// Absolute location on disk.
    pub file_path: PathBuf,
    pub access: Access,
    /// Inline content; when `None` the file is read from `file_path`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl ResourceDescriptor {
    /// Creates a public descriptor whose name is derived from `path`.
    pub fn new(path: impl Into<String>, file_path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            name: path.trim_start_matches('/').to_owned(),
            path,
            file_path: file_path.into(),
            access: Access::Public,
            content: None,
        }
    }

    #[must_use]
    pub fn with_access(mut self, access: Access) -> Self {
        self.access = access;
        self
    }

    #[must_use]
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }
}

/// The functions and assets of a project.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default)]
    pub functions: Vec<ResourceDescriptor>,
    #[serde(default)]
    pub assets: Vec<ResourceDescriptor>,
}

impl Resources {
    pub fn new(functions: Vec<ResourceDescriptor>, assets: Vec<ResourceDescriptor>) -> Self {
        Self { functions, assets }
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty() && self.assets.is_empty()
    }
}

/// Errors raised while scanning a project directory.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("path {0} is not valid UTF-8")]
    NonUtf8Path(PathBuf),
}

/// Scans `base_dir` for functions and assets.
///
/// `functions_dir` and `assets_dir` override the conventional directory
/// names (relative paths are resolved against `base_dir`). A missing
/// directory simply contributes no resources.
///
/// # Errors
///
/// Returns [`DiscoveryError`] if a directory exists but cannot be read.
pub fn discover(
    base_dir: &Path,
    functions_dir: Option<&Path>,
    assets_dir: Option<&Path>,
) -> Result<Resources, DiscoveryError> {
    let functions = match resolve_dir(base_dir, functions_dir, &FUNCTIONS_DIRS) {
        Some(dir) => scan(&dir, ResourceKind::Function)?,
        None => Vec::new(),
    };
    let assets = match resolve_dir(base_dir, assets_dir, &ASSETS_DIRS) {
        Some(dir) => scan(&dir, ResourceKind::Asset)?,
        None => Vec::new(),
    };

    debug!(
        functions = functions.len(),
        assets = assets.len(),
        base_dir = %base_dir.display(),
        "discovered project resources"
    );
    Ok(Resources { functions, assets })
}

#[derive(Debug, Clone, Copy)]
enum ResourceKind {
    Function,
    Asset,
}

fn resolve_dir(base_dir: &Path, configured: Option<&Path>, defaults: &[&str]) -> Option<PathBuf> {
    match configured {
        Some(dir) => Some(base_dir.join(dir)).filter(|dir| dir.is_dir()),
        None => defaults
            .iter()
            .map(|name| base_dir.join(name))
            .find(|dir| dir.is_dir()),
    }
}

fn scan(root: &Path, kind: ResourceKind) -> Result<Vec<ResourceDescriptor>, DiscoveryError> {
    let mut files = Vec::new();
    collect_files(root, &mut files)?;
    files.sort();

    files
        .into_iter()
        .map(|file| {
            let relative = file
                .strip_prefix(root)
                .unwrap_or(&file)
                .to_str()
                .ok_or_else(|| DiscoveryError::NonUtf8Path(file.clone()))?
                .replace('\\', "/");
            let (path, access) = public_path(&relative, kind);
            let file_path = fs::canonicalize(&file).unwrap_or(file);
            Ok(ResourceDescriptor::new(path, file_path).with_access(access))
        })
        .collect()
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), DiscoveryError> {
    let entries = fs::read_dir(dir).map_err(|source| DiscoveryError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| DiscoveryError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        if path.is_dir() {
            collect_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

/// Maps a path relative to the resource root onto its public URL path.
fn public_path(relative: &str, kind: ResourceKind) -> (String, Access) {
    let (dir, file_name) = match relative.rsplit_once('/') {
        Some((dir, file)) => (Some(dir), file),
        None => (None, relative),
    };

    let (stem, extension) = match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (file_name, None),
    };

    let mut access = Access::Public;
    let mut stem = stem;
    for candidate in [Access::Protected, Access::Private] {
        if let Some(stripped) = candidate.suffix().and_then(|suffix| stem.strip_suffix(suffix)) {
            access = candidate;
            stem = stripped;
        }
    }

    let file_name = match (kind, extension) {
        (ResourceKind::Function, _) | (ResourceKind::Asset, None) => stem.to_owned(),
        (ResourceKind::Asset, Some(ext)) => format!("{stem}.{ext}"),
    };

    let path = match dir {
        Some(dir) => format!("/{dir}/{file_name}"),
        None => format!("/{file_name}"),
    };
    (path, access)
}
