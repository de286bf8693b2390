//! Configuration loading from `~/.agentmesh/config.toml`.
//!
//! A config file may list other TOML files under `include`. Includes are
//! layered in order beneath the file that names them, so later includes beat
//! earlier ones and the including file beats all of them.
//!
//! [`try_load_config`] reports every problem. [`load_config`] logs it and
//! falls back to defaults.

use agentmesh_types::config::MeshConfig;
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use tracing::{info, warn};

const MAX_INCLUDE_DEPTH: u32 = 10;

/// Why a config file could not be loaded.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("include '{0}' is an absolute path")]
    Absolute(String),
    #[error("include '{0}' contains '..'")]
    Traversal(String),
    #[error("include '{0}' resolves outside the config directory")]
    OutsideDir(String),
    #[error("include '{0}' forms a cycle")]
    Cycle(String),
    #[error("includes nested deeper than {MAX_INCLUDE_DEPTH}")]
    TooDeep,
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("{path}: does not match the config schema: {source}")]
    Schema {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Load mesh configuration from `path`, includes and all. Unlike
/// [`load_config`] nothing is skipped: an unreadable file, a parse error, a
/// bad include or a schema mismatch is returned as an error.
///
/// The result is not validated; [`crate::MeshKernel::boot`] does that.
pub fn try_load_config(path: &Path) -> Result<MeshConfig, ConfigError> {
    let mut root = read_toml(path)?;
    let includes = take_includes(&mut root);
    let (dir, mut visited) = include_scope(path);
    let mut merged = layer_includes(&includes, &dir, &mut visited, 0)?;
    merge_tables(&mut merged, &root);
    let config = merged.try_into::<MeshConfig>().map_err(|source| ConfigError::Schema {
        path: path.to_path_buf(),
        source,
    })?;
    info!(path = %path.display(), "Loaded configuration");
    Ok(config)
}

/// Load mesh configuration, falling back to [`MeshConfig::default`] with a
/// warning when the file is missing, unreadable or malformed. A bad include
/// drops every include and keeps the root file alone.
///
/// The result is not validated; [`crate::MeshKernel::boot`] does that.
pub fn load_config(path: Option<&Path>) -> MeshConfig {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    if !path.exists() {
        info!(path = %path.display(), "Config file not found, using defaults");
        return MeshConfig::default();
    }

    let mut root = match read_toml(&path) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "Unusable config file, using defaults");
            return MeshConfig::default();
        }
    };
    let includes = take_includes(&mut root);
    let (dir, mut visited) = include_scope(&path);

    let merged = match layer_includes(&includes, &dir, &mut visited, 0) {
        Ok(mut base) => {
            merge_tables(&mut base, &root);
            base
        }
        Err(e) => {
            warn!(error = %e, "Ignoring config includes");
            root
        }
    };

    match merged.try_into::<MeshConfig>() {
        Ok(config) => {
            info!(path = %path.display(), "Loaded configuration");
            config
        }
        Err(e) => {
            warn!(error = %e, path = %path.display(), "Config does not match schema, using defaults");
            MeshConfig::default()
        }
    }
}

/// `~/.agentmesh/config.toml`, or under the temp dir when there is no home.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".agentmesh")
        .join("config.toml")
}

/// Recursively merge `overlay` into `base`. Tables merge key by key; any
/// other value in `overlay` replaces what `base` has.
pub fn merge_tables(base: &mut toml::Value, overlay: &toml::Value) {
    if let (toml::Value::Table(base_tbl), toml::Value::Table(overlay_tbl)) = (&mut *base, overlay)
    {
        for (key, value) in overlay_tbl {
            match base_tbl.get_mut(key) {
                Some(existing) => merge_tables(existing, value),
                None => {
                    base_tbl.insert(key.clone(), value.clone());
                }
            }
        }
        return;
    }
    *base = overlay.clone();
}

/// Directory includes resolve against, and the visited set seeded with the
/// root file.
fn include_scope(path: &Path) -> (PathBuf, HashSet<PathBuf>) {
    let mut visited = HashSet::new();
    visited.insert(std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf()));
    let dir = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
    (dir, visited)
}

fn read_toml(path: &Path) -> Result<toml::Value, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Removes and returns the `include` list. Non-string entries are ignored.
fn take_includes(value: &mut toml::Value) -> Vec<String> {
    let Some(toml::Value::Array(entries)) = value.as_table_mut().and_then(|t| t.remove("include"))
    else {
        return Vec::new();
    };
    entries
        .into_iter()
        .filter_map(|v| v.as_str().map(str::to_owned))
        .collect()
}

/// Resolve `name` against `dir`, keeping it inside `dir`.
fn resolve_include(name: &str, dir: &Path) -> Result<PathBuf, ConfigError> {
    let relative = Path::new(name);
    if relative.is_absolute() {
        return Err(ConfigError::Absolute(name.to_owned()));
    }
    if relative.components().any(|c| c == Component::ParentDir) {
        return Err(ConfigError::Traversal(name.to_owned()));
    }
    let io_err = |path: &Path, source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };
    let joined = dir.join(relative);
    let resolved = std::fs::canonicalize(&joined).map_err(|e| io_err(&joined, e))?;
    let root = std::fs::canonicalize(dir).map_err(|e| io_err(dir, e))?;
    if !resolved.starts_with(&root) {
        return Err(ConfigError::OutsideDir(name.to_owned()));
    }
    Ok(resolved)
}

/// Merge `includes` (and whatever they include) into one table.
fn layer_includes(
    includes: &[String],
    dir: &Path,
    visited: &mut HashSet<PathBuf>,
    depth: u32,
) -> Result<toml::Value, ConfigError> {
    let mut layered = toml::Value::Table(toml::map::Map::new());
    if includes.is_empty() {
        return Ok(layered);
    }
    if depth >= MAX_INCLUDE_DEPTH {
        return Err(ConfigError::TooDeep);
    }

    for name in includes {
        let path = resolve_include(name, dir)?;
        if !visited.insert(path.clone()) {
            return Err(ConfigError::Cycle(name.clone()));
        }
        info!(include = %name, "Loading config include");

        let mut value = read_toml(&path)?;
        let nested = take_includes(&mut value);
        let nested_dir = path.parent().unwrap_or(dir).to_path_buf();
        let mut layer = layer_includes(&nested, &nested_dir, visited, depth + 1)?;
        merge_tables(&mut layer, &value);
        merge_tables(&mut layered, &layer);
    }
    Ok(layered)
}
