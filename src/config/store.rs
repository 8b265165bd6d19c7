//! Durable policy store.
//!
//! The store keeps one cached [`Policy`] per process. Every mutator updates the
//! cache and rewrites the policy file immediately through a temp file that is
//! renamed over the target, so a concurrent reader sees either the old or the
//! new document, never a torn one.
//!
//! Loading never fails: a missing file yields defaults, a malformed file
//! yields defaults plus a warning (and is left alone until the next
//! mutation), and a single bad value only resets that one field.

use std::fs;
use std::io::Write;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use serde_json::{Map, Value};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::error::ConfigError;
use super::schema::{Policy, ReadScope};

/// Per-user configuration directory name.
pub const USER_CONFIG_DIR: &str = "shellguard";

/// Policy filename.
pub const POLICY_FILE: &str = "sandbox_config.json";

/// Cached policy plus keys this version does not understand.
#[derive(Debug, Clone, Default)]
struct StoredPolicy {
    policy: Policy,
    extra: Map<String, Value>,
}

/// Policy store backed by a JSON file.
pub struct PolicyStore {
    path: PathBuf,
    state: RwLock<StoredPolicy>,
}

impl PolicyStore {
    /// Open the store at the default per-user location.
    pub fn open() -> Result<Self, ConfigError> {
        Ok(Self::with_path(Self::default_path()?))
    }

    /// Open a store backed by a specific file (used by tests and `--config`).
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let stored = read_policy_file(&path);
        Self {
            path,
            state: RwLock::new(stored),
        }
    }

    /// Default policy file location.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        if let Some(dir) = dirs::config_dir() {
            return Ok(dir.join(USER_CONFIG_DIR).join(POLICY_FILE));
        }
        dirs::home_dir()
            .map(|home| home.join(format!(".{}", USER_CONFIG_DIR)).join(POLICY_FILE))
            .ok_or(ConfigError::NoHomeDirectory)
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the backing file, replacing the cached policy.
    pub fn load(&self) {
        let stored = read_policy_file(&self.path);
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = stored;
    }

    /// Write the cached policy to disk.
    pub fn save(&self) -> Result<(), ConfigError> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        write_policy_file(&self.path, &state)
    }

    /// Snapshot of the whole policy.
    pub fn policy(&self) -> Policy {
        self.read(|p| p.clone())
    }

    /// Whether sandboxing is enabled.
    pub fn enabled(&self) -> bool {
        self.read(|p| p.enabled)
    }

    /// Whether filesystem isolation is on.
    pub fn filesystem_isolation(&self) -> bool {
        self.read(|p| p.filesystem_isolation)
    }

    /// Whether network isolation is on.
    pub fn network_isolation(&self) -> bool {
        self.read(|p| p.network_isolation)
    }

    /// Allowed domains.
    pub fn allowed_domains(&self) -> Vec<String> {
        self.read(|p| p.allowed_domains.clone())
    }

    /// Allowed read paths.
    pub fn allowed_read_paths(&self) -> Vec<String> {
        self.read(|p| p.allowed_read_paths.clone())
    }

    /// Allowed write paths.
    pub fn allowed_write_paths(&self) -> Vec<String> {
        self.read(|p| p.allowed_write_paths.clone())
    }

    /// Denied read paths.
    pub fn denied_read_paths(&self) -> Vec<String> {
        self.read(|p| p.denied_read_paths.clone())
    }

    /// Read scope.
    pub fn read_scope(&self) -> ReadScope {
        self.read(|p| p.read_scope)
    }

    /// Whether unlisted domains need approval.
    pub fn require_approval_for_new_domains(&self) -> bool {
        self.read(|p| p.require_approval_for_new_domains)
    }

    /// HTTP proxy port.
    pub fn http_proxy_port(&self) -> u16 {
        self.read(|p| p.http_proxy_port)
    }

    /// SOCKS proxy port.
    pub fn socks_proxy_port(&self) -> u16 {
        self.read(|p| p.socks_proxy_port)
    }

    /// Excluded commands.
    pub fn excluded_commands(&self) -> Vec<String> {
        self.read(|p| p.excluded_commands.clone())
    }

    /// Whether an approved unsandboxed retry is permitted.
    pub fn allow_unsandboxed_commands(&self) -> bool {
        self.read(|p| p.allow_unsandboxed_commands)
    }

    /// Memory cap in MiB.
    pub fn max_memory_mb(&self) -> Option<NonZeroU32> {
        self.read(|p| p.max_memory_mb)
    }

    /// CPU cap in percent.
    pub fn max_cpu_percent(&self) -> Option<NonZeroU32> {
        self.read(|p| p.max_cpu_percent)
    }

    /// Execution time cap in seconds.
    pub fn max_execution_time(&self) -> Option<NonZeroU32> {
        self.read(|p| p.max_execution_time)
    }

    /// Enable or disable sandboxing.
    pub fn set_enabled(&self, value: bool) -> Result<(), ConfigError> {
        self.update(|p| p.enabled = value)
    }

    /// Toggle filesystem isolation.
    pub fn set_filesystem_isolation(&self, value: bool) -> Result<(), ConfigError> {
        self.update(|p| p.filesystem_isolation = value)
    }

    /// Toggle network isolation.
    pub fn set_network_isolation(&self, value: bool) -> Result<(), ConfigError> {
        self.update(|p| p.network_isolation = value)
    }

    /// Set the read scope.
    pub fn set_read_scope(&self, scope: ReadScope) -> Result<(), ConfigError> {
        self.update(|p| p.read_scope = scope)
    }

    /// Toggle approval prompts for unlisted domains.
    pub fn set_require_approval_for_new_domains(&self, value: bool) -> Result<(), ConfigError> {
        self.update(|p| p.require_approval_for_new_domains = value)
    }

    /// Set the HTTP proxy port.
    pub fn set_http_proxy_port(&self, port: u16) -> Result<(), ConfigError> {
        self.update(|p| p.http_proxy_port = port)
    }

    /// Set the SOCKS proxy port.
    pub fn set_socks_proxy_port(&self, port: u16) -> Result<(), ConfigError> {
        self.update(|p| p.socks_proxy_port = port)
    }

    /// Toggle approved unsandboxed retries.
    pub fn set_allow_unsandboxed_commands(&self, value: bool) -> Result<(), ConfigError> {
        self.update(|p| p.allow_unsandboxed_commands = value)
    }

    /// Set or clear the memory cap.
    pub fn set_max_memory_mb(&self, value: Option<NonZeroU32>) -> Result<(), ConfigError> {
        self.update(|p| p.max_memory_mb = value)
    }

    /// Set or clear the CPU cap.
    pub fn set_max_cpu_percent(&self, value: Option<NonZeroU32>) -> Result<(), ConfigError> {
        self.update(|p| p.max_cpu_percent = value)
    }

    /// Set or clear the execution time cap.
    pub fn set_max_execution_time(&self, value: Option<NonZeroU32>) -> Result<(), ConfigError> {
        self.update(|p| p.max_execution_time = value)
    }

    /// Add a domain (lowercased) to the allowlist.
    pub fn add_allowed_domain(&self, domain: &str) -> Result<(), ConfigError> {
        let domain = normalize_domain(domain)?;
        self.update(|p| push_unique(&mut p.allowed_domains, domain))
    }

    /// Remove a domain from the allowlist.
    pub fn remove_allowed_domain(&self, domain: &str) -> Result<(), ConfigError> {
        let domain = normalize_domain(domain)?;
        self.update(|p| p.allowed_domains.retain(|d| !d.eq_ignore_ascii_case(&domain)))
    }

    /// Add a read-only path. The path is stored absolute and resolved.
    pub fn add_allowed_read_path(&self, path: &str) -> Result<(), ConfigError> {
        let path = normalize_path(path)?;
        self.update(|p| push_unique(&mut p.allowed_read_paths, path))
    }

    /// Remove a read-only path.
    pub fn remove_allowed_read_path(&self, path: &str) -> Result<(), ConfigError> {
        let path = normalize_path(path)?;
        self.update(|p| p.allowed_read_paths.retain(|x| *x != path))
    }

    /// Add a read-write path. The path is stored absolute and resolved.
    pub fn add_allowed_write_path(&self, path: &str) -> Result<(), ConfigError> {
        let path = normalize_path(path)?;
        self.update(|p| push_unique(&mut p.allowed_write_paths, path))
    }

    /// Remove a read-write path.
    pub fn remove_allowed_write_path(&self, path: &str) -> Result<(), ConfigError> {
        let path = normalize_path(path)?;
        self.update(|p| p.allowed_write_paths.retain(|x| *x != path))
    }

    /// Hide a path from sandboxed commands (broad scope).
    pub fn add_denied_read_path(&self, path: &str) -> Result<(), ConfigError> {
        let path = normalize_path(path)?;
        self.update(|p| push_unique(&mut p.denied_read_paths, path))
    }

    /// Always run commands with this leading token natively.
    pub fn add_excluded_command(&self, command: &str) -> Result<(), ConfigError> {
        let command = non_empty("excluded_commands", command)?;
        self.update(|p| push_unique(&mut p.excluded_commands, command))
    }

    /// Stop excluding a command.
    pub fn remove_excluded_command(&self, command: &str) -> Result<(), ConfigError> {
        let command = command.trim().to_string();
        self.update(|p| p.excluded_commands.retain(|c| *c != command))
    }

    fn read<T>(&self, f: impl FnOnce(&Policy) -> T) -> T {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f(&state.policy)
    }

    /// Persist a mutated copy; the cache only changes once the file does.
    fn update(&self, f: impl FnOnce(&mut Policy)) -> Result<(), ConfigError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = state.clone();
        f(&mut next.policy);
        write_policy_file(&self.path, &next)?;
        *state = next;
        Ok(())
    }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from(path));
    }
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    PathBuf::from(path)
}

/// Turn a user-supplied path into an absolute, resolved string.
///
/// Existing paths are canonicalized (symlinks resolved). Paths that do not
/// exist yet are made absolute against the current directory.
pub fn normalize_path(path: &str) -> Result<String, ConfigError> {
    let trimmed = non_empty("path", path)?;
    let expanded = expand_tilde(&trimmed);
    let resolved = fs::canonicalize(&expanded)
        .or_else(|_| std::path::absolute(&expanded))
        .map_err(|e| ConfigError::InvalidValue {
            field: "path".to_string(),
            message: format!("cannot resolve '{}': {}", trimmed, e),
        })?;
    Ok(resolved.to_string_lossy().into_owned())
}

fn normalize_domain(domain: &str) -> Result<String, ConfigError> {
    let domain = non_empty("allowed_domains", domain)?;
    Ok(domain.trim_end_matches('.').to_lowercase())
}

fn non_empty(field: &str, value: &str) -> Result<String, ConfigError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            message: "value must not be empty".to_string(),
        });
    }
    Ok(value.to_string())
}

fn push_unique(list: &mut Vec<String>, value: String) {
    if !list.contains(&value) {
        list.push(value);
    }
}

/// Read the policy file, degrading to defaults on any problem.
fn read_policy_file(path: &Path) -> StoredPolicy {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("No policy file at {:?}, using defaults", path);
            return StoredPolicy::default();
        }
        Err(e) => {
            warn!("{}", ConfigError::ReadError { path: path.to_path_buf(), source: e });
            return StoredPolicy::default();
        }
    };

    match serde_json::from_str::<Value>(&text) {
        Ok(Value::Object(map)) => merge_lenient(path, map),
        Ok(_) => {
            warn!("Policy file {:?} is not a JSON object, using defaults", path);
            StoredPolicy::default()
        }
        Err(source) => {
            warn!(
                "{}",
                ConfigError::ParseError { path: path.to_path_buf(), source }
            );
            StoredPolicy::default()
        }
    }
}

/// Overlay file values onto defaults one key at a time.
///
/// A key whose value does not fit the schema is dropped with a warning so the
/// rest of the file still applies.
fn merge_lenient(path: &Path, file: Map<String, Value>) -> StoredPolicy {
    let Ok(Value::Object(defaults)) = serde_json::to_value(Policy::default()) else {
        return StoredPolicy::default();
    };

    let mut merged = defaults.clone();
    let mut extra = Map::new();

    for (key, value) in file {
        if !defaults.contains_key(&key) {
            extra.insert(key, value);
            continue;
        }
        let previous = merged.insert(key.clone(), value);
        if let Err(e) = serde_json::from_value::<Policy>(Value::Object(merged.clone())) {
            warn!("Ignoring invalid '{}' in {:?}: {}", key, path, e);
            if let Some(previous) = previous {
                merged.insert(key, previous);
            }
        }
    }

    let policy = serde_json::from_value(Value::Object(merged)).unwrap_or_default();
    StoredPolicy { policy, extra }
}

fn write_policy_file(path: &Path, stored: &StoredPolicy) -> Result<(), ConfigError> {
    let write_err = |source| ConfigError::WriteError {
        path: path.to_path_buf(),
        source,
    };

    let mut document = stored.extra.clone();
    if let Value::Object(known) = serde_json::to_value(&stored.policy)? {
        document.extend(known);
    }
    let mut json = serde_json::to_string_pretty(&Value::Object(document))?;
    json.push('\n');

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir).map_err(write_err)?;

    let mut tmp = NamedTempFile::new_in(&dir).map_err(write_err)?;
    tmp.write_all(json.as_bytes()).map_err(write_err)?;
    tmp.as_file().sync_all().map_err(write_err)?;
    tmp.persist(path).map_err(|e| write_err(e.error))?;

    debug!("Saved policy to {:?}", path);
    Ok(())
}
