//! Policy store for shellguard.
//!
//! The sandbox policy lives in a single JSON object on disk:
//!
//! ```json
//! {
//!   "enabled": true,
//!   "read_scope": "restricted",
//!   "allowed_domains": ["pypi.org", "*.github.com"],
//!   "allowed_write_paths": ["/home/dev/out"],
//!   "excluded_commands": ["docker", "systemctl"]
//! }
//! ```
//!
//! Missing keys fall back to defaults, unknown keys survive a re-save, and a
//! malformed file degrades to defaults with a warning instead of an error.

mod error;
mod schema;
mod store;

pub use error::ConfigError;
pub use schema::{
    DEFAULT_ALLOWED_DOMAINS, DEFAULT_DENIED_READ_PATHS, DEFAULT_EXCLUDED_COMMANDS,
    DEFAULT_HTTP_PROXY_PORT, DEFAULT_SOCKS_PROXY_PORT, Policy, ReadScope,
};
pub use store::{POLICY_FILE, PolicyStore, USER_CONFIG_DIR, expand_tilde, normalize_path};
