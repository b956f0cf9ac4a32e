use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Revision IDs per API request (the `revids` fan-in limit for normal accounts)
pub const DEFAULT_BATCH_SIZE: u64 = 50;

/// Revision IDs per persisted aggregation slice
pub const DEFAULT_SLICE_SIZE: u64 = 5000;

/// Concurrent download workers
pub const DEFAULT_WORKERS: usize = 16;

/// Slices extracted concurrently during aggregation
pub const DEFAULT_SLICE_PARALLELISM: usize = 8;

/// Attempts per chunk before the run is aborted
pub const FETCH_MAX_ATTEMPTS: u32 = 8;

/// First retry delay; doubles on every further attempt
pub const FETCH_BACKOFF_BASE_MS: u64 = 1_000;

/// Upper bound for a single retry delay
pub const FETCH_BACKOFF_MAX_MS: u64 = 60_000;

/// Timeout for one API call (retries get a fresh timeout)
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Bumped whenever the slice file layout changes
pub const SLICE_FORMAT_VERSION: u32 = 1;

/// Synthetic username for revisions whose author is suppressed
pub const HIDDEN_USER: &str = "<HIDDEN_USER>";

pub const DEFAULT_ENDPOINT: &str = "https://zh.minecraft.wiki/api.php";

pub const USER_AGENT: &str = concat!("revtally/", env!("CARGO_PKG_VERSION"));

/// Optional settings file. Every field can also be given on the command line,
/// which takes precedence.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub endpoint: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Extra HTTP headers sent with every request
    pub headers: BTreeMap<String, String>,
    /// Namespace labels for the report, replacing the built-in catalog
    pub namespaces: Option<BTreeMap<i32, String>>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Some(Credentials {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}
