//! Environment-style configuration
//!
//! The rendezvous location travels through environment variables so that
//! every worker process spawned by a launcher agrees on it. Access goes
//! through [`EnvStore`] so ranks running as threads can share an in-memory
//! environment instead of the process one.

use std::collections::HashMap;
use std::sync::Mutex;

/// Address of the rank-0 process.
pub const MASTER_ADDR: &str = "MASTER_ADDR";
/// Port rank 0 listens on for the rendezvous.
pub const MASTER_PORT: &str = "MASTER_PORT";
/// Global rank of a worker process (set by `ddp-launch`).
pub const RANK: &str = "RANK";
/// Number of worker processes (set by `ddp-launch`).
pub const WORLD_SIZE: &str = "WORLD_SIZE";
/// Rank of a worker on its node (set by `ddp-launch`).
pub const LOCAL_RANK: &str = "LOCAL_RANK";

/// Key/value environment the launcher reads and defaults.
pub trait EnvStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: &str);

    /// Store `default` under `key` unless the key is already present, and
    /// return the effective value.
    ///
    /// A key set to the empty string counts as present.
    fn set_default(&self, key: &str, default: &str) -> String {
        match self.get(key) {
            Some(existing) => existing,
            None => {
                self.set(key, default);
                default.to_string()
            }
        }
    }
}

/// The real process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnv;

impl EnvStore for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var_os(key).map(|v| v.to_string_lossy().into_owned())
    }

    fn set(&self, key: &str, value: &str) {
        std::env::set_var(key, value);
    }
}

/// In-memory environment, shareable between threads.
#[derive(Debug, Default)]
pub struct MemoryEnv {
    vars: Mutex<HashMap<String, String>>,
}

impl MemoryEnv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with_var(self, key: &str, value: &str) -> Self {
        self.set(key, value);
        self
    }
}

impl EnvStore for MemoryEnv {
    fn get(&self, key: &str) -> Option<String> {
        let vars = self.vars.lock().unwrap_or_else(|e| e.into_inner());
        vars.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        let mut vars = self.vars.lock().unwrap_or_else(|e| e.into_inner());
        vars.insert(key.to_string(), value.to_string());
    }
}
