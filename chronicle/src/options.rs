//! Engine construction options, deserializable from a JSON config file.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::gate::Policy;

/// How long a writer may wait on a document's lock before the caller gets a
/// retryable conflict.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Options {
    /// Path of the relational store database.
    pub store: PathBuf,
    /// Root directory holding the per-document repositories.
    pub repositories: PathBuf,
    #[serde(default = "defaults::lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    #[serde(default = "defaults::session_ttl_secs")]
    pub session_ttl_secs: u64,
    /// Merge policy applied when a caller doesn't supply one.
    #[serde(default)]
    pub policy: Policy,
}

mod defaults {
    pub fn lock_timeout_ms() -> u64 {
        super::DEFAULT_LOCK_TIMEOUT.as_millis() as u64
    }

    pub fn session_ttl_secs() -> u64 {
        crate::flush::DEFAULT_TTL.as_secs()
    }
}

impl Options {
    /// Options rooted at a single directory.
    pub fn root<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref();
        Self {
            store: root.join("chronicle.db"),
            repositories: root.join("repositories"),
            lock_timeout_ms: defaults::lock_timeout_ms(),
            session_ttl_secs: defaults::session_ttl_secs(),
            policy: Policy::default(),
        }
    }

    /// Load options from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, io::Error> {
        let file = std::fs::File::open(path)?;
        serde_json::from_reader(file).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_fill_in() {
        let options: Options = serde_json::from_str(
            r#"{ "store": "/tmp/c.db", "repositories": "/tmp/repos" }"#,
        )
        .unwrap();

        assert_eq!(options.lock_timeout(), DEFAULT_LOCK_TIMEOUT);
        assert_eq!(options.session_ttl(), crate::flush::DEFAULT_TTL);
        assert_eq!(options.policy, Policy::default());
    }
}
