//! Configuration for the knowledge ingestion service

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Overrides the embedded store data directory
pub const DATA_DIR_ENV: &str = "KNOWLEDGE_DATA_DIR";
/// Overrides the remote store connection string
pub const DATABASE_URL_ENV: &str = "KNOWLEDGE_DATABASE_URL";

/// Main ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct KnowledgeConfig {
    /// Memory store connection settings
    #[serde(default)]
    pub store: StoreConfig,
    /// Fragmentation policy
    #[serde(default)]
    pub chunking: ChunkingConfig,
    /// Worker lifecycle and deadlines
    #[serde(default)]
    pub worker: WorkerConfig,
}

impl KnowledgeConfig {
    /// Parse configuration from TOML text
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| Error::Config(format!("Invalid TOML: {}", e)))
    }

    /// Load configuration from a TOML file, apply environment overrides and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!(
                "Failed to read config '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let mut config = Self::from_toml_str(&raw)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply the two opaque store settings from the environment
    pub fn apply_env_overrides(&mut self) {
        let data_dir = std::env::var(DATA_DIR_ENV).ok();
        let url = std::env::var(DATABASE_URL_ENV).ok();
        self.store.apply_overrides(data_dir.as_deref(), url.as_deref());
    }

    /// Validate all sections
    pub fn validate(&self) -> Result<()> {
        self.store.resolve()?;
        self.chunking.validate()?;
        self.worker.validate()?;
        Ok(())
    }
}

/// Memory store connection settings. Exactly one field must be set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Embedded store data directory
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Remote store connection string
    #[serde(default)]
    pub connection_string: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
            .join("agent-rag");

        Self {
            data_dir: Some(data_dir),
            connection_string: None,
        }
    }
}

impl StoreConfig {
    /// Embedded store rooted at `data_dir`
    pub fn embedded(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: Some(data_dir.into()),
            connection_string: None,
        }
    }

    /// Remote store reached through `url`
    pub fn remote(url: impl Into<String>) -> Self {
        Self {
            data_dir: None,
            connection_string: Some(url.into()),
        }
    }

    /// Apply override values. A remote connection string wins over the
    /// data directory and clears it, so the result never has both set.
    pub fn apply_overrides(&mut self, data_dir: Option<&str>, url: Option<&str>) {
        let data_dir = data_dir.map(str::trim).filter(|s| !s.is_empty());
        let url = url.map(str::trim).filter(|s| !s.is_empty());

        if let Some(url) = url {
            self.connection_string = Some(url.to_string());
            self.data_dir = None;
        } else if let Some(dir) = data_dir {
            self.data_dir = Some(PathBuf::from(dir));
            self.connection_string = None;
        }
    }

    /// Resolve into a connection descriptor, enforcing exactly-one
    pub fn resolve(&self) -> Result<StoreConnection> {
        let url = self
            .connection_string
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());

        match (&self.data_dir, url) {
            (Some(dir), None) => Ok(StoreConnection::Embedded {
                data_dir: dir.clone(),
            }),
            (None, Some(url)) => Ok(StoreConnection::Remote {
                url: url.to_string(),
            }),
            (Some(_), Some(_)) => Err(Error::Config(
                "store.data_dir and store.connection_string are mutually exclusive".to_string(),
            )),
            (None, None) => Err(Error::Config(
                "one of store.data_dir or store.connection_string must be set".to_string(),
            )),
        }
    }
}

/// Resolved store connection handed to each worker at spawn
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreConnection {
    /// Embedded store living in a local data directory
    Embedded { data_dir: PathBuf },
    /// Remote store reached through a connection string
    Remote { url: String },
}

/// Text fragmentation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Maximum fragment length in characters
    pub chunk_size: usize,
    /// Characters shared between consecutive fragments
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1024,
            chunk_overlap: 200,
        }
    }
}

impl ChunkingConfig {
    /// Validate the fragmentation policy
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::Config("chunking.chunk_size must be > 0".to_string()));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(Error::Config(format!(
                "chunking.chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        Ok(())
    }
}

/// Worker lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Request queue capacity per worker
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Deadline for the readiness handshake
    #[serde(default = "default_init_timeout_ms")]
    pub init_timeout_ms: u64,
    /// Deadline for a dispatched request, from registration to result
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Grace period for a worker to drain its queue on stop
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    /// Deadline for the primary PDF text parser before falling back
    #[serde(default = "default_pdf_timeout_ms")]
    pub pdf_timeout_ms: u64,
}

fn default_channel_capacity() -> usize { 64 }
fn default_init_timeout_ms() -> u64 { 30_000 }
fn default_request_timeout_ms() -> u64 { 300_000 }  // 5 minutes
fn default_shutdown_timeout_ms() -> u64 { 10_000 }
fn default_pdf_timeout_ms() -> u64 { 60_000 }

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            init_timeout_ms: default_init_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            pdf_timeout_ms: default_pdf_timeout_ms(),
        }
    }
}

impl WorkerConfig {
    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn pdf_timeout(&self) -> Duration {
        Duration::from_millis(self.pdf_timeout_ms)
    }

    /// Validate worker settings
    pub fn validate(&self) -> Result<()> {
        if self.channel_capacity == 0 {
            return Err(Error::Config("worker.channel_capacity must be > 0".to_string()));
        }
        if self.request_timeout_ms == 0 || self.init_timeout_ms == 0 {
            return Err(Error::Config("worker timeouts must be > 0".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_resolves_to_embedded() {
        let config = KnowledgeConfig::default();
        assert!(matches!(
            config.store.resolve().unwrap(),
            StoreConnection::Embedded { .. }
        ));
        config.validate().unwrap();
    }

    #[test]
    fn test_exactly_one_store_setting() {
        let both = StoreConfig {
            data_dir: Some(PathBuf::from("/tmp/kb")),
            connection_string: Some("sqlite:///tmp/kb.db".to_string()),
        };
        assert!(matches!(both.resolve(), Err(Error::Config(_))));

        let neither = StoreConfig {
            data_dir: None,
            connection_string: Some("   ".to_string()),
        };
        assert!(matches!(neither.resolve(), Err(Error::Config(_))));

        assert_eq!(
            StoreConfig::remote("sqlite:///tmp/kb.db").resolve().unwrap(),
            StoreConnection::Remote { url: "sqlite:///tmp/kb.db".to_string() }
        );
    }

    #[test]
    fn test_overrides_keep_settings_exclusive() {
        let mut store = StoreConfig::embedded("/var/lib/kb");
        store.apply_overrides(None, Some("sqlite:///srv/kb.db"));
        assert!(store.data_dir.is_none());
        assert!(store.resolve().is_ok());

        store.apply_overrides(Some("/data/kb"), None);
        assert_eq!(store.data_dir, Some(PathBuf::from("/data/kb")));
        assert!(store.connection_string.is_none());

        // Blank overrides are ignored
        store.apply_overrides(Some(""), Some("  "));
        assert_eq!(store.data_dir, Some(PathBuf::from("/data/kb")));
    }

    #[test]
    fn test_from_toml() {
        let config = KnowledgeConfig::from_toml_str(
            r#"
            [store]
            connection_string = "sqlite:///srv/knowledge.db"

            [chunking]
            chunk_size = 300
            chunk_overlap = 0

            [worker]
            request_timeout_ms = 1500
            "#,
        )
        .unwrap();

        assert_eq!(config.chunking.chunk_size, 300);
        assert_eq!(config.worker.request_timeout(), Duration::from_millis(1500));
        assert_eq!(config.worker.channel_capacity, 64);
        config.validate().unwrap();
    }

    #[test]
    fn test_overlap_must_be_smaller_than_size() {
        let chunking = ChunkingConfig { chunk_size: 100, chunk_overlap: 100 };
        assert!(chunking.validate().is_err());
        let chunking = ChunkingConfig { chunk_size: 0, chunk_overlap: 0 };
        assert!(chunking.validate().is_err());
    }
}
