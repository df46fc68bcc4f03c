//! snapvault configuration management.
//!
//! Configuration is stored as TOML:
//! - Unix: `~/.config/snapvault/config.toml`
//! - Windows: `%APPDATA%/snapvault/config.toml`
//!
//! ```toml
//! [upload]
//! chunk_size = 134217728
//!
//! [[targets]]
//! kind = "gcs"
//! name = "offsite"
//! bucket = "my-backups"
//! token_env = "GCS_ACCESS_TOKEN"
//! request_timeout_secs = 300
//!
//! [[targets]]
//! kind = "dir"
//! name = "nas"
//! directory = "/Volumes/nas/backups"
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use snapvault_gcs::GcsStore;
use snapvault_store::{BlobStore, DirStore};
use snapvault_upload::UploadConfig;

/// Application configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub upload: UploadConfig,

    #[serde(default)]
    pub targets: Vec<Target>,
}

/// A place uploads are sent to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Target {
    /// A Google Cloud Storage bucket.
    Gcs {
        name: String,
        bucket: String,
        /// Environment variable holding an OAuth2 access token.
        #[serde(default = "default_token_env")]
        token_env: String,
        /// Alternative API endpoint, e.g. a local emulator.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
        /// Upper bound on one request, sized to a full chunk upload.
        #[serde(default = "default_request_timeout_secs")]
        request_timeout_secs: u64,
    },
    /// A local or mounted directory.
    Dir { name: String, directory: PathBuf },
}

fn default_token_env() -> String {
    "GCS_ACCESS_TOKEN".into()
}

fn default_request_timeout_secs() -> u64 {
    snapvault_gcs::DEFAULT_REQUEST_TIMEOUT.as_secs()
}

impl Target {
    pub fn name(&self) -> &str {
        match self {
            Target::Gcs { name, .. } | Target::Dir { name, .. } => name,
        }
    }

    /// Where objects end up, without contacting the store.
    pub fn location(&self) -> String {
        match self {
            Target::Gcs { bucket, .. } => format!("gs://{bucket}"),
            Target::Dir { directory, .. } => directory.display().to_string(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.name().trim().is_empty() {
            bail!("target name must not be empty");
        }
        match self {
            Target::Gcs {
                name,
                bucket,
                token_env,
                request_timeout_secs,
                ..
            } => {
                if bucket.trim().is_empty() {
                    bail!("target {name}: bucket must not be empty");
                }
                if token_env.trim().is_empty() {
                    bail!("target {name}: token_env must not be empty");
                }
                if *request_timeout_secs == 0 {
                    bail!("target {name}: request_timeout_secs must be positive");
                }
            }
            Target::Dir { name, directory } => {
                if directory.as_os_str().is_empty() {
                    bail!("target {name}: directory must not be empty");
                }
            }
        }
        Ok(())
    }

    /// Builds the store for this target.
    pub fn open(&self) -> anyhow::Result<Arc<dyn BlobStore>> {
        self.validate()?;
        match self {
            Target::Gcs {
                name,
                bucket,
                token_env,
                endpoint,
                request_timeout_secs,
            } => {
                let token = std::env::var(token_env)
                    .with_context(|| format!("target {name}: ${token_env} is not set"))?;
                let mut store = GcsStore::with_request_timeout(
                    bucket,
                    token.trim(),
                    Duration::from_secs(*request_timeout_secs),
                )
                .with_context(|| format!("target {name}: cannot create client"))?;
                if let Some(url) = endpoint {
                    store = store.with_base_url(url.as_str());
                }
                Ok(Arc::new(store))
            }
            Target::Dir { directory, .. } => Ok(Arc::new(DirStore::new(directory))),
        }
    }
}

impl Config {
    /// Loads configuration from `path`, or creates a default if not found.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let config: Config =
                toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            tracing::info!(path = %path.display(), "created default configuration");
            Ok(config)
        }
    }

    /// Saves the configuration to `path`.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        // Targets may name credentials; keep the file private.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.upload.validate()?;
        let mut seen = HashSet::new();
        for target in &self.targets {
            target.validate()?;
            if !seen.insert(target.name()) {
                bail!("duplicate target name: {}", target.name());
            }
        }
        Ok(())
    }

    /// Returns the target called `name`, or every target when `name` is `None`.
    pub fn select(&self, name: Option<&str>) -> anyhow::Result<Vec<&Target>> {
        if self.targets.is_empty() {
            bail!("no targets configured");
        }
        match name {
            None => Ok(self.targets.iter().collect()),
            Some(name) => match self.targets.iter().find(|t| t.name() == name) {
                Some(target) => Ok(vec![target]),
                None => bail!("unknown target: {name}"),
            },
        }
    }
}

/// Returns the platform-specific configuration file path.
pub fn default_config_path() -> PathBuf {
    #[cfg(windows)]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata).join("snapvault").join("config.toml")
    }

    #[cfg(not(windows))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home)
            .join(".config")
            .join("snapvault")
            .join("config.toml")
    }
}
