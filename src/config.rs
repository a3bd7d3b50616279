use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from preview.toml.
#[derive(Debug, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct FileConfig {
    pub server: ServerConfig,
    pub output: OutputConfig,
    pub generate: GenerateConfig,
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub command: String,
    pub args: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub dir_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct GenerateConfig {
    pub command: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub grace_period_ms: u64,
}

impl ShutdownConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

// --- Default implementations ---

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            command: "python3".to_string(),
            args: vec![
                "-m".to_string(),
                "http.server".to_string(),
                "{port}".to_string(),
            ],
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir_name: "Output".to_string(),
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 5000,
        }
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    InvalidPort {
        port: u16,
    },
    RootMissing {
        path: PathBuf,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::InvalidPort { port } => {
                write!(f, "invalid port number {port}: must be between 1 and 65535")
            }
            ConfigError::RootMissing { path } => {
                write!(f, "site root folder {} does not exist", path.display())
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::InvalidPort { .. } | ConfigError::RootMissing { .. } => None,
        }
    }
}

/// Load config from the given path. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<FileConfig, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(FileConfig::default());
        }
        Err(e) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };

    toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Validated settings for one preview session. Immutable once built.
#[derive(Debug, Clone)]
pub struct PreviewConfig {
    root: PathBuf,
    port: u16,
}

impl PreviewConfig {
    pub fn new(root: impl Into<PathBuf>, port: u16) -> Result<Self, ConfigError> {
        let root = root.into();
        if port == 0 {
            return Err(ConfigError::InvalidPort { port });
        }
        if !root.is_dir() {
            return Err(ConfigError::RootMissing { path: root });
        }
        Ok(Self { root, port })
    }

    /// The site root folder handed to the generator and the output locator.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}
