//! Server configuration, read from the environment.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use camino::Utf8PathBuf;
use storage::{GcsConfig, S3Config, StorageConfig};

const PORT: Setting = Setting::new("PORT", "HTTP port");
const FLAKE: Setting = Setting::new("NIXERY_FLAKE", "Source flake to use");
const TIMEOUT: Setting = Setting::new("NIX_TIMEOUT", "Nix builder timeout");
const WEB_DIR: Setting = Setting::new("WEB_DIR", "Static web file dir");
const POPULARITY_URL: Setting = Setting::new("NIX_POPULARITY_URL", "Nix package popularity URL");
const CACHE_UPLOAD_URL: Setting = Setting::new("NIX_CACHE_UPLOAD_URL", "Nix binary cache upload URL");
const BACKEND: Setting = Setting::new(
    "NIXERY_STORAGE_BACKEND",
    "Storage backend (gcs, s3 or filesystem)",
);

const GCS_BUCKET: Setting = Setting::new("GCS_BUCKET", "GCS bucket for layer storage");
const GCS_CREDENTIALS: Setting = Setting::new(
    "GOOGLE_APPLICATION_CREDENTIALS",
    "Service account key for URL signing",
);
const S3_BUCKET: Setting = Setting::new("S3_BUCKET", "S3 bucket for layer storage");
const S3_PATH_STYLE: Setting = Setting::new("S3_USE_PATH_STYLE", "Use path-style S3 addressing");
const S3_ENDPOINT: Setting = Setting::new("S3_ENDPOINT", "Custom S3 endpoint");
const S3_REGION: Setting = Setting::new("S3_REGION", "S3 region");
const STORAGE_PATH: Setting = Setting::new("STORAGE_PATH", "Root directory for layer storage");

const DEFAULT_FLAKE: &str = "nixpkgs";
const DEFAULT_TIMEOUT: u64 = 60;
const DEFAULT_WEB_DIR: &str = "./web";

/// A named configuration option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Setting {
    /// Environment variable name.
    pub name: &'static str,

    /// What the option controls.
    pub description: &'static str,
}

impl Setting {
    const fn new(name: &'static str, description: &'static str) -> Self {
        Self { name, description }
    }
}

impl fmt::Display for Setting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.description)
    }
}

/// Configuration could not be loaded.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required option is unset or empty.
    #[error("missing required configuration {0}")]
    Missing(Setting),

    /// An option is set to a value which can't be used.
    #[error("invalid value {value:?} for {setting}: {reason}")]
    Invalid {
        /// The offending option.
        setting: Setting,

        /// The value it was set to.
        value: String,

        /// Why the value was rejected.
        reason: String,
    },
}

impl ConfigError {
    /// The option this error is about.
    pub fn setting(&self) -> Setting {
        match self {
            ConfigError::Missing(setting) => *setting,
            ConfigError::Invalid { setting, .. } => *setting,
        }
    }
}

/// The supported storage backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Google Cloud Storage.
    Gcs,

    /// Amazon S3 or a compatible store.
    S3,

    /// Local filesystem.
    Filesystem,
}

/// The storage backend name was not recognized.
#[derive(Debug, thiserror::Error)]
#[error("unsupported storage backend {0:?}, expected one of gcs, s3 or filesystem")]
pub struct UnknownBackend(String);

impl FromStr for BackendKind {
    type Err = UnknownBackend;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gcs" => Ok(BackendKind::Gcs),
            "s3" => Ok(BackendKind::S3),
            "filesystem" => Ok(BackendKind::Filesystem),
            other => Err(UnknownBackend(other.to_owned())),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Gcs => f.write_str("gcs"),
            BackendKind::S3 => f.write_str("s3"),
            BackendKind::Filesystem => f.write_str("filesystem"),
        }
    }
}

/// Runtime configuration for the layer server.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port for the HTTP server.
    pub port: u16,

    /// Source for the Nix package set.
    pub flake: String,

    /// Timeout for a single Nix builder.
    pub timeout: Duration,

    /// Directory with static web assets.
    pub web_dir: Utf8PathBuf,

    /// URL of the Nix package popularity data.
    pub popularity_url: Option<String>,

    /// Binary cache to upload build results to.
    pub cache_upload_url: Option<String>,

    /// Which storage backend was selected.
    pub backend: BackendKind,

    /// Connection settings for the selected backend.
    pub storage: StorageConfig,
}

impl Config {
    /// Load configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from any variable lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let selector = env.optional(BACKEND).unwrap_or_default();
        let backend: BackendKind = selector.parse().map_err(|err: UnknownBackend| {
            ConfigError::Invalid {
                setting: BACKEND,
                value: selector.clone(),
                reason: err.to_string(),
            }
        })?;

        let port = env.required(PORT)?;
        let port: u16 = port.parse().map_err(|err: std::num::ParseIntError| ConfigError::Invalid {
            setting: PORT,
            value: port.clone(),
            reason: err.to_string(),
        })?;

        let timeout: u64 = match env.optional(TIMEOUT) {
            Some(value) => value.parse().map_err(|err: std::num::ParseIntError| {
                ConfigError::Invalid {
                    setting: TIMEOUT,
                    value: value.clone(),
                    reason: err.to_string(),
                }
            })?,
            None => DEFAULT_TIMEOUT,
        };

        let storage = match backend {
            BackendKind::Gcs => StorageConfig::Gcs(GcsConfig {
                bucket: env.required(GCS_BUCKET)?,
                credentials: env.optional(GCS_CREDENTIALS).map(Utf8PathBuf::from),
            }),
            BackendKind::S3 => StorageConfig::S3(S3Config {
                bucket: env.required(S3_BUCKET)?,
                endpoint: env.optional(S3_ENDPOINT),
                path_style: env.optional(S3_PATH_STYLE).as_deref() == Some("true"),
                region: env.optional(S3_REGION),
            }),
            BackendKind::Filesystem => StorageConfig::Filesystem {
                path: env.required(STORAGE_PATH)?.into(),
            },
        };

        Ok(Config {
            port,
            flake: env.optional(FLAKE).unwrap_or_else(|| DEFAULT_FLAKE.to_owned()),
            timeout: Duration::from_secs(timeout),
            web_dir: env
                .optional(WEB_DIR)
                .unwrap_or_else(|| DEFAULT_WEB_DIR.to_owned())
                .into(),
            popularity_url: env.optional(POPULARITY_URL),
            cache_upload_url: env.optional(CACHE_UPLOAD_URL),
            backend,
            storage,
        })
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, setting: Setting) -> Option<String> {
        (self.lookup)(setting.name).filter(|value| !value.is_empty())
    }

    fn required(&self, setting: Setting) -> Result<String, ConfigError> {
        self.optional(setting).ok_or(ConfigError::Missing(setting))
    }
}
