//! Connection and output settings, loaded from TOML with environment overrides.
//!
//! ```
//! use sirepo_backend::config::SirepoConfig;
//!
//! let config = SirepoConfig::from_toml_str(r#"
//!     server = "http://sirepo.example:8000"
//!     image_shape = [256, 256]
//! "#).unwrap();
//! assert_eq!(config.secret, "bluesky");
//! assert_eq!(config.image_shape, [256, 256]);
//! ```

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::*;

pub const ENV_SERVER: &str = "SIREPO_BLUESKY_SERVER";
pub const ENV_SECRET: &str = "SIREPO_BLUESKY_SECRET";
pub const ENV_ROOT_DIR: &str = "SIREPO_BLUESKY_ROOT_DIR";
pub const ENV_MAX_STATUS_CALLS: &str = "SIREPO_BLUESKY_MAX_STATUS_CALLS";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SirepoConfig {
    pub server: String,
    pub secret: String,
    /// Upper bound on status calls per run, the submission included.
    pub max_status_calls: usize,
    /// Root of the date-organized directory tree result files are written to.
    pub root_dir: PathBuf,
    /// `[rows, cols]` of the frames SRW watchpoint images are resampled to.
    pub image_shape: [usize; 2],
    pub request_timeout_secs: Option<f64>,
}

impl Default for SirepoConfig {
    fn default() -> Self {
        Self {
            server: "http://localhost:8000".to_string(),
            secret: "bluesky".to_string(),
            max_status_calls: 1000,
            root_dir: PathBuf::from("/tmp/sirepo-bluesky-data"),
            image_shape: [1024, 1024],
            request_timeout_secs: None,
        }
    }
}

impl SirepoConfig {
    pub fn from_toml_str(s: &str) -> SirepoResult<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> SirepoResult<Self> {
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    /// Applies `SIREPO_BLUESKY_*` environment variables on top of the loaded values.
    pub fn with_env_overrides(mut self) -> SirepoResult<Self> {
        if let Ok(server) = env::var(ENV_SERVER) {
            self.server = server;
        }
        if let Ok(secret) = env::var(ENV_SECRET) {
            self.secret = secret;
        }
        if let Ok(root_dir) = env::var(ENV_ROOT_DIR) {
            self.root_dir = PathBuf::from(root_dir);
        }
        if let Ok(calls) = env::var(ENV_MAX_STATUS_CALLS) {
            self.max_status_calls = calls.parse().map_err(|_| {
                SirepoError::Config(format!("{} must be an integer, got '{}'", ENV_MAX_STATUS_CALLS, calls))
            })?;
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> SirepoResult<()> {
        if self.max_status_calls == 0 {
            return Err(SirepoError::Config("max_status_calls must be at least 1".to_string()));
        }
        if self.image_shape.contains(&0) {
            return Err(SirepoError::Config(format!(
                "image_shape {:?} has an empty axis",
                self.image_shape
            )));
        }
        Ok(())
    }
}
