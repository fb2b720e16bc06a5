use std::path::PathBuf;

use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

/// Runtime configuration, merged from defaults, an optional
/// `drivecheck.toml`, `DRIVECHECK_*` environment variables, and finally any
/// CLI arguments. Later layers win.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// File whose bytes are written to and read back from every device.
    pub test_file: Option<PathBuf>,
    /// Write/verify cycles per device; 0 means run until canceled.
    pub iterations: u32,
    /// Emit logs and the final report as JSON.
    pub json: bool,
    /// Default log level DEBUG instead of INFO.
    pub verbose: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            test_file: None,
            iterations: 1,
            json: false,
            verbose: false,
        }
    }
}

impl AppConfig {
    pub fn new(args: Option<&impl Serialize>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file("drivecheck.toml"))
            .merge(Env::prefixed("DRIVECHECK_"));

        if let Some(args) = args {
            figment = figment.merge(Serialized::defaults(args));
        }

        figment.extract().context("invalid configuration")
    }
}
