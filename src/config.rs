// Copyright 2024 the openwrt-imagegen authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Process-wide configuration.
//!
//! Options are loaded from `OWRT_IMG_*` environment variables; facade flags
//! override the loaded values by mutating the struct before handing it to
//! the core.  Precedence: facade flags > env vars > defaults.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::types::VerificationMode;

/// Env var prefix for all recognized options.
pub const ENV_PREFIX: &str = "OWRT_IMG_";

/// Default base URL for the official OpenWrt download origin.
pub const DEFAULT_DOWNLOAD_BASE: &str = "https://downloads.openwrt.org";

const MIN_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    /// The matching `tracing` filter directive.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
            LogLevel::Critical => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARNING" => Ok(LogLevel::Warning),
            "ERROR" => Ok(LogLevel::Error),
            "CRITICAL" => Ok(LogLevel::Critical),
            other => Err(Error::Validation(format!("unknown log level: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root of the Image Builder cache tree.
    pub cache_dir: PathBuf,
    /// Root of per-build output trees.
    pub artifacts_dir: PathBuf,
    /// Persistence connection string (`sqlite://<path>` or `:memory:`).
    pub db_url: String,
    /// Scratch directory; system temp when unset.
    pub tmp_dir: Option<PathBuf>,
    /// Refuse any network call when set.
    pub offline: bool,
    pub log_level: LogLevel,
    pub max_concurrent_downloads: u32,
    pub max_concurrent_builds: u32,
    /// Default verification mode for flashing when the caller supplies none.
    pub verification_mode: VerificationMode,
    pub download_timeout: u64,
    pub build_timeout: u64,
    pub flash_timeout: u64,
    /// Download origin; the public OpenWrt server by default.
    pub download_base_url: String,
    /// Program invoked for Image Builder runs.  Overridable so test
    /// harnesses can substitute a stub.
    pub make_program: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let home = env::var_os("HOME").map(PathBuf::from).unwrap_or_default();
        let data_dir = home.join(".local/share/openwrt-imagegen");
        Config {
            cache_dir: home.join(".cache/openwrt-imagegen/builders"),
            artifacts_dir: data_dir.join("artifacts"),
            db_url: format!("sqlite://{}", data_dir.join("db.sqlite").display()),
            tmp_dir: None,
            offline: false,
            log_level: LogLevel::Info,
            max_concurrent_downloads: 2,
            max_concurrent_builds: 2,
            verification_mode: VerificationMode::Full,
            download_timeout: 3600,
            build_timeout: 3600,
            flash_timeout: 1800,
            download_base_url: DEFAULT_DOWNLOAD_BASE.to_string(),
            make_program: PathBuf::from("make"),
        }
    }
}

impl Config {
    /// Load configuration from `OWRT_IMG_*` env vars on top of the defaults.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Config::default();
        if let Some(v) = env_var("CACHE_DIR") {
            cfg.cache_dir = PathBuf::from(v);
        }
        if let Some(v) = env_var("ARTIFACTS_DIR") {
            cfg.artifacts_dir = PathBuf::from(v);
        }
        if let Some(v) = env_var("DB_URL") {
            cfg.db_url = v;
        }
        if let Some(v) = env_var("TMP_DIR") {
            cfg.tmp_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = env_var("OFFLINE") {
            cfg.offline = parse_bool("OFFLINE", &v)?;
        }
        if let Some(v) = env_var("LOG_LEVEL") {
            cfg.log_level = v.parse()?;
        }
        if let Some(v) = env_var("MAX_CONCURRENT_DOWNLOADS") {
            cfg.max_concurrent_downloads = parse_int("MAX_CONCURRENT_DOWNLOADS", &v)?;
        }
        if let Some(v) = env_var("MAX_CONCURRENT_BUILDS") {
            cfg.max_concurrent_builds = parse_int("MAX_CONCURRENT_BUILDS", &v)?;
        }
        if let Some(v) = env_var("VERIFICATION_MODE") {
            cfg.verification_mode = v.parse()?;
        }
        if let Some(v) = env_var("DOWNLOAD_TIMEOUT") {
            cfg.download_timeout = parse_int("DOWNLOAD_TIMEOUT", &v)?;
        }
        if let Some(v) = env_var("BUILD_TIMEOUT") {
            cfg.build_timeout = parse_int("BUILD_TIMEOUT", &v)?;
        }
        if let Some(v) = env_var("FLASH_TIMEOUT") {
            cfg.flash_timeout = parse_int("FLASH_TIMEOUT", &v)?;
        }
        if let Some(v) = env_var("DOWNLOAD_BASE_URL") {
            cfg.download_base_url = v;
        }
        if let Some(v) = env_var("MAKE_PROGRAM") {
            cfg.make_program = PathBuf::from(v);
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Range-check the loaded options.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("max_concurrent_downloads", self.max_concurrent_downloads),
            ("max_concurrent_builds", self.max_concurrent_builds),
        ] {
            if !(1..=10).contains(&value) {
                return Err(Error::Validation(format!(
                    "{name} must be between 1 and 10, got {value}"
                )));
            }
        }
        for (name, value) in [
            ("download_timeout", self.download_timeout),
            ("build_timeout", self.build_timeout),
            ("flash_timeout", self.flash_timeout),
        ] {
            if value < MIN_TIMEOUT_SECS {
                return Err(Error::Validation(format!(
                    "{name} must be at least {MIN_TIMEOUT_SECS} seconds, got {value}"
                )));
            }
        }
        Ok(())
    }

    pub fn download_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.download_timeout)
    }

    pub fn build_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.build_timeout)
    }

    pub fn flash_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.flash_timeout)
    }

    /// Lock directory shared by the builder cache and the build pipeline.
    pub fn lock_dir(&self) -> PathBuf {
        self.cache_dir.join(".locks")
    }

    /// Scratch directory for overlay staging.
    pub fn scratch_dir(&self) -> PathBuf {
        self.tmp_dir.clone().unwrap_or_else(env::temp_dir)
    }
}

/// Install a global tracing subscriber honoring the configured level.
/// Intended to be called once by the owning facade at startup; calling it
/// again is a no-op.
pub fn init_logging(config: &Config) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_filter()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn env_var(name: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}{name}")).ok()
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(Error::Validation(format!(
            "{ENV_PREFIX}{name}: expected a boolean, got {other:?}"
        ))),
    }
}

fn parse_int<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| {
        Error::Validation(format!(
            "{ENV_PREFIX}{name}: expected an integer, got {value:?}"
        ))
    })
}
