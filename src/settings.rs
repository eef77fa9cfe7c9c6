//! Process settings using Figment.
//!
//! Settings describe how a process runs (where to listen, how long to wait,
//! where to write files), as opposed to the run [`Configuration`] document that
//! the orchestrator ships to peers. They are loaded from:
//! 1. built-in defaults,
//! 2. an optional TOML file,
//! 3. environment variables prefixed with `DAQ_`, using `__` between table and key
//!    (`DAQ_RUN_CONTROL__LISTEN_ADDRESS=0.0.0.0:44000`).
//!
//! # Example
//! ```no_run
//! use daq_runcontrol::settings::DaqSettings;
//!
//! let settings = DaqSettings::load_from("daq.toml")?;
//! settings.validate()?;
//! println!("listening on {}", settings.run_control.listen_address);
//! # Ok::<(), daq_runcontrol::error::DaqError>(())
//! ```
//!
//! [`Configuration`]: crate::config::Configuration

use crate::codec::file::RetryPolicy;
use crate::error::{AppResult, DaqError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "DAQ_";

/// Top-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct DaqSettings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationSettings,
    /// Orchestrator settings
    #[serde(default)]
    pub run_control: RunControlSettings,
    /// Peer runtime settings
    #[serde(default)]
    pub peer: PeerSettings,
    /// Event file settings
    #[serde(default)]
    pub files: FileSettings,
}

/// Application-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApplicationSettings {
    /// Process name used in logs
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Orchestrator settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunControlSettings {
    /// Control listener address
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// How long a transition may take before it is reported as timed out
    #[serde(default = "default_transition_timeout")]
    pub transition_timeout_ms: u64,
    /// Round-trip timeout for a synchronous request to one peer
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    /// Admit new peers while a run is in progress
    #[serde(default)]
    pub accept_during_run: bool,
}

/// Peer runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerSettings {
    /// Unsolicited status push period (0 disables the push task)
    #[serde(default = "default_status_push_interval")]
    pub status_push_interval_ms: u64,
    /// Time allowed for the admission handshake
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
    /// Bind address of a data collector's data listener
    #[serde(default = "default_data_listen_address")]
    pub data_listen_address: String,
}

/// Event file settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileSettings {
    /// Short-read retries before a file read fails
    #[serde(default = "default_max_read_retries")]
    pub max_read_retries: u32,
    /// Pause between short-read retries
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
    /// Directory run files are written to
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

// Default value functions
fn default_name() -> String {
    "daq-runcontrol".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_listen_address() -> String {
    "127.0.0.1:44000".to_string()
}

fn default_transition_timeout() -> u64 {
    10_000
}

fn default_request_timeout() -> u64 {
    5_000
}

fn default_status_push_interval() -> u64 {
    1_000
}

fn default_handshake_timeout() -> u64 {
    5_000
}

fn default_data_listen_address() -> String {
    "0.0.0.0:0".to_string()
}

fn default_max_read_retries() -> u32 {
    1_000
}

fn default_retry_backoff() -> u64 {
    10
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data")
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

impl Default for RunControlSettings {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            transition_timeout_ms: default_transition_timeout(),
            request_timeout_ms: default_request_timeout(),
            accept_during_run: false,
        }
    }
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            status_push_interval_ms: default_status_push_interval(),
            handshake_timeout_ms: default_handshake_timeout(),
            data_listen_address: default_data_listen_address(),
        }
    }
}

impl Default for FileSettings {
    fn default() -> Self {
        Self {
            max_read_retries: default_max_read_retries(),
            retry_backoff_ms: default_retry_backoff(),
            output_dir: default_output_dir(),
        }
    }
}

impl RunControlSettings {
    /// Transition timeout as a duration.
    pub fn transition_timeout(&self) -> Duration {
        Duration::from_millis(self.transition_timeout_ms)
    }

    /// Request timeout as a duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl PeerSettings {
    /// Status push period, `None` when disabled.
    pub fn status_push_interval(&self) -> Option<Duration> {
        (self.status_push_interval_ms > 0).then(|| Duration::from_millis(self.status_push_interval_ms))
    }

    /// Handshake timeout as a duration.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

impl FileSettings {
    /// Retry policy for following a growing file.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_read_retries,
            backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }
}

impl DaqSettings {
    fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(DaqSettings::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Defaults merged with the environment.
    pub fn load() -> AppResult<Self> {
        Ok(Self::figment(None).extract()?)
    }

    /// Defaults merged with a TOML file (missing files are ignored) and the environment.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Ok(Self::figment(Some(path.as_ref())).extract()?)
    }

    /// Render as TOML, e.g. to write a starting settings file.
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self).map_err(|err| DaqError::Configuration(err.to_string()))
    }

    /// Validate settings after loading.
    pub fn validate(&self) -> AppResult<()> {
        crate::logging::parse_log_level(&self.application.log_level)?;

        let timeouts = [
            ("run_control.transition_timeout_ms", self.run_control.transition_timeout_ms),
            ("run_control.request_timeout_ms", self.run_control.request_timeout_ms),
            ("peer.handshake_timeout_ms", self.peer.handshake_timeout_ms),
        ];
        for (key, value) in timeouts {
            if value == 0 {
                return Err(DaqError::Configuration(format!("{key} must be greater than zero")));
            }
        }

        if self.run_control.listen_address.trim().is_empty() {
            return Err(DaqError::Configuration(
                "run_control.listen_address must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let settings = DaqSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.files.retry_policy().max_retries, 1_000);
        assert_eq!(settings.files.retry_policy().backoff, Duration::from_millis(10));
        assert_eq!(settings.peer.status_push_interval(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn invalid_log_level_is_rejected() {
        let mut settings = DaqSettings::default();
        settings.application.log_level = "chatty".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        let mut settings = DaqSettings::default();
        settings.run_control.transition_timeout_ms = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn file_and_env_layers_merge() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "daq.toml",
                r#"
                [application]
                log_level = "debug"

                [run_control]
                listen_address = "0.0.0.0:45000"
                "#,
            )?;
            jail.set_env("DAQ_RUN_CONTROL__TRANSITION_TIMEOUT_MS", "2500");

            let settings = DaqSettings::load_from("daq.toml").map_err(|e| e.to_string())?;
            assert_eq!(settings.application.log_level, "debug");
            assert_eq!(settings.run_control.listen_address, "0.0.0.0:45000");
            assert_eq!(settings.run_control.transition_timeout_ms, 2500);
            assert_eq!(settings.run_control.request_timeout_ms, 5_000);
            Ok(())
        });
    }

    #[test]
    fn toml_rendering_roundtrips() {
        let settings = DaqSettings::default();
        let text = settings.to_toml().unwrap();
        let back: DaqSettings = toml::from_str(&text).unwrap();
        assert_eq!(back, settings);
    }
}
