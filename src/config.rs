//! Configuration management.
//!
//! Settings are loaded from a TOML file via the `config` crate and
//! deserialized into the [`Settings`] tree. A minimal file looks like:
//!
//! ```toml
//! log_level = "info"
//!
//! [acquisition]
//! bind_address = "0.0.0.0:10205"
//! discard_pre_run = true
//!
//! [sorting]
//! sample_interval = 1
//! write_enabled = false
//!
//! [storage]
//! output_dir = "data"
//! ```
//!
//! Every section has defaults tuned for a bench setup, so an empty file is
//! also a valid configuration.

use crate::error::{DaqError, DaqResult};
use config::Config;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level application settings.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Settings {
    /// Log level filter (trace, debug, info, warn, error).
    pub log_level: String,
    /// Log output format: "pretty" or "compact".
    pub log_format: String,
    pub acquisition: AcquisitionSettings,
    pub ring: RingSettings,
    pub sorting: SortingSettings,
    pub storage: StorageSettings,
    pub run: RunSettings,
}

/// Network front-end settings for the receiver daemon.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AcquisitionSettings {
    /// Local UDP address the receiver binds to.
    pub bind_address: String,
    /// Optional front-end address; when set the socket is connected so only
    /// datagrams from this peer are accepted.
    pub frontend_address: Option<String>,
    /// Socket receive timeout; bounds how long a stop request can go unseen.
    #[serde(with = "humantime_serde")]
    pub receive_timeout: Duration,
    /// Drop idle-poll buffers that arrive before the run has begun.
    pub discard_pre_run: bool,
}

/// Ring buffer geometry shared by the sorting and storage paths.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RingSettings {
    /// Slot count of the sorting ring.
    pub sorting_capacity: usize,
    /// Slot count of the storage ring.
    pub storage_capacity: usize,
    /// Byte capacity of one raw buffer frame.
    pub frame_bytes: usize,
}

/// Sorter daemon settings.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SortingSettings {
    /// Process 1 of every `sample_interval` events (1 = every event).
    pub sample_interval: u64,
    /// Re-encode accepted events and archive them to disk.
    pub write_enabled: bool,
}

/// Disk archiver settings.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageSettings {
    /// Directory event output files are created in.
    pub output_dir: PathBuf,
    /// Data record length in bytes for output files.
    pub record_length: usize,
}

/// Run-boundary handshake settings.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RunSettings {
    /// Interval at which the end-of-run stop command is re-issued while
    /// waiting for the daemons to catch up.
    #[serde(with = "humantime_serde")]
    pub stop_resend_interval: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            acquisition: AcquisitionSettings::default(),
            ring: RingSettings::default(),
            sorting: SortingSettings::default(),
            storage: StorageSettings::default(),
            run: RunSettings::default(),
        }
    }
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:10205".to_string(),
            frontend_address: None,
            receive_timeout: Duration::from_millis(200),
            discard_pre_run: true,
        }
    }
}

impl Default for RingSettings {
    fn default() -> Self {
        Self {
            sorting_capacity: 16,
            storage_capacity: 16,
            frame_bytes: 8 * 1024,
        }
    }
}

impl Default for SortingSettings {
    fn default() -> Self {
        Self {
            sample_interval: 1,
            write_enabled: false,
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data"),
            record_length: 8 * 1024,
        }
    }
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            stop_resend_interval: Duration::from_secs(3),
        }
    }
}

impl Settings {
    /// Load settings from `config/<name>.toml` (default name: "default").
    pub fn new(config_name: Option<&str>) -> DaqResult<Self> {
        let config_path = format!("config/{}", config_name.unwrap_or("default"));
        let s = Config::builder()
            .add_source(config::File::with_name(&config_path).required(false))
            .build()
            .map_err(DaqError::Config)?;

        let settings: Settings = s.try_deserialize().map_err(DaqError::Config)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from an explicit file path.
    pub fn from_file(path: &std::path::Path) -> DaqResult<Self> {
        let s = Config::builder()
            .add_source(config::File::from(path))
            .build()
            .map_err(DaqError::Config)?;

        let settings: Settings = s.try_deserialize().map_err(DaqError::Config)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Semantic validation beyond what deserialization checks.
    pub fn validate(&self) -> DaqResult<()> {
        if self.ring.sorting_capacity == 0 || self.ring.storage_capacity == 0 {
            return Err(DaqError::Configuration(
                "ring capacities must be at least 1".to_string(),
            ));
        }
        if self.ring.frame_bytes < 256 {
            return Err(DaqError::Configuration(
                "frame_bytes must hold at least one 256-byte header record".to_string(),
            ));
        }
        if self.sorting.sample_interval == 0 {
            return Err(DaqError::Configuration(
                "sample_interval must be at least 1".to_string(),
            ));
        }
        if self.storage.record_length == 0 || self.storage.record_length > self.ring.frame_bytes {
            return Err(DaqError::Configuration(
                "record_length must be between 1 and frame_bytes".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.sorting.sample_interval, 1);
        assert!(settings.acquisition.discard_pre_run);
    }

    #[test]
    fn test_parse_from_toml() {
        let toml_str = r#"
            log_level = "debug"

            [acquisition]
            bind_address = "127.0.0.1:9999"
            receive_timeout = "50ms"
            discard_pre_run = false

            [sorting]
            sample_interval = 10
            write_enabled = true

            [run]
            stop_resend_interval = "3s"
        "#;
        let settings: Settings = toml::from_str(toml_str).unwrap();
        settings.validate().unwrap();
        assert_eq!(settings.acquisition.bind_address, "127.0.0.1:9999");
        assert_eq!(settings.sorting.sample_interval, 10);
        assert!(settings.sorting.write_enabled);
        assert_eq!(settings.run.stop_resend_interval, Duration::from_secs(3));
    }

    #[test]
    fn test_zero_sample_interval_rejected() {
        let mut settings = Settings::default();
        settings.sorting.sample_interval = 0;
        assert!(settings.validate().is_err());
    }
}
