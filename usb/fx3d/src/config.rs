//! `fx3d.toml`. Every key is optional; an empty file describes a stock board.

use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{fs, io};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::endpoint::Fx3Ids;
use crate::nt1065::RailLines;
use crate::script::{RegisterScript, DEFAULT_STOP_ADDRESS};
use crate::stream::{StreamParams, ABORT_GRACE};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Fx3Config {
    pub device: DeviceConfig,
    pub firmware: FirmwareConfig,
    pub frontend: FrontendConfig,
    pub stream: StreamConfig,
    pub capture: CaptureConfig,
}

impl Fx3Config {
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub vendor: u16,
    pub stream_product: u16,
    pub boot_product: u16,
    pub control_timeout_ms: u64,
    pub reset_wait_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        let ids = Fx3Ids::default();
        Self {
            vendor: ids.vendor,
            stream_product: ids.stream_product,
            boot_product: ids.boot_product,
            control_timeout_ms: 1000,
            reset_wait_ms: 2000,
        }
    }
}

impl DeviceConfig {
    pub fn ids(&self) -> Fx3Ids {
        Fx3Ids {
            vendor: self.vendor,
            stream_product: self.stream_product,
            boot_product: self.boot_product,
        }
    }
    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms)
    }
    pub fn reset_wait(&self) -> Duration {
        Duration::from_millis(self.reset_wait_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FirmwareConfig {
    /// Boot image downloaded when the device shows up in the bootloader.
    pub image: Option<PathBuf>,
    /// `"manual"` for the built-in front-end sequence, otherwise a script path.
    pub register_script: Option<String>,
    pub stop_address: Option<u8>,
    pub settle_ms: u64,
    pub write_delay_ms: u64,
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        Self {
            image: None,
            register_script: None,
            stop_address: Some(DEFAULT_STOP_ADDRESS),
            settle_ms: 2000,
            write_delay_ms: 20,
        }
    }
}

impl FirmwareConfig {
    pub fn script(&self) -> Option<RegisterScript> {
        self.register_script
            .as_deref()
            .and_then(RegisterScript::from_name)
    }
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
    pub fn write_delay(&self) -> Duration {
        Duration::from_millis(self.write_delay_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrontendConfig {
    pub power_up: bool,
    pub rail_settle_ms: u64,
    pub lines: RailLines,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            power_up: true,
            rail_settle_ms: 500,
            lines: RailLines::default(),
        }
    }
}

impl FrontendConfig {
    pub fn rail_settle(&self) -> Duration {
        Duration::from_millis(self.rail_settle_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub endpoint: usize,
    pub packets_per_transfer: usize,
    pub queue_depth: usize,
    pub timeout_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        let params = StreamParams::default();
        Self {
            endpoint: 0,
            packets_per_transfer: params.packets_per_transfer,
            queue_depth: params.queue_depth,
            timeout_ms: params.timeout.as_millis() as u64,
        }
    }
}

impl StreamConfig {
    pub fn params(&self) -> StreamParams {
        StreamParams {
            packets_per_transfer: self.packets_per_transfer,
            queue_depth: self.queue_depth,
            timeout: Duration::from_millis(self.timeout_ms),
            abort_grace: ABORT_GRACE,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Raw samples are discarded when unset.
    pub output: Option<PathBuf>,
    /// Runs until interrupted when unset.
    pub duration_secs: Option<u64>,
    pub telemetry_interval_ms: u64,
    /// Every n-th telemetry tick also reads the device debug block.
    pub full_report_every: u32,
    pub channel_depth: usize,
    pub log_file: Option<PathBuf>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            output: None,
            duration_secs: None,
            telemetry_interval_ms: 1000,
            full_report_every: 10,
            channel_depth: 64,
            log_file: None,
        }
    }
}

impl CaptureConfig {
    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_millis(self.telemetry_interval_ms)
    }
    pub fn duration(&self) -> Option<Duration> {
        self.duration_secs.map(Duration::from_secs)
    }
}
