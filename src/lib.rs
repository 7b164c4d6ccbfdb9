pub mod capture;
pub mod command;
pub mod error;
pub mod manager;
pub mod pipeline;
pub mod sdk;

use std::path::{Path, PathBuf};
use std::time::Duration;

use capture::convert::DepthScaling;
use capture::frame::PixelFormat;
use capture::worker::{AcquisitionStyle, CameraConfig, TriggerMode};
use sdk::sim::{SimCameraSpec, SimSystem};
use serde::{Deserialize, Serialize};

pub use command::Command;
pub use error::{AcqError, SdkError};
pub use manager::CameraManager;
pub use sdk::SdkContext;

/// System configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub acquisition: AcquisitionConfig,
    pub output: OutputConfig,
    pub simulator: SimConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    pub camera_count: usize,
    pub color: bool,
    pub trigger_mode: TriggerMode,
    pub style: AcquisitionStyle,
    pub retrieve_timeout_ms: u64,
    pub decimation: Option<i64>,
    pub depth_scaling: DepthScaling,
    pub pin_threads: bool, // Pin worker i to core i mod n
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub save_images: bool,
    pub directory: PathBuf,
}

/// Simulated cameras used when no vendor backend is linked
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub width: u32,
    pub height: u32,
    pub frame_interval_ms: u64,
    pub buffer_count: u32,
    /// Sensor format; BayerRG8 for colour and Mono8 otherwise when unset
    pub pixel_format: Option<PixelFormat>,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            camera_count: 2,
            color: true,
            trigger_mode: TriggerMode::SoftwareTriggered,
            style: AcquisitionStyle::Polling,
            retrieve_timeout_ms: 1000,
            decimation: None,
            depth_scaling: DepthScaling::Shift,
            pin_threads: false,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            save_images: false,
            directory: PathBuf::from("captured_images"),
        }
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            frame_interval_ms: 33, // ~30fps free-run
            buffer_count: 4,
            pixel_format: None,
        }
    }
}

impl Config {
    /// Defaults, then the optional TOML file, then `MULTICAM_<SECTION>__<KEY>`
    /// environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ::config::ConfigError> {
        let mut builder =
            ::config::Config::builder().add_source(::config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path));
        }
        builder
            .add_source(
                ::config::Environment::with_prefix("MULTICAM")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

impl AcquisitionConfig {
    pub fn retrieve_timeout(&self) -> Duration {
        Duration::from_millis(self.retrieve_timeout_ms)
    }

    /// Worker settings for the camera at `index`.
    pub fn camera(&self, index: usize) -> CameraConfig {
        CameraConfig {
            device_index: index,
            color: self.color,
            trigger_mode: self.trigger_mode,
            style: self.style,
            retrieve_timeout: self.retrieve_timeout(),
            decimation: self.decimation,
            depth_scaling: self.depth_scaling,
            core: self.pin_threads.then_some(index),
        }
    }
}

impl SimConfig {
    pub fn build(&self, count: usize, color: bool) -> SimSystem {
        let format = self.pixel_format.unwrap_or(if color {
            PixelFormat::BayerRG8
        } else {
            PixelFormat::Mono8
        });
        SimSystem::new(
            (0..count)
                .map(|index| {
                    SimCameraSpec::new(index, format)
                        .with_size(self.width, self.height)
                        .with_frame_interval(Duration::from_millis(self.frame_interval_ms))
                        .with_buffer_count(self.buffer_count)
                })
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdk::CameraSystem;

    #[test]
    fn defaults_load_without_file() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.acquisition.camera_count, Config::default().acquisition.camera_count);
        assert_eq!(config.acquisition.trigger_mode, TriggerMode::SoftwareTriggered);
        assert_eq!(config.output.directory, PathBuf::from("captured_images"));
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let path = std::env::temp_dir().join(format!("multicam-config-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            "[acquisition]\ncamera_count = 3\ntrigger_mode = \"continuous\"\nstyle = \"callback\"\ndecimation = 2\n\n[simulator]\nwidth = 32\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.acquisition.camera_count, 3);
        assert_eq!(config.acquisition.trigger_mode, TriggerMode::Continuous);
        assert_eq!(config.acquisition.style, AcquisitionStyle::Callback);
        assert_eq!(config.acquisition.decimation, Some(2));
        assert_eq!(config.simulator.width, 32);
        assert_eq!(config.simulator.height, 480);
    }

    #[test]
    fn camera_config_from_acquisition() {
        let acquisition = AcquisitionConfig {
            pin_threads: true,
            retrieve_timeout_ms: 250,
            ..AcquisitionConfig::default()
        };
        let camera = acquisition.camera(3);
        assert_eq!(camera.device_index, 3);
        assert_eq!(camera.core, Some(3));
        assert_eq!(camera.retrieve_timeout, Duration::from_millis(250));
    }

    #[test]
    fn simulator_follows_colour_setting() {
        let system = SimConfig::default().build(2, false);
        assert_eq!(system.device_count(), 2);
    }
}
