pub mod capture;
pub mod channel;
pub mod cli;
pub mod error;
pub mod params;
pub mod pipeline;
pub mod rt;
pub mod utils;

use std::path::{Path, PathBuf};

use capture::{OutputOptions, PixelFormat};
use serde::{Deserialize, Serialize};

pub use error::{ErrorKind, Result, TakeError};
pub use pipeline::{AcquisitionLoop, CancellationToken, RunSummary};

/// Frame source implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Simulated,
    V4l2,
}

impl Backend {
    /// Prefix of the default channel name
    pub fn stream_prefix(self) -> &'static str {
        match self {
            Backend::Simulated => "simcam",
            Backend::V4l2 => "v4lcam",
        }
    }
}

/// Run configuration: defaults, then TOML file, then `SHMTAKE__*` env, then CLI
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub source: SourceConfig,
    pub channel: ChannelConfig,
    pub acquisition: AcquisitionConfig,
    pub realtime: RealtimeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub backend: Backend,
    pub unit: u32,
    pub channel: u32,
    /// Overrides `/dev/video<unit>` for the v4l2 backend
    pub device_path: Option<String>,
    pub buffers: u32,
    pub timeout_ms: u64,
    pub sim_width: u32,
    pub sim_height: u32,
    pub sim_format: PixelFormat,
    pub sim_frame_interval_us: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Explicit channel name; derived from backend, unit and channel otherwise
    pub name: Option<String>,
    pub shm_dir: Option<PathBuf>,
    /// Attach to an existing channel instead of recreating it
    pub reuse: bool,
    pub output: OutputOptions,
    /// Service the `<name>_params_fb` channel
    pub params: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Frames to publish; 0 runs until cancelled
    pub loops: u64,
    pub embed_timestamp: bool,
    /// Frames between status lines
    pub status_interval: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    pub enabled: bool,
    pub policy: rt::SchedPolicy,
    pub priority: i32,
    pub cpu: Option<usize>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Simulated,
            unit: 0,
            channel: 0,
            device_path: None,
            buffers: 4,
            timeout_ms: 1000,
            sim_width: 320,
            sim_height: 256,
            sim_format: PixelFormat::Mono16,
            sim_frame_interval_us: 1000,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            name: None,
            shm_dir: None,
            reuse: false,
            output: OutputOptions::default(),
            params: true,
        }
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            loops: 0,
            embed_timestamp: false,
            status_interval: 5000,
        }
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        let sched = rt::RealTimeScheduler::default();
        Self {
            enabled: true,
            policy: sched.policy,
            priority: sched.priority,
            cpu: sched.cpu,
        }
    }
}

impl ChannelConfig {
    pub fn dir(&self) -> PathBuf {
        self.shm_dir
            .clone()
            .unwrap_or_else(|| utils::shm_dir().to_path_buf())
    }
}

impl RealtimeConfig {
    pub fn scheduler(&self) -> rt::RealTimeScheduler {
        rt::RealTimeScheduler {
            policy: self.policy,
            priority: self.priority,
            cpu: self.cpu,
        }
    }
}

impl Config {
    /// Layer an optional TOML file and the environment over the defaults
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("SHMTAKE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Image channel name for this run
    pub fn stream_name(&self) -> String {
        self.channel.name.clone().unwrap_or_else(|| {
            utils::default_stream_name(self.source.backend, self.source.unit, self.source.channel)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_stream_name_uses_backend_prefix() {
        let config = Config::default();
        assert_eq!(config.stream_name(), "simcam00");
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[source]\nunit = 2\ntimeout_ms = 250\n\n[acquisition]\nloops = 10\n\n[channel.output]\nunsigned = true"
        )
        .unwrap();
        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.source.unit, 2);
        assert_eq!(config.source.timeout_ms, 250);
        assert_eq!(config.acquisition.loops, 10);
        assert!(config.channel.output.unsigned);
        assert_eq!(config.source.buffers, 4);
        assert_eq!(config.stream_name(), "simcam20");
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let err = Config::load(Some(Path::new("/nonexistent/shmtake.toml"))).unwrap_err();
        assert!(matches!(err, TakeError::Config(_)));
    }
}
