use std::path::PathBuf;

use clap::Parser;

use crate::{Backend, Config};

/// Copy frames from a camera into a shared-memory image channel
#[derive(Parser, Debug, Clone, Default)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// TOML configuration file, applied before the flags below
    #[arg(long, env = "SHMTAKE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Frame source backend
    #[arg(long, value_enum)]
    pub backend: Option<Backend>,

    /// Camera unit number
    #[arg(short = 'u', long)]
    pub unit: Option<u32>,

    /// Camera channel number
    #[arg(short = 'c', long)]
    pub channel: Option<u32>,

    /// Image channel name, defaults to <backend prefix><unit><channel>
    #[arg(short = 's', long = "stream")]
    pub stream: Option<String>,

    /// Number of device buffers
    #[arg(short = 'N', long)]
    pub buffers: Option<u32>,

    /// Frames to publish before exiting, 0 for unbounded
    #[arg(short = 'l', long)]
    pub loops: Option<u64>,

    /// Reuse an existing image channel
    #[arg(short = 'R', long)]
    pub reuse: bool,

    /// Frame wait timeout in milliseconds
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Real-time priority for the acquisition thread
    #[arg(long)]
    pub rt_priority: Option<i32>,

    /// Skip the real-time scheduling step
    #[arg(long)]
    pub no_rt: bool,

    /// Pin the acquisition thread to this CPU
    #[arg(long)]
    pub cpu: Option<usize>,

    /// Publish unsigned elements
    #[arg(long)]
    pub unsigned: bool,

    /// Recombine 8-bit byte pairs into 16-bit pixels
    #[arg(long)]
    pub byte_short_cast: bool,

    /// Embed the acquisition timestamp in the frame at pixel 8
    #[arg(short = 't', long)]
    pub embed_timestamp: bool,

    /// Directory holding channel files
    #[arg(long)]
    pub shm_dir: Option<PathBuf>,

    /// Do not service the parameter feedback channel
    #[arg(long)]
    pub no_params: bool,

    /// Log filter, e.g. "shmtake=debug"
    #[arg(long, env = "RUST_LOG", default_value = "shmtake=info")]
    pub log: String,
}

impl Args {
    /// Flags win over file and environment settings
    pub fn apply(&self, config: &mut Config) {
        if let Some(backend) = self.backend {
            config.source.backend = backend;
        }
        if let Some(unit) = self.unit {
            config.source.unit = unit;
        }
        if let Some(channel) = self.channel {
            config.source.channel = channel;
        }
        if let Some(buffers) = self.buffers {
            config.source.buffers = buffers;
        }
        if let Some(timeout) = self.timeout_ms {
            config.source.timeout_ms = timeout;
        }
        if self.stream.is_some() {
            config.channel.name = self.stream.clone();
        }
        if self.shm_dir.is_some() {
            config.channel.shm_dir = self.shm_dir.clone();
        }
        config.channel.reuse |= self.reuse;
        config.channel.output.unsigned |= self.unsigned;
        config.channel.output.byte_short_cast |= self.byte_short_cast;
        if self.no_params {
            config.channel.params = false;
        }
        if let Some(loops) = self.loops {
            config.acquisition.loops = loops;
        }
        config.acquisition.embed_timestamp |= self.embed_timestamp;
        if let Some(priority) = self.rt_priority {
            config.realtime.priority = priority;
        }
        if self.no_rt {
            config.realtime.enabled = false;
        }
        if self.cpu.is_some() {
            config.realtime.cpu = self.cpu;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_short_flags() {
        let args = Args::parse_from(["shmtake", "-u", "1", "-c", "2", "-N", "8", "-l", "100", "-R", "-t"]);
        let mut config = Config::default();
        args.apply(&mut config);
        assert_eq!(config.source.unit, 1);
        assert_eq!(config.source.channel, 2);
        assert_eq!(config.source.buffers, 8);
        assert_eq!(config.acquisition.loops, 100);
        assert!(config.channel.reuse);
        assert!(config.acquisition.embed_timestamp);
        assert_eq!(config.stream_name(), "simcam12");
    }

    #[test]
    fn absent_flags_keep_config_values() {
        let args = Args::parse_from(["shmtake"]);
        let mut config = Config::default();
        config.source.timeout_ms = 42;
        config.channel.output.unsigned = true;
        args.apply(&mut config);
        assert_eq!(config.source.timeout_ms, 42);
        assert!(config.channel.output.unsigned);
        assert!(config.channel.params);
    }

    #[test]
    fn stream_name_and_backend() {
        let args = Args::parse_from(["shmtake", "--backend", "v4l2", "-s", "wfscam", "--no-params"]);
        let mut config = Config::default();
        args.apply(&mut config);
        assert_eq!(config.source.backend, Backend::V4l2);
        assert_eq!(config.stream_name(), "wfscam");
        assert!(!config.channel.params);
    }
}
