//! Error taxonomy shared by the capture, channel and acquisition layers

use std::io;

use thiserror::Error;

/// Coarse classification used to decide between abort and degraded mode.
///
/// Timeouts and overruns are not errors; the device reports them through its
/// counters and the recovery policy owns them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Setup-time failure: abort, release resources, exit non-zero.
    Fatal,
    /// A single property access failed; the loop keeps going.
    Degraded,
    /// Privilege or scheduling change failed; the loop keeps going.
    BestEffort,
}

#[derive(Error, Debug)]
pub enum TakeError {
    #[error("failed to open device {device}: {reason}")]
    DeviceOpen { device: String, reason: String },

    #[error("failed to allocate {count} device buffers: {reason}")]
    BufferAlloc { count: u32, reason: String },

    #[error("unusable pixel format: {0}")]
    PixelFormat(String),

    #[error("device call {op} failed (code {code})")]
    Device { op: &'static str, code: i32 },

    #[error("property 0x{id:08x} {op} failed (code {code})")]
    Property { op: &'static str, id: u32, code: i32 },

    #[error("failed to create channel {name}: {source}")]
    ChannelCreate { name: String, source: io::Error },

    #[error("failed to open channel {name}: {reason}")]
    ChannelOpen { name: String, reason: String },

    #[error("channel {name} has no free keyword slot for {keyword}")]
    KeywordSpace { name: String, keyword: String },

    #[error("invalid parameter keyword {0:?}")]
    ParamName(String),

    #[error("{op} failed: {source}")]
    Privilege { op: &'static str, source: nix::Error },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TakeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TakeError::Property { .. } | TakeError::ParamName(_) => ErrorKind::Degraded,
            TakeError::Privilege { .. } => ErrorKind::BestEffort,
            _ => ErrorKind::Fatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }

    /// Underlying device or OS error code, when one exists.
    pub fn code(&self) -> Option<i32> {
        match self {
            TakeError::Device { code, .. } | TakeError::Property { code, .. } => Some(*code),
            TakeError::ChannelCreate { source, .. } | TakeError::Io(source) => source.raw_os_error(),
            TakeError::Privilege { source, .. } => Some(*source as i32),
            _ => None,
        }
    }
}

impl From<config::ConfigError> for TakeError {
    fn from(err: config::ConfigError) -> Self {
        TakeError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TakeError>;
