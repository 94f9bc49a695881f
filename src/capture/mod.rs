pub mod frame;
pub mod sim;
#[cfg(feature = "v4l2")]
pub mod v4l2;

use std::ops::{Deref, DerefMut};
use std::time::Duration;

use tracing::{info, warn};

pub use frame::{ChannelGeometry, FrameDescriptor, OutputOptions, PixelFormat};
pub use sim::SimulatedSource;
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Source;

use crate::error::{Result, TakeError};
use crate::{Backend, SourceConfig};

/// Result of one bounded frame wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A frame is ready for copy-out; `skipped` older frames were dropped to reach it
    Frame { skipped: u32 },
    /// No frame arrived within the timeout
    Timeout,
}

/// Cumulative device-reported error counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceCounters {
    pub timeouts: u64,
    pub overruns: u64,
}

/// Capability interface over a vendor frame grabber.
///
/// Opening is backend specific; once opened the handle is owned by a
/// [`DeviceGuard`] which stops and closes it on every exit path.
pub trait FrameSource: Send {
    /// Human readable device identification
    fn describe(&self) -> String;

    fn descriptor(&self) -> FrameDescriptor;

    /// Allocate `buffers` device buffers and start continuous acquisition
    fn start(&mut self, buffers: u32) -> Result<()>;

    fn stop(&mut self) -> Result<()>;

    /// Block until the next frame is ready or `timeout` elapses.
    /// A timeout must also be reflected in [`DeviceCounters::timeouts`].
    fn wait_frame(&mut self, timeout: Duration) -> Result<WaitOutcome>;

    /// Copy the frame made ready by the last successful wait into `dst`,
    /// `row_bytes` bytes per destination row
    fn copy_frame(&mut self, dst: &mut [u8], row_bytes: usize) -> Result<()>;

    fn counters(&self) -> DeviceCounters;

    /// Reset the device pipeline after a timeout
    fn timeout_restart(&mut self) -> Result<()>;

    fn get_property(&mut self, id: u32) -> Result<f64>;

    fn set_property(&mut self, id: u32, value: f64) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn describe(&self) -> String {
        (**self).describe()
    }
    fn descriptor(&self) -> FrameDescriptor {
        (**self).descriptor()
    }
    fn start(&mut self, buffers: u32) -> Result<()> {
        (**self).start(buffers)
    }
    fn stop(&mut self) -> Result<()> {
        (**self).stop()
    }
    fn wait_frame(&mut self, timeout: Duration) -> Result<WaitOutcome> {
        (**self).wait_frame(timeout)
    }
    fn copy_frame(&mut self, dst: &mut [u8], row_bytes: usize) -> Result<()> {
        (**self).copy_frame(dst, row_bytes)
    }
    fn counters(&self) -> DeviceCounters {
        (**self).counters()
    }
    fn timeout_restart(&mut self) -> Result<()> {
        (**self).timeout_restart()
    }
    fn get_property(&mut self, id: u32) -> Result<f64> {
        (**self).get_property(id)
    }
    fn set_property(&mut self, id: u32, value: f64) -> Result<()> {
        (**self).set_property(id, value)
    }
    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// Scoped owner of an opened frame source
pub struct DeviceGuard<S: FrameSource> {
    source: S,
    started: bool,
    closed: bool,
}

impl<S: FrameSource> DeviceGuard<S> {
    pub fn new(source: S) -> Self {
        info!("Device opened: {}", source.describe());
        Self {
            source,
            started: false,
            closed: false,
        }
    }

    pub fn start(&mut self, buffers: u32) -> Result<()> {
        self.source.start(buffers)?;
        self.started = true;
        Ok(())
    }

    /// Stop and close now, reporting the first failure
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let stopped = if self.started {
            self.started = false;
            self.source.stop()
        } else {
            Ok(())
        };
        let closed = self.source.close();
        info!("Device closed: {}", self.source.describe());
        stopped.and(closed)
    }
}

impl<S: FrameSource> Deref for DeviceGuard<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.source
    }
}

impl<S: FrameSource> DerefMut for DeviceGuard<S> {
    fn deref_mut(&mut self) -> &mut S {
        &mut self.source
    }
}

impl<S: FrameSource> Drop for DeviceGuard<S> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("Device teardown failed: {} (code {:?})", e, e.code());
        }
    }
}

/// Open the configured backend
pub fn open_source(config: &SourceConfig) -> Result<Box<dyn FrameSource>> {
    match config.backend {
        Backend::Simulated => Ok(Box::new(SimulatedSource::new(
            config.unit,
            FrameDescriptor::new(config.sim_width, config.sim_height, config.sim_format),
            Duration::from_micros(config.sim_frame_interval_us),
        ))),
        #[cfg(feature = "v4l2")]
        Backend::V4l2 => Ok(Box::new(V4l2Source::open(config)?)),
        #[cfg(not(feature = "v4l2"))]
        Backend::V4l2 => Err(TakeError::DeviceOpen {
            device: format!("/dev/video{}", config.unit),
            reason: "built without the v4l2 feature".into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_stops_and_closes_on_drop() {
        let sim = SimulatedSource::new(
            0,
            FrameDescriptor::new(8, 8, PixelFormat::Mono8),
            Duration::ZERO,
        );
        let journal = sim.journal();
        {
            let mut guard = DeviceGuard::new(sim);
            guard.start(4).unwrap();
        }
        let journal = journal.lock().unwrap();
        assert!(journal.started_with == Some(4));
        assert_eq!(journal.stops, 1);
        assert_eq!(journal.closes, 1);
    }

    #[test]
    fn explicit_close_is_not_repeated_by_drop() {
        let sim = SimulatedSource::new(
            0,
            FrameDescriptor::new(8, 8, PixelFormat::Mono8),
            Duration::ZERO,
        );
        let journal = sim.journal();
        let guard = DeviceGuard::new(sim);
        guard.close().unwrap();
        let journal = journal.lock().unwrap();
        assert_eq!(journal.stops, 0);
        assert_eq!(journal.closes, 1);
    }

    #[cfg(not(feature = "v4l2"))]
    #[test]
    fn v4l2_backend_requires_feature() {
        let config = SourceConfig {
            backend: Backend::V4l2,
            ..SourceConfig::default()
        };
        let err = open_source(&config).err().unwrap();
        assert!(err.is_fatal());
    }
}
