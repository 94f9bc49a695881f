//! The acquisition-and-publish loop

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, instrument, warn};

use crate::capture::{ChannelGeometry, DeviceGuard, FrameSource, WaitOutcome};
use crate::channel::{ImageChannel, KeywordSlotMap, KeywordValue, Reserved, DEFAULT_NB_KW};
use crate::error::{Result, TakeError};
use crate::params::{DrainMode, ParameterChannel};
use crate::pipeline::rate::RateEstimator;
use crate::pipeline::recovery::{RecoveryAction, RecoveryPolicy, RecoveryState};
use crate::utils;
use crate::Config;

/// First pixel overwritten by the embedded timestamp
const TIMESTAMP_PIXEL: usize = 8;

/// Shortest pause after a failed wait
const MIN_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Cooperative stop flag shared with the signal handler
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Cancel on the first interrupt; true when one had already arrived
    pub fn interrupt(&self) -> bool {
        self.0.swap(true, Ordering::AcqRel)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AcquisitionState {
    pub frame_index: u64,
    pub timeouts: u64,
    pub overruns: u64,
    pub skipped: u64,
    /// Wait calls that failed outright
    pub wait_errors: u64,
    pub recovering: bool,
    pub rate: f64,
}

/// Outcome of one run of the loop
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub frames: u64,
    pub timeouts: u64,
    pub overruns: u64,
    pub skipped: u64,
    pub cancelled: bool,
    pub rate: f64,
}

impl RunSummary {
    /// 0 for a clean run, 2 when any timeout or overrun occurred
    pub fn exit_code(&self) -> u8 {
        if self.timeouts > 0 || self.overruns > 0 {
            2
        } else {
            0
        }
    }

    pub fn report(&self) {
        info!(
            "{} images, {} timeouts, {} overruns, {} skipped",
            self.frames, self.timeouts, self.overruns, self.skipped
        );
        if self.timeouts > 0 {
            warn!("{} timeouts occurred, check camera and connections", self.timeouts);
        }
    }
}

pub struct AcquisitionLoop<S: FrameSource> {
    source: DeviceGuard<S>,
    image: ImageChannel,
    params: Option<ParameterChannel>,
    slots: KeywordSlotMap,
    geometry: ChannelGeometry,
    policy: RecoveryPolicy,
    rate: RateEstimator,
    state: AcquisitionState,
    loops: u64,
    timeout: Duration,
    embed_timestamp: bool,
    status_interval: u64,
    baseline_timeouts: u64,
}

impl<S: FrameSource> AcquisitionLoop<S> {
    /// Prepare channels and start the device.
    ///
    /// Every failure here is fatal; the device guard closes whatever was
    /// opened before the error.
    #[instrument(skip_all, fields(device = %source.describe()))]
    pub fn setup(source: S, config: &Config) -> Result<Self> {
        let mut source = DeviceGuard::new(source);
        let descriptor = source.descriptor();
        let geometry = ChannelGeometry::derive(&descriptor, config.channel.output)?;

        info!(
            "Frame {}x{} {:?} ({} bit, stride {} B), {} buffers, timeout {} ms",
            descriptor.width,
            descriptor.height,
            descriptor.format,
            descriptor.bit_depth,
            descriptor.stride,
            config.source.buffers,
            config.source.timeout_ms
        );

        let dir = config.channel.dir();
        let name = config.stream_name();
        let mut image = if config.channel.reuse && ImageChannel::exists(&dir, &name) {
            let image = ImageChannel::open(&dir, &name)?;
            check_geometry(&image, &geometry)?;
            info!("Reusing channel {}", name);
            image
        } else {
            ImageChannel::create(
                &dir,
                &name,
                geometry.width,
                geometry.height,
                geometry.datatype,
                DEFAULT_NB_KW,
            )?
        };

        let slots = KeywordSlotMap::resolve(&mut image)?;
        image.set_keyword_value(
            slots.index(Reserved::SizeX),
            KeywordValue::Int(geometry.width as i64),
        );
        image.set_keyword_value(
            slots.index(Reserved::SizeY),
            KeywordValue::Int(geometry.height as i64),
        );

        let params = if config.channel.params {
            let mut params = ParameterChannel::open_or_create(&dir, &name)?;
            let report = params.drain(&mut *source, DrainMode::Strict)?;
            if report.rows > 0 {
                info!("Applied {} startup parameter rows", report.rows);
            }
            params.announce_ready();
            Some(params)
        } else {
            None
        };

        source.start(config.source.buffers)?;
        let counters = source.counters();

        Ok(Self {
            source,
            image,
            params,
            slots,
            geometry,
            policy: RecoveryPolicy::with_baseline(counters.timeouts, counters.overruns),
            rate: RateEstimator::default(),
            state: AcquisitionState::default(),
            loops: config.acquisition.loops,
            timeout: Duration::from_millis(config.source.timeout_ms),
            embed_timestamp: config.acquisition.embed_timestamp,
            status_interval: config.acquisition.status_interval.max(1),
            baseline_timeouts: counters.timeouts,
        })
    }

    pub fn image(&self) -> &ImageChannel {
        &self.image
    }

    pub fn state(&self) -> &AcquisitionState {
        &self.state
    }

    pub fn slots(&self) -> KeywordSlotMap {
        self.slots
    }

    fn restart(&mut self, what: &str) {
        if let Err(e) = self.source.timeout_restart() {
            warn!("{} failed: {} (code {:?})", what, e, e.code());
        }
    }

    fn apply_params(&mut self) {
        if let Some(params) = self.params.as_mut() {
            match params.drain(&mut *self.source, DrainMode::Lenient) {
                Ok(report) => debug!("Parameter update: {:?}", report),
                Err(e) => warn!("Parameter update failed: {}", e),
            }
        }
    }

    /// Pause after a failed wait, still servicing parameter posts
    fn back_off(&mut self) {
        self.rate.reset_interval();
        let pause = self.timeout.max(MIN_ERROR_BACKOFF);
        let posted = match self.params.as_ref() {
            Some(params) => params.wait(pause),
            None => {
                thread::sleep(pause);
                false
            }
        };
        if posted {
            self.apply_params();
        }
    }

    /// Run until cancelled or the loop count is reached
    pub fn run(&mut self, cancel: &CancellationToken) -> RunSummary {
        info!(
            "Acquiring into {} ({} loops)",
            self.image.name(),
            if self.loops == 0 {
                "unbounded".to_string()
            } else {
                self.loops.to_string()
            }
        );

        while !cancel.is_cancelled() && (self.loops == 0 || self.state.frame_index < self.loops) {
            if self.params.as_ref().is_some_and(|p| p.poll()) {
                self.apply_params();
            }

            let outcome = match self.source.wait_frame(self.timeout) {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.state.wait_errors += 1;
                    error!("Frame wait failed: {} (code {:?})", e, e.code());
                    metrics::counter!("frame_wait_errors").increment(1);
                    self.back_off();
                    continue;
                }
            };

            let counters = self.source.counters();
            let overruns_before = self.policy.overruns();
            let action = self.policy.observe(counters.timeouts, counters.overruns);
            let new_overruns = self.policy.overruns() - overruns_before;
            if new_overruns > 0 {
                metrics::counter!("frame_overruns").increment(new_overruns);
            }
            self.state.timeouts = counters.timeouts.saturating_sub(self.baseline_timeouts);
            self.state.overruns = self.policy.overruns();
            self.state.recovering = self.policy.state() == RecoveryState::Recovering;

            match action {
                RecoveryAction::Restart => {
                    metrics::counter!("frame_timeouts").increment(1);
                    self.restart("Timeout restart");
                    self.rate.reset_interval();
                    continue;
                }
                RecoveryAction::Rearm => self.restart("Re-arm restart"),
                RecoveryAction::Proceed => {}
            }

            let skipped = match outcome {
                WaitOutcome::Frame { skipped } => skipped,
                WaitOutcome::Timeout => {
                    // Timed out without the device counting it; nothing to publish.
                    self.rate.reset_interval();
                    continue;
                }
            };
            if skipped > 0 {
                self.state.skipped += skipped as u64;
                debug!("Skipped {} frames to reach the newest one", skipped);
            }

            if let Err(e) = self.publish() {
                error!("Frame copy failed: {} (code {:?})", e, e.code());
                continue;
            }

            self.state.frame_index += 1;
            if self.state.frame_index % self.status_interval == 0 {
                debug!(
                    "{} frames, {:.1} Hz, {} timeouts, {} overruns",
                    self.state.frame_index, self.state.rate, self.state.timeouts, self.state.overruns
                );
            }
        }

        RunSummary {
            frames: self.state.frame_index,
            timeouts: self.state.timeouts,
            overruns: self.state.overruns,
            skipped: self.state.skipped,
            cancelled: cancel.is_cancelled(),
            rate: self.state.rate,
        }
    }

    /// Copy the ready frame into the channel and commit it
    fn publish(&mut self) -> Result<u64> {
        let start = Instant::now();
        let stamp = utils::micros_since_epoch();
        let row_bytes = self.geometry.row_bytes;

        let mut write = self.image.begin_write();
        self.source.copy_frame(write.buffer_mut(), row_bytes)?;

        if self.embed_timestamp {
            let offset = TIMESTAMP_PIXEL * self.geometry.datatype.size();
            if let Some(dst) = write.buffer_mut().get_mut(offset..offset + 8) {
                dst.copy_from_slice(&stamp.to_ne_bytes());
            }
        }

        let rate = self.rate.sample(Instant::now());
        self.state.rate = rate;
        write.set_keyword(self.slots.index(Reserved::FrameRate), KeywordValue::Float(rate));
        write.set_keyword(self.slots.index(Reserved::AcqTime), KeywordValue::Int(stamp));
        write.set_keyword(
            self.slots.index(Reserved::SizeX),
            KeywordValue::Int(self.geometry.width as i64),
        );
        write.set_keyword(
            self.slots.index(Reserved::SizeY),
            KeywordValue::Int(self.geometry.height as i64),
        );
        let committed = write.commit();

        metrics::counter!("frames_published").increment(1);
        metrics::gauge!("measured_frame_rate_hz").set(rate);
        metrics::histogram!("frame_copy_time_us").record(start.elapsed().as_micros() as f64);
        Ok(committed)
    }

    /// Stop and close the device now instead of on drop
    pub fn shutdown(self) -> Result<()> {
        self.source.close()
    }
}

fn check_geometry(image: &ImageChannel, geometry: &ChannelGeometry) -> Result<()> {
    if image.width() != geometry.width
        || image.height() != geometry.height
        || image.datatype() != geometry.datatype
    {
        return Err(TakeError::ChannelOpen {
            name: image.name().to_string(),
            reason: format!(
                "existing channel is {}x{} {:?}, device needs {}x{} {:?}",
                image.width(),
                image.height(),
                image.datatype(),
                geometry.width,
                geometry.height,
                geometry.datatype
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FrameDescriptor, PixelFormat, SimulatedSource};
    use crate::channel::DataType;

    fn config(dir: &std::path::Path, loops: u64) -> Config {
        let mut config = Config::default();
        config.channel.shm_dir = Some(dir.to_path_buf());
        config.channel.name = Some("acq".into());
        config.channel.params = false;
        config.acquisition.loops = loops;
        config
    }

    fn sim() -> SimulatedSource {
        SimulatedSource::new(0, FrameDescriptor::new(16, 4, PixelFormat::Mono8), Duration::ZERO)
    }

    #[test]
    fn token_is_shared_between_clones() {
        let token = CancellationToken::new();
        let other = token.clone();
        assert!(!token.is_cancelled());
        other.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn second_interrupt_is_reported() {
        let token = CancellationToken::new();
        assert!(!token.interrupt());
        assert!(token.is_cancelled());
        assert!(token.interrupt());
    }

    #[test]
    fn failed_waits_back_off() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), 0);
        config.source.timeout_ms = 0;
        let source = sim().with_timeouts_on(&[1]).with_failing_restart();
        let journal = source.journal();
        let mut acq = AcquisitionLoop::setup(source, &config).unwrap();

        let cancel = CancellationToken::new();
        let stopper = {
            let cancel = cancel.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(100));
                cancel.cancel();
            })
        };
        let summary = acq.run(&cancel);
        stopper.join().unwrap();

        assert!(summary.cancelled);
        assert_eq!(summary.frames, 0);
        // A zero timeout still pauses for the minimum backoff.
        let errors = acq.state().wait_errors;
        assert!(errors >= 1 && errors <= 15, "{} failed waits", errors);
        assert_eq!(journal.lock().unwrap().waits, errors + 1);
    }

    #[test]
    fn exit_code_reflects_errors() {
        let mut summary = RunSummary {
            frames: 5,
            timeouts: 0,
            overruns: 0,
            skipped: 3,
            cancelled: false,
            rate: 0.0,
        };
        assert_eq!(summary.exit_code(), 0);
        summary.overruns = 1;
        assert_eq!(summary.exit_code(), 2);
    }

    #[test]
    fn embedded_timestamp_lands_at_pixel_eight() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), 1);
        config.acquisition.embed_timestamp = true;
        config.channel.output.unsigned = true;

        let before = utils::micros_since_epoch();
        let mut acq = AcquisitionLoop::setup(sim(), &config).unwrap();
        acq.run(&CancellationToken::new());

        let data = acq.image().data();
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&data[8..16]);
        let stamp = i64::from_ne_bytes(raw);
        assert!(stamp >= before);
        // Pixels before the stamp keep the device pattern.
        assert_eq!(&data[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(acq.image().datatype(), DataType::U8);
    }

    #[test]
    fn skipped_frames_are_tallied() {
        let dir = tempfile::tempdir().unwrap();
        let source = sim().with_skipped_on(2, 3);
        let mut acq = AcquisitionLoop::setup(source, &config(dir.path(), 3)).unwrap();
        let summary = acq.run(&CancellationToken::new());
        assert_eq!(summary.skipped, 3);
        assert_eq!(summary.exit_code(), 0);
    }

    #[test]
    fn reuse_rejects_mismatched_channel() {
        let dir = tempfile::tempdir().unwrap();
        ImageChannel::create(dir.path(), "acq", 8, 8, DataType::I8, DEFAULT_NB_KW).unwrap();
        let mut config = config(dir.path(), 1);
        config.channel.reuse = true;

        let source = sim();
        let journal = source.journal();
        let err = AcquisitionLoop::setup(source, &config).err().unwrap();
        assert!(matches!(err, TakeError::ChannelOpen { .. }));
        assert_eq!(journal.lock().unwrap().closes, 1);
    }

    #[test]
    fn byte_short_cast_halves_width() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), 2);
        config.channel.output.byte_short_cast = true;
        let mut acq = AcquisitionLoop::setup(sim(), &config).unwrap();
        acq.run(&CancellationToken::new());

        let image = acq.image();
        assert_eq!((image.width(), image.height()), (8, 4));
        assert_eq!(image.datatype(), DataType::U16);
        let size_x = image.keyword(acq.slots().index(Reserved::SizeX)).value;
        assert_eq!(size_x, KeywordValue::Int(8));
    }
}
