//! Parameter command/feedback channel.
//!
//! A controller writes request rows into the keyword table of
//! `<image>_params_fb`, stores the row count in element 0 of the data array and
//! posts the channel. The taker applies each row to the device, reads the
//! property back and writes the fresh value into the same slot.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::capture::FrameSource;
use crate::channel::{DataType, ImageChannel, KeywordValue, DEFAULT_NB_KW};
use crate::error::{Result, TakeError};
use crate::utils;

/// Device property identifier carried as a hex keyword name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParamId(u32);

impl ParamId {
    /// Set on identifiers the taker must only read
    pub const READ_ONLY: u32 = 0x8000_0000;

    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Parse a keyword name such as `80000010` or `0x1f`
    pub fn parse(name: &str) -> Result<Self> {
        let trimmed = name.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        u32::from_str_radix(digits, 16)
            .map(Self)
            .map_err(|_| TakeError::ParamName(name.to_string()))
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn is_read_only(self) -> bool {
        self.0 & Self::READ_ONLY != 0
    }

    /// Identifier as understood by the device
    pub fn device_id(self) -> u32 {
        self.0 & !Self::READ_ONLY
    }
}

impl fmt::Display for ParamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

/// How a failed property write is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainMode {
    /// Abort on the first failed write (startup)
    Strict,
    /// Log and carry on (inside the acquisition loop)
    Lenient,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub rows: usize,
    pub written: usize,
    pub read_only: usize,
    pub failed: usize,
}

pub struct ParameterChannel {
    channel: ImageChannel,
}

impl ParameterChannel {
    /// Attach to the feedback channel of `image_name`, creating it if absent
    #[instrument(skip(dir))]
    pub fn open_or_create(dir: &Path, image_name: &str) -> Result<Self> {
        let name = utils::feedback_stream_name(image_name);
        let mut channel = if ImageChannel::exists(dir, &name) {
            ImageChannel::open(dir, &name)?
        } else {
            info!("Parameter channel {} not found, creating it", name);
            ImageChannel::create(dir, &name, 1, 1, DataType::I32, DEFAULT_NB_KW)?
        };
        channel.claim_semaphore()?;
        channel.flush_updates();
        Ok(Self { channel })
    }

    pub fn channel(&self) -> &ImageChannel {
        &self.channel
    }

    /// True when the controller has posted since the last poll
    pub fn poll(&self) -> bool {
        self.channel.try_wait_update()
    }

    /// Block up to `timeout` for a controller post
    pub fn wait(&self, timeout: Duration) -> bool {
        self.channel.wait_update(timeout)
    }

    fn pending_rows(&self) -> usize {
        let n = self.channel.first_element();
        if n < 0 {
            warn!("Negative parameter count {} on {}", n, self.channel.name());
            return 0;
        }
        let n = n as usize;
        if n > self.channel.nb_kw() {
            warn!(
                "Parameter count {} exceeds keyword capacity {}, clamping",
                n,
                self.channel.nb_kw()
            );
        }
        n.min(self.channel.nb_kw())
    }

    /// Apply every pending request row to `source` and write the read-back
    /// values into the same slots.
    pub fn drain<S: FrameSource + ?Sized>(
        &mut self,
        source: &mut S,
        mode: DrainMode,
    ) -> Result<DrainReport> {
        let mut report = DrainReport {
            rows: self.pending_rows(),
            ..DrainReport::default()
        };

        for idx in 0..report.rows {
            let row = self.channel.keyword(idx);
            let id = match ParamId::parse(&row.name) {
                Ok(id) => id,
                Err(e) => {
                    warn!("Skipping parameter row {}: {}", idx, e);
                    report.failed += 1;
                    continue;
                }
            };

            if id.is_read_only() {
                report.read_only += 1;
            } else {
                match row.value.as_f64() {
                    Some(value) => match source.set_property(id.device_id(), value) {
                        Ok(()) => {
                            debug!("Set parameter {} to {}", id, value);
                            report.written += 1;
                        }
                        Err(e) if mode == DrainMode::Strict => return Err(e),
                        Err(e) => {
                            warn!("Set parameter {} failed: {} (code {:?})", id, e, e.code());
                            report.failed += 1;
                        }
                    },
                    None => {
                        warn!("Parameter {} carries no numeric value: {:?}", id, row.value);
                        report.failed += 1;
                    }
                }
            }

            match source.get_property(id.device_id()) {
                Ok(value) => self.channel.set_keyword_value(idx, KeywordValue::Float(value)),
                Err(e) => warn!("Read back of parameter {} failed: {} (code {:?})", id, e, e.code()),
            }
        }

        self.channel.republish();
        self.channel.flush_updates();
        Ok(report)
    }

    /// Republish once so the controller knows the taker is live
    pub fn announce_ready(&mut self) {
        self.channel.republish();
        self.channel.flush_updates();
        info!("Taker ready on {}", self.channel.name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FrameDescriptor, PixelFormat, SimulatedSource};
    use std::time::Duration;

    fn sim() -> SimulatedSource {
        SimulatedSource::new(0, FrameDescriptor::new(4, 4, PixelFormat::Mono8), Duration::ZERO)
    }

    fn post_rows(dir: &Path, rows: &[(&str, KeywordValue)]) -> ImageChannel {
        let mut ctrl = ImageChannel::open(dir, "cam_params_fb").unwrap();
        for (idx, (name, value)) in rows.iter().enumerate() {
            ctrl.define_keyword(idx, name, value.clone(), "");
        }
        let mut w = ctrl.begin_write();
        w.buffer_mut().copy_from_slice(&(rows.len() as i32).to_ne_bytes());
        w.commit();
        ctrl
    }

    #[test]
    fn param_id_decoding() {
        let id = ParamId::parse("80000010").unwrap();
        assert!(id.is_read_only());
        assert_eq!(id.device_id(), 0x10);
        assert_eq!(ParamId::parse("0x1f").unwrap().raw(), 0x1f);
        assert!(!ParamId::parse("1f").unwrap().is_read_only());
        assert!(matches!(ParamId::parse("EXPTIME"), Err(TakeError::ParamName(_))));
        assert_eq!(id.to_string(), "80000010");
    }

    #[test]
    fn creates_missing_feedback_channel() {
        let dir = tempfile::tempdir().unwrap();
        let params = ParameterChannel::open_or_create(dir.path(), "cam").unwrap();
        assert!(params.channel().is_owner());
        assert_eq!(params.channel().name(), "cam_params_fb");
        assert_eq!(params.channel().datatype(), DataType::I32);
        assert_eq!(params.channel().nb_kw(), DEFAULT_NB_KW);
        assert!(!params.poll());
    }

    #[test]
    fn read_only_row_is_read_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let mut params = ParameterChannel::open_or_create(dir.path(), "cam").unwrap();
        let _ctrl = post_rows(dir.path(), &[("80000010", KeywordValue::Float(3.0))]);
        assert!(params.poll());

        let mut source = sim().with_property(0x10, 42.0);
        let journal = source.journal();
        let report = params.drain(&mut source, DrainMode::Lenient).unwrap();

        assert_eq!(report.rows, 1);
        assert_eq!(report.read_only, 1);
        let journal = journal.lock().unwrap();
        assert!(journal.property_writes.is_empty());
        assert_eq!(journal.property_reads, vec![0x10]);
        assert_eq!(params.channel().keyword(0).value, KeywordValue::Float(42.0));
    }

    #[test]
    fn writable_row_is_applied_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut params = ParameterChannel::open_or_create(dir.path(), "cam").unwrap();
        let ctrl = post_rows(
            dir.path(),
            &[
                ("0000000A", KeywordValue::Int(7)),
                ("0000000B", KeywordValue::Str("1.5".into())),
            ],
        );
        let before = ctrl.cnt1();

        let mut source = sim();
        let journal = source.journal();
        let report = params.drain(&mut source, DrainMode::Lenient).unwrap();

        assert_eq!(report.written, 2);
        assert_eq!(journal.lock().unwrap().property_writes, vec![(0xA, 7.0), (0xB, 1.5)]);
        assert_eq!(ctrl.keyword(1).value, KeywordValue::Float(1.5));
        // Feedback republished, own wake discarded.
        assert_eq!(ctrl.cnt1(), before + 1);
        assert!(!params.poll());
    }

    #[test]
    fn strict_mode_aborts_on_failed_write() {
        let dir = tempfile::tempdir().unwrap();
        let mut params = ParameterChannel::open_or_create(dir.path(), "cam").unwrap();
        let _ctrl = post_rows(dir.path(), &[("00000005", KeywordValue::Float(1.0))]);

        let mut source = sim().with_failing_property(5);
        let err = params.drain(&mut source, DrainMode::Strict).unwrap_err();
        assert!(matches!(err, TakeError::Property { op: "set", id: 5, .. }));

        let report = params.drain(&mut source, DrainMode::Lenient).unwrap();
        assert_eq!(report.failed, 1);
        // Failed read-back leaves the request value in place.
        assert_eq!(params.channel().keyword(0).value, KeywordValue::Float(1.0));
    }

    #[test]
    fn ready_handshake_bumps_commit_counter() {
        let dir = tempfile::tempdir().unwrap();
        let mut params = ParameterChannel::open_or_create(dir.path(), "cam").unwrap();
        params.announce_ready();
        assert_eq!(params.channel().cnt1(), 1);
        assert!(!params.poll());
    }
}
