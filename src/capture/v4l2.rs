//! V4L2 frame source built on memory-mapped capture streams

use std::io;
use std::time::Duration;

use tracing::{info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::control::{Control, Value};
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::{DeviceCounters, FrameDescriptor, FrameSource, PixelFormat, WaitOutcome};
use crate::error::{Result, TakeError};
use crate::SourceConfig;

fn os_code(err: &io::Error) -> i32 {
    err.raw_os_error().unwrap_or(-1)
}

pub struct V4l2Source {
    path: String,
    device: Device,
    stream: Option<MmapStream<'static>>,
    descriptor: FrameDescriptor,
    buffers: u32,
    timeout: Option<Duration>,
    counters: DeviceCounters,
    last_sequence: Option<u32>,
    pending: Vec<u8>,
    frame_ready: bool,
}

impl V4l2Source {
    #[instrument(skip(config), fields(unit = config.unit))]
    pub fn open(config: &SourceConfig) -> Result<Self> {
        let path = config
            .device_path
            .clone()
            .unwrap_or_else(|| format!("/dev/video{}", config.unit));

        let device = Device::with_path(&path).map_err(|e| TakeError::DeviceOpen {
            device: path.clone(),
            reason: e.to_string(),
        })?;

        let caps = device.query_caps().map_err(|e| TakeError::DeviceOpen {
            device: path.clone(),
            reason: e.to_string(),
        })?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(TakeError::DeviceOpen {
                device: path,
                reason: "device doesn't support video capture".into(),
            });
        }

        let fmt = device.format().map_err(|e| TakeError::Device {
            op: "format",
            code: os_code(&e),
        })?;

        let format = if fmt.fourcc == FourCC::new(b"GREY") {
            PixelFormat::Mono8
        } else if fmt.fourcc == FourCC::new(b"Y16 ") {
            PixelFormat::Mono16
        } else if fmt.fourcc == FourCC::new(b"YUYV") {
            PixelFormat::Yuyv4
        } else if fmt.fourcc == FourCC::new(b"MJPG") {
            PixelFormat::Mjpeg
        } else {
            return Err(TakeError::PixelFormat(fmt.fourcc.to_string()));
        };

        let mut descriptor = FrameDescriptor::new(fmt.width, fmt.height, format);
        if fmt.stride as usize >= descriptor.stride {
            descriptor.stride = fmt.stride as usize;
        }

        Ok(Self {
            path,
            device,
            stream: None,
            descriptor,
            buffers: 0,
            timeout: None,
            counters: DeviceCounters::default(),
            last_sequence: None,
            pending: Vec::new(),
            frame_ready: false,
        })
    }

    fn open_stream(&mut self) -> Result<()> {
        let mut stream = MmapStream::with_buffers(&self.device, Type::VideoCapture, self.buffers)
            .map_err(|e| TakeError::BufferAlloc {
                count: self.buffers,
                reason: e.to_string(),
            })?;
        if let Some(timeout) = self.timeout {
            stream.set_timeout(timeout);
        }
        self.stream = Some(stream);
        self.last_sequence = None;
        Ok(())
    }
}

impl FrameSource for V4l2Source {
    fn describe(&self) -> String {
        format!(
            "{} ({}x{} {:?})",
            self.path, self.descriptor.width, self.descriptor.height, self.descriptor.format
        )
    }

    fn descriptor(&self) -> FrameDescriptor {
        self.descriptor.clone()
    }

    fn start(&mut self, buffers: u32) -> Result<()> {
        self.buffers = buffers;
        self.open_stream()?;
        info!("Capture stream started with {} buffers", buffers);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.stream = None;
        self.buffers = 0;
        self.frame_ready = false;
        Ok(())
    }

    fn wait_frame(&mut self, timeout: Duration) -> Result<WaitOutcome> {
        if self.timeout != Some(timeout) {
            self.timeout = Some(timeout);
            if let Some(stream) = self.stream.as_mut() {
                stream.set_timeout(timeout);
            }
        }
        if self.stream.is_none() {
            if self.buffers == 0 {
                return Err(TakeError::Device {
                    op: "wait_frame",
                    code: -1,
                });
            }
            // A failed restart left no stream behind.
            self.open_stream()?;
        }
        let stream = self.stream.as_mut().ok_or(TakeError::Device {
            op: "wait_frame",
            code: -1,
        })?;

        let (buf, meta) = match stream.next() {
            Ok(next) => next,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                self.counters.timeouts += 1;
                self.frame_ready = false;
                return Ok(WaitOutcome::Timeout);
            }
            Err(e) => {
                return Err(TakeError::Device {
                    op: "dequeue",
                    code: os_code(&e),
                })
            }
        };

        let skipped = match self.last_sequence {
            Some(last) => meta.sequence.wrapping_sub(last).saturating_sub(1),
            None => 0,
        };
        if skipped > 0 {
            self.counters.overruns += 1;
        }
        self.last_sequence = Some(meta.sequence);

        let used = (meta.bytesused as usize).min(buf.len());
        self.pending.clear();
        self.pending.extend_from_slice(&buf[..used]);
        self.frame_ready = true;
        Ok(WaitOutcome::Frame { skipped })
    }

    fn copy_frame(&mut self, dst: &mut [u8], row_bytes: usize) -> Result<()> {
        if !self.frame_ready {
            return Err(TakeError::Device {
                op: "copy_frame",
                code: -1,
            });
        }
        let stride = self.descriptor.stride;
        let rows = self.descriptor.height as usize;
        if row_bytes > stride || dst.len() < row_bytes * rows {
            return Err(TakeError::Device {
                op: "copy_frame",
                code: -1,
            });
        }
        for (src, out) in self
            .pending
            .chunks(stride)
            .zip(dst.chunks_exact_mut(row_bytes))
            .take(rows)
        {
            let n = src.len().min(row_bytes);
            out[..n].copy_from_slice(&src[..n]);
        }
        self.frame_ready = false;
        Ok(())
    }

    fn counters(&self) -> DeviceCounters {
        self.counters
    }

    fn timeout_restart(&mut self) -> Result<()> {
        warn!("Restarting capture stream on {}", self.path);
        self.stream = None;
        self.open_stream()
    }

    fn get_property(&mut self, id: u32) -> Result<f64> {
        let ctrl = self.device.control(id).map_err(|e| TakeError::Property {
            op: "get",
            id,
            code: os_code(&e),
        })?;
        match ctrl.value {
            Value::Integer(v) => Ok(v as f64),
            Value::Boolean(b) => Ok(if b { 1.0 } else { 0.0 }),
            _ => Err(TakeError::Property {
                op: "get",
                id,
                code: -libc::EINVAL,
            }),
        }
    }

    fn set_property(&mut self, id: u32, value: f64) -> Result<()> {
        let ctrl = Control {
            id,
            value: Value::Integer(value.round() as i64),
        };
        self.device.set_control(ctrl).map_err(|e| TakeError::Property {
            op: "set",
            id,
            code: os_code(&e),
        })
    }

    fn close(&mut self) -> Result<()> {
        self.stream = None;
        Ok(())
    }
}
