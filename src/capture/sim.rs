//! Scripted in-process frame source.
//!
//! Produces a moving test pattern and lets callers inject timeouts, overruns
//! and failing properties at chosen wait calls. Every device-visible action is
//! recorded in a shared [`SimJournal`] so it can be inspected after the source
//! has been moved into a [`DeviceGuard`](super::DeviceGuard).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crate::capture::{DeviceCounters, FrameDescriptor, FrameSource, WaitOutcome};
use crate::error::{Result, TakeError};

/// Everything the simulated device was asked to do
#[derive(Debug, Default, Clone)]
pub struct SimJournal {
    pub started_with: Option<u32>,
    pub stops: u32,
    pub closes: u32,
    /// Number of wait calls issued so far
    pub waits: u64,
    /// Wait-call number current at each timeout restart
    pub restarts: Vec<u64>,
    pub property_writes: Vec<(u32, f64)>,
    pub property_reads: Vec<u32>,
    pub frames_copied: u64,
}

pub struct SimulatedSource {
    unit: u32,
    descriptor: FrameDescriptor,
    interval: Duration,
    properties: HashMap<u32, f64>,
    failing_properties: HashSet<u32>,
    timeout_on: HashSet<u64>,
    overrun_on: HashSet<u64>,
    skipped_on: HashMap<u64, u32>,
    failing_restart: bool,
    counters: DeviceCounters,
    frame_ready: bool,
    running: bool,
    journal: Arc<Mutex<SimJournal>>,
}

impl SimulatedSource {
    pub fn new(unit: u32, descriptor: FrameDescriptor, interval: Duration) -> Self {
        Self {
            unit,
            descriptor,
            interval,
            properties: HashMap::new(),
            failing_properties: HashSet::new(),
            timeout_on: HashSet::new(),
            overrun_on: HashSet::new(),
            skipped_on: HashMap::new(),
            failing_restart: false,
            counters: DeviceCounters::default(),
            frame_ready: false,
            running: false,
            journal: Arc::new(Mutex::new(SimJournal::default())),
        }
    }

    /// Make the given wait calls (1-based) time out
    pub fn with_timeouts_on(mut self, waits: &[u64]) -> Self {
        self.timeout_on.extend(waits.iter().copied());
        self
    }

    /// Flag a buffer overrun on the given wait calls (1-based)
    pub fn with_overruns_on(mut self, waits: &[u64]) -> Self {
        self.overrun_on.extend(waits.iter().copied());
        self
    }

    pub fn with_skipped_on(mut self, wait: u64, skipped: u32) -> Self {
        self.skipped_on.insert(wait, skipped);
        self
    }

    /// Timeout restarts fail and leave the device stopped
    pub fn with_failing_restart(mut self) -> Self {
        self.failing_restart = true;
        self
    }

    pub fn with_property(mut self, id: u32, value: f64) -> Self {
        self.properties.insert(id, value);
        self
    }

    /// Every get or set of `id` fails
    pub fn with_failing_property(mut self, id: u32) -> Self {
        self.failing_properties.insert(id);
        self
    }

    pub fn journal(&self) -> Arc<Mutex<SimJournal>> {
        Arc::clone(&self.journal)
    }

    fn log(&self) -> MutexGuard<'_, SimJournal> {
        self.journal.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn check_property(&self, op: &'static str, id: u32) -> Result<()> {
        if self.failing_properties.contains(&id) {
            return Err(TakeError::Property { op, id, code: -1 });
        }
        Ok(())
    }
}

impl FrameSource for SimulatedSource {
    fn describe(&self) -> String {
        format!(
            "simulated camera unit {} ({}x{} {:?})",
            self.unit, self.descriptor.width, self.descriptor.height, self.descriptor.format
        )
    }

    fn descriptor(&self) -> FrameDescriptor {
        self.descriptor.clone()
    }

    fn start(&mut self, buffers: u32) -> Result<()> {
        if buffers == 0 {
            return Err(TakeError::BufferAlloc {
                count: buffers,
                reason: "at least one buffer is required".into(),
            });
        }
        self.running = true;
        self.log().started_with = Some(buffers);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.running = false;
        self.frame_ready = false;
        self.log().stops += 1;
        Ok(())
    }

    fn wait_frame(&mut self, _timeout: Duration) -> Result<WaitOutcome> {
        let call = {
            let mut log = self.log();
            log.waits += 1;
            log.waits
        };
        if !self.running {
            return Err(TakeError::Device {
                op: "wait_frame",
                code: -2,
            });
        }

        if self.overrun_on.contains(&call) {
            self.counters.overruns += 1;
        }
        if self.timeout_on.contains(&call) {
            self.counters.timeouts += 1;
            self.frame_ready = false;
            return Ok(WaitOutcome::Timeout);
        }

        if !self.interval.is_zero() {
            thread::sleep(self.interval);
        }
        self.frame_ready = true;
        Ok(WaitOutcome::Frame {
            skipped: self.skipped_on.get(&call).copied().unwrap_or(0),
        })
    }

    fn copy_frame(&mut self, dst: &mut [u8], row_bytes: usize) -> Result<()> {
        if !self.frame_ready {
            return Err(TakeError::Device {
                op: "copy_frame",
                code: -3,
            });
        }
        let height = self.descriptor.height as usize;
        let stride = self.descriptor.stride;
        if row_bytes > stride || dst.len() < row_bytes * height {
            return Err(TakeError::Device {
                op: "copy_frame",
                code: -4,
            });
        }

        let seq = {
            let mut log = self.log();
            log.frames_copied += 1;
            log.frames_copied
        };
        for (y, row) in dst.chunks_exact_mut(row_bytes).take(height).enumerate() {
            for (x, px) in row.iter_mut().enumerate() {
                *px = (x as u64 + y as u64 + seq) as u8;
            }
        }
        self.frame_ready = false;
        Ok(())
    }

    fn counters(&self) -> DeviceCounters {
        self.counters
    }

    fn timeout_restart(&mut self) -> Result<()> {
        {
            let mut log = self.log();
            let current = log.waits;
            log.restarts.push(current);
        }
        if self.failing_restart {
            self.running = false;
            self.frame_ready = false;
            return Err(TakeError::Device {
                op: "timeout_restart",
                code: -5,
            });
        }
        Ok(())
    }

    fn get_property(&mut self, id: u32) -> Result<f64> {
        self.log().property_reads.push(id);
        self.check_property("get", id)?;
        Ok(self.properties.get(&id).copied().unwrap_or(0.0))
    }

    fn set_property(&mut self, id: u32, value: f64) -> Result<()> {
        self.log().property_writes.push((id, value));
        self.check_property("set", id)?;
        self.properties.insert(id, value);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.running = false;
        self.log().closes += 1;
        Ok(())
    }
}
