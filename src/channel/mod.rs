//! Named shared-memory image channels.
//!
//! A channel is one file under the shm directory holding a metadata header, a
//! fixed keyword table and a single frame. There is exactly one producer; any
//! number of consumers map the same file read-only in spirit.
//!
//! # Publish protocol
//!
//! The producer wraps every frame update in a [`FrameWrite`]:
//! 1. `write` flag set, request counter `cnt0` bumped, release fence
//! 2. frame bytes and keywords written
//! 3. commit counter `cnt1` bumped (release), `write` cleared, every
//!    semaphore posted once
//!
//! Dropping a `FrameWrite` without committing clears the flag without touching
//! `cnt1`. Readers sample `write`, `cnt0` and `cnt1` before and after copying
//! and only trust the copy when all three are unchanged and `write` is clear
//! (see [`ImageChannel::read_consistent`]).

pub mod keywords;
pub mod layout;
pub mod semaphore;

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{fence, Ordering};
use std::time::Duration;

use memmap2::{MmapMut, MmapOptions};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::{getpid, Pid};
use tracing::{debug, info, warn};

pub use keywords::{Keyword, KeywordSlotMap, KeywordValue, Reserved};
pub use layout::DataType;
use layout::{
    ChannelHeader, KeywordRaw, HEADER_SIZE, KW_EMPTY, LAYOUT_VERSION, MAGIC, NB_SEM,
};

use crate::error::{Result, TakeError};
use crate::utils;

/// Keyword capacity of channels created by this crate
pub const DEFAULT_NB_KW: usize = 50;

pub fn channel_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.im.shm", name))
}

pub struct ImageChannel {
    name: String,
    path: PathBuf,
    /// Kept alive for the lifetime of the raw pointers below
    _mmap: MmapMut,
    base: *mut u8,
    owner: bool,
    width: u32,
    height: u32,
    datatype: DataType,
    nb_kw: usize,
    data_offset: usize,
    data_len: usize,
    sem_index: Option<usize>,
}

impl std::fmt::Debug for ImageChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageChannel")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("owner", &self.owner)
            .field("shape", &(self.width, self.height))
            .field("datatype", &self.datatype)
            .field("cnt0", &self.cnt0())
            .field("cnt1", &self.cnt1())
            .finish()
    }
}

// SAFETY: the channel owns its mapping; the raw pointers never outlive it and
// all cross-thread visible state in the header is atomic.
unsafe impl Send for ImageChannel {}

impl ImageChannel {
    /// Create a fresh channel, replacing any previous file of the same name.
    ///
    /// The old file is unlinked rather than truncated so consumers still
    /// mapping it are not faulted.
    pub fn create(
        dir: &Path,
        name: &str,
        width: u32,
        height: u32,
        datatype: DataType,
        nb_kw: usize,
    ) -> Result<Self> {
        let create_err = |source: io::Error| TakeError::ChannelCreate {
            name: name.to_string(),
            source,
        };
        let path = channel_path(dir, name);
        let nelement = width as usize * height as usize;
        let total = layout::total_size(nb_kw, nelement, datatype);

        match fs::remove_file(&path) {
            Ok(()) => debug!("Removed stale channel file {:?}", path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(create_err(e)),
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(create_err)?;
        file.set_len(total as u64).map_err(create_err)?;

        // SAFETY: we just created the file with the requested size.
        let mut mmap = unsafe { MmapOptions::new().map_mut(&file).map_err(create_err)? };
        let base = mmap.as_mut_ptr();

        // SAFETY: the mapping is `total` bytes, at least HEADER_SIZE plus the
        // keyword table, page aligned and zero filled by set_len.
        unsafe {
            let hdr = base as *mut ChannelHeader;
            (*hdr).version = LAYOUT_VERSION;
            (*hdr).datatype = datatype.code();
            (*hdr).naxis = 2;
            (*hdr).size = [width, height, 0];
            (*hdr).nb_kw = nb_kw as u32;
            (*hdr).nelement = nelement as u64;
            (*hdr).creation_time_us = utils::micros_since_epoch();
            layout::write_cstr(&mut (*hdr).name, name);
            (*hdr).nb_sem = NB_SEM as u32;

            let kws = base.add(HEADER_SIZE) as *mut KeywordRaw;
            for i in 0..nb_kw {
                (*kws.add(i)).kind = KW_EMPTY;
            }

            // Attachers check the magic, so it goes last.
            fence(Ordering::Release);
            ptr::write_volatile(&mut (*hdr).magic, MAGIC);
        }

        info!(
            "Created channel {} ({}x{} {:?}, {} keywords) at {:?}",
            name, width, height, datatype, nb_kw, path
        );

        Ok(Self {
            name: name.to_string(),
            path,
            _mmap: mmap,
            base,
            owner: true,
            width,
            height,
            datatype,
            nb_kw,
            data_offset: layout::data_offset(nb_kw),
            data_len: nelement * datatype.size(),
            sem_index: None,
        })
    }

    /// Attach to an existing channel
    pub fn open(dir: &Path, name: &str) -> Result<Self> {
        let open_err = |reason: String| TakeError::ChannelOpen {
            name: name.to_string(),
            reason,
        };
        let path = channel_path(dir, name);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| open_err(format!("{:?}: {}", path, e)))?;
        let len = file
            .metadata()
            .map_err(|e| open_err(e.to_string()))?
            .len() as usize;
        if len < HEADER_SIZE {
            return Err(open_err(format!("file too small ({} bytes)", len)));
        }

        // SAFETY: the file exists and is at least HEADER_SIZE bytes long.
        let mut mmap = unsafe {
            MmapOptions::new()
                .map_mut(&file)
                .map_err(|e| open_err(e.to_string()))?
        };
        let base = mmap.as_mut_ptr();

        // SAFETY: mapping is at least HEADER_SIZE bytes and page aligned.
        let (magic, version, dt_code, size, nb_kw, nelement) = unsafe {
            let hdr = base as *const ChannelHeader;
            let magic = ptr::read_volatile(&(*hdr).magic);
            fence(Ordering::Acquire);
            (
                magic,
                (*hdr).version,
                (*hdr).datatype,
                (*hdr).size,
                (*hdr).nb_kw as usize,
                (*hdr).nelement as usize,
            )
        };

        if magic != MAGIC {
            return Err(open_err(format!(
                "invalid magic: expected 0x{:016X}, got 0x{:016X}",
                MAGIC, magic
            )));
        }
        if version != LAYOUT_VERSION {
            return Err(open_err(format!("unsupported layout version {}", version)));
        }
        let datatype = DataType::from_code(dt_code)
            .ok_or_else(|| open_err(format!("unknown datatype code {}", dt_code)))?;
        let total = layout::total_size(nb_kw, nelement, datatype);
        if len < total {
            return Err(open_err(format!(
                "file has {} bytes, layout needs {}",
                len, total
            )));
        }

        debug!("Attached to channel {} at {:?}", name, path);

        Ok(Self {
            name: name.to_string(),
            path,
            _mmap: mmap,
            base,
            owner: false,
            width: size[0],
            height: size[1],
            datatype,
            nb_kw,
            data_offset: layout::data_offset(nb_kw),
            data_len: nelement * datatype.size(),
            sem_index: None,
        })
    }

    pub fn exists(dir: &Path, name: &str) -> bool {
        channel_path(dir, name).exists()
    }

    fn header(&self) -> &ChannelHeader {
        // SAFETY: base points at a validated header inside the live mapping.
        unsafe { &*(self.base as *const ChannelHeader) }
    }

    fn keyword_table(&self) -> &[KeywordRaw] {
        // SAFETY: the keyword table follows the header and holds nb_kw entries.
        unsafe {
            std::slice::from_raw_parts(self.base.add(HEADER_SIZE) as *const KeywordRaw, self.nb_kw)
        }
    }

    fn keyword_table_mut(&mut self) -> &mut [KeywordRaw] {
        // SAFETY: as above; &mut self makes this the only in-process view.
        unsafe {
            std::slice::from_raw_parts_mut(self.base.add(HEADER_SIZE) as *mut KeywordRaw, self.nb_kw)
        }
    }

    fn data_ptr(&self) -> *mut u8 {
        // SAFETY: data_offset + data_len lies inside the mapping (checked on open/create).
        unsafe { self.base.add(self.data_offset) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True when this process created the channel
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn datatype(&self) -> DataType {
        self.datatype
    }

    pub fn nb_kw(&self) -> usize {
        self.nb_kw
    }

    pub fn data_len(&self) -> usize {
        self.data_len
    }

    pub fn cnt0(&self) -> u64 {
        self.header().cnt0.load(Ordering::Acquire)
    }

    pub fn cnt1(&self) -> u64 {
        self.header().cnt1.load(Ordering::Acquire)
    }

    pub fn is_writing(&self) -> bool {
        self.header().write.load(Ordering::Acquire) != 0
    }

    /// Raw view of the frame; may be torn while a write is in progress
    pub fn data(&self) -> &[u8] {
        // SAFETY: data region lies inside the mapping.
        unsafe { std::slice::from_raw_parts(self.data_ptr(), self.data_len) }
    }

    /// Element 0 of the data array widened to i64
    pub fn first_element(&self) -> i64 {
        let d = self.data();
        if d.len() < self.datatype.size() {
            return 0;
        }
        match self.datatype {
            DataType::U8 => d[0] as i64,
            DataType::I8 => d[0] as i8 as i64,
            DataType::U16 => u16::from_ne_bytes([d[0], d[1]]) as i64,
            DataType::I16 => i16::from_ne_bytes([d[0], d[1]]) as i64,
            DataType::U32 => u32::from_ne_bytes([d[0], d[1], d[2], d[3]]) as i64,
            DataType::I32 => i32::from_ne_bytes([d[0], d[1], d[2], d[3]]) as i64,
            DataType::F32 => f32::from_ne_bytes([d[0], d[1], d[2], d[3]]) as i64,
            DataType::F64 => {
                let mut b = [0u8; 8];
                b.copy_from_slice(&d[..8]);
                f64::from_ne_bytes(b) as i64
            }
        }
    }

    /// Copy the current frame into `out` if no write overlapped the copy.
    ///
    /// Returns the commit counter the copy corresponds to, or `None` when the
    /// caller should retry.
    pub fn read_consistent(&self, out: &mut [u8]) -> Option<u64> {
        let hdr = self.header();
        let w1 = hdr.write.load(Ordering::Acquire);
        let r1 = hdr.cnt0.load(Ordering::Acquire);
        let c1 = hdr.cnt1.load(Ordering::Acquire);
        if w1 != 0 {
            return None;
        }

        let n = out.len().min(self.data_len);
        // SAFETY: both ranges are valid for n bytes and do not overlap.
        unsafe { ptr::copy_nonoverlapping(self.data_ptr(), out.as_mut_ptr(), n) };

        fence(Ordering::Acquire);
        let c2 = hdr.cnt1.load(Ordering::Relaxed);
        let r2 = hdr.cnt0.load(Ordering::Relaxed);
        let w2 = hdr.write.load(Ordering::Relaxed);

        (w2 == 0 && c1 == c2 && r1 == r2).then_some(c1)
    }

    pub fn keyword(&self, idx: usize) -> Keyword {
        let raw = &self.keyword_table()[idx];
        Keyword {
            name: layout::read_cstr(&raw.name).to_string(),
            value: KeywordValue::decode(raw.kind, &raw.value),
            comment: layout::read_cstr(&raw.comment).to_string(),
        }
    }

    pub fn find_keyword(&self, name: &str) -> Option<usize> {
        self.keyword_table()
            .iter()
            .position(|kw| kw.kind != KW_EMPTY && layout::read_cstr(&kw.name) == name)
    }

    pub fn first_empty_keyword(&self) -> Option<usize> {
        self.keyword_table()
            .iter()
            .position(|kw| kw.kind == KW_EMPTY || kw.name[0] == 0)
    }

    pub fn define_keyword(&mut self, idx: usize, name: &str, value: KeywordValue, comment: &str) {
        let raw = &mut self.keyword_table_mut()[idx];
        layout::write_cstr(&mut raw.name, name);
        layout::write_cstr(&mut raw.comment, comment);
        raw.kind = value.kind();
        raw.value = value.encode();
    }

    /// Overwrite the value (and type tag) of an already named slot
    pub fn set_keyword_value(&mut self, idx: usize, value: KeywordValue) {
        let raw = &mut self.keyword_table_mut()[idx];
        raw.kind = value.kind();
        raw.value = value.encode();
    }

    /// Start a frame update; see the module docs for the protocol
    pub fn begin_write(&mut self) -> FrameWrite<'_> {
        let hdr = self.header();
        hdr.write.store(1, Ordering::Relaxed);
        hdr.cnt0.fetch_add(1, Ordering::Relaxed);
        fence(Ordering::Release);
        FrameWrite {
            channel: self,
            done: false,
        }
    }

    /// Publish the current contents again, e.g. after keyword-only changes
    pub fn republish(&mut self) -> u64 {
        self.begin_write().commit()
    }

    fn post_all(&self) {
        for sem in &self.header().sem_value {
            semaphore::post(sem);
        }
    }

    /// Claim a semaphore index for this process, reclaiming slots of dead owners
    pub fn claim_semaphore(&mut self) -> Result<usize> {
        if let Some(idx) = self.sem_index {
            return Ok(idx);
        }
        let me = getpid().as_raw();
        let hdr = self.header();
        let claimed = hdr.sem_pid.iter().position(|owner| {
            let current = owner.load(Ordering::Acquire);
            let free = current == 0 || !pid_alive(current);
            free && owner
                .compare_exchange(current, me, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        });
        match claimed {
            Some(idx) => {
                semaphore::flush(&hdr.sem_value[idx]);
                debug!("Claimed semaphore {} on {}", idx, self.name);
                self.sem_index = Some(idx);
                Ok(idx)
            }
            None => Err(TakeError::ChannelOpen {
                name: self.name.clone(),
                reason: format!("all {} semaphores are claimed", NB_SEM),
            }),
        }
    }

    /// Non-blocking check for a post on the claimed semaphore
    pub fn try_wait_update(&self) -> bool {
        match self.sem_index {
            Some(idx) => semaphore::try_wait(&self.header().sem_value[idx]),
            None => false,
        }
    }

    pub fn wait_update(&self, timeout: Duration) -> bool {
        match self.sem_index {
            Some(idx) => semaphore::wait_timeout(&self.header().sem_value[idx], timeout),
            None => false,
        }
    }

    /// Discard pending posts on the claimed semaphore
    pub fn flush_updates(&self) -> u32 {
        match self.sem_index {
            Some(idx) => semaphore::flush(&self.header().sem_value[idx]),
            None => 0,
        }
    }

    fn release_semaphore(&mut self) {
        if let Some(idx) = self.sem_index.take() {
            let me = getpid().as_raw();
            let _ = self.header().sem_pid[idx].compare_exchange(
                me,
                0,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }
}

impl Drop for ImageChannel {
    fn drop(&mut self) {
        self.release_semaphore();
        if self.is_writing() && self.owner {
            warn!("Channel {} closed with a write in progress", self.name);
        }
    }
}

fn pid_alive(pid: i32) -> bool {
    !matches!(kill(Pid::from_raw(pid), None), Err(Errno::ESRCH))
}

/// In-progress frame update; commit to publish, drop to abandon
pub struct FrameWrite<'a> {
    channel: &'a mut ImageChannel,
    done: bool,
}

impl<'a> FrameWrite<'a> {
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        let len = self.channel.data_len;
        // SAFETY: data region lies inside the mapping; &mut self is the only
        // in-process view while the write flag is set.
        unsafe { std::slice::from_raw_parts_mut(self.channel.data_ptr(), len) }
    }

    pub fn set_keyword(&mut self, idx: usize, value: KeywordValue) {
        self.channel.set_keyword_value(idx, value);
    }

    /// Publish the frame and wake every waiter once; returns the new commit count
    pub fn commit(mut self) -> u64 {
        self.done = true;
        let hdr = self.channel.header();
        let committed = hdr.cnt1.fetch_add(1, Ordering::Release) + 1;
        hdr.write.store(0, Ordering::Release);
        self.channel.post_all();
        committed
    }
}

impl Drop for FrameWrite<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.channel.header().write.store(0, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_attach_sees_same_shape() {
        let dir = tempfile::tempdir().unwrap();
        {
            let chan = ImageChannel::create(dir.path(), "shape", 64, 32, DataType::U16, 50).unwrap();
            assert!(chan.is_owner());
            assert_eq!(chan.data_len(), 64 * 32 * 2);
        }
        let chan = ImageChannel::open(dir.path(), "shape").unwrap();
        assert!(!chan.is_owner());
        assert_eq!((chan.width(), chan.height()), (64, 32));
        assert_eq!(chan.datatype(), DataType::U16);
        assert_eq!(chan.nb_kw(), 50);
    }

    #[test]
    fn open_missing_channel_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = ImageChannel::open(dir.path(), "nope").unwrap_err();
        assert!(matches!(err, TakeError::ChannelOpen { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn open_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(channel_path(dir.path(), "junk"), vec![7u8; 4096]).unwrap();
        let err = ImageChannel::open(dir.path(), "junk").unwrap_err();
        assert!(err.to_string().contains("invalid magic"));
    }

    #[test]
    fn commit_counts_and_clears_write_flag() {
        let dir = tempfile::tempdir().unwrap();
        let mut chan = ImageChannel::create(dir.path(), "commit", 4, 4, DataType::U8, 4).unwrap();
        for n in 1..=3u64 {
            let mut w = chan.begin_write();
            w.buffer_mut().fill(n as u8);
            assert_eq!(w.commit(), n);
            assert!(!chan.is_writing());
        }
        assert_eq!(chan.cnt0(), 3);
        assert_eq!(chan.cnt1(), 3);
    }

    #[test]
    fn abandoned_write_does_not_commit() {
        let dir = tempfile::tempdir().unwrap();
        let mut chan = ImageChannel::create(dir.path(), "abandon", 4, 4, DataType::U8, 4).unwrap();
        {
            let mut w = chan.begin_write();
            w.buffer_mut()[0] = 9;
            assert!(w.channel.is_writing());
        }
        assert!(!chan.is_writing());
        assert_eq!(chan.cnt1(), 0);
        assert_eq!(chan.cnt0(), 1);
        let mut out = vec![0u8; 16];
        assert_eq!(chan.read_consistent(&mut out), Some(0));
    }

    #[test]
    fn reader_rejects_copy_during_write() {
        let dir = tempfile::tempdir().unwrap();
        let mut producer =
            ImageChannel::create(dir.path(), "torn", 4, 1, DataType::U8, 4).unwrap();
        let reader = ImageChannel::open(dir.path(), "torn").unwrap();
        let mut out = [0u8; 4];

        let w = producer.begin_write();
        assert_eq!(reader.read_consistent(&mut out), None);
        w.commit();
        assert_eq!(reader.read_consistent(&mut out), Some(1));
    }

    #[test]
    fn commit_posts_claimed_semaphore_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut producer =
            ImageChannel::create(dir.path(), "sems", 2, 2, DataType::U8, 4).unwrap();
        let mut reader = ImageChannel::open(dir.path(), "sems").unwrap();
        reader.claim_semaphore().unwrap();

        assert!(!reader.try_wait_update());
        producer.begin_write().commit();
        assert!(reader.try_wait_update());
        assert!(!reader.try_wait_update());

        producer.republish();
        producer.republish();
        assert_eq!(reader.flush_updates(), 2);
    }

    #[test]
    fn slow_reader_backlog_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let mut producer =
            ImageChannel::create(dir.path(), "backlog", 2, 2, DataType::U8, 4).unwrap();
        let mut reader = ImageChannel::open(dir.path(), "backlog").unwrap();
        reader.claim_semaphore().unwrap();

        for _ in 0..1000 {
            producer.republish();
        }
        assert_eq!(producer.cnt1(), 1000);
        assert_eq!(reader.flush_updates(), semaphore::SEM_VALUE_MAX);
    }

    #[test]
    fn blocking_wait_wakes_on_commit() {
        let dir = tempfile::tempdir().unwrap();
        let mut producer =
            ImageChannel::create(dir.path(), "blocking", 2, 2, DataType::U8, 4).unwrap();
        let mut reader = ImageChannel::open(dir.path(), "blocking").unwrap();
        reader.claim_semaphore().unwrap();
        assert!(!reader.wait_update(Duration::from_millis(5)));

        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            producer.republish()
        });
        assert!(reader.wait_update(Duration::from_secs(5)));
        assert_eq!(writer.join().unwrap(), 1);
    }

    #[test]
    fn claim_reuses_own_slot_and_releases_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let chan = ImageChannel::create(dir.path(), "claim", 2, 2, DataType::U8, 4).unwrap();
        let first = {
            let mut a = ImageChannel::open(dir.path(), "claim").unwrap();
            a.claim_semaphore().unwrap()
        };
        let mut b = ImageChannel::open(dir.path(), "claim").unwrap();
        assert_eq!(b.claim_semaphore().unwrap(), first);
        drop(chan);
    }

    #[test]
    fn recreate_replaces_old_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut old = ImageChannel::create(dir.path(), "again", 2, 2, DataType::U8, 4).unwrap();
        old.begin_write().commit();
        let fresh = ImageChannel::create(dir.path(), "again", 8, 8, DataType::I16, 4).unwrap();
        assert_eq!(fresh.cnt1(), 0);
        // The old mapping stays valid for whoever still holds it.
        assert_eq!(old.cnt1(), 1);
        let attached = ImageChannel::open(dir.path(), "again").unwrap();
        assert_eq!(attached.width(), 8);
    }

    #[test]
    fn first_element_reads_pending_count() {
        let dir = tempfile::tempdir().unwrap();
        let mut chan = ImageChannel::create(dir.path(), "count", 1, 1, DataType::I32, 4).unwrap();
        let mut w = chan.begin_write();
        w.buffer_mut().copy_from_slice(&3i32.to_ne_bytes());
        w.commit();
        assert_eq!(chan.first_element(), 3);
    }
}
