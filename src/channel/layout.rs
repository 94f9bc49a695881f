//! On-disk (in-shm) layout of an image channel.
//!
//! ```text
//! +-------------------------+ 0
//! | ChannelHeader (256 B)   |
//! +-------------------------+ HEADER_SIZE
//! | KeywordRaw x nb_kw      |   120 B each
//! +-------------------------+ data_offset (64 B aligned)
//! | frame data              |   nelement * datatype.size()
//! +-------------------------+
//! ```
//!
//! All structures are `#[repr(C)]` so that non-Rust readers can map the same
//! file.

use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64};

use serde::{Deserialize, Serialize};

pub const MAGIC: u64 = 0x5348_4D54_414B_4501; // "SHMTAKE\x01"
pub const LAYOUT_VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 256;
pub const KEYWORD_SIZE: usize = 120;
pub const NB_SEM: usize = 10;
pub const NAME_LEN: usize = 80;
pub const KW_NAME_LEN: usize = 16;
pub const KW_VALUE_LEN: usize = 16;
pub const KW_COMMENT_LEN: usize = 80;
const DATA_ALIGN: usize = 64;

/// Element type of the channel data array
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
    F64,
}

impl DataType {
    pub fn size(self) -> usize {
        match self {
            DataType::U8 | DataType::I8 => 1,
            DataType::U16 | DataType::I16 => 2,
            DataType::U32 | DataType::I32 | DataType::F32 => 4,
            DataType::F64 => 8,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            DataType::U8 => 1,
            DataType::I8 => 2,
            DataType::U16 => 3,
            DataType::I16 => 4,
            DataType::U32 => 5,
            DataType::I32 => 6,
            DataType::F32 => 9,
            DataType::F64 => 10,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => DataType::U8,
            2 => DataType::I8,
            3 => DataType::U16,
            4 => DataType::I16,
            5 => DataType::U32,
            6 => DataType::I32,
            9 => DataType::F32,
            10 => DataType::F64,
            _ => return None,
        })
    }
}

/// Channel metadata block.
///
/// Layout (256 bytes):
/// - identity: magic, version, datatype, naxis, size, nb_kw, nelement,
///   creation time, name (128 bytes)
/// - publish state: write flag, nb_sem, cnt0, cnt1 (24 bytes)
/// - semaphore values and owner pids (80 bytes)
/// - padding (24 bytes)
#[repr(C)]
pub struct ChannelHeader {
    pub magic: u64,
    pub version: u32,
    pub datatype: u8,
    pub naxis: u8,
    pub _pad0: [u8; 2],
    pub size: [u32; 3],
    pub nb_kw: u32,
    pub nelement: u64,
    pub creation_time_us: i64,
    pub name: [u8; NAME_LEN],

    /// Non-zero while the producer mutates the data array
    pub write: AtomicU32,
    pub nb_sem: u32,
    /// Request counter, bumped when a write begins
    pub cnt0: AtomicU64,
    /// Commit counter, bumped when a frame is fully written
    pub cnt1: AtomicU64,

    pub sem_value: [AtomicU32; NB_SEM],
    pub sem_pid: [AtomicI32; NB_SEM],

    pub _padding: [u8; 24],
}

const _: () = assert!(
    std::mem::size_of::<ChannelHeader>() == HEADER_SIZE,
    "ChannelHeader size must equal HEADER_SIZE"
);

/// Keyword type tags
pub const KW_EMPTY: u8 = b'N';
pub const KW_FLOAT: u8 = b'D';
pub const KW_INT: u8 = b'L';
pub const KW_STRING: u8 = b'S';

/// One keyword slot as stored in shared memory
#[repr(C)]
#[derive(Clone, Copy)]
pub struct KeywordRaw {
    pub name: [u8; KW_NAME_LEN],
    pub kind: u8,
    pub _pad: [u8; 7],
    pub value: [u8; KW_VALUE_LEN],
    pub comment: [u8; KW_COMMENT_LEN],
}

const _: () = assert!(
    std::mem::size_of::<KeywordRaw>() == KEYWORD_SIZE,
    "KeywordRaw size must equal KEYWORD_SIZE"
);

pub fn data_offset(nb_kw: usize) -> usize {
    let end = HEADER_SIZE + nb_kw * KEYWORD_SIZE;
    end.div_ceil(DATA_ALIGN) * DATA_ALIGN
}

pub fn total_size(nb_kw: usize, nelement: usize, datatype: DataType) -> usize {
    data_offset(nb_kw) + nelement * datatype.size()
}

/// Copy `src` into a fixed NUL-padded field, truncating to leave a terminator
pub fn write_cstr(dst: &mut [u8], src: &str) {
    dst.fill(0);
    let n = src.len().min(dst.len().saturating_sub(1));
    dst[..n].copy_from_slice(&src.as_bytes()[..n]);
}

pub fn read_cstr(src: &[u8]) -> &str {
    let end = src.iter().position(|&b| b == 0).unwrap_or(src.len());
    std::str::from_utf8(&src[..end]).unwrap_or("")
}
