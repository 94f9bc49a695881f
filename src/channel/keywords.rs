//! Keyword values and the reserved-keyword slot map

use tracing::{debug, warn};

use super::layout::{KW_EMPTY, KW_FLOAT, KW_INT, KW_STRING, KW_VALUE_LEN};
use super::ImageChannel;
use crate::error::{Result, TakeError};

/// Decoded keyword value
#[derive(Debug, Clone, PartialEq)]
pub enum KeywordValue {
    Empty,
    Float(f64),
    Int(i64),
    Str(String),
}

impl KeywordValue {
    pub fn kind(&self) -> u8 {
        match self {
            KeywordValue::Empty => KW_EMPTY,
            KeywordValue::Float(_) => KW_FLOAT,
            KeywordValue::Int(_) => KW_INT,
            KeywordValue::Str(_) => KW_STRING,
        }
    }

    pub(crate) fn encode(&self) -> [u8; KW_VALUE_LEN] {
        let mut raw = [0u8; KW_VALUE_LEN];
        match self {
            KeywordValue::Empty => {}
            KeywordValue::Float(v) => raw[..8].copy_from_slice(&v.to_ne_bytes()),
            KeywordValue::Int(v) => raw[..8].copy_from_slice(&v.to_ne_bytes()),
            KeywordValue::Str(s) => super::layout::write_cstr(&mut raw, s),
        }
        raw
    }

    pub(crate) fn decode(kind: u8, raw: &[u8; KW_VALUE_LEN]) -> Self {
        let mut word = [0u8; 8];
        word.copy_from_slice(&raw[..8]);
        match kind {
            KW_FLOAT => KeywordValue::Float(f64::from_ne_bytes(word)),
            KW_INT => KeywordValue::Int(i64::from_ne_bytes(word)),
            KW_STRING => KeywordValue::Str(super::layout::read_cstr(raw).to_string()),
            _ => KeywordValue::Empty,
        }
    }

    /// Numeric view used when pushing a value to a device property
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            KeywordValue::Float(v) => Some(*v),
            KeywordValue::Int(v) => Some(*v as f64),
            KeywordValue::Str(s) => s.trim().parse().ok(),
            KeywordValue::Empty => None,
        }
    }
}

/// A keyword slot read back from a channel
#[derive(Debug, Clone, PartialEq)]
pub struct Keyword {
    pub name: String,
    pub value: KeywordValue,
    pub comment: String,
}

/// Keywords the acquisition loop always maintains on its image channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reserved {
    FrameRate,
    AcqTime,
    SizeX,
    SizeY,
}

impl Reserved {
    pub const ALL: [Reserved; 4] = [
        Reserved::FrameRate,
        Reserved::AcqTime,
        Reserved::SizeX,
        Reserved::SizeY,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Reserved::FrameRate => "MFRATE",
            Reserved::AcqTime => "_MAQTIME",
            Reserved::SizeX => "_FGSIZE1",
            Reserved::SizeY => "_FGSIZE2",
        }
    }

    pub fn comment(self) -> &'static str {
        match self {
            Reserved::FrameRate => "Measured frame rate (Hz)",
            Reserved::AcqTime => "Frame acq time (us, CLOCK_REALTIME)",
            Reserved::SizeX => "Size of frame grabber for the X axis (pixel)",
            Reserved::SizeY => "Size of frame grabber for the Y axis (pixel)",
        }
    }

    pub fn initial(self) -> KeywordValue {
        match self {
            Reserved::FrameRate => KeywordValue::Float(0.0),
            _ => KeywordValue::Int(0),
        }
    }

    fn position(self) -> usize {
        self as usize
    }
}

/// Name to slot-index map for the reserved keywords, built once per run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeywordSlotMap {
    slots: [usize; 4],
}

impl KeywordSlotMap {
    /// Pick the strategy matching how the channel was obtained
    pub fn resolve(channel: &mut ImageChannel) -> Result<Self> {
        if channel.is_owner() {
            Self::assign_fresh(channel)
        } else {
            Self::discover(channel)
        }
    }

    /// Lay the reserved keywords out in the first slots of a fresh channel
    pub fn assign_fresh(channel: &mut ImageChannel) -> Result<Self> {
        let mut slots = [0usize; 4];
        for kw in Reserved::ALL {
            let idx = kw.position();
            if idx >= channel.nb_kw() {
                return Err(TakeError::KeywordSpace {
                    name: channel.name().to_string(),
                    keyword: kw.name().to_string(),
                });
            }
            channel.define_keyword(idx, kw.name(), kw.initial(), kw.comment());
            slots[idx] = idx;
        }
        debug!("Assigned reserved keywords on {}: {:?}", channel.name(), slots);
        Ok(Self { slots })
    }

    /// Find the reserved keywords by name on an attached channel.
    ///
    /// Other processes may have added keywords in any order, so nothing about
    /// positions is assumed. A reserved keyword that is missing is defined in
    /// the first empty slot.
    pub fn discover(channel: &mut ImageChannel) -> Result<Self> {
        let mut slots = [0usize; 4];
        for kw in Reserved::ALL {
            let idx = match channel.find_keyword(kw.name()) {
                Some(idx) => idx,
                None => {
                    let idx = channel.first_empty_keyword().ok_or_else(|| {
                        TakeError::KeywordSpace {
                            name: channel.name().to_string(),
                            keyword: kw.name().to_string(),
                        }
                    })?;
                    warn!(
                        "Keyword {} missing on {}, defining it in slot {}",
                        kw.name(),
                        channel.name(),
                        idx
                    );
                    channel.define_keyword(idx, kw.name(), kw.initial(), kw.comment());
                    idx
                }
            };
            slots[kw.position()] = idx;
        }
        debug!("Discovered reserved keywords on {}: {:?}", channel.name(), slots);
        Ok(Self { slots })
    }

    pub fn index(&self, kw: Reserved) -> usize {
        self.slots[kw.position()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::DataType;

    #[test]
    fn values_encode_and_decode() {
        let cases = [
            KeywordValue::Float(-8.25),
            KeywordValue::Int(1_700_000_000_000_000),
            KeywordValue::Str("GLOBAL".into()),
        ];
        for value in cases {
            let raw = value.encode();
            assert_eq!(KeywordValue::decode(value.kind(), &raw), value);
        }
    }

    #[test]
    fn numeric_view_parses_strings() {
        assert_eq!(KeywordValue::Str(" 2.5 ".into()).as_f64(), Some(2.5));
        assert_eq!(KeywordValue::Int(3).as_f64(), Some(3.0));
        assert_eq!(KeywordValue::Empty.as_f64(), None);
    }

    #[test]
    fn discover_ignores_position() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut chan = ImageChannel::create(dir.path(), "kwshuffle", 4, 4, DataType::U8, 8)
                .unwrap();
            chan.define_keyword(0, "EXPTIME", KeywordValue::Float(0.1), "exposure");
            chan.define_keyword(2, "_FGSIZE2", KeywordValue::Int(4), "");
            chan.define_keyword(5, "MFRATE", KeywordValue::Float(0.0), "");
        }
        let mut chan = ImageChannel::open(dir.path(), "kwshuffle").unwrap();
        let map = KeywordSlotMap::discover(&mut chan).unwrap();
        assert_eq!(map.index(Reserved::SizeY), 2);
        assert_eq!(map.index(Reserved::FrameRate), 5);
        // Missing ones land in empty slots, never on top of EXPTIME.
        assert_eq!(map.index(Reserved::AcqTime), 1);
        assert_eq!(map.index(Reserved::SizeX), 3);
        assert_eq!(chan.keyword(0).name, "EXPTIME");

        let again = KeywordSlotMap::discover(&mut chan).unwrap();
        assert_eq!(map, again);
    }

    #[test]
    fn discover_fails_without_room() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut chan =
                ImageChannel::create(dir.path(), "kwfull", 2, 2, DataType::U8, 2).unwrap();
            chan.define_keyword(0, "A", KeywordValue::Int(1), "");
            chan.define_keyword(1, "B", KeywordValue::Int(2), "");
        }
        let mut chan = ImageChannel::open(dir.path(), "kwfull").unwrap();
        let err = KeywordSlotMap::discover(&mut chan).unwrap_err();
        assert!(matches!(err, TakeError::KeywordSpace { .. }));
    }
}
