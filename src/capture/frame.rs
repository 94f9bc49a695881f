use serde::{Deserialize, Serialize};

use crate::channel::DataType;
use crate::error::{Result, TakeError};

/// Pixel formats a frame source may report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Mono8,
    Mono16,
    Yuyv4,
    Mjpeg,
}

impl PixelFormat {
    pub fn bit_depth(self) -> u32 {
        match self {
            PixelFormat::Mono8 => 8,
            PixelFormat::Mono16 => 16,
            PixelFormat::Yuyv4 => 16,
            PixelFormat::Mjpeg => 0,
        }
    }
}

/// Device-side frame geometry, fixed for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameDescriptor {
    pub width: u32,
    pub height: u32,
    pub bit_depth: u32,
    pub format: PixelFormat,
    /// Row stride in bytes as delivered by the device
    pub stride: usize,
}

impl FrameDescriptor {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        let bit_depth = format.bit_depth();
        let stride = width as usize * (bit_depth as usize).div_ceil(8);
        Self {
            width,
            height,
            bit_depth,
            format,
            stride,
        }
    }
}

/// Options shaping how device frames land in the image channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputOptions {
    /// Publish unsigned elements instead of signed ones
    pub unsigned: bool,
    /// Device sends 16-bit pixels as byte pairs over an 8-bit tap
    pub byte_short_cast: bool,
}

/// Published shape and element type of the image channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelGeometry {
    pub width: u32,
    pub height: u32,
    pub datatype: DataType,
    /// Bytes per published row
    pub row_bytes: usize,
}

impl ChannelGeometry {
    pub fn derive(desc: &FrameDescriptor, opts: OutputOptions) -> Result<Self> {
        match desc.format {
            PixelFormat::Mono8 | PixelFormat::Mono16 => {}
            other => return Err(TakeError::PixelFormat(format!("{:?}", other))),
        }

        let width = if opts.byte_short_cast {
            desc.width / 2
        } else {
            desc.width
        };
        // Casting implies unsigned output.
        let unsigned = opts.unsigned || opts.byte_short_cast;
        let wide = opts.byte_short_cast || desc.bit_depth != 8;

        let datatype = match (wide, unsigned) {
            (false, true) => DataType::U8,
            (false, false) => DataType::I8,
            (true, true) => DataType::U16,
            (true, false) => DataType::I16,
        };

        if width == 0 || desc.height == 0 {
            return Err(TakeError::PixelFormat(format!(
                "degenerate frame {}x{}",
                desc.width, desc.height
            )));
        }

        Ok(Self {
            width,
            height: desc.height,
            datatype,
            row_bytes: width as usize * datatype.size(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mono16_defaults_to_signed_sixteen_bit() {
        let desc = FrameDescriptor::new(320, 256, PixelFormat::Mono16);
        assert_eq!(desc.stride, 640);
        let geom = ChannelGeometry::derive(&desc, OutputOptions::default()).unwrap();
        assert_eq!(geom.datatype, DataType::I16);
        assert_eq!(geom.row_bytes, 640);
        assert_eq!(geom.height, 256);
    }

    #[test]
    fn byte_short_cast_halves_width() {
        let desc = FrameDescriptor::new(640, 512, PixelFormat::Mono8);
        let opts = OutputOptions {
            unsigned: false,
            byte_short_cast: true,
        };
        let geom = ChannelGeometry::derive(&desc, opts).unwrap();
        assert_eq!(geom.width, 320);
        assert_eq!(geom.datatype, DataType::U16);
        assert_eq!(geom.row_bytes, desc.stride);
    }

    #[test]
    fn mono8_unsigned() {
        let desc = FrameDescriptor::new(128, 128, PixelFormat::Mono8);
        let opts = OutputOptions {
            unsigned: true,
            byte_short_cast: false,
        };
        let geom = ChannelGeometry::derive(&desc, opts).unwrap();
        assert_eq!(geom.datatype, DataType::U8);
    }

    #[test]
    fn compressed_formats_are_unusable() {
        let desc = FrameDescriptor::new(800, 600, PixelFormat::Mjpeg);
        let err = ChannelGeometry::derive(&desc, OutputOptions::default()).unwrap_err();
        assert!(err.is_fatal());
    }
}
