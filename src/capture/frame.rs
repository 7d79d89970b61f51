use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::BufferError;

/// Frame data with zero-copy semantics
#[derive(Debug, Clone)]
pub struct Frame {
    /// Producer-assigned sequence number, one per capture event
    pub index: u64,

    /// Capture time in seconds on a monotonic clock, relative to the
    /// producer's acquisition-start epoch
    pub timestamp: f64,

    /// Immutable pixel payload - can be shared across threads without copying
    pub image: Image,
}

impl Frame {
    pub fn new(index: u64, timestamp: f64, image: Image) -> Self {
        Self {
            index,
            timestamp,
            image,
        }
    }
}

/// Dense pixel array with fixed geometry and element type
#[derive(Debug, Clone)]
pub struct Image {
    shape: FrameShape,
    depth: PixelDepth,
    data: Bytes,
}

impl Image {
    /// Wrap raw pixel bytes. Fails if the byte count does not match the
    /// geometry.
    pub fn from_bytes(
        shape: FrameShape,
        depth: PixelDepth,
        data: Bytes,
    ) -> Result<Self, BufferError> {
        let expected = shape.frame_bytes(depth)?;
        if data.len() != expected {
            return Err(BufferError::InvalidShape(format!(
                "payload is {} bytes, geometry {}x{}x{} {:?} needs {}",
                data.len(),
                shape.height,
                shape.width,
                shape.channels,
                depth,
                expected
            )));
        }
        Ok(Self { shape, depth, data })
    }

    /// Internal constructor for payloads already sized by a pool layout
    pub(crate) fn from_pool_bytes(shape: FrameShape, depth: PixelDepth, data: Bytes) -> Self {
        debug_assert_eq!(Some(data.len()), shape.frame_bytes(depth).ok());
        Self { shape, depth, data }
    }

    /// Zero-filled image of the given geometry
    pub fn zeroed(shape: FrameShape, depth: PixelDepth) -> Result<Self, BufferError> {
        let len = shape.frame_bytes(depth)?;
        Ok(Self {
            shape,
            depth,
            data: Bytes::from(vec![0u8; len]),
        })
    }

    pub fn shape(&self) -> FrameShape {
        self.shape
    }

    pub fn depth(&self) -> PixelDepth {
        self.depth
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Frame geometry: height x width x channels (channels = 1 for mono)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameShape {
    pub height: u32,
    pub width: u32,
    pub channels: u32,
}

impl FrameShape {
    pub fn new(height: u32, width: u32, channels: u32) -> Self {
        Self {
            height,
            width,
            channels,
        }
    }

    /// Mono geometry, the common case for scientific cameras
    pub fn mono(height: u32, width: u32) -> Self {
        Self::new(height, width, 1)
    }

    /// Pixel count, checked against overflow
    pub fn pixels(&self) -> Result<usize, BufferError> {
        if self.height == 0 || self.width == 0 || self.channels == 0 {
            return Err(BufferError::InvalidShape(format!(
                "zero dimension in {}x{}x{}",
                self.height, self.width, self.channels
            )));
        }
        (self.height as usize)
            .checked_mul(self.width as usize)
            .and_then(|p| p.checked_mul(self.channels as usize))
            .ok_or_else(|| {
                BufferError::InvalidShape(format!(
                    "pixel count overflow for {}x{}x{}",
                    self.height, self.width, self.channels
                ))
            })
    }

    /// Payload size in bytes for the given element type
    pub fn frame_bytes(&self, depth: PixelDepth) -> Result<usize, BufferError> {
        self.pixels()?.checked_mul(depth.bytes()).ok_or_else(|| {
            BufferError::InvalidShape(format!(
                "byte count overflow for {}x{}x{} {:?}",
                self.height, self.width, self.channels, depth
            ))
        })
    }
}

/// Pixel element types we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelDepth {
    U8,
    U16,
    U32,
    F32,
}

impl PixelDepth {
    pub const fn bytes(self) -> usize {
        match self {
            PixelDepth::U8 => 1,
            PixelDepth::U16 => 2,
            PixelDepth::U32 => 4,
            PixelDepth::F32 => 4,
        }
    }

    /// Wire code stored in the shared segment header
    pub(crate) const fn code(self) -> u32 {
        match self {
            PixelDepth::U8 => 1,
            PixelDepth::U16 => 2,
            PixelDepth::U32 => 3,
            PixelDepth::F32 => 4,
        }
    }

    pub(crate) const fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(PixelDepth::U8),
            2 => Some(PixelDepth::U16),
            3 => Some(PixelDepth::U32),
            4 => Some(PixelDepth::F32),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_bytes_math() {
        let shape = FrameShape::new(480, 640, 3);
        assert_eq!(shape.frame_bytes(PixelDepth::U8).unwrap(), 480 * 640 * 3);
        assert_eq!(
            shape.frame_bytes(PixelDepth::U16).unwrap(),
            480 * 640 * 3 * 2
        );
        assert_eq!(
            FrameShape::mono(2, 2).frame_bytes(PixelDepth::F32).unwrap(),
            16
        );
    }

    #[test]
    fn zero_dimension_rejected() {
        let shape = FrameShape::new(0, 640, 1);
        assert!(matches!(
            shape.frame_bytes(PixelDepth::U8),
            Err(BufferError::InvalidShape(_))
        ));
    }

    #[test]
    fn overflowing_shape_rejected() {
        let shape = FrameShape::new(u32::MAX, u32::MAX, u32::MAX);
        assert!(matches!(
            shape.frame_bytes(PixelDepth::U32),
            Err(BufferError::InvalidShape(_))
        ));
    }

    #[test]
    fn image_length_checked() {
        let shape = FrameShape::mono(2, 2);
        let ok = Image::from_bytes(shape, PixelDepth::U8, Bytes::from(vec![0u8; 4]));
        assert!(ok.is_ok());
        let short = Image::from_bytes(shape, PixelDepth::U8, Bytes::from(vec![0u8; 3]));
        assert!(matches!(short, Err(BufferError::InvalidShape(_))));
    }
}
