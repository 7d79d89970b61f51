//! Shared segment layout: header, slot geometry, offset math
//!
//! The same byte layout backs the anonymous (in-process) and named
//! (cross-process) pools, so every cursor lives in the mapped region as an
//! atomic rather than in any single process's address space.

use std::sync::atomic::AtomicU64;

use crate::capture::frame::{FrameShape, PixelDepth};
use crate::error::BufferError;

/// Identifies a carousel segment. Attaching to anything else is refused.
pub const MAGIC: u64 = 0x4341_524f_5553_454c; // "CAROUSEL"

/// Bumped whenever the header or slot layout changes shape.
pub const LAYOUT_VERSION: u32 = 1;

/// Cache line size assumed for cursor separation and slot alignment
pub const CACHE_LINE: usize = 64;

pub const HEADER_BYTES: usize = 192;
pub const SLOT_HEADER_BYTES: usize = 32;

/// Segment header at offset 0 of every pool
///
/// Geometry fields are written once by the creator and read-only afterwards;
/// `head` and `tail` are the live cursors, each on its own cache line. Both
/// count frames monotonically since creation - the physical slot for
/// absolute position `p` is `p % capacity`.
#[repr(C, align(64))]
pub struct RingHeader {
    pub magic: u64,
    pub layout_version: u32,
    pub capacity: u32,
    pub height: u32,
    pub width: u32,
    pub channels: u32,
    pub depth_code: u32,
    pub slot_stride: u64,
    pub frame_bytes: u64,
    _pad0: [u8; 16],
    /// Write cursor: total frames ever published
    pub head: AtomicU64,
    _pad1: [u8; 56],
    /// Read cursor: total frames ever consumed or dropped
    pub tail: AtomicU64,
    _pad2: [u8; 56],
}

const _: () = assert!(std::mem::size_of::<RingHeader>() == HEADER_BYTES);

/// Per-slot header preceding the pixel bytes
///
/// `seq` is the publication word (seqlock discipline): `2p + 1` while the
/// producer is writing absolute position `p`, `2p + 2` once published, and 0
/// for a slot never written. `index` and `timestamp` are only meaningful
/// while `seq` stays at the published value.
#[repr(C)]
pub struct SlotHeader {
    pub seq: AtomicU64,
    pub index: u64,
    pub timestamp: f64,
    _pad: u64,
}

const _: () = assert!(std::mem::size_of::<SlotHeader>() == SLOT_HEADER_BYTES);

/// Seq word for "absolute position `p` is being written"
#[inline]
pub const fn seq_writing(pos: u64) -> u64 {
    pos * 2 + 1
}

/// Seq word for "absolute position `p` is published"
#[inline]
pub const fn seq_published(pos: u64) -> u64 {
    pos * 2 + 2
}

const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Validated geometry of a pool: capacity, frame shape, derived byte sizes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingLayout {
    pub capacity: u32,
    pub shape: FrameShape,
    pub depth: PixelDepth,
    pub frame_bytes: usize,
    pub slot_stride: usize,
}

impl RingLayout {
    pub fn new(capacity: u32, shape: FrameShape, depth: PixelDepth) -> Result<Self, BufferError> {
        if capacity == 0 {
            return Err(BufferError::InvalidShape(
                "slot capacity must be at least 1".into(),
            ));
        }
        let frame_bytes = shape.frame_bytes(depth)?;
        let slot_stride = SLOT_HEADER_BYTES
            .checked_add(frame_bytes)
            .map(|s| align_up(s, CACHE_LINE))
            .ok_or_else(|| BufferError::InvalidShape("slot stride overflow".into()))?;
        // Reject segments the platform cannot map
        slot_stride
            .checked_mul(capacity as usize)
            .and_then(|s| s.checked_add(HEADER_BYTES))
            .ok_or_else(|| BufferError::InvalidShape("segment size overflow".into()))?;
        Ok(Self {
            capacity,
            shape,
            depth,
            frame_bytes,
            slot_stride,
        })
    }

    /// Total mapping size: header plus all slots
    pub fn segment_bytes(&self) -> usize {
        HEADER_BYTES + self.slot_stride * self.capacity as usize
    }

    /// Byte offset of the slot backing absolute position `pos`
    pub fn slot_offset(&self, pos: u64) -> usize {
        let slot = (pos % self.capacity as u64) as usize;
        HEADER_BYTES + slot * self.slot_stride
    }

    /// Header image for a freshly created segment
    pub fn to_header(&self) -> RingHeader {
        RingHeader {
            magic: MAGIC,
            layout_version: LAYOUT_VERSION,
            capacity: self.capacity,
            height: self.shape.height,
            width: self.shape.width,
            channels: self.shape.channels,
            depth_code: self.depth.code(),
            slot_stride: self.slot_stride as u64,
            frame_bytes: self.frame_bytes as u64,
            _pad0: [0; 16],
            head: AtomicU64::new(0),
            _pad1: [0; 56],
            tail: AtomicU64::new(0),
            _pad2: [0; 56],
        }
    }

    /// Reconstruct and cross-check the layout recorded in a foreign header
    pub fn from_header(header: &RingHeader) -> Result<Self, BufferError> {
        if header.magic != MAGIC {
            return Err(BufferError::SharedResourceUnavailable(format!(
                "bad magic {:#018x}, segment is not a frame ring",
                header.magic
            )));
        }
        if header.layout_version != LAYOUT_VERSION {
            return Err(BufferError::SharedResourceUnavailable(format!(
                "layout version {} (expected {})",
                header.layout_version, LAYOUT_VERSION
            )));
        }
        let depth = PixelDepth::from_code(header.depth_code).ok_or_else(|| {
            BufferError::SharedResourceUnavailable(format!(
                "unknown pixel depth code {}",
                header.depth_code
            ))
        })?;
        let shape = FrameShape::new(header.height, header.width, header.channels);
        let layout = Self::new(header.capacity, shape, depth).map_err(|e| {
            BufferError::SharedResourceUnavailable(format!("header geometry invalid: {e}"))
        })?;
        if layout.slot_stride as u64 != header.slot_stride
            || layout.frame_bytes as u64 != header.frame_bytes
        {
            return Err(BufferError::SharedResourceUnavailable(
                "header byte sizes disagree with its geometry".into(),
            ));
        }
        Ok(layout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stride_is_cache_aligned() {
        let layout =
            RingLayout::new(4, FrameShape::mono(2, 2), PixelDepth::U8).unwrap();
        assert_eq!(layout.frame_bytes, 4);
        assert_eq!(layout.slot_stride % CACHE_LINE, 0);
        assert!(layout.slot_stride >= SLOT_HEADER_BYTES + 4);
        assert_eq!(layout.segment_bytes(), HEADER_BYTES + 4 * layout.slot_stride);
    }

    #[test]
    fn slot_offsets_wrap() {
        let layout =
            RingLayout::new(3, FrameShape::mono(8, 8), PixelDepth::U16).unwrap();
        assert_eq!(layout.slot_offset(0), HEADER_BYTES);
        assert_eq!(layout.slot_offset(3), HEADER_BYTES);
        assert_eq!(layout.slot_offset(4), HEADER_BYTES + layout.slot_stride);
    }

    #[test]
    fn header_round_trip() {
        let layout =
            RingLayout::new(16, FrameShape::new(480, 640, 3), PixelDepth::U8).unwrap();
        let header = layout.to_header();
        assert_eq!(RingLayout::from_header(&header).unwrap(), layout);
    }

    #[test]
    fn foreign_header_rejected() {
        let layout = RingLayout::new(2, FrameShape::mono(4, 4), PixelDepth::U8).unwrap();
        let mut header = layout.to_header();
        header.magic = 0xdead_beef;
        assert!(matches!(
            RingLayout::from_header(&header),
            Err(BufferError::SharedResourceUnavailable(_))
        ));

        let mut header = layout.to_header();
        header.layout_version = LAYOUT_VERSION + 1;
        assert!(RingLayout::from_header(&header).is_err());

        let mut header = layout.to_header();
        header.depth_code = 99;
        assert!(RingLayout::from_header(&header).is_err());
    }

    #[test]
    fn zero_capacity_rejected() {
        assert!(matches!(
            RingLayout::new(0, FrameShape::mono(4, 4), PixelDepth::U8),
            Err(BufferError::InvalidShape(_))
        ));
    }
}
