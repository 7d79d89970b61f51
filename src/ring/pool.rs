//! Preallocated slot storage
//!
//! One contiguous mapping holds the ring header followed by `capacity`
//! fixed-stride slots, so nothing allocates on the hot path. Same-process
//! buffers use an anonymous mapping; cross-process buffers use a named POSIX
//! shared-memory segment that producer and consumer processes map to the
//! same bytes.

use std::fs::File;

use memmap2::{MmapMut, MmapOptions};
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use tracing::{info, warn};

use crate::error::BufferError;
use crate::ring::layout::{RingHeader, RingLayout, SlotHeader, HEADER_BYTES, SLOT_HEADER_BYTES};

/// Fixed pool of frame-sized slots behind a memory mapping
#[derive(Debug)]
pub struct SlotPool {
    map: MmapMut,
    base: *mut u8,
    layout: RingLayout,
    /// Named segment backing, if any. The creator unlinks it on drop;
    /// attachers only unmap.
    segment: Option<String>,
    owned: bool,
}

// The raw base pointer aliases the mapping, which lives exactly as long as
// the pool. All mutation behind it goes through the ring's atomic cursor
// protocol, so handing the pool to another thread is sound.
unsafe impl Send for SlotPool {}
unsafe impl Sync for SlotPool {}

impl SlotPool {
    /// Private in-process pool
    pub fn anonymous(layout: RingLayout) -> Result<Self, BufferError> {
        let mut map = MmapMut::map_anon(layout.segment_bytes())?;
        let base = map.as_mut_ptr();
        // Anonymous pages arrive zeroed; only the header needs writing.
        unsafe { (base as *mut RingHeader).write(layout.to_header()) };
        Ok(Self {
            map,
            base,
            layout,
            segment: None,
            owned: true,
        })
    }

    /// Create a named segment and initialize its header. Fails if a segment
    /// of that name already exists.
    pub fn create(name: &str, layout: RingLayout) -> Result<Self, BufferError> {
        let segment = normalize(name);
        let fd = shm_open(
            segment.as_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )?;
        let file = File::from(fd);

        // Unlink a half-built segment rather than leaking the name
        match Self::map_created(&file, &layout) {
            Ok((map, base)) => {
                info!(
                    segment = %segment,
                    bytes = layout.segment_bytes(),
                    capacity = layout.capacity,
                    "created shared frame pool"
                );
                Ok(Self {
                    map,
                    base,
                    layout,
                    segment: Some(segment),
                    owned: true,
                })
            }
            Err(e) => {
                let _ = shm_unlink(segment.as_str());
                Err(e)
            }
        }
    }

    fn map_created(file: &File, layout: &RingLayout) -> Result<(MmapMut, *mut u8), BufferError> {
        file.set_len(layout.segment_bytes() as u64)?;
        let mut map = unsafe { MmapOptions::new().map_mut(file)? };
        let base = map.as_mut_ptr();
        unsafe { (base as *mut RingHeader).write(layout.to_header()) };
        Ok((map, base))
    }

    /// Attach to a segment another process created. Validates the header
    /// before trusting any of it.
    pub fn attach(name: &str) -> Result<Self, BufferError> {
        let segment = normalize(name);
        let fd = shm_open(segment.as_str(), OFlag::O_RDWR, Mode::empty())?;
        let file = File::from(fd);
        let mut map = unsafe { MmapOptions::new().map_mut(&file)? };

        if map.len() < HEADER_BYTES {
            return Err(BufferError::SharedResourceUnavailable(format!(
                "segment {segment} is {} bytes, smaller than the ring header",
                map.len()
            )));
        }
        let base = map.as_mut_ptr();
        let layout = {
            let header = unsafe { &*(base as *const RingHeader) };
            RingLayout::from_header(header)?
        };
        if map.len() < layout.segment_bytes() {
            return Err(BufferError::SharedResourceUnavailable(format!(
                "segment {segment} truncated: {} bytes mapped, layout needs {}",
                map.len(),
                layout.segment_bytes()
            )));
        }

        info!(segment = %segment, capacity = layout.capacity, "attached shared frame pool");
        Ok(Self {
            map,
            base,
            layout,
            segment: Some(segment),
            owned: false,
        })
    }

    pub fn layout(&self) -> &RingLayout {
        &self.layout
    }

    pub fn header(&self) -> &RingHeader {
        unsafe { &*(self.base as *const RingHeader) }
    }

    /// Slot header and payload pointers for absolute position `pos`.
    ///
    /// The offset is derived modulo capacity; an out-of-range result means
    /// the cursor arithmetic is broken, which asserts rather than returns.
    pub(crate) fn slot(&self, pos: u64) -> (*mut SlotHeader, *mut u8) {
        let offset = self.layout.slot_offset(pos);
        assert!(
            offset + self.layout.slot_stride <= self.map.len(),
            "slot offset {offset} outside pool of {} bytes: ring invariant violated",
            self.map.len()
        );
        unsafe {
            (
                self.base.add(offset) as *mut SlotHeader,
                self.base.add(offset + SLOT_HEADER_BYTES),
            )
        }
    }
}

impl Drop for SlotPool {
    fn drop(&mut self) {
        if self.owned {
            if let Some(segment) = &self.segment {
                if let Err(e) = shm_unlink(segment.as_str()) {
                    warn!(segment = %segment, "failed to unlink segment: {e}");
                }
            }
        }
    }
}

/// POSIX shm names live in a flat namespace and must start with '/'
fn normalize(name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    }
}
