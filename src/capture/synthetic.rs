//! Synthetic frame sources for tests and demos
//!
//! No camera hardware required: `NoiseSource` emits exposure-scaled uniform
//! noise at a configurable rate, `BlankSource` emits zero-filled frames as
//! fast as it is polled.

use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use color_eyre::Result;
use rand::Rng;

use crate::capture::frame::{Frame, FrameShape, Image, PixelDepth};
use crate::capture::source::FrameSource;

/// Random image source paced at a fixed frame rate
///
/// A mock exposure in [0, 1] scales the upper bound of the pixel
/// distribution, so turning exposure down visibly darkens the noise.
pub struct NoiseSource {
    shape: FrameShape,
    depth: PixelDepth,
    exposure: f64,
    fps: f64,
    index: u64,
    epoch: Instant,
}

impl NoiseSource {
    pub fn new(shape: FrameShape, depth: PixelDepth, fps: f64) -> Self {
        Self {
            shape,
            depth,
            exposure: 1.0,
            fps,
            index: 0,
            epoch: Instant::now(),
        }
    }

    pub fn set_exposure(&mut self, exposure: f64) {
        self.exposure = exposure.clamp(0.0, 1.0);
    }

    pub fn exposure(&self) -> f64 {
        self.exposure
    }

    pub fn set_framerate(&mut self, fps: f64) {
        self.fps = fps;
    }

    pub fn framerate(&self) -> f64 {
        self.fps
    }

    fn render(&self) -> Vec<u8> {
        let len = self
            .shape
            .frame_bytes(self.depth)
            .unwrap_or_default();
        let mut data = vec![0u8; len];
        let mut rng = rand::thread_rng();
        match self.depth {
            PixelDepth::U8 => {
                let hi = (self.exposure * f64::from(u8::MAX)).clamp(1.0, 255.0) as u8;
                for byte in &mut data {
                    *byte = rng.gen_range(0..=hi);
                }
            }
            PixelDepth::U16 => {
                let hi = (self.exposure * f64::from(u16::MAX)).clamp(1.0, 65535.0) as u16;
                for chunk in data.chunks_exact_mut(2) {
                    chunk.copy_from_slice(&rng.gen_range(0..=hi).to_ne_bytes());
                }
            }
            PixelDepth::U32 => {
                let hi = (self.exposure * f64::from(u32::MAX)).max(1.0) as u32;
                for chunk in data.chunks_exact_mut(4) {
                    chunk.copy_from_slice(&rng.gen_range(0..=hi).to_ne_bytes());
                }
            }
            PixelDepth::F32 => {
                let hi = (self.exposure as f32).max(f32::EPSILON);
                for chunk in data.chunks_exact_mut(4) {
                    chunk.copy_from_slice(&rng.gen_range(0.0..hi).to_ne_bytes());
                }
            }
        }
        data
    }
}

impl FrameSource for NoiseSource {
    fn start(&mut self) -> Result<()> {
        self.index = 0;
        self.epoch = Instant::now();
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    fn grab(&mut self) -> Result<Frame> {
        self.index += 1;
        let timestamp = self.epoch.elapsed().as_secs_f64();
        let image = Image::from_bytes(self.shape, self.depth, Bytes::from(self.render()))?;

        if self.fps > 0.0 {
            thread::sleep(Duration::from_secs_f64(1.0 / self.fps));
        }

        Ok(Frame::new(self.index, timestamp, image))
    }

    fn shape(&self) -> FrameShape {
        self.shape
    }

    fn depth(&self) -> PixelDepth {
        self.depth
    }
}

/// Zero-filled frame source, unpaced
pub struct BlankSource {
    shape: FrameShape,
    depth: PixelDepth,
    index: u64,
    epoch: Instant,
    // One allocation shared by every emitted frame
    blank: Image,
}

impl BlankSource {
    pub fn new(shape: FrameShape, depth: PixelDepth) -> Result<Self> {
        Ok(Self {
            shape,
            depth,
            index: 0,
            epoch: Instant::now(),
            blank: Image::zeroed(shape, depth)?,
        })
    }
}

impl FrameSource for BlankSource {
    fn start(&mut self) -> Result<()> {
        self.index = 0;
        self.epoch = Instant::now();
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    fn grab(&mut self) -> Result<Frame> {
        self.index += 1;
        let timestamp = self.epoch.elapsed().as_secs_f64();
        Ok(Frame::new(self.index, timestamp, self.blank.clone()))
    }

    fn shape(&self) -> FrameShape {
        self.shape
    }

    fn depth(&self) -> PixelDepth {
        self.depth
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noise_frames_are_sequenced() {
        let mut source = NoiseSource::new(FrameShape::mono(4, 4), PixelDepth::U8, 1000.0);
        source.start().unwrap();
        let first = source.grab().unwrap();
        let second = source.grab().unwrap();
        assert_eq!(first.index, 1);
        assert_eq!(second.index, 2);
        assert!(second.timestamp >= first.timestamp);
        assert_eq!(first.image.len(), 16);
    }

    #[test]
    fn exposure_bounds_pixels() {
        let mut source = NoiseSource::new(FrameShape::mono(8, 8), PixelDepth::U8, 0.0);
        source.set_exposure(0.25);
        source.start().unwrap();
        let frame = source.grab().unwrap();
        let hi = (0.25 * 255.0) as u8;
        assert!(frame.image.bytes().iter().all(|&b| b <= hi));
    }

    #[test]
    fn start_resets_the_sequence() {
        let mut source = NoiseSource::new(FrameShape::mono(2, 2), PixelDepth::U16, 0.0);
        source.start().unwrap();
        let _ = source.grab().unwrap();
        let _ = source.grab().unwrap();
        source.start().unwrap();
        assert_eq!(source.grab().unwrap().index, 1);
    }

    #[test]
    fn blank_frames_are_zero() {
        let mut source = BlankSource::new(FrameShape::new(2, 3, 2), PixelDepth::F32).unwrap();
        source.start().unwrap();
        let frame = source.grab().unwrap();
        assert_eq!(frame.image.len(), 2 * 3 * 2 * 4);
        assert!(frame.image.bytes().iter().all(|&b| b == 0));
    }
}
