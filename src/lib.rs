pub mod capture;
pub mod error;
pub mod pipeline;
pub mod ring;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

pub use capture::{Frame, FrameShape, FrameSource, Image, PixelDepth};
pub use error::{BufferError, TryGetError};
pub use ring::{BufferStats, FrameLease, OverflowPolicy, RetrievalMode, RingBuffer};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// System configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub buffer: BufferConfig,
    pub acquisition: AcquisitionConfig,
    pub demo: DemoConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    pub capacity: u32,
    pub height: u32,
    pub width: u32,
    pub channels: u32,
    pub depth: PixelDepth,
    pub mode: RetrievalMode,
    pub overflow: OverflowPolicy,
    /// Named segment for cross-process sharing; None keeps the pool private
    pub segment: Option<String>,
}

impl BufferConfig {
    pub fn shape(&self) -> FrameShape {
        FrameShape::new(self.height, self.width, self.channels)
    }

    /// Build the ring this config describes
    pub fn build(&self) -> Result<RingBuffer, BufferError> {
        let buffer = match &self.segment {
            Some(name) => RingBuffer::create(name, self.capacity, self.shape(), self.depth)?,
            None => RingBuffer::new(self.capacity, self.shape(), self.depth)?,
        };
        Ok(buffer.with_overflow(self.overflow))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    pub fps: f64,
    pub exposure: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemoConfig {
    pub duration_secs: u64,
    pub monitor_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            buffer: BufferConfig {
                capacity: 100,
                height: 480,
                width: 640,
                channels: 1,
                depth: PixelDepth::U8,
                mode: RetrievalMode::Copy,
                overflow: OverflowPolicy::DropOldest,
                segment: None,
            },
            acquisition: AcquisitionConfig {
                fps: 100.0,
                exposure: 1.0,
            },
            demo: DemoConfig {
                duration_secs: 5,
                monitor_interval_ms: 100,
            },
        }
    }
}

impl Config {
    /// Load from a TOML file, with defaults filling anything unset
    pub fn load(path: &str) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?)
            .add_source(config::File::with_name(path))
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_builds_a_ring() {
        let config = Config::default();
        let buffer = config.buffer.build().unwrap();
        assert_eq!(buffer.capacity(), 100);
        assert_eq!(buffer.shape(), FrameShape::mono(480, 640));
        assert_eq!(buffer.overflow(), OverflowPolicy::DropOldest);
    }
}
