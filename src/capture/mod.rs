pub mod frame;
pub mod source;
pub mod synthetic;

pub use frame::{Frame, FrameShape, Image, PixelDepth};
pub use source::FrameSource;
pub use synthetic::{BlankSource, NoiseSource};
