//! The boundary contract between frame producers and the ring
//!
//! Vendor camera adapters live outside this crate; whatever they wrap, they
//! face the ring as a `FrameSource`. A source that changes geometry must
//! signal it out of band so the owner can stop acquisition and rebuild the
//! buffer - `put` refuses mismatched frames, it never reshapes.

use color_eyre::Result;

use crate::capture::frame::{Frame, FrameShape, PixelDepth};

pub trait FrameSource {
    /// Begin acquisition: reset the frame index and the timestamp epoch
    fn start(&mut self) -> Result<()>;

    /// End acquisition and release device resources
    fn stop(&mut self) -> Result<()>;

    /// Block until the next frame is available and return it
    fn grab(&mut self) -> Result<Frame>;

    /// Geometry of every frame this source will produce
    fn shape(&self) -> FrameShape;

    fn depth(&self) -> PixelDepth;
}
