pub mod buffer;
pub mod layout;
pub mod pool;

pub use buffer::{BufferStats, FrameLease, OverflowPolicy, RetrievalMode, RingBuffer};
pub use pool::SlotPool;
