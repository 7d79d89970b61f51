pub mod consumer;
pub mod producer;

pub use consumer::Delivery;
pub use producer::Acquisition;
