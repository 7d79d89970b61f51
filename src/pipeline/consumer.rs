//! Delivery loop: ring -> consumer callback
//!
//! One worker thread polls the ring and forwards each retrieved frame to a
//! registered callback. `Empty` is a poll-boundary condition, handled here
//! and never surfaced to the callback. Single-consumer semantics: one
//! logical reader advances the shared read cursor; fanning out to several
//! independent readers takes multiple buffers or an external broadcast
//! layer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use color_eyre::eyre::eyre;
use color_eyre::Result;
use metrics::counter;
use tracing::warn;

use crate::capture::frame::Frame;
use crate::error::TryGetError;
use crate::ring::buffer::FrameLease;
use crate::ring::RingBuffer;

/// Poll interval; also bounds how long terminate can lag
const POLL: Duration = Duration::from_millis(10);

/// Handle to a running delivery worker
pub struct Delivery {
    terminate: Arc<AtomicBool>,
    handle: Option<JoinHandle<Result<()>>>,
}

impl Delivery {
    /// Copy-mode loop: the callback receives owning frames it may hold
    /// indefinitely.
    pub fn spawn<F>(buffer: Arc<RingBuffer>, mut on_frame: F) -> Self
    where
        F: FnMut(&Frame) + Send + 'static,
    {
        let terminate = Arc::new(AtomicBool::new(false));
        let worker = {
            let terminate = Arc::clone(&terminate);
            thread::spawn(move || -> Result<()> {
                while !terminate.load(Ordering::Acquire) {
                    match buffer.get_timeout(POLL) {
                        Ok(frame) => on_frame(&frame),
                        // Poll boundary: nothing arrived, check flags again
                        Err(TryGetError::Empty) => {}
                    }
                }
                Ok(())
            })
        };
        Self {
            terminate,
            handle: Some(worker),
        }
    }

    /// View-mode loop: the callback borrows slot bytes through a lease and
    /// must not retain them past its synchronous extent. Leases the
    /// producer invalidated before delivery are discarded; invalidation
    /// during the callback is counted and logged.
    pub fn spawn_view<F>(buffer: Arc<RingBuffer>, mut on_frame: F) -> Self
    where
        F: FnMut(&FrameLease<'_>) + Send + 'static,
    {
        let terminate = Arc::new(AtomicBool::new(false));
        let worker = {
            let terminate = Arc::clone(&terminate);
            thread::spawn(move || -> Result<()> {
                while !terminate.load(Ordering::Acquire) {
                    match buffer.get_view_timeout(POLL) {
                        Ok(lease) => {
                            if !lease.is_intact() {
                                counter!("leases_invalidated").increment(1);
                                continue;
                            }
                            on_frame(&lease);
                            if !lease.release() {
                                warn!("frame lease invalidated during callback");
                                counter!("leases_invalidated").increment(1);
                            }
                        }
                        Err(TryGetError::Empty) => {}
                    }
                }
                Ok(())
            })
        };
        Self {
            terminate,
            handle: Some(worker),
        }
    }

    /// Cooperative cancellation: the loop exits at its next poll boundary
    pub fn terminate(&self) {
        self.terminate.store(true, Ordering::Release);
    }

    /// Whether the worker has exited
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    pub fn join(mut self) -> Result<()> {
        self.terminate();
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| eyre!("delivery worker panicked"))?,
            None => Ok(()),
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        self.terminate.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::{FrameShape, Image, PixelDepth};
    use crate::capture::synthetic::BlankSource;
    use crate::pipeline::producer::Acquisition;
    use bytes::Bytes;
    use std::sync::Mutex;
    use std::time::Instant;

    fn frame(buffer: &RingBuffer, index: u64) -> Frame {
        let len = buffer.shape().frame_bytes(buffer.depth()).unwrap();
        let image = Image::from_bytes(
            buffer.shape(),
            buffer.depth(),
            Bytes::from(vec![index as u8; len]),
        )
        .unwrap();
        Frame::new(index, index as f64, image)
    }

    fn wait_until(predicate: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !predicate() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(predicate(), "condition not reached in time");
    }

    #[test]
    fn delivery_forwards_frames_in_order() {
        let buffer = Arc::new(
            RingBuffer::new(8, FrameShape::mono(2, 2), PixelDepth::U8).unwrap(),
        );
        for index in 1..=3 {
            buffer.put(&frame(&buffer, index)).unwrap();
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let worker = {
            let seen = Arc::clone(&seen);
            Delivery::spawn(Arc::clone(&buffer), move |frame| {
                seen.lock().unwrap().push(frame.index);
            })
        };

        wait_until(|| seen.lock().unwrap().len() == 3);
        worker.join().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn view_delivery_borrows_slot_bytes() {
        let buffer = Arc::new(
            RingBuffer::new(8, FrameShape::mono(2, 2), PixelDepth::U8).unwrap(),
        );
        for index in 1..=2 {
            buffer.put(&frame(&buffer, index)).unwrap();
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let worker = {
            let seen = Arc::clone(&seen);
            Delivery::spawn_view(Arc::clone(&buffer), move |lease| {
                seen.lock()
                    .unwrap()
                    .push((lease.index(), lease.image()[0]));
            })
        };

        wait_until(|| seen.lock().unwrap().len() == 2);
        worker.join().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![(1, 1u8), (2, 2u8)]);
    }

    #[test]
    fn terminate_is_prompt_on_an_empty_ring() {
        let buffer = Arc::new(
            RingBuffer::new(4, FrameShape::mono(2, 2), PixelDepth::U8).unwrap(),
        );
        let worker = Delivery::spawn(buffer, |_| {});
        let start = Instant::now();
        worker.join().unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn source_to_callback_end_to_end() {
        let buffer = Arc::new(
            RingBuffer::new(32, FrameShape::mono(4, 4), PixelDepth::U8).unwrap(),
        );
        let source = BlankSource::new(FrameShape::mono(4, 4), PixelDepth::U8).unwrap();

        let delivered = Arc::new(Mutex::new(0u64));
        let producer = Acquisition::spawn(source, Arc::clone(&buffer));
        let consumer = {
            let delivered = Arc::clone(&delivered);
            Delivery::spawn(Arc::clone(&buffer), move |_| {
                *delivered.lock().unwrap() += 1;
            })
        };

        wait_until(|| *delivered.lock().unwrap() >= 100);
        producer.join().unwrap();
        consumer.join().unwrap();
    }
}
