//! Acquisition loop: frame source -> ring
//!
//! One worker thread pulls frames from a `FrameSource` and publishes them
//! while the acquisition flag is set. Cancellation is cooperative: flags are
//! checked between iterations and never preempt an in-flight grab.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use color_eyre::eyre::eyre;
use color_eyre::Result;
use tracing::{error, info};

use crate::capture::source::FrameSource;
use crate::ring::RingBuffer;

/// Sleep between flag checks while paused
const IDLE_POLL: Duration = Duration::from_millis(5);

/// Handle to a running acquisition worker
pub struct Acquisition {
    active: Arc<AtomicBool>,
    terminate: Arc<AtomicBool>,
    handle: Option<JoinHandle<Result<()>>>,
}

impl Acquisition {
    /// Start acquiring from `source` into `buffer`. The worker owns the
    /// source for its lifetime; errors from the source or a geometry
    /// mismatch on `put` end the loop and surface at `join`.
    pub fn spawn<S>(mut source: S, buffer: Arc<RingBuffer>) -> Self
    where
        S: FrameSource + Send + 'static,
    {
        let active = Arc::new(AtomicBool::new(true));
        let terminate = Arc::new(AtomicBool::new(false));

        let worker = {
            let active = Arc::clone(&active);
            let terminate = Arc::clone(&terminate);
            thread::spawn(move || -> Result<()> {
                source.start()?;
                info!("acquisition started");
                let outcome = loop {
                    if terminate.load(Ordering::Acquire) {
                        break Ok(());
                    }
                    if !active.load(Ordering::Acquire) {
                        thread::sleep(IDLE_POLL);
                        continue;
                    }
                    match source.grab() {
                        Ok(frame) => {
                            if let Err(e) = buffer.put(&frame) {
                                error!("refusing frame {}: {e}", frame.index);
                                break Err(e.into());
                            }
                        }
                        Err(e) => {
                            error!("frame grab failed: {e}");
                            break Err(e);
                        }
                    }
                };
                source.stop()?;
                info!("acquisition stopped");
                outcome
            })
        };

        Self {
            active,
            terminate,
            handle: Some(worker),
        }
    }

    /// Clear the acquisition flag: the loop idles without consuming slots
    pub fn pause(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub fn resume(&self) {
        self.active.store(true, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Cooperative cancellation: the loop exits at its next poll boundary
    pub fn terminate(&self) {
        self.terminate.store(true, Ordering::Release);
    }

    /// Whether the worker has exited (cleanly or with an error)
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Terminate and wait for the worker, surfacing its outcome
    pub fn join(mut self) -> Result<()> {
        self.terminate();
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| eyre!("acquisition worker panicked"))?,
            None => Ok(()),
        }
    }
}

impl Drop for Acquisition {
    fn drop(&mut self) {
        self.terminate.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::{FrameShape, PixelDepth};
    use crate::capture::synthetic::{BlankSource, NoiseSource};

    fn blank(height: u32, width: u32) -> BlankSource {
        BlankSource::new(FrameShape::mono(height, width), PixelDepth::U8).unwrap()
    }

    #[test]
    fn acquisition_fills_the_ring() {
        let buffer = Arc::new(
            RingBuffer::new(16, FrameShape::mono(4, 4), PixelDepth::U8).unwrap(),
        );
        let worker = Acquisition::spawn(blank(4, 4), Arc::clone(&buffer));

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while buffer.is_empty() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(!buffer.is_empty(), "no frames produced");
        worker.join().unwrap();

        // Indices are one-based and start at the first grab
        assert_eq!(buffer.get().unwrap().index, buffer.stats().dropped + 1);
    }

    #[test]
    fn pause_idles_without_consuming_slots() {
        let buffer = Arc::new(
            RingBuffer::new(64, FrameShape::mono(2, 2), PixelDepth::U8).unwrap(),
        );
        let worker = Acquisition::spawn(blank(2, 2), Arc::clone(&buffer));
        thread::sleep(Duration::from_millis(20));

        worker.pause();
        assert!(!worker.is_active());
        // Let any in-flight grab land, then drain
        thread::sleep(Duration::from_millis(20));
        while buffer.get().is_ok() {}

        thread::sleep(Duration::from_millis(30));
        assert_eq!(buffer.occupied(), 0, "paused worker kept producing");

        worker.resume();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while buffer.is_empty() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(!buffer.is_empty(), "resume did not restart acquisition");
        worker.join().unwrap();
    }

    #[test]
    fn geometry_mismatch_surfaces_at_join() {
        // Source and buffer disagree: every put is refused
        let buffer = Arc::new(
            RingBuffer::new(4, FrameShape::mono(2, 2), PixelDepth::U8).unwrap(),
        );
        let source = NoiseSource::new(FrameShape::mono(4, 4), PixelDepth::U8, 0.0);
        let worker = Acquisition::spawn(source, Arc::clone(&buffer));

        // The first refused put ends the loop on its own
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !worker.is_finished() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(worker.is_finished(), "worker kept running past the error");
        assert!(worker.join().is_err());
        assert_eq!(buffer.occupied(), 0);
    }
}
