//! Carousel demo: a synthetic camera through the frame ring
//!
//! Spawns the acquisition and delivery workers around one ring buffer and
//! logs occupancy and throughput for a fixed run.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use carousel::capture::NoiseSource;
use carousel::pipeline::{Acquisition, Delivery};
use carousel::{Config, RetrievalMode};
use color_eyre::Result;
use tracing::info;

fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter("carousel=debug")
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Carousel launching...");

    // Load configuration
    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(&path)?,
        None => Config::default(),
    };
    carousel::CONFIG.store(Arc::new(config.clone()));

    let buffer = Arc::new(config.buffer.build()?);
    info!(
        "ring ready: {} slots of {}x{}x{} {:?}",
        buffer.capacity(),
        config.buffer.height,
        config.buffer.width,
        config.buffer.channels,
        config.buffer.depth,
    );

    let mut source = NoiseSource::new(
        config.buffer.shape(),
        config.buffer.depth,
        config.acquisition.fps,
    );
    source.set_exposure(config.acquisition.exposure);

    let producer = Acquisition::spawn(source, Arc::clone(&buffer));

    // Delivery callback: count frames and track pacing
    let delivered = Arc::new(AtomicU64::new(0));
    let consumer = match config.buffer.mode {
        RetrievalMode::Copy => {
            let delivered = Arc::clone(&delivered);
            let mut last = Instant::now();
            Delivery::spawn(Arc::clone(&buffer), move |frame| {
                let n = delivered.fetch_add(1, Ordering::Relaxed) + 1;
                metrics::histogram!("delivery_gap_ms").record(last.elapsed().as_millis() as f64);
                last = Instant::now();
                if n % 100 == 0 {
                    info!("delivered {n} frames, latest index {}", frame.index);
                }
            })
        }
        RetrievalMode::View => {
            let delivered = Arc::clone(&delivered);
            let mut last = Instant::now();
            Delivery::spawn_view(Arc::clone(&buffer), move |lease| {
                let n = delivered.fetch_add(1, Ordering::Relaxed) + 1;
                metrics::histogram!("delivery_gap_ms").record(last.elapsed().as_millis() as f64);
                last = Instant::now();
                if n % 100 == 0 {
                    info!("delivered {n} frames, latest index {}", lease.index());
                }
            })
        }
    };

    // Occupancy monitor for the duration of the run
    let run_for = Duration::from_secs(config.demo.duration_secs);
    let interval = Duration::from_millis(config.demo.monitor_interval_ms);
    let started = Instant::now();
    while started.elapsed() < run_for {
        thread::sleep(interval);
        info!("occupancy: {}/{}", buffer.occupied(), buffer.capacity());
    }

    producer.join()?;
    consumer.join()?;

    let stats = buffer.stats();
    info!(
        "written {} / read {} / dropped {} over {:.1}s",
        stats.written,
        stats.read,
        stats.dropped,
        started.elapsed().as_secs_f64(),
    );
    info!("Carousel shutting down");
    Ok(())
}
