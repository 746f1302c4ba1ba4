//! Capture source collaborator.
//!
//! A [`CaptureSource`] owns the camera hardware. `start` acquires it and
//! returns a channel of raw frames; `stop` releases it, which closes the
//! channel. [`PatternCapture`] is a synthetic source that paints a moving
//! gradient on its own thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::capture::types::{PixelFormat, RawFrame};
use crate::error::{DevlinkError, Result};

/// Frames buffered between the source and the pipeline.
pub const FRAME_QUEUE_DEPTH: usize = 4;

/// Receiving half handed to the frame pipeline.
pub type FrameReceiver = mpsc::Receiver<RawFrame>;

/// The shared hardware capture resource.
pub trait CaptureSource: Send {
    /// Acquire the device and begin producing frames.
    fn start(&mut self) -> Result<FrameReceiver>;

    /// Release the device. Must be idempotent.
    fn stop(&mut self);
}

// ── PatternCapture ───────────────────────────────────────────────

/// Synthetic BGRA test-pattern source.
pub struct PatternCapture {
    width: u32,
    height: u32,
    fps: u8,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl PatternCapture {
    pub fn new(width: u32, height: u32, fps: u8) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
            fps: fps.clamp(1, 60),
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Join the previous producer if it already exited, otherwise let it
    /// finish in the background.
    fn reap(&mut self) {
        match self.thread.take() {
            Some(t) if t.is_finished() => {
                if t.join().is_err() {
                    warn!("pattern capture thread panicked");
                }
            }
            Some(t) => drop(t),
            None => {}
        }
    }

    fn paint(width: u32, height: u32, sequence: u64) -> Vec<u8> {
        let mut data = Vec::with_capacity(PixelFormat::Bgra8.frame_len(width, height));
        let shift = (sequence % 256) as u32;
        for y in 0..height {
            for x in 0..width {
                let v = ((x + y + shift) % 256) as u8;
                data.extend_from_slice(&[v, v / 2, 255 - v, 255]);
            }
        }
        data
    }
}

impl CaptureSource for PatternCapture {
    fn start(&mut self) -> Result<FrameReceiver> {
        if self.is_running() {
            return Err(DevlinkError::ResourceUnavailable(
                "pattern capture already running".into(),
            ));
        }
        // A previous producer may still be winding down on its own flag.
        self.reap();

        let (tx, rx) = mpsc::channel(FRAME_QUEUE_DEPTH);
        let running = Arc::new(AtomicBool::new(true));
        self.running = Arc::clone(&running);

        let (width, height) = (self.width, self.height);
        let interval = Duration::from_secs_f64(1.0 / self.fps as f64);

        let thread = std::thread::Builder::new()
            .name("devlink-pattern".into())
            .spawn(move || {
                let mut sequence = 0u64;
                while running.load(Ordering::SeqCst) {
                    let started = Instant::now();
                    let frame = RawFrame {
                        sequence,
                        width,
                        height,
                        format: PixelFormat::Bgra8,
                        data: Self::paint(width, height, sequence),
                        timestamp: started,
                    };
                    if tx.blocking_send(frame).is_err() {
                        break;
                    }
                    sequence += 1;
                    if let Some(rest) = interval.checked_sub(started.elapsed()) {
                        std::thread::sleep(rest);
                    }
                }
                debug!(frames = sequence, "pattern capture stopped");
            })
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                DevlinkError::ResourceUnavailable(format!("spawn capture thread: {e}"))
            })?;

        self.thread = Some(thread);
        Ok(rx)
    }

    fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        // The producer exits on its next tick; joining here would stall
        // the caller for up to one frame interval.
        self.reap();
    }
}

impl Drop for PatternCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produces_frames_until_stopped() {
        let mut source = PatternCapture::new(8, 4, 60);
        let mut rx = source.start().unwrap();

        let frame = rx.blocking_recv().unwrap();
        assert_eq!(frame.width, 8);
        assert_eq!(frame.height, 4);
        assert_eq!(frame.byte_len(), PixelFormat::Bgra8.frame_len(8, 4));

        source.stop();
        assert!(!source.is_running());
        // Drain until the producer notices and drops its sender.
        while rx.blocking_recv().is_some() {}
    }

    #[test]
    fn double_start_is_rejected() {
        let mut source = PatternCapture::new(2, 2, 30);
        let _rx = source.start().unwrap();
        assert!(matches!(
            source.start(),
            Err(DevlinkError::ResourceUnavailable(_))
        ));
        source.stop();
    }

    #[test]
    fn restart_does_not_wait_for_the_old_producer() {
        let mut source = PatternCapture::new(2, 2, 1);
        let mut rx = source.start().unwrap();
        assert!(rx.blocking_recv().is_some());
        source.stop();

        let started = Instant::now();
        let mut rx = source.start().unwrap();
        assert!(started.elapsed() < Duration::from_millis(250));
        assert!(source.is_running());
        assert!(rx.blocking_recv().is_some());
        source.stop();
    }

    #[test]
    fn restart_after_stop() {
        let mut source = PatternCapture::new(2, 2, 60);
        let mut rx = source.start().unwrap();
        source.stop();
        while rx.blocking_recv().is_some() {}

        let mut rx = source.start().unwrap();
        assert!(rx.blocking_recv().is_some());
        source.stop();
    }
}
