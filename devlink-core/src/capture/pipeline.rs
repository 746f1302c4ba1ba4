//! Producer-side frame pipeline and chunk fan-out.
//!
//! Runs on the dedicated capture thread. It only reads the current
//! [`FanoutTargets`] (published by the arbiter over a `watch` channel)
//! and reports problems back to the control plane as
//! [`CaptureSignal`]s; it never touches roster or device state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};

use crate::capture::encoder::{EncoderFactory, FrameEncoder};
use crate::capture::source::FrameReceiver;
use crate::capture::types::{FrameSink, RawFrame};
use crate::engine::ControlEvent;
use crate::state::PeerId;
use crate::transport::SessionHandler;

// ── FanoutTargets ────────────────────────────────────────────────

/// Who currently consumes frames.
#[derive(Clone, Default)]
pub struct FanoutTargets {
    /// Local preview consumer, if registered.
    pub preview: Option<Arc<dyn FrameSink>>,
    /// Connected peers in the viewing set.
    pub viewers: Vec<PeerId>,
}

impl FanoutTargets {
    pub fn is_empty(&self) -> bool {
        self.preview.is_none() && self.viewers.is_empty()
    }
}

impl std::fmt::Debug for FanoutTargets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutTargets")
            .field("preview", &self.preview.is_some())
            .field("viewers", &self.viewers)
            .finish()
    }
}

// ── CaptureSignal ────────────────────────────────────────────────

/// Capture-thread notifications for the control plane.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureSignal {
    /// The session cannot continue (encoder or hardware failure).
    Failed { session: u64, reason: String },
    /// The source stopped producing frames on its own.
    Ended { session: u64 },
}

/// Send `chunk` to every viewer. Failures are logged and skipped.
///
/// Returns the number of peers the chunk was handed to.
pub fn fan_out(viewers: &[PeerId], chunk: &Bytes, sessions: &dyn SessionHandler) -> usize {
    let mut delivered = 0;
    for peer in viewers {
        match sessions.write_media(peer, chunk.clone()) {
            Ok(()) => delivered += 1,
            Err(e) => warn!(%peer, len = chunk.len(), "media write failed: {e}"),
        }
    }
    delivered
}

// ── FramePipeline ────────────────────────────────────────────────

/// Per-session frame processor.
pub struct FramePipeline {
    session: u64,
    targets: watch::Receiver<FanoutTargets>,
    factory: EncoderFactory,
    encoder: Option<Box<dyn FrameEncoder>>,
    sessions: Arc<dyn SessionHandler>,
    signals: mpsc::UnboundedSender<ControlEvent>,
    frames_processed: u64,
}

impl FramePipeline {
    pub fn new(
        session: u64,
        targets: watch::Receiver<FanoutTargets>,
        factory: EncoderFactory,
        sessions: Arc<dyn SessionHandler>,
        signals: mpsc::UnboundedSender<ControlEvent>,
    ) -> Self {
        Self {
            session,
            targets,
            factory,
            encoder: None,
            sessions,
            signals,
            frames_processed: 0,
        }
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed
    }

    pub fn has_encoder(&self) -> bool {
        self.encoder.is_some()
    }

    /// Route one frame: preview first, then encode and fan out.
    ///
    /// Returns `false` when the session must end.
    pub fn process_frame(&mut self, frame: &RawFrame) -> bool {
        let targets = self.targets.borrow().clone();
        self.frames_processed += 1;

        if let Some(preview) = &targets.preview {
            if preview.is_ready() {
                preview.enqueue(frame);
            }
        }

        if targets.viewers.is_empty() {
            return true;
        }

        if self.encoder.is_none() {
            match (self.factory)() {
                Ok(encoder) => {
                    debug!(session = self.session, "encoder started");
                    self.encoder = Some(encoder);
                }
                Err(e) => {
                    error!(session = self.session, "encoder unavailable: {e}");
                    self.signal(CaptureSignal::Failed {
                        session: self.session,
                        reason: e.to_string(),
                    });
                    return false;
                }
            }
        }

        let Some(encoder) = self.encoder.as_mut() else {
            return false;
        };
        match encoder.encode(frame) {
            Ok(chunks) => {
                for chunk in &chunks {
                    fan_out(&targets.viewers, chunk, self.sessions.as_ref());
                }
            }
            Err(e) => warn!(session = self.session, seq = frame.sequence, "encode failed: {e}"),
        }
        true
    }

    /// Consume frames until the source closes or `running` clears.
    pub fn run(mut self, mut frames: FrameReceiver, running: Arc<AtomicBool>) {
        let mut failed = false;
        while let Some(frame) = frames.blocking_recv() {
            if !running.load(Ordering::SeqCst) {
                break;
            }
            if !self.process_frame(&frame) {
                failed = true;
                break;
            }
        }

        if let Some(mut encoder) = self.encoder.take() {
            encoder.end();
        }
        debug!(
            session = self.session,
            frames = self.frames_processed,
            "capture pipeline exited"
        );

        // Source closed while the arbiter still wanted frames.
        if !failed && running.load(Ordering::SeqCst) {
            self.signal(CaptureSignal::Ended {
                session: self.session,
            });
        }
    }

    fn signal(&self, signal: CaptureSignal) {
        if self.signals.send(ControlEvent::Capture(signal)).is_err() {
            debug!(session = self.session, "control plane gone; dropping capture signal");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Instant;

    use crate::capture::encoder::ZstdFrameEncoder;
    use crate::capture::types::PixelFormat;
    use crate::error::{DevlinkError, Result};

    #[derive(Default)]
    struct RecordingSessions {
        writes: Mutex<Vec<(PeerId, usize)>>,
        unreachable: Vec<PeerId>,
    }

    impl SessionHandler for RecordingSessions {
        fn write_media(&self, peer: &PeerId, chunk: Bytes) -> Result<()> {
            if self.unreachable.contains(peer) {
                return Err(DevlinkError::PeerUnreachable(peer.clone()));
            }
            self.writes.lock().unwrap().push((peer.clone(), chunk.len()));
            Ok(())
        }
        fn open_playback(&self, _peer: &PeerId) -> Result<()> {
            Ok(())
        }
        fn close_playback(&self, _peer: &PeerId) {}
        fn close_session(&self, _peer: &PeerId) {}
    }

    #[derive(Default)]
    struct CountingPreview(Mutex<u64>);

    impl FrameSink for CountingPreview {
        fn enqueue(&self, _frame: &RawFrame) {
            *self.0.lock().unwrap() += 1;
        }
    }

    fn frame(sequence: u64) -> RawFrame {
        RawFrame {
            sequence,
            width: 4,
            height: 4,
            format: PixelFormat::Bgra8,
            data: vec![1; PixelFormat::Bgra8.frame_len(4, 4)],
            timestamp: Instant::now(),
        }
    }

    fn pipeline(
        targets: FanoutTargets,
        factory: EncoderFactory,
        sessions: Arc<RecordingSessions>,
    ) -> (
        FramePipeline,
        watch::Sender<FanoutTargets>,
        mpsc::UnboundedReceiver<ControlEvent>,
    ) {
        let (targets_tx, targets_rx) = watch::channel(targets);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        (
            FramePipeline::new(7, targets_rx, factory, sessions, signal_tx),
            targets_tx,
            signal_rx,
        )
    }

    #[test]
    fn fan_out_skips_failing_peers() {
        let sessions = RecordingSessions {
            unreachable: vec![PeerId::from("b")],
            ..Default::default()
        };
        let viewers = vec![PeerId::from("a"), PeerId::from("b"), PeerId::from("c")];
        let delivered = fan_out(&viewers, &Bytes::from_static(b"chunk"), &sessions);

        assert_eq!(delivered, 2);
        let writes = sessions.writes.lock().unwrap();
        let peers: Vec<_> = writes.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(peers, ["a", "c"]);
    }

    #[test]
    fn preview_only_never_builds_encoder() {
        let preview = Arc::new(CountingPreview::default());
        let sessions = Arc::new(RecordingSessions::default());
        let targets = FanoutTargets {
            preview: Some(preview.clone()),
            viewers: Vec::new(),
        };
        let (mut pipe, _tx, _rx) = pipeline(targets, ZstdFrameEncoder::factory(1), sessions.clone());

        assert!(pipe.process_frame(&frame(0)));
        assert!(pipe.process_frame(&frame(1)));

        assert_eq!(*preview.0.lock().unwrap(), 2);
        assert!(!pipe.has_encoder());
        assert!(sessions.writes.lock().unwrap().is_empty());
    }

    #[test]
    fn encoder_created_lazily_when_viewer_appears() {
        let sessions = Arc::new(RecordingSessions::default());
        let preview = Arc::new(CountingPreview::default());
        let (mut pipe, targets_tx, _rx) = pipeline(
            FanoutTargets {
                preview: Some(preview.clone()),
                viewers: Vec::new(),
            },
            ZstdFrameEncoder::factory(1),
            sessions.clone(),
        );

        pipe.process_frame(&frame(0));
        assert!(!pipe.has_encoder());

        targets_tx.send_modify(|t| t.viewers.push(PeerId::from("a")));
        pipe.process_frame(&frame(1));

        assert!(pipe.has_encoder());
        assert_eq!(*preview.0.lock().unwrap(), 2);
        assert_eq!(sessions.writes.lock().unwrap().len(), 1);
    }

    #[test]
    fn encoder_failure_ends_session_with_signal() {
        let sessions = Arc::new(RecordingSessions::default());
        let factory: EncoderFactory =
            Arc::new(|| Err(DevlinkError::ResourceUnavailable("no encoder".into())));
        let (mut pipe, _tx, mut rx) = pipeline(
            FanoutTargets {
                preview: None,
                viewers: vec![PeerId::from("a")],
            },
            factory,
            sessions,
        );

        assert!(!pipe.process_frame(&frame(0)));
        match rx.try_recv().unwrap() {
            ControlEvent::Capture(CaptureSignal::Failed { session, .. }) => assert_eq!(session, 7),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn run_reports_source_end() {
        let sessions = Arc::new(RecordingSessions::default());
        let (pipe, _tx, mut rx) = pipeline(
            FanoutTargets {
                preview: None,
                viewers: vec![PeerId::from("a")],
            },
            ZstdFrameEncoder::factory(1),
            sessions.clone(),
        );
        let (frame_tx, frame_rx) = mpsc::channel(4);
        frame_tx.try_send(frame(0)).unwrap();
        frame_tx.try_send(frame(1)).unwrap();
        drop(frame_tx);

        pipe.run(frame_rx, Arc::new(AtomicBool::new(true)));

        assert_eq!(sessions.writes.lock().unwrap().len(), 2);
        assert!(matches!(
            rx.try_recv().unwrap(),
            ControlEvent::Capture(CaptureSignal::Ended { session: 7 })
        ));
    }

    #[test]
    fn run_stopped_by_arbiter_is_silent() {
        let sessions = Arc::new(RecordingSessions::default());
        let (pipe, _tx, mut rx) = pipeline(
            FanoutTargets::default(),
            ZstdFrameEncoder::factory(1),
            sessions,
        );
        let (frame_tx, frame_rx) = mpsc::channel(4);
        frame_tx.try_send(frame(0)).unwrap();
        drop(frame_tx);

        pipe.run(frame_rx, Arc::new(AtomicBool::new(false)));
        assert!(rx.try_recv().is_err());
    }
}
