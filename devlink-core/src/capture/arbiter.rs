//! Capture resource arbiter.
//!
//! Reference-counts demand for the single capture resource: one local
//! preview slot plus the set of viewing peers. The resource is held iff
//! that demand set is non-empty.
//!
//! ```text
//!            demand becomes non-empty
//!   Idle ───────────────────────────────► Active
//!    ▲                                       │
//!    └───────────────────────────────────────┘
//!            demand becomes empty
//! ```
//!
//! Only the arbiter starts or stops the [`CaptureSource`], and only from
//! [`reconcile`](CaptureArbiter::reconcile).

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::capture::encoder::EncoderFactory;
use crate::capture::pipeline::{CaptureSignal, FanoutTargets, FramePipeline};
use crate::capture::source::CaptureSource;
use crate::capture::types::FrameSink;
use crate::engine::ControlEvent;
use crate::error::{DevlinkError, Result};
use crate::state::PeerId;
use crate::transport::SessionHandler;

/// Result of a demand change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Resource state did not change.
    Unchanged,
    /// Idle → Active.
    Acquired,
    /// Active → Idle.
    Released,
}

struct ActiveCapture {
    session: u64,
    running: Arc<AtomicBool>,
}

/// Owner of the shared capture resource.
pub struct CaptureArbiter {
    source: Box<dyn CaptureSource>,
    factory: EncoderFactory,
    sessions: Arc<dyn SessionHandler>,
    signals: mpsc::UnboundedSender<ControlEvent>,

    preview: Option<Arc<dyn FrameSink>>,
    viewers: BTreeSet<PeerId>,

    targets: watch::Sender<FanoutTargets>,
    active: Option<ActiveCapture>,
    next_session: u64,
}

impl CaptureArbiter {
    pub fn new(
        source: Box<dyn CaptureSource>,
        factory: EncoderFactory,
        sessions: Arc<dyn SessionHandler>,
        signals: mpsc::UnboundedSender<ControlEvent>,
    ) -> Self {
        let (targets, _) = watch::channel(FanoutTargets::default());
        Self {
            source,
            factory,
            sessions,
            signals,
            preview: None,
            viewers: BTreeSet::new(),
            targets,
            active: None,
            next_session: 1,
        }
    }

    // ── Queries ──────────────────────────────────────────────────

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn demand_is_empty(&self) -> bool {
        self.preview.is_none() && self.viewers.is_empty()
    }

    /// Observe the fan-out targets handed to the capture thread.
    pub fn subscribe_targets(&self) -> watch::Receiver<FanoutTargets> {
        self.targets.subscribe()
    }

    // ── Demand changes ───────────────────────────────────────────

    /// Register or replace the local preview consumer.
    ///
    /// On acquisition failure the previous preview is restored.
    pub fn set_preview(&mut self, sink: Arc<dyn FrameSink>) -> Result<Transition> {
        let previous = self.preview.replace(sink);
        self.reconcile().inspect_err(|_| {
            self.preview = previous;
            self.publish_targets();
        })
    }

    pub fn clear_preview(&mut self) -> Transition {
        self.preview = None;
        self.reconcile_releasing()
    }

    /// Add a viewing peer. Adding a peer twice is a no-op.
    ///
    /// On acquisition failure the peer is not added.
    pub fn add_viewer(&mut self, peer: PeerId) -> Result<Transition> {
        if !self.viewers.insert(peer.clone()) {
            return Ok(Transition::Unchanged);
        }
        self.reconcile().inspect_err(|_| {
            self.viewers.remove(&peer);
            self.publish_targets();
        })
    }

    pub fn remove_viewer(&mut self, peer: &PeerId) -> Transition {
        if !self.viewers.remove(peer) {
            return Transition::Unchanged;
        }
        self.reconcile_releasing()
    }

    /// Drop every viewer (transport-level disconnect).
    pub fn clear_viewers(&mut self) -> Transition {
        self.viewers.clear();
        self.reconcile_releasing()
    }

    /// Bring the resource in line with the demand set and republish the
    /// fan-out targets.
    pub fn reconcile(&mut self) -> Result<Transition> {
        let transition = if !self.demand_is_empty() && self.active.is_none() {
            self.acquire()?;
            Transition::Acquired
        } else if self.demand_is_empty() && self.active.is_some() {
            self.release();
            Transition::Released
        } else {
            Transition::Unchanged
        };
        self.publish_targets();
        Ok(transition)
    }

    /// Handle a capture-thread signal. Stale sessions are ignored.
    ///
    /// A failed or ended session cannot serve its consumers, so the
    /// whole demand set is dropped along with the resource.
    pub fn on_signal(&mut self, signal: &CaptureSignal) -> Option<Vec<PeerId>> {
        let session = match signal {
            CaptureSignal::Failed { session, .. } | CaptureSignal::Ended { session } => *session,
        };
        if self.active.as_ref().map(|a| a.session) != Some(session) {
            return None;
        }
        warn!(session, ?signal, "capture session lost; dropping all consumers");

        self.preview = None;
        let dropped: Vec<PeerId> = std::mem::take(&mut self.viewers).into_iter().collect();
        self.release();
        self.publish_targets();
        Some(dropped)
    }

    // ── Internal ─────────────────────────────────────────────────

    // Removal paths only ever release, which cannot fail.
    fn reconcile_releasing(&mut self) -> Transition {
        self.reconcile().unwrap_or(Transition::Unchanged)
    }

    fn acquire(&mut self) -> Result<()> {
        let frames = self.source.start()?;
        let session = self.next_session;
        self.next_session += 1;

        let running = Arc::new(AtomicBool::new(true));
        // Targets must be current before the first frame is processed.
        self.publish_targets();
        let pipeline = FramePipeline::new(
            session,
            self.targets.subscribe(),
            Arc::clone(&self.factory),
            Arc::clone(&self.sessions),
            self.signals.clone(),
        );

        let thread_running = Arc::clone(&running);
        let spawned = std::thread::Builder::new()
            .name(format!("devlink-capture-{session}"))
            .spawn(move || pipeline.run(frames, thread_running));
        if let Err(e) = spawned {
            self.source.stop();
            return Err(DevlinkError::ResourceUnavailable(format!(
                "spawn frame pipeline: {e}"
            )));
        }

        info!(session, "capture started");
        self.active = Some(ActiveCapture { session, running });
        Ok(())
    }

    fn release(&mut self) {
        if let Some(active) = self.active.take() {
            active.running.store(false, Ordering::SeqCst);
            self.source.stop();
            info!(session = active.session, "capture stopped");
        }
    }

    fn publish_targets(&self) {
        let targets = FanoutTargets {
            preview: self.preview.clone(),
            viewers: self.viewers.iter().cloned().collect(),
        };
        self.targets.send_replace(targets);
    }
}

impl Drop for CaptureArbiter {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use bytes::Bytes;

    use crate::capture::encoder::ZstdFrameEncoder;
    use crate::capture::source::FrameReceiver;
    use crate::capture::types::RawFrame;

    #[derive(Default)]
    struct Counters {
        starts: usize,
        stops: usize,
        fail_next_start: bool,
        senders: Vec<mpsc::Sender<RawFrame>>,
    }

    #[derive(Clone, Default)]
    struct FakeSource(Arc<Mutex<Counters>>);

    impl CaptureSource for FakeSource {
        fn start(&mut self) -> Result<FrameReceiver> {
            let mut c = self.0.lock().unwrap();
            if std::mem::take(&mut c.fail_next_start) {
                return Err(DevlinkError::ResourceUnavailable("camera busy".into()));
            }
            c.starts += 1;
            let (tx, rx) = mpsc::channel(1);
            c.senders.push(tx);
            Ok(rx)
        }

        fn stop(&mut self) {
            let mut c = self.0.lock().unwrap();
            c.stops += 1;
            c.senders.clear();
        }
    }

    struct NullSessions;

    impl SessionHandler for NullSessions {
        fn write_media(&self, _peer: &PeerId, _chunk: Bytes) -> Result<()> {
            Ok(())
        }
        fn open_playback(&self, _peer: &PeerId) -> Result<()> {
            Ok(())
        }
        fn close_playback(&self, _peer: &PeerId) {}
        fn close_session(&self, _peer: &PeerId) {}
    }

    struct NullPreview;

    impl FrameSink for NullPreview {
        fn enqueue(&self, _frame: &RawFrame) {}
    }

    fn arbiter() -> (CaptureArbiter, FakeSource, mpsc::UnboundedReceiver<ControlEvent>) {
        let source = FakeSource::default();
        let (tx, rx) = mpsc::unbounded_channel();
        let arbiter = CaptureArbiter::new(
            Box::new(source.clone()),
            ZstdFrameEncoder::factory(1),
            Arc::new(NullSessions),
            tx,
        );
        (arbiter, source, rx)
    }

    fn counts(source: &FakeSource) -> (usize, usize) {
        let c = source.0.lock().unwrap();
        (c.starts, c.stops)
    }

    #[test]
    fn preview_acquires_and_releases() {
        let (mut arb, source, _rx) = arbiter();
        assert_eq!(arb.set_preview(Arc::new(NullPreview)).unwrap(), Transition::Acquired);
        assert!(arb.is_active());

        assert_eq!(arb.clear_preview(), Transition::Released);
        assert!(!arb.is_active());
        assert_eq!(counts(&source), (1, 1));
    }

    #[test]
    fn second_demand_is_idempotent() {
        let (mut arb, source, _rx) = arbiter();
        arb.set_preview(Arc::new(NullPreview)).unwrap();
        assert_eq!(arb.add_viewer("a".into()).unwrap(), Transition::Unchanged);
        assert_eq!(arb.add_viewer("a".into()).unwrap(), Transition::Unchanged);
        assert_eq!(counts(&source), (1, 0));
    }

    #[test]
    fn stays_active_until_last_viewer_leaves() {
        let (mut arb, source, _rx) = arbiter();
        assert_eq!(arb.add_viewer("a".into()).unwrap(), Transition::Acquired);
        assert_eq!(arb.add_viewer("b".into()).unwrap(), Transition::Unchanged);

        assert_eq!(arb.remove_viewer(&"a".into()), Transition::Unchanged);
        assert!(arb.is_active());

        assert_eq!(arb.remove_viewer(&"b".into()), Transition::Released);
        assert!(!arb.is_active());
        assert_eq!(counts(&source), (1, 1));
    }

    #[test]
    fn preview_keeps_resource_when_viewers_leave() {
        let (mut arb, _source, _rx) = arbiter();
        arb.add_viewer("a".into()).unwrap();
        arb.set_preview(Arc::new(NullPreview)).unwrap();
        assert_eq!(arb.clear_viewers(), Transition::Unchanged);
        assert!(arb.is_active());
    }

    #[test]
    fn removing_unknown_viewer_is_noop() {
        let (mut arb, source, _rx) = arbiter();
        assert_eq!(arb.remove_viewer(&"ghost".into()), Transition::Unchanged);
        assert_eq!(counts(&source), (0, 0));
    }

    #[test]
    fn failed_acquire_rolls_back_demand() {
        let (mut arb, source, _rx) = arbiter();
        source.0.lock().unwrap().fail_next_start = true;

        assert!(matches!(
            arb.add_viewer("a".into()),
            Err(DevlinkError::ResourceUnavailable(_))
        ));
        assert!(!arb.is_active());
        assert!(arb.demand_is_empty());
    }

    #[test]
    fn targets_follow_demand() {
        let (mut arb, _source, _rx) = arbiter();
        let rx = arb.subscribe_targets();
        arb.add_viewer("a".into()).unwrap();
        arb.add_viewer("b".into()).unwrap();
        assert_eq!(rx.borrow().viewers, vec![PeerId::from("a"), PeerId::from("b")]);

        arb.remove_viewer(&"a".into());
        assert_eq!(rx.borrow().viewers, vec![PeerId::from("b")]);
        assert!(rx.borrow().preview.is_none());
    }

    #[test]
    fn lost_session_drops_all_demand() {
        let (mut arb, source, _rx) = arbiter();
        arb.add_viewer("a".into()).unwrap();
        arb.set_preview(Arc::new(NullPreview)).unwrap();

        assert!(arb.on_signal(&CaptureSignal::Ended { session: 99 }).is_none());
        assert!(arb.is_active());

        let dropped = arb
            .on_signal(&CaptureSignal::Failed {
                session: 1,
                reason: "sensor gone".into(),
            })
            .unwrap();
        assert_eq!(dropped, vec![PeerId::from("a")]);
        assert!(!arb.is_active());
        assert!(arb.demand_is_empty());
        assert_eq!(counts(&source), (1, 1));
    }
}
