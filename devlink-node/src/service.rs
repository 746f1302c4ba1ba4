//! Node service lifecycle.
//!
//! Wires the TCP transport, the simulated device platform and the
//! synthetic camera into a [`Controller`], then runs until stopped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use devlink_core::{
    Collaborators, Controller, ControllerHandle, DeviceEvent, PatternCapture, SimulatedPlatform,
    TcpTransport, ZstdFrameEncoder,
};

use crate::config::NodeConfig;

const STOP_POLL: Duration = Duration::from_millis(100);

// ── NodeService ──────────────────────────────────────────────────

/// The top-level node service.
pub struct NodeService {
    config: NodeConfig,
    running: Arc<AtomicBool>,
}

impl NodeService {
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Obtain a handle that can be used to stop the service from
    /// another task.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Run the service until stopped.
    ///
    /// 1. Starts the TCP transport (listener + dialers).
    /// 2. Spawns the controller on its own task.
    /// 3. Logs device events until `running` becomes `false`.
    /// 4. Shuts the controller down, then the transport.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        self.config.validate()?;
        self.running.store(true, Ordering::SeqCst);

        let (handle, inbox) = ControllerHandle::channel();
        let transport = TcpTransport::start(self.config.to_transport_config(), handle.clone()).await?;
        info!(
            "node {} listening on {}",
            transport.id(),
            transport.local_addr()
        );

        let capture = &self.config.capture;
        let controller = Controller::new(
            self.config.to_controller_config(),
            Collaborators {
                transport: transport.clone(),
                sessions: transport.clone(),
                platform: Box::new(SimulatedPlatform::new(self.config.display_name())),
                capture: Box::new(PatternCapture::new(
                    capture.width,
                    capture.height,
                    capture.fps,
                )),
                encoder: ZstdFrameEncoder::factory(capture.compression_level),
            },
            &handle,
        );

        let observer = tokio::spawn(log_events(controller.subscribe()));
        let control = tokio::spawn(controller.run(inbox));

        Self::wait_for_stop(&self.running).await;

        if let Err(e) = handle.shutdown() {
            debug!("controller already gone: {e}");
        }
        if let Err(e) = control.await {
            warn!("controller task failed: {e}");
        }
        observer.abort();
        transport.shutdown();

        self.running.store(false, Ordering::SeqCst);
        info!("node service stopped");
        Ok(())
    }

    /// Signal the service to stop.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Resolves when `running` becomes false.
    async fn wait_for_stop(running: &Arc<AtomicBool>) {
        while running.load(Ordering::SeqCst) {
            tokio::time::sleep(STOP_POLL).await;
        }
    }
}

async fn log_events(mut events: broadcast::Receiver<DeviceEvent>) {
    loop {
        match events.recv().await {
            Ok(DeviceEvent::SelfInfoChanged { name }) => info!("self name: {name}"),
            Ok(DeviceEvent::DeviceListChanged) => debug!("device list changed"),
            Ok(DeviceEvent::DeviceStatusChanged { peer: None, patch }) => {
                info!("local state: {patch:?}")
            }
            Ok(DeviceEvent::DeviceStatusChanged {
                peer: Some(peer),
                patch,
            }) => info!("{peer} state: {patch:?}"),
            Err(broadcast::error::RecvError::Lagged(n)) => warn!("event log skipped {n} events"),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
