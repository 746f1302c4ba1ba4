//! Platform hardware / audio collaborator.
//!
//! The controller drives physical state through [`DevicePlatform`] and
//! receives unsolicited changes as [`PlatformEvent`]s.
//! [`SimulatedPlatform`] keeps everything in memory and is used by the
//! node service and the tests.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{DevlinkError, Result};
use crate::state::clamp_level;

/// Hardware and audio subsystem of the local device.
pub trait DevicePlatform: Send {
    /// Torch state, `None` if the device has no torch.
    fn torch(&self) -> Option<bool>;
    fn set_torch(&mut self, on: bool) -> Result<()>;

    fn brightness(&self) -> f32;
    fn set_brightness(&mut self, level: f32) -> Result<()>;

    fn is_ringing(&self) -> bool;
    fn set_ringing(&mut self, playing: bool) -> Result<()>;

    fn volume(&self) -> f32;
    fn set_volume(&mut self, level: f32) -> Result<()>;

    /// Human readable device name, used when our self name is empty.
    fn device_name(&self) -> String;
}

/// Changes originating on the platform rather than from a command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlatformEvent {
    /// The screen brightness moved (user slider, ambient sensor).
    BrightnessChanged(f32),
    /// Audio playback was interrupted by the system.
    AudioInterrupted,
    /// The application moved to the background.
    EnteredBackground,
}

// ── SimulatedPlatform ────────────────────────────────────────────

#[derive(Debug)]
struct SimulatedState {
    torch: Option<bool>,
    brightness: f32,
    ringing: bool,
    volume: f32,
    name: String,
}

/// In-memory platform. Clones share the same state.
#[derive(Debug, Clone)]
pub struct SimulatedPlatform {
    inner: Arc<Mutex<SimulatedState>>,
}

impl SimulatedPlatform {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimulatedState {
                torch: Some(false),
                brightness: 0.8,
                ringing: false,
                volume: 1.0,
                name: name.into(),
            })),
        }
    }

    /// A platform without torch hardware.
    pub fn without_torch(name: impl Into<String>) -> Self {
        let platform = Self::new(name);
        platform.state().torch = None;
        platform
    }

    fn state(&self) -> MutexGuard<'_, SimulatedState> {
        // A poisoned lock still holds plain data.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl DevicePlatform for SimulatedPlatform {
    fn torch(&self) -> Option<bool> {
        self.state().torch
    }

    fn set_torch(&mut self, on: bool) -> Result<()> {
        let mut state = self.state();
        match state.torch.as_mut() {
            Some(torch) => {
                *torch = on;
                Ok(())
            }
            None => Err(DevlinkError::ResourceUnavailable("device has no torch".into())),
        }
    }

    fn brightness(&self) -> f32 {
        self.state().brightness
    }

    fn set_brightness(&mut self, level: f32) -> Result<()> {
        self.state().brightness = clamp_level(level);
        Ok(())
    }

    fn is_ringing(&self) -> bool {
        self.state().ringing
    }

    fn set_ringing(&mut self, playing: bool) -> Result<()> {
        self.state().ringing = playing;
        Ok(())
    }

    fn volume(&self) -> f32 {
        self.state().volume
    }

    fn set_volume(&mut self, level: f32) -> Result<()> {
        self.state().volume = clamp_level(level);
        Ok(())
    }

    fn device_name(&self) -> String {
        self.state().name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_state() {
        let platform = SimulatedPlatform::new("desk");
        let mut handle = platform.clone();
        handle.set_volume(0.3).unwrap();
        handle.set_torch(true).unwrap();
        assert_eq!(platform.volume(), 0.3);
        assert_eq!(platform.torch(), Some(true));
    }

    #[test]
    fn torchless_platform_rejects_torch() {
        let mut platform = SimulatedPlatform::without_torch("tablet");
        assert!(platform.torch().is_none());
        assert!(matches!(
            platform.set_torch(true),
            Err(DevlinkError::ResourceUnavailable(_))
        ));
    }

    #[test]
    fn levels_are_clamped() {
        let mut platform = SimulatedPlatform::new("desk");
        platform.set_brightness(3.0).unwrap();
        assert_eq!(platform.brightness(), 1.0);
    }
}
