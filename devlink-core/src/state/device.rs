//! Local device state.
//!
//! One instance per process, owned by the controller. It is the single
//! source for `status` replies and is only mutated on the control plane.

use crate::message::StatePatch;
use crate::platform::DevicePlatform;

/// Clamp a level to `0.0..=1.0`; NaN becomes `0.0`.
pub fn clamp_level(level: f32) -> f32 {
    if level.is_nan() { 0.0 } else { level.clamp(0.0, 1.0) }
}

/// This device's controllable state.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalDeviceState {
    pub bulb: bool,
    /// `None` when the device has no torch.
    pub torch: Option<bool>,
    pub brightness: f32,
    pub ring: bool,
    pub volume: f32,
    /// Mirrors the capture arbiter: `true` while capture is held.
    pub camera: bool,
}

impl Default for LocalDeviceState {
    fn default() -> Self {
        Self {
            bulb: false,
            torch: Some(false),
            brightness: 1.0,
            ring: false,
            volume: 1.0,
            camera: false,
        }
    }
}

impl LocalDeviceState {
    /// Seed from what the platform currently reports.
    pub fn from_platform(platform: &dyn DevicePlatform) -> Self {
        Self {
            bulb: false,
            torch: platform.torch(),
            brightness: clamp_level(platform.brightness()),
            ring: platform.is_ringing(),
            volume: clamp_level(platform.volume()),
            camera: false,
        }
    }

    /// Full snapshot for a `status` reply.
    pub fn snapshot(&self) -> StatePatch {
        StatePatch {
            bulb: Some(self.bulb),
            torch: self.torch,
            brightness: Some(self.brightness),
            ring: Some(self.ring),
            volume: Some(self.volume),
            camera: Some(self.camera),
        }
    }
}
