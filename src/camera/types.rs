//! Camera connection types.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::backoff::{DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX, DEFAULT_MAX_ATTEMPTS};

/// Connection state of a camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraState {
    Connected,
    Disconnected,
    Reconnecting,
    /// Reconnection attempts exhausted; terminal until the camera is registered again
    Failed,
}

impl fmt::Display for CameraState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CameraState::Connected => "connected",
            CameraState::Disconnected => "disconnected",
            CameraState::Reconnecting => "reconnecting",
            CameraState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Settings for the reconnection loop.
#[derive(Debug, Clone)]
pub struct ReconnectSettings {
    /// Attempts before the camera is marked failed
    pub max_attempts: u32,
    /// Delay before the first attempt; doubles each attempt
    pub base_delay: Duration,
    /// Cap on the delay between attempts
    pub max_delay: Duration,
    /// How long `unregister_camera`/`shutdown` wait for a loop to exit
    pub join_timeout: Duration,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BACKOFF_BASE,
            max_delay: DEFAULT_BACKOFF_MAX,
            join_timeout: Duration::from_secs(2),
        }
    }
}
