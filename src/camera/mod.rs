//! Camera connection tracking and reconnection.
//!
//! - [`CameraState`] is the per-camera connection state
//! - [`CameraReconnectionManager`] drives the backoff reconnection loop

mod reconnect;
mod types;

pub use reconnect::{CameraReconnectionManager, ReconnectCallback, StateObserver};
pub use types::{CameraState, ReconnectSettings};
