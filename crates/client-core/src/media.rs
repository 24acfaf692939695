//! Local media capture seam
//!
//! Camera and microphone access is an external capability. The client only
//! needs to acquire a capture stream for a call, toggle its tracks, and
//! release it when the call ends. A capture device is exclusively owned by at
//! most one call at a time; implementations report [`MediaError::DeviceBusy`]
//! when asked for a device that is still held.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Kind of media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

/// What to capture for a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

impl MediaConstraints {
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    pub fn kinds(&self) -> Vec<MediaKind> {
        let mut kinds = Vec::with_capacity(2);
        if self.audio {
            kinds.push(MediaKind::Audio);
        }
        if self.video {
            kinds.push(MediaKind::Video);
        }
        kinds
    }
}

/// Why local media could not be acquired
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("permission denied")]
    PermissionDenied,
    #[error("capture device busy")]
    DeviceBusy,
    #[error("no capture device for {0}")]
    NoDevice(MediaKind),
}

/// An acquired local capture stream
///
/// Implementations must release the device on `stop()` and on drop.
pub trait LocalMedia: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;

    fn kinds(&self) -> Vec<MediaKind>;

    /// Enable or disable one track without releasing the device
    fn set_enabled(&mut self, kind: MediaKind, enabled: bool);

    fn is_enabled(&self, kind: MediaKind) -> bool;

    /// Release the capture device; idempotent
    fn stop(&mut self);

    fn is_stopped(&self) -> bool;
}

/// Access to the local capture devices
#[async_trait]
pub trait MediaCapture: Send + Sync {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<Box<dyn LocalMedia>, MediaError>;
}

/// Handle to media received from the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMedia {
    pub id: String,
    pub kinds: Vec<MediaKind>,
}
