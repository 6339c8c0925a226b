use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    Portrait,
    Landscape,
    Square,
    Unknown,
}

impl Orientation {
    pub fn from_dimensions(width: u32, height: u32) -> Self {
        match width.cmp(&height) {
            _ if width == 0 || height == 0 => Orientation::Unknown,
            std::cmp::Ordering::Less => Orientation::Portrait,
            std::cmp::Ordering::Greater => Orientation::Landscape,
            std::cmp::Ordering::Equal => Orientation::Square,
        }
    }
}

/// Metadata loaded while preparing a handle.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaMetadata {
    pub playable: bool,
    pub duration: Option<Duration>,
    pub orientation: Orientation,
}

#[derive(Debug, Error)]
pub enum PrepareError {
    #[error("network error: {0}")]
    Network(String),
    #[error("malformed asset: {0}")]
    Malformed(String),
}

/// Backend that turns a URL into a playable resource (decoder, player item).
#[async_trait]
pub trait MediaPreparer: Send + Sync {
    async fn prepare(&self, url: &str) -> Result<MediaMetadata, PrepareError>;

    /// Free native resources held for `url`. Called once per prepared handle.
    fn release(&self, _url: &str) {}
}
