use anyhow::Result;

use crate::detect::result::RawDetection;

/// Object detection backend.
///
/// Backends receive an RGB8 frame (row-major, 3 bytes per pixel) and return raw
/// candidates with boxes in the frame's pixel space. Filtering and deduplication
/// happen in the service, never in the backend.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame.
    fn detect(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<RawDetection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
