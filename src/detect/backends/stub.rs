use anyhow::Result;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::RawDetection;

/// Stub backend for testing. Returns the same scripted candidates for every frame.
#[derive(Clone, Debug, Default)]
pub struct StubBackend {
    detections: Vec<RawDetection>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_detections(detections: Vec<RawDetection>) -> Self {
        Self { detections }
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, _pixels: &[u8], width: u32, height: u32) -> Result<Vec<RawDetection>> {
        log::trace!("stub backend frame {}x{}", width, height);
        Ok(self.detections.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::BoundingBox;

    #[test]
    fn stub_backend_replays_detections() {
        let det = RawDetection::new(2, 0.9, BoundingBox::new(10.0, 10.0, 50.0, 50.0));
        let mut backend = StubBackend::with_detections(vec![det]);

        assert_eq!(backend.detect(b"frame1", 1, 1).unwrap(), vec![det]);
        assert_eq!(backend.detect(b"frame2", 1, 1).unwrap(), vec![det]);
        assert!(StubBackend::new().detect(b"x", 1, 1).unwrap().is_empty());
    }
}
