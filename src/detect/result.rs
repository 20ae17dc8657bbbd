use serde::{Deserialize, Serialize};

use crate::geometry::BoundingBox;

/// One candidate detection as produced by a backend.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    pub class_id: u32,
    pub confidence: f32,
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
}

impl RawDetection {
    pub fn new(class_id: u32, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            class_id,
            confidence,
            bbox,
        }
    }
}

/// Result of one inference call.
///
/// A failing backend is reported as a value rather than an error so callers can
/// degrade to "no detections" without tearing down the request.
#[derive(Clone, Debug, PartialEq)]
pub enum InferenceOutcome {
    Detections(Vec<RawDetection>),
    BackendFailed(String),
}

impl InferenceOutcome {
    /// Candidates from a successful run; empty when the backend failed.
    pub fn into_candidates(self) -> Vec<RawDetection> {
        match self {
            InferenceOutcome::Detections(detections) => detections,
            InferenceOutcome::BackendFailed(_) => Vec::new(),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, InferenceOutcome::BackendFailed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detection_serializes_with_box_array() {
        let det = RawDetection::new(2, 0.5, BoundingBox::new(10.0, 10.0, 50.0, 50.0));
        let json = serde_json::to_value(det).unwrap();
        assert_eq!(json["class_id"], 2);
        assert_eq!(json["box"], serde_json::json!([10.0, 10.0, 50.0, 50.0]));
    }

    #[test]
    fn failed_outcome_has_no_candidates() {
        let outcome = InferenceOutcome::BackendFailed("boom".into());
        assert!(outcome.is_failure());
        assert!(outcome.into_candidates().is_empty());
    }
}
