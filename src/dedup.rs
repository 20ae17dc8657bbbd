//! Cross-request duplicate suppression.
//!
//! The deduplicator keeps every detection it has admitted and rejects new
//! candidates that overlap a stored detection of the same class. History only
//! shrinks on an explicit [`Deduplicator::reset`]; there is no age-based expiry.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::detect::RawDetection;
use crate::geometry::iou;

/// IoU above which a same-class candidate counts as already seen.
pub const DEFAULT_NOVELTY_IOU: f32 = 0.4;

/// A detection that passed filtering and the novelty check.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrackedDetection {
    pub detection: RawDetection,
}

impl TrackedDetection {
    fn matches(&self, candidate: &RawDetection, threshold: f32) -> bool {
        self.detection.class_id == candidate.class_id
            && iou(&self.detection.bbox, &candidate.bbox) > threshold
    }
}

/// Process-wide detection history, guarded by a single lock.
///
/// The novelty check and the append happen under the same lock, so two
/// concurrent callers can never both admit equivalent candidates, and a reset
/// never interleaves with an admission.
pub struct Deduplicator {
    history: Mutex<Vec<TrackedDetection>>,
    iou_threshold: f32,
}

impl Deduplicator {
    pub fn new(iou_threshold: f32) -> Self {
        Self {
            history: Mutex::new(Vec::new()),
            iou_threshold,
        }
    }

    /// True when no stored detection of the same class overlaps `candidate`
    /// by more than the threshold.
    pub fn is_novel(&self, candidate: &RawDetection) -> bool {
        let history = self.history();
        is_novel_in(&history, candidate, self.iou_threshold)
    }

    /// Append `candidate` to history if it is novel. Returns whether it was admitted.
    pub fn admit(&self, candidate: RawDetection) -> bool {
        let mut history = self.history();
        if !is_novel_in(&history, &candidate, self.iou_threshold) {
            return false;
        }
        history.push(TrackedDetection {
            detection: candidate,
        });
        true
    }

    /// Clear the whole history. Returns how many entries were dropped.
    pub fn reset(&self) -> usize {
        let mut history = self.history();
        let dropped = history.len();
        history.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.history().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn history(&self) -> MutexGuard<'_, Vec<TrackedDetection>> {
        // A panic while holding the lock cannot leave the Vec half-updated.
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(DEFAULT_NOVELTY_IOU)
    }
}

fn is_novel_in(history: &[TrackedDetection], candidate: &RawDetection, threshold: f32) -> bool {
    !history.iter().any(|stored| stored.matches(candidate, threshold))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::BoundingBox;
    use std::sync::{Arc, Barrier};

    fn det(class_id: u32, x: f32, y: f32) -> RawDetection {
        RawDetection::new(class_id, 0.9, BoundingBox::new(x, y, 50.0, 50.0))
    }

    #[test]
    fn overlapping_same_class_is_rejected() {
        let dedup = Deduplicator::default();
        assert!(dedup.admit(det(2, 10.0, 10.0)));
        assert!(!dedup.is_novel(&det(2, 12.0, 11.0)));
        assert!(!dedup.admit(det(2, 12.0, 11.0)));
        assert_eq!(dedup.len(), 1);
    }

    #[test]
    fn different_class_or_low_overlap_is_admitted() {
        let dedup = Deduplicator::default();
        assert!(dedup.admit(det(2, 10.0, 10.0)));
        assert!(dedup.admit(det(3, 10.0, 10.0)));
        // shifted by 30px: IoU = 20*50 / (2*2500 - 1000) = 0.25
        assert!(dedup.admit(det(2, 40.0, 10.0)));
        assert_eq!(dedup.len(), 3);
    }

    #[test]
    fn threshold_is_exclusive() {
        let dedup = Deduplicator::new(0.25);
        assert!(dedup.admit(det(1, 0.0, 0.0)));
        // IoU exactly 0.25 is not "greater than" the threshold
        assert!(dedup.admit(det(1, 30.0, 0.0)));
    }

    #[test]
    fn reset_readmits_previous_duplicates() {
        let dedup = Deduplicator::default();
        assert!(dedup.admit(det(2, 10.0, 10.0)));
        assert!(!dedup.admit(det(2, 10.0, 10.0)));
        assert_eq!(dedup.reset(), 1);
        assert!(dedup.is_empty());
        assert!(dedup.admit(det(2, 10.0, 10.0)));
    }

    #[test]
    fn concurrent_admits_of_same_object_insert_once() {
        let dedup = Arc::new(Deduplicator::default());
        let workers = 16;
        let barrier = Arc::new(Barrier::new(workers));
        let handles: Vec<_> = (0..workers)
            .map(|i| {
                let dedup = dedup.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    dedup.admit(det(2, 10.0 + (i % 3) as f32, 10.0))
                })
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|admitted| *admitted)
            .count();
        assert_eq!(admitted, 1);
        assert_eq!(dedup.len(), 1);
    }
}
