//! Request orchestration.
//!
//! [`DetectionService`] runs one detection request end to end:
//! admission, decode, inference, filtering, deduplication and the rate-limit
//! sweep. It owns no global state; the deduplicator, the rate limiter and the
//! backends are handed in by the caller so tests can build a fresh service.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;

use crate::dedup::Deduplicator;
use crate::detect::{BackendRegistry, InferenceOutcome, RawDetection};
use crate::image_input::{DecodedImage, ImagePayload};
use crate::rate_limit::{Admission, RateLimiter};

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.1;

/// COCO ids of people, vehicles and common desk electronics.
pub const DEFAULT_RELEVANT_CLASSES: [u32; 13] = [0, 1, 2, 3, 5, 6, 7, 62, 63, 64, 65, 66, 67];

/// Candidate screen applied before deduplication.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectionFilter {
    /// Candidates must score strictly above this.
    pub confidence_threshold: f32,
    pub relevant_classes: BTreeSet<u32>,
}

impl DetectionFilter {
    pub fn accepts(&self, detection: &RawDetection) -> bool {
        detection.confidence > self.confidence_threshold
            && self.relevant_classes.contains(&detection.class_id)
    }
}

impl Default for DetectionFilter {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            relevant_classes: DEFAULT_RELEVANT_CLASSES.into_iter().collect(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum DetectOutcome {
    /// Newly seen detections from this request (possibly empty).
    Detections(Vec<RawDetection>),
    /// The client is sending too fast; nothing was run.
    RateLimited { retry_after: Duration },
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid image: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub status: &'static str,
    pub active_clients: usize,
    pub tracked_detections: usize,
    pub model_loaded: bool,
}

pub struct DetectionService {
    filter: DetectionFilter,
    dedup: Arc<Deduplicator>,
    limiter: Arc<RateLimiter>,
    backends: BackendRegistry,
}

impl DetectionService {
    pub fn new(
        filter: DetectionFilter,
        dedup: Arc<Deduplicator>,
        limiter: Arc<RateLimiter>,
        backends: BackendRegistry,
    ) -> Self {
        Self {
            filter,
            dedup,
            limiter,
            backends,
        }
    }

    pub fn model_loaded(&self) -> bool {
        self.backends.default_backend().is_some()
    }

    /// Whether a request from `client` at `now` would pass the rate limiter.
    /// Nothing is recorded; lets the HTTP layer answer 429 before validating
    /// the upload.
    pub fn check_rate(&self, client: &str, now: Instant) -> Admission {
        self.limiter.check(client, now)
    }

    /// Process one detection request from `client` arriving at `now`.
    pub fn handle(
        &self,
        client: &str,
        payload: &ImagePayload,
        now: Instant,
    ) -> Result<DetectOutcome, ServiceError> {
        if let Admission::Rejected { retry_after } = self.limiter.try_admit(client, now) {
            log::debug!(
                "rate limited {} (retry in {:.3}s)",
                client,
                retry_after.as_secs_f64()
            );
            return Ok(DetectOutcome::RateLimited { retry_after });
        }

        let result = self.run_admitted(client, payload);
        let evicted = self.limiter.sweep(now);
        if evicted > 0 {
            log::debug!("evicted {} idle rate-limit entries", evicted);
        }
        result
    }

    fn run_admitted(
        &self,
        client: &str,
        payload: &ImagePayload,
    ) -> Result<DetectOutcome, ServiceError> {
        let image = payload
            .decode()
            .map_err(|err| ServiceError::InvalidInput(format!("{:#}", err)))?;
        let candidates = self.infer(&image);
        let admitted = self.admit_candidates(candidates);
        log::debug!(
            "{}: {}x{} frame, {} new detections",
            client,
            image.width,
            image.height,
            admitted.len()
        );
        Ok(DetectOutcome::Detections(admitted))
    }

    /// Run the backend, degrading any failure to an empty candidate list.
    fn infer(&self, image: &DecodedImage) -> Vec<RawDetection> {
        let outcome = self
            .backends
            .detect(&image.pixels, image.width, image.height);
        if let InferenceOutcome::BackendFailed(reason) = &outcome {
            log::error!("detection backend failed: {}", reason);
        }
        outcome.into_candidates()
    }

    /// Screen candidates and keep the ones the deduplicator has not seen.
    fn admit_candidates(&self, candidates: Vec<RawDetection>) -> Vec<RawDetection> {
        candidates
            .into_iter()
            .filter(|candidate| self.filter.accepts(candidate))
            .filter(|candidate| self.dedup.admit(*candidate))
            .collect()
    }

    /// Clear the detection history.
    pub fn reset(&self) -> usize {
        let dropped = self.dedup.reset();
        log::info!("detection history cleared ({} entries)", dropped);
        dropped
    }

    pub fn status(&self) -> StatusReport {
        StatusReport {
            status: "operational",
            active_clients: self.limiter.active_client_count(),
            tracked_detections: self.dedup.len(),
            model_loaded: self.model_loaded(),
        }
    }
}
