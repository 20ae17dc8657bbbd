//! Detection gate
//!
//! Wraps an object detection backend with the state that makes it usable as a
//! shared network service:
//!
//! - **Deduplication**: detections that overlap an already reported detection of
//!   the same class are suppressed across requests until the history is reset.
//! - **Rate limiting**: each client may be admitted at most once per minimum
//!   interval; idle clients are swept after a minute.
//!
//! # Module Structure
//!
//! - `geometry`: boxes and IoU
//! - `dedup`: detection history and novelty checks
//! - `rate_limit`: per-client admission
//! - `detect`: backend trait, registry and backends
//! - `image_input`: upload decoding
//! - `service`: per-request orchestration
//! - `api`: HTTP server
//! - `config`: file + environment configuration

pub mod api;
pub mod config;
pub mod dedup;
pub mod detect;
pub mod geometry;
pub mod image_input;
pub mod rate_limit;
pub mod service;

pub use dedup::{Deduplicator, TrackedDetection, DEFAULT_NOVELTY_IOU};
pub use detect::{BackendRegistry, DetectorBackend, InferenceOutcome, RawDetection, StubBackend};
pub use geometry::{iou, BoundingBox};
pub use image_input::{DecodedImage, ImagePayload};
pub use rate_limit::{Admission, RateLimitConfig, RateLimiter};
pub use service::{DetectOutcome, DetectionFilter, DetectionService, ServiceError, StatusReport};
