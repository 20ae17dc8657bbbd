use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::dedup::DEFAULT_NOVELTY_IOU;
use crate::rate_limit::RateLimitConfig;
use crate::service::{DetectionFilter, DEFAULT_CONFIDENCE_THRESHOLD, DEFAULT_RELEVANT_CLASSES};

const DEFAULT_API_ADDR: &str = "0.0.0.0:5000";
const DEFAULT_MAX_BODY_BYTES: usize = 16 * 1024 * 1024;
const DEFAULT_WORKERS: usize = 8;
const DEFAULT_QUEUE_DEPTH: usize = 32;
const DEFAULT_MIN_INTERVAL_MS: u64 = 100;
const DEFAULT_STALE_AFTER_SECS: u64 = 60;
const DEFAULT_MODEL_PATH: &str = "models/yolov5m.onnx";
const DEFAULT_INPUT_SIZE: u32 = 640;

#[derive(Debug, Deserialize, Default)]
struct DetectApiConfigFile {
    api: Option<ApiConfigFile>,
    filter: Option<FilterConfigFile>,
    dedup: Option<DedupConfigFile>,
    rate_limit: Option<RateLimitConfigFile>,
    backend: Option<BackendConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
    cors_origin: Option<String>,
    max_body_bytes: Option<usize>,
    workers: Option<usize>,
    queue_depth: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct FilterConfigFile {
    confidence_threshold: Option<f32>,
    relevant_classes: Option<Vec<u32>>,
}

#[derive(Debug, Deserialize, Default)]
struct DedupConfigFile {
    iou_threshold: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct RateLimitConfigFile {
    min_interval_ms: Option<u64>,
    stale_after_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct BackendConfigFile {
    kind: Option<String>,
    model_path: Option<PathBuf>,
    input_size: Option<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    Stub,
    Tract,
}

impl BackendKind {
    fn parse(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "stub" => Ok(BackendKind::Stub),
            "tract" => Ok(BackendKind::Tract),
            other => Err(anyhow!(
                "unknown backend kind '{}'; expected 'stub' or 'tract'",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub kind: BackendKind,
    pub model_path: PathBuf,
    pub input_size: u32,
}

#[derive(Debug, Clone)]
pub struct DetectApiConfig {
    pub api_addr: String,
    pub cors_origin: Option<String>,
    pub max_body_bytes: usize,
    /// Threads serving connections.
    pub workers: usize,
    /// Accepted connections waiting for a worker; beyond this the server answers 503.
    pub queue_depth: usize,
    pub filter: DetectionFilter,
    pub iou_threshold: f32,
    pub rate_limit: RateLimitConfig,
    pub backend: BackendSettings,
}

impl DetectApiConfig {
    /// Load from the file named by `DETECT_CONFIG` (if any), then apply env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("DETECT_CONFIG").ok().map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => DetectApiConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: DetectApiConfigFile) -> Result<Self> {
        let api = file.api.unwrap_or_default();
        let filter = file.filter.unwrap_or_default();
        let rate_limit = file.rate_limit.unwrap_or_default();
        let backend = file.backend.unwrap_or_default();

        let kind = backend
            .kind
            .as_deref()
            .map(BackendKind::parse)
            .transpose()?
            .unwrap_or(BackendKind::Tract);

        Ok(Self {
            api_addr: api.addr.unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
            cors_origin: api.cors_origin,
            max_body_bytes: api.max_body_bytes.unwrap_or(DEFAULT_MAX_BODY_BYTES),
            workers: api.workers.unwrap_or(DEFAULT_WORKERS),
            queue_depth: api.queue_depth.unwrap_or(DEFAULT_QUEUE_DEPTH),
            filter: DetectionFilter {
                confidence_threshold: filter
                    .confidence_threshold
                    .unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD),
                relevant_classes: filter
                    .relevant_classes
                    .map(|classes| classes.into_iter().collect())
                    .unwrap_or_else(|| DEFAULT_RELEVANT_CLASSES.into_iter().collect()),
            },
            iou_threshold: file
                .dedup
                .and_then(|dedup| dedup.iou_threshold)
                .unwrap_or(DEFAULT_NOVELTY_IOU),
            rate_limit: RateLimitConfig {
                min_interval: Duration::from_millis(
                    rate_limit.min_interval_ms.unwrap_or(DEFAULT_MIN_INTERVAL_MS),
                ),
                stale_after: Duration::from_secs(
                    rate_limit.stale_after_secs.unwrap_or(DEFAULT_STALE_AFTER_SECS),
                ),
            },
            backend: BackendSettings {
                kind,
                model_path: backend
                    .model_path
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_MODEL_PATH)),
                input_size: backend.input_size.unwrap_or(DEFAULT_INPUT_SIZE),
            },
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("DETECT_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api_addr = addr;
            }
        }
        if let Ok(origin) = std::env::var("DETECT_CORS_ORIGIN") {
            if !origin.trim().is_empty() {
                self.cors_origin = Some(origin);
            }
        }
        if let Ok(workers) = std::env::var("DETECT_API_WORKERS") {
            self.workers = workers
                .trim()
                .parse()
                .map_err(|_| anyhow!("DETECT_API_WORKERS must be a positive integer"))?;
        }
        if let Ok(threshold) = std::env::var("DETECT_CONFIDENCE_THRESHOLD") {
            self.filter.confidence_threshold = threshold
                .trim()
                .parse()
                .map_err(|_| anyhow!("DETECT_CONFIDENCE_THRESHOLD must be a number"))?;
        }
        if let Ok(classes) = std::env::var("DETECT_RELEVANT_CLASSES") {
            let parsed = parse_class_csv(&classes)?;
            if !parsed.is_empty() {
                self.filter.relevant_classes = parsed;
            }
        }
        if let Ok(interval) = std::env::var("DETECT_MIN_INTERVAL_MS") {
            let millis: u64 = interval.trim().parse().map_err(|_| {
                anyhow!("DETECT_MIN_INTERVAL_MS must be an integer number of milliseconds")
            })?;
            self.rate_limit.min_interval = Duration::from_millis(millis);
        }
        if let Ok(kind) = std::env::var("DETECT_BACKEND") {
            if !kind.trim().is_empty() {
                self.backend.kind = BackendKind::parse(&kind)?;
            }
        }
        if let Ok(path) = std::env::var("DETECT_MODEL_PATH") {
            if !path.trim().is_empty() {
                self.backend.model_path = PathBuf::from(path);
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let threshold = self.filter.confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(anyhow!(
                "confidence threshold must be within 0..=1, got {}",
                threshold
            ));
        }
        if !(0.0..=1.0).contains(&self.iou_threshold) {
            return Err(anyhow!(
                "iou threshold must be within 0..=1, got {}",
                self.iou_threshold
            ));
        }
        if self.filter.relevant_classes.is_empty() {
            return Err(anyhow!("relevant class set must not be empty"));
        }
        if self.rate_limit.stale_after.is_zero() {
            return Err(anyhow!("rate limit stale_after must be greater than zero"));
        }
        if self.backend.input_size == 0 {
            return Err(anyhow!("backend input size must be greater than zero"));
        }
        if self.max_body_bytes == 0 {
            return Err(anyhow!("max body size must be greater than zero"));
        }
        if self.workers == 0 {
            return Err(anyhow!("api workers must be greater than zero"));
        }
        if self.queue_depth == 0 {
            return Err(anyhow!("api queue depth must be greater than zero"));
        }
        Ok(())
    }
}

impl Default for DetectApiConfig {
    fn default() -> Self {
        Self {
            api_addr: DEFAULT_API_ADDR.to_string(),
            cors_origin: None,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            workers: DEFAULT_WORKERS,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            filter: DetectionFilter::default(),
            iou_threshold: DEFAULT_NOVELTY_IOU,
            rate_limit: RateLimitConfig::default(),
            backend: BackendSettings {
                kind: BackendKind::Tract,
                model_path: PathBuf::from(DEFAULT_MODEL_PATH),
                input_size: DEFAULT_INPUT_SIZE,
            },
        }
    }
}

fn read_config_file(path: &Path) -> Result<DetectApiConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn parse_class_csv(value: &str) -> Result<BTreeSet<u32>> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            entry
                .parse()
                .map_err(|_| anyhow!("invalid class id '{}' in DETECT_RELEVANT_CLASSES", entry))
        })
        .collect()
}
