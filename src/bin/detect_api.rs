//! detect_api - HTTP object detection service with duplicate suppression
//!
//! This daemon:
//! 1. Loads configuration (JSON file + environment)
//! 2. Loads the detection backend (a failed model load leaves the service up
//!    with `model_loaded = false`)
//! 3. Serves /detect, /reset and /status until Ctrl-C

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use detect_gate::{
    api::{ApiConfig, ApiServer},
    config::DetectApiConfig,
    BackendRegistry, Deduplicator, DetectionService, RateLimiter,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// JSON config file.
    #[arg(long, env = "DETECT_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,
    /// Listen address, overrides config and DETECT_API_ADDR.
    #[arg(long, value_name = "ADDR")]
    addr: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = DetectApiConfig::load_from(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.api_addr = addr;
    }

    let backends = BackendRegistry::load(&config.backend, config.filter.confidence_threshold);
    if backends.is_empty() {
        log::error!("no detection backend loaded; requests will return no detections");
    } else {
        log::info!("detection backends: {}", backends.list().join(", "));
    }

    log::info!(
        "{} workers, queue depth {}",
        config.workers,
        config.queue_depth
    );
    log::info!(
        "confidence threshold {}, {} relevant classes, novelty iou {}",
        config.filter.confidence_threshold,
        config.filter.relevant_classes.len(),
        config.iou_threshold
    );

    let service = Arc::new(DetectionService::new(
        config.filter.clone(),
        Arc::new(Deduplicator::new(config.iou_threshold)),
        Arc::new(RateLimiter::new(config.rate_limit)),
        backends,
    ));

    let api_handle = ApiServer::new(ApiConfig::from(&config), service).spawn()?;
    log::info!("detection api listening on {}", api_handle.addr);
    if let Some(origin) = &config.cors_origin {
        log::info!("cors origin allowed: {}", origin);
    }

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;

    log::info!("detect_api waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping API server...");
    api_handle.stop()?;

    Ok(())
}
