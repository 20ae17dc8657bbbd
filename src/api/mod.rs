use crate::config::DetectApiConfig;
use crate::image_input::ImagePayload;
use crate::rate_limit::Admission;
use crate::service::{DetectOutcome, DetectionService, ServiceError};
use anyhow::{anyhow, Result};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;

mod multipart;

const MAX_HEAD_BYTES: usize = 8192;
const READ_TIMEOUT: Duration = Duration::from_secs(5);
/// How long to keep reading after an early error response so the close is clean.
const LINGER: Duration = Duration::from_millis(100);
const LINGER_MAX_BYTES: u64 = 64 * 1024;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    /// Origin allowed to call the API from a browser. No CORS headers when unset.
    pub cors_origin: Option<String>,
    pub max_body_bytes: usize,
    pub workers: usize,
    pub queue_depth: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        let defaults = DetectApiConfig::default();
        Self::from(&defaults)
    }
}

impl From<&DetectApiConfig> for ApiConfig {
    fn from(cfg: &DetectApiConfig) -> Self {
        Self {
            addr: cfg.api_addr.clone(),
            cors_origin: cfg.cors_origin.clone(),
            max_body_bytes: cfg.max_body_bytes,
            workers: cfg.workers,
            queue_depth: cfg.queue_depth,
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    service: Arc<DetectionService>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, service: Arc<DetectionService>) -> Self {
        Self { cfg, service }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let cfg = Arc::new(self.cfg);
        let service = self.service;
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, cfg, service, shutdown_thread) {
                log::error!("detection api stopped: {}", err);
            }
        });

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

type Connection = (TcpStream, SocketAddr);

fn run_api(
    listener: TcpListener,
    cfg: Arc<ApiConfig>,
    service: Arc<DetectionService>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let (tx, rx) = crossbeam_channel::bounded::<Connection>(cfg.queue_depth);
    let workers = (0..cfg.workers.max(1))
        .map(|id| spawn_worker(id, rx.clone(), cfg.clone(), service.clone()))
        .collect::<std::io::Result<Vec<_>>>()?;
    drop(rx);

    let result = accept_loop(&listener, &tx, &cfg, &shutdown);

    // Closing the queue lets every worker finish its current connection and exit.
    drop(tx);
    for worker in workers {
        if worker.join().is_err() {
            log::error!("detection api worker panicked");
        }
    }
    result
}

fn spawn_worker(
    id: usize,
    rx: Receiver<Connection>,
    cfg: Arc<ApiConfig>,
    service: Arc<DetectionService>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("detect-api-{id}"))
        .spawn(move || {
            for (stream, peer) in rx.iter() {
                if let Err(err) = handle_connection(stream, peer, &service, &cfg) {
                    log::warn!("detection api request from {} dropped: {}", peer, err);
                }
            }
        })
}

fn accept_loop(
    listener: &TcpListener,
    tx: &Sender<Connection>,
    cfg: &ApiConfig,
    shutdown: &AtomicBool,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok(conn) => match tx.try_send(conn) {
                Ok(()) => {}
                Err(TrySendError::Full((stream, peer))) => {
                    log::warn!("all workers busy, turning away {}", peer);
                    if let Err(err) = reject_busy(stream, cfg) {
                        log::debug!("busy response to {} failed: {}", peer, err);
                    }
                }
                Err(TrySendError::Disconnected(_)) => {
                    return Err(anyhow!("detection api workers exited"));
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn reject_busy(mut stream: TcpStream, cfg: &ApiConfig) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_write_timeout(Some(LINGER))?;
    let response = HttpResponse::json(
        503,
        &json!({
            "error": "server_busy",
            "message": "Server is busy, please retry shortly",
        }),
    )
    .with_header("Retry-After", "1".to_string());
    write_response(&mut stream, &response, cfg)?;
    linger_close(stream);
    Ok(())
}

/// Finish an early response: stop writing, then swallow whatever the client
/// is still sending so the close is a FIN rather than a reset.
fn linger_close(stream: TcpStream) {
    let _ = stream.shutdown(Shutdown::Write);
    if stream.set_read_timeout(Some(LINGER)).is_ok() {
        let _ = std::io::copy(&mut (&stream).take(LINGER_MAX_BYTES), &mut std::io::sink());
    }
}

fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    service: &DetectionService,
    cfg: &ApiConfig,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(READ_TIMEOUT))?;

    let head = read_request_head(&mut stream).and_then(|request| {
        let len = request.content_length()?;
        Ok((request, len))
    });
    let (mut request, len) = match head {
        Ok(head) => head,
        Err(RequestError::Io(err)) => return Err(err.into()),
        Err(err) => {
            log::warn!("malformed request from {}: {}", peer, err);
            write_response(&mut stream, &err.response(), cfg)?;
            linger_close(stream);
            return Ok(());
        }
    };

    if let Some(len) = len.filter(|len| *len > cfg.max_body_bytes) {
        log::warn!("{} sent a {} byte body", peer, len);
        let response = HttpResponse::json(
            413,
            &json!({
                "error": "payload_too_large",
                "message": format!("request body exceeds {} bytes", cfg.max_body_bytes),
            }),
        );
        write_response(&mut stream, &response, cfg)?;
        linger_close(stream);
        return Ok(());
    }

    let expects_continue = request
        .header("expect")
        .is_some_and(|v| v.eq_ignore_ascii_case("100-continue"));
    if expects_continue && request.body.is_empty() {
        stream.write_all(b"HTTP/1.1 100 Continue\r\n\r\n")?;
    }
    read_body(&mut stream, &mut request, len.unwrap_or(0))?;
    let client = peer.ip().to_string();
    let routed = catch_unwind(AssertUnwindSafe(|| route(&request, &client, service, cfg)));
    let response = match routed {
        Ok(response) => response,
        Err(_) => {
            log::error!("panic while handling {} {}", request.method, request.path);
            internal_error()
        }
    };
    write_response(&mut stream, &response, cfg)
}

fn route(
    request: &HttpRequest,
    client: &str,
    service: &DetectionService,
    cfg: &ApiConfig,
) -> HttpResponse {
    match (request.method.as_str(), request.path.as_str()) {
        ("OPTIONS", _) if cfg.cors_origin.is_some() => HttpResponse::empty(204),
        ("GET", "/detect") => HttpResponse::json(
            200,
            &json!({"status": "healthy", "model_loaded": service.model_loaded()}),
        ),
        ("POST", "/detect") => detect(request, client, service),
        ("POST", "/reset") => {
            service.reset();
            HttpResponse::json(
                200,
                &json!({"status": "success", "message": "Detection history cleared"}),
            )
        }
        ("GET", "/status") => HttpResponse::json(200, &service.status()),
        (_, "/detect" | "/reset" | "/status") => {
            HttpResponse::json(405, &json!({"error": "method_not_allowed"}))
        }
        _ => HttpResponse::json(404, &json!({"error": "not_found"})),
    }
}

#[derive(Serialize)]
struct DetectResponse<'a> {
    status: &'static str,
    detections: &'a [crate::detect::RawDetection],
}

fn detect(request: &HttpRequest, client: &str, service: &DetectionService) -> HttpResponse {
    // A client inside its interval hears 429 even when the upload is also malformed.
    let now = Instant::now();
    if let Admission::Rejected { retry_after } = service.check_rate(client, now) {
        return too_many_requests(retry_after);
    }

    let payload = match extract_image(request) {
        Ok(payload) => payload,
        Err(response) => return response,
    };

    match service.handle(client, &payload, now) {
        Ok(DetectOutcome::Detections(detections)) => HttpResponse::json(
            200,
            &DetectResponse {
                status: "success",
                detections: &detections,
            },
        ),
        Ok(DetectOutcome::RateLimited { retry_after }) => too_many_requests(retry_after),
        Err(ServiceError::InvalidInput(message)) => {
            log::warn!("rejected image from {}: {}", client, message);
            HttpResponse::json(400, &json!({"error": "invalid_image", "message": message}))
        }
        Err(ServiceError::Internal(err)) => {
            log::error!("detect request from {} failed: {:#}", client, err);
            internal_error()
        }
    }
}

#[derive(Deserialize)]
struct JsonImageBody {
    image: Option<String>,
}

/// Pull the image out of a multipart upload, a JSON base64 body or a raw body.
fn extract_image(request: &HttpRequest) -> std::result::Result<ImagePayload, HttpResponse> {
    let content_type = request
        .headers
        .get("content-type")
        .map(|v| v.to_lowercase())
        .unwrap_or_default();

    if content_type.starts_with("multipart/form-data") {
        let Some(boundary) = multipart::boundary(request.header("content-type").unwrap_or(""))
        else {
            return Err(bad_request("invalid_content_type", "multipart boundary missing"));
        };
        let parts = multipart::parse(&request.body, &boundary);
        let Some(part) = parts.into_iter().find(|part| part.name == "image") else {
            return Err(bad_request(
                "no_image",
                "Please include an image file in the request",
            ));
        };
        match part.filename.as_deref() {
            Some(name) if name.contains('.') => {}
            _ => {
                return Err(bad_request(
                    "invalid_filename",
                    "Please provide a valid image file",
                ))
            }
        }
        return Ok(ImagePayload::Bytes(part.data.to_vec()));
    }

    if content_type.starts_with("application/json") {
        let body: JsonImageBody = serde_json::from_slice(&request.body)
            .map_err(|e| bad_request("invalid_json", &e.to_string()))?;
        return match body.image {
            Some(image) if !image.is_empty() => Ok(ImagePayload::Base64(image)),
            _ => Err(bad_request("no_image", "Please include an image in the request")),
        };
    }

    if content_type.starts_with("image/") || content_type.starts_with("application/octet-stream") {
        if request.body.is_empty() {
            return Err(bad_request("no_image", "Request body is empty"));
        }
        return Ok(ImagePayload::Bytes(request.body.clone()));
    }

    Err(HttpResponse::json(
        415,
        &json!({
            "error": "invalid_content_type",
            "message": "Request must be multipart/form-data, application/json or an image body",
        }),
    ))
}

fn too_many_requests(retry_after: Duration) -> HttpResponse {
    let secs = retry_after.as_secs_f64();
    HttpResponse::json(
        429,
        &json!({
            "error": "too_many_requests",
            "retry_after": secs,
            "message": "Please wait before sending another request",
        }),
    )
    .with_header("Retry-After", (secs.ceil() as u64).max(1).to_string())
}

fn bad_request(code: &str, message: &str) -> HttpResponse {
    HttpResponse::json(400, &json!({"error": code, "message": message}))
}

fn internal_error() -> HttpResponse {
    HttpResponse::json(
        500,
        &json!({"error": "internal_server_error", "message": "An unexpected error occurred"}),
    )
}

/// Why a request could not be read. Everything but `Io` is the client's fault
/// and gets an error response.
#[derive(Debug, Error)]
enum RequestError {
    #[error("request head exceeds {} bytes", MAX_HEAD_BYTES)]
    HeadTooLarge,
    #[error("{0}")]
    Malformed(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RequestError {
    fn response(&self) -> HttpResponse {
        match self {
            RequestError::HeadTooLarge => HttpResponse::json(
                431,
                &json!({
                    "error": "request_header_fields_too_large",
                    "message": self.to_string(),
                }),
            ),
            _ => bad_request("malformed_request", &self.to_string()),
        }
    }
}

fn read_request_head(stream: &mut TcpStream) -> std::result::Result<HttpRequest, RequestError> {
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let head_end = loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(RequestError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before request head",
            )));
        }
        data.extend_from_slice(&buf[..n]);
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        if data.len() > MAX_HEAD_BYTES {
            return Err(RequestError::HeadTooLarge);
        }
    };
    if head_end > MAX_HEAD_BYTES {
        return Err(RequestError::HeadTooLarge);
    }
    let body = data.split_off(head_end + 4);
    let text = String::from_utf8_lossy(&data[..head_end]);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| RequestError::Malformed("request line is empty".to_string()))?;
    let raw_path = parts
        .next()
        .ok_or_else(|| RequestError::Malformed("request line has no path".to_string()))?;
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        headers,
        body,
    })
}

fn read_body(stream: &mut TcpStream, request: &mut HttpRequest, len: usize) -> Result<()> {
    if request.body.len() > len {
        request.body.truncate(len);
        return Ok(());
    }
    let start = request.body.len();
    request.body.resize(len, 0);
    stream.read_exact(&mut request.body[start..])?;
    Ok(())
}

fn write_response(stream: &mut TcpStream, response: &HttpResponse, cfg: &ApiConfig) -> Result<()> {
    let status_line = match response.status {
        200 => "HTTP/1.1 200 OK",
        204 => "HTTP/1.1 204 No Content",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        413 => "HTTP/1.1 413 Payload Too Large",
        415 => "HTTP/1.1 415 Unsupported Media Type",
        429 => "HTTP/1.1 429 Too Many Requests",
        431 => "HTTP/1.1 431 Request Header Fields Too Large",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let mut header = format!(
        "{status_line}\r\nContent-Type: application/json\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n",
        status_line = status_line,
        len = response.body.len()
    );
    if let Some(origin) = &cfg.cors_origin {
        header.push_str(&format!(
            "Access-Control-Allow-Origin: {origin}\r\nAccess-Control-Allow-Methods: GET, POST\r\nAccess-Control-Allow-Headers: Content-Type\r\n"
        ));
    }
    for (name, value) in &response.headers {
        header.push_str(&format!("{name}: {value}\r\n"));
    }
    header.push_str("\r\n");
    stream.write_all(header.as_bytes())?;
    stream.write_all(&response.body)?;
    stream.flush()?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl HttpRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    fn content_length(&self) -> std::result::Result<Option<usize>, RequestError> {
        match self.header("content-length") {
            Some(value) => value.parse().map(Some).map_err(|_| {
                RequestError::Malformed(format!("invalid content-length '{}'", value))
            }),
            None => Ok(None),
        }
    }
}

#[derive(Debug)]
struct HttpResponse {
    status: u16,
    headers: Vec<(&'static str, String)>,
    body: Vec<u8>,
}

impl HttpResponse {
    fn json<T: Serialize + ?Sized>(status: u16, body: &T) -> Self {
        match serde_json::to_vec(body) {
            Ok(body) => Self {
                status,
                headers: Vec::new(),
                body,
            },
            Err(err) => {
                log::error!("failed to serialize response: {}", err);
                Self {
                    status: 500,
                    headers: Vec::new(),
                    body: br#"{"error":"internal_server_error"}"#.to_vec(),
                }
            }
        }
    }

    fn empty(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    fn with_header(mut self, name: &'static str, value: String) -> Self {
        self.headers.push((name, value));
        self
    }
}
