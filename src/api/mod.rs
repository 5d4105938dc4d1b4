//! HTTP control surface.
//!
//! Small hand-rolled HTTP/1.1 server on `std::net`. Every connection gets its
//! own thread so that `/alert_status` and `/acknowledge_alert` answer promptly
//! while a `/start` is opening the camera or a `/video_feed` client is
//! streaming.

use crate::pipeline::PipelineController;
use crate::stream::{multipart_part, HubRecv, STREAM_CONTENT_TYPE};
use crate::{error_kind, PipelineError};
use anyhow::{anyhow, Context, Result};
use serde_json::json;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const MAX_REQUEST_BYTES: usize = 8192;
const MAX_RECENT_LIMIT: usize = 500;
const STREAM_WAIT: Duration = Duration::from_millis(500);

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    /// Subject used when a request carries no `X-Subject` header.
    pub default_subject: String,
    pub recent_limit: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8799".to_string(),
            default_subject: "operator".to_string(),
            recent_limit: 20,
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
    controller: Arc<PipelineController>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, controller: Arc<PipelineController>) -> Self {
        Self { cfg, controller }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .with_context(|| format!("invalid api address '{}'", self.cfg.addr))?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shared = Arc::new(Shared {
            cfg: self.cfg,
            controller: self.controller,
            shutdown: shutdown.clone(),
        });
        let join = std::thread::Builder::new()
            .name("vista-api".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, shared) {
                    log::error!("control api stopped: {}", err);
                }
            })
            .context("spawn api thread")?;
        log::info!("control api listening on {}", addr);

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

struct Shared {
    cfg: ApiConfig,
    controller: Arc<PipelineController>,
    shutdown: Arc<AtomicBool>,
}

fn run_api(listener: TcpListener, shared: Arc<Shared>) -> Result<()> {
    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                let shared = shared.clone();
                let spawned = std::thread::Builder::new()
                    .name("vista-api-conn".to_string())
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, &shared) {
                            log::warn!("control api request failed: {:#}", err);
                        }
                    });
                if let Err(err) = spawned {
                    log::warn!("could not spawn connection thread: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, shared: &Shared) -> Result<()> {
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        write_json_response(&mut stream, 403, &json!({"error": "forbidden"}))?;
        return Ok(());
    }

    let request = read_request(&mut stream)?;
    let expected_method = match request.path.as_str() {
        "/start" | "/stop" | "/acknowledge_alert" => "POST",
        "/alert_status" | "/video_feed" | "/events/recent" | "/health" => "GET",
        _ => {
            write_json_response(&mut stream, 404, &json!({"error": "not_found"}))?;
            return Ok(());
        }
    };
    if request.method != expected_method {
        write_json_response(&mut stream, 405, &json!({"error": "method_not_allowed"}))?;
        return Ok(());
    }

    let controller = &shared.controller;
    match request.path.as_str() {
        "/health" => {
            let body = json!({"status": "ok", "running": controller.is_running()});
            write_json_response(&mut stream, 200, &body)
        }
        "/start" => {
            let subject = request
                .subject()
                .unwrap_or_else(|| shared.cfg.default_subject.clone());
            match controller.start(&subject) {
                Ok(true) => write_json_response(
                    &mut stream,
                    200,
                    &json!({"status": "started", "subject": subject}),
                ),
                Ok(false) => write_json_response(
                    &mut stream,
                    200,
                    &json!({"status": "already_running", "subject": controller.subject()}),
                ),
                Err(err) => {
                    log::warn!("start failed: {:#}", err);
                    let (status, code) = match error_kind(&err) {
                        Some(PipelineError::SourceUnavailable(_)) => (503, "source_unavailable"),
                        _ => (500, "start_failed"),
                    };
                    write_json_response(
                        &mut stream,
                        status,
                        &json!({"error": code, "detail": format!("{:#}", err)}),
                    )
                }
            }
        }
        "/stop" => {
            let status = match controller.stop() {
                Some(_) => "stopped",
                None => "not_running",
            };
            write_json_response(&mut stream, 200, &json!({"status": status}))
        }
        "/alert_status" => {
            let status = controller.status();
            let body = json!({
                "is_alert_active": status.active,
                "anomaly": status.anomaly.unwrap_or_else(|| "None".to_string()),
            });
            write_json_response(&mut stream, 200, &body)
        }
        "/acknowledge_alert" => {
            controller.acknowledge();
            write_json_response(
                &mut stream,
                200,
                &json!({"message": "Alert acknowledged and sound stopped."}),
            )
        }
        "/events/recent" => {
            let limit = match request.query_param("limit") {
                Some(raw) => match raw.parse::<usize>() {
                    Ok(n) if n > 0 => n.min(MAX_RECENT_LIMIT),
                    _ => {
                        write_json_response(&mut stream, 400, &json!({"error": "invalid_limit"}))?;
                        return Ok(());
                    }
                },
                None => shared.cfg.recent_limit,
            };
            let subject = request
                .subject()
                .or_else(|| controller.subject())
                .unwrap_or_else(|| shared.cfg.default_subject.clone());
            let events = {
                let mut logger = controller
                    .logger()
                    .lock()
                    .map_err(|_| anyhow!("event logger lock poisoned"))?;
                logger.recent_detections(&subject, limit)?
            };
            write_json_response(
                &mut stream,
                200,
                &json!({"subject": subject, "events": events}),
            )
        }
        "/video_feed" => stream_video(stream, shared),
        _ => unreachable!("route table checked above"),
    }
}

/// Serve the annotated frames until the pipeline stops, the client goes
/// away, or the API shuts down.
fn stream_video(mut stream: TcpStream, shared: &Shared) -> Result<()> {
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        STREAM_CONTENT_TYPE
    );
    stream.write_all(header.as_bytes())?;

    let hub = shared.controller.hub();
    let mut last = 0u64;
    let mut sent = 0u64;
    while !shared.shutdown.load(Ordering::SeqCst) {
        match hub.wait_next(last, STREAM_WAIT) {
            HubRecv::Frame { sequence, jpeg } => {
                last = sequence;
                if stream.write_all(&multipart_part(&jpeg)).is_err() {
                    break;
                }
                sent += 1;
            }
            HubRecv::Timeout => continue,
            HubRecv::Closed => break,
        }
    }
    log::debug!("video feed client left after {} frames", sent);
    Ok(())
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&data);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        headers,
        raw_path: raw_path.to_string(),
    })
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &serde_json::Value) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    write_response(stream, status, "application/json", &payload)
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    raw_path: String,
}

impl HttpRequest {
    fn subject(&self) -> Option<String> {
        self.headers
            .get("x-subject")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn query_param(&self, name: &str) -> Option<&str> {
        let query = self.raw_path.split_once('?')?.1;
        query.split('&').find_map(|pair| match pair.split_once('=') {
            Some((k, v)) if k == name => Some(v),
            _ => None,
        })
    }
}
