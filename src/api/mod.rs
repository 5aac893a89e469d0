//! Minimal blocking HTTP/1.1 JSON surface over the pipeline and catalog.
//!
//! One accept loop on a background thread; requests are served inline since
//! every route is either a stat check, a small file read, or a trigger that
//! hands work to its own thread.

use crate::artifacts::validate_video_name;
use crate::catalog::Catalog;
use crate::error::PipelineError;
use crate::pipeline::Pipeline;
use anyhow::{anyhow, Result};
use serde::Serialize;
use serde_json::json;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const MAX_REQUEST_BYTES: usize = 8192;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8000".to_string(),
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
    pipeline: Arc<Pipeline>,
    catalog: Arc<Catalog>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, pipeline: Arc<Pipeline>, catalog: Arc<Catalog>) -> Self {
        Self {
            cfg,
            pipeline,
            catalog,
        }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
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
        let shutdown_thread = shutdown.clone();
        let pipeline = self.pipeline;
        let catalog = self.catalog;
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, &pipeline, &catalog, shutdown_thread) {
                log::error!("http api stopped: {}", err);
            }
        });
        log::info!("http api listening on {}", addr);

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    pipeline: &Arc<Pipeline>,
    catalog: &Catalog,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, pipeline, catalog) {
                    log::warn!("http api request rejected: {}", err);
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

/// Status code and JSON body.
struct Reply {
    status: u16,
    body: serde_json::Value,
}

impl Reply {
    fn ok(body: serde_json::Value) -> Self {
        Self { status: 200, body }
    }

    fn json<T: Serialize>(value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(body) => Self::ok(body),
            Err(err) => Self::internal(err),
        }
    }

    fn error(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "error": message.into() }),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: 404,
            body: json!({ "error": message.into(), "status": "not_found" }),
        }
    }

    fn internal(err: impl std::fmt::Display) -> Self {
        log::error!("http api internal error: {}", err);
        Self {
            status: 500,
            body: json!({ "error": err.to_string(), "status": "error" }),
        }
    }
}

fn handle_connection(mut stream: TcpStream, pipeline: &Arc<Pipeline>, catalog: &Catalog) -> Result<()> {
    // Accepted sockets can inherit non-blocking mode from the listener.
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        write_json_response(&mut stream, 403, &json!({ "error": "forbidden" }))?;
        return Ok(());
    }

    let request = read_request(&mut stream)?;
    if request.method != "GET" {
        write_json_response(&mut stream, 405, &json!({ "error": "method_not_allowed" }))?;
        return Ok(());
    }
    log::debug!("GET {}", request.path);
    let reply = route(&request.path, pipeline, catalog);
    write_json_response(&mut stream, reply.status, &reply.body)
}

fn route(path: &str, pipeline: &Arc<Pipeline>, catalog: &Catalog) -> Reply {
    let segments: Vec<String> = path
        .trim_start_matches('/')
        .split('/')
        .map(percent_decode)
        .collect();
    let segments: Vec<&str> = segments.iter().map(String::as_str).collect();

    match segments.as_slice() {
        ["health"] => Reply::ok(json!({ "status": "ok" })),
        ["available-videos"] => match catalog.available_videos() {
            Ok(videos) => Reply::ok(json!({ "videos": videos })),
            Err(err) => Reply::internal(format!("{:#}", err)),
        },
        ["process", video] => with_valid_name(video, || match pipeline.trigger(video) {
            Ok(report) => Reply::json(&report),
            Err(err @ PipelineError::Input { .. }) => Reply::not_found(err.to_string()),
            Err(err) => Reply::internal(err),
        }),
        ["status", video] => with_valid_name(video, || Reply::json(&pipeline.status(video))),
        ["metadata", "search", label] => match catalog.search_label(label) {
            Ok(results) if results.is_empty() => {
                Reply::not_found(format!("No objects found with label '{}'", label))
            }
            Ok(results) => Reply::ok(json!({ "results": results, "status": "found" })),
            Err(err) => Reply::internal(format!("{:#}", err)),
        },
        ["metadata", "objects", video] => with_valid_name(video, || match catalog.unique_objects(video) {
            Ok(Some(objects)) => Reply::ok(json!({ "objects": objects, "status": "found" })),
            Ok(None) => Reply::not_found("Metadata not found"),
            Err(err) => Reply::internal(format!("{:#}", err)),
        }),
        ["metadata", video] => with_valid_name(video, || match catalog.metadata(video) {
            Ok(Some(records)) => Reply::ok(json!({ "metadata": records, "status": "found" })),
            Ok(None) => Reply::not_found("Metadata not found"),
            Err(err) => Reply::internal(format!("{:#}", err)),
        }),
        _ => Reply::error(404, "not_found"),
    }
}

fn with_valid_name(video: &str, handler: impl FnOnce() -> Reply) -> Reply {
    match validate_video_name(video) {
        Ok(()) => handler(),
        Err(err) => Reply::error(400, err.to_string()),
    }
}

/// Decode `%XX` escapes; malformed escapes are kept literally.
fn percent_decode(segment: &str) -> String {
    let bytes = segment.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(value) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(value);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
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
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
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
}
