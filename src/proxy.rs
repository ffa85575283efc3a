//! Proxy layer between the browser and the build service.
//!
//! A deliberately small HTTP/1.1 server: one request per connection, JSON in
//! and JSON out, CORS headers on every response. Routes mirror the build
//! service one-to-one:
//!
//! - `POST /run {prompt}` → upstream `POST /run`
//! - `POST /build {jobId}` → upstream `POST /build`
//! - `POST /improve {jobId, prompt}` → upstream `POST /improve`
//! - `GET /logs/{jobId}` or `POST /logs {jobId}` → upstream `GET /logs/{jobId}`
//! - `GET /download/{jobId}` or `POST /download {jobId}` → `{download}` URL
//! - `GET /health`
//!
//! Missing required fields answer 400, upstream failures answer 500, both as
//! `{error}`.

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Result, ServiceError};
use crate::service::BuildServiceClient;
use crate::util::is_valid_job_id;

const MAX_HEADER_BYTES: usize = 16 * 1024;
const MAX_BODY_BYTES: usize = 1024 * 1024;

const CORS_HEADERS: &str = "Access-Control-Allow-Origin: *\r\n\
Access-Control-Allow-Headers: authorization, x-client-info, apikey, content-type\r\n\
Access-Control-Allow-Methods: POST, GET, OPTIONS\r\n";

/// A parsed request: method, path without query string, raw body.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyRequest {
    pub method: String,
    pub path: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProxyResponse {
    pub status: u16,
    /// `None` for bodiless responses (CORS preflight).
    pub body: Option<Value>,
}

impl ProxyResponse {
    fn json(status: u16, body: Value) -> Self {
        Self {
            status,
            body: Some(body),
        }
    }

    fn error(status: u16, message: impl Into<String>) -> Self {
        Self::json(status, json!({ "error": message.into() }))
    }
}

/// Handle to a running proxy.
pub struct ProxyServer {
    addr: SocketAddr,
    handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ProxyServer {
    /// Binds `listen` and starts accepting connections in the background.
    pub async fn start(listen: &str, upstream: BuildServiceClient) -> Result<ProxyServer> {
        let listener = TcpListener::bind(listen).await?;
        let addr = listener.local_addr()?;
        let upstream = Arc::new(upstream);
        info!(%addr, upstream = upstream.base_url(), "proxy listening");

        let handle = tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let upstream = upstream.clone();
                tokio::spawn(async move {
                    handle_connection(stream, peer, &upstream).await;
                });
            }
        });

        Ok(ProxyServer {
            addr,
            handle: Arc::new(Mutex::new(Some(handle))),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.handle.lock().await.take() {
            handle.abort();
        }
    }

    pub fn kill_sync(&self) {
        if let Ok(mut guard) = self.handle.try_lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

impl Drop for ProxyServer {
    fn drop(&mut self) {
        self.kill_sync();
    }
}

async fn handle_connection(mut stream: TcpStream, peer: SocketAddr, upstream: &BuildServiceClient) {
    let request = match read_request(&mut stream).await {
        Some(r) => r,
        None => {
            let _ = write_response(&mut stream, &ProxyResponse::error(400, "Malformed request")).await;
            return;
        }
    };
    debug!(%peer, method = %request.method, path = %request.path, "proxy request");

    let response = route(&request, upstream).await;
    if response.status >= 500 {
        warn!(path = %request.path, status = response.status, "upstream call failed");
    }
    if let Err(e) = write_response(&mut stream, &response).await {
        debug!(%peer, error = %e, "client went away");
    }
}

/// Reads one request, honouring `Content-Length` for the body.
async fn read_request(stream: &mut TcpStream) -> Option<ProxyRequest> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
            break pos;
        }
        if buf.len() > MAX_HEADER_BYTES {
            return None;
        }
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.lines();
    let mut request_line = lines.next()?.split_whitespace();
    let method = request_line.next()?.to_ascii_uppercase();
    let target = request_line.next()?;
    let path = target.split(['?', '#']).next().unwrap_or("/").to_string();

    let content_length = lines
        .filter_map(|l| l.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    if content_length > MAX_BODY_BYTES {
        return None;
    }

    let mut body = buf[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    Some(ProxyRequest { method, path, body })
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "",
    }
}

async fn write_response(stream: &mut TcpStream, response: &ProxyResponse) -> std::io::Result<()> {
    let body = response
        .body
        .as_ref()
        .map(|b| b.to_string())
        .unwrap_or_default();
    let content_type = if response.body.is_some() {
        "Content-Type: application/json\r\n"
    } else {
        ""
    };
    let head = format!(
        "HTTP/1.1 {} {}\r\n{CORS_HEADERS}{content_type}Content-Length: {}\r\nConnection: close\r\n\r\n",
        response.status,
        reason_phrase(response.status),
        body.len(),
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body.as_bytes()).await?;
    stream.flush().await
}

fn str_field<'a>(body: &'a Value, name: &str) -> Option<&'a str> {
    body.get(name)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Job id from `/{route}/{jobId}` or, failing that, from the JSON body.
fn job_id<'a>(segments: &[&'a str], body: &'a Value) -> Option<&'a str> {
    segments
        .get(1)
        .copied()
        .filter(|s| !s.is_empty())
        .or_else(|| str_field(body, "jobId"))
}

fn upstream_error(e: ServiceError) -> ProxyResponse {
    ProxyResponse::error(500, e.to_string())
}

/// Dispatches a request to the build service.
pub async fn route(request: &ProxyRequest, upstream: &BuildServiceClient) -> ProxyResponse {
    if request.method == "OPTIONS" {
        return ProxyResponse {
            status: 204,
            body: None,
        };
    }

    let body: Value = if request.body.is_empty() {
        Value::Null
    } else {
        match serde_json::from_slice(&request.body) {
            Ok(v) => v,
            Err(_) => return ProxyResponse::error(400, "Request body must be JSON"),
        }
    };

    let segments: Vec<&str> = request
        .path
        .trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();
    let method = request.method.as_str();

    let takes_job = matches!(segments.first(), Some(&("build" | "improve" | "logs" | "download")));
    if let Some(id) = job_id(&segments, &body).filter(|_| takes_job) {
        if !is_valid_job_id(id) {
            warn!(job_id = id, path = %request.path, "rejecting job ID that is not one path segment");
            return ProxyResponse::error(400, "Invalid job ID");
        }
    }

    match (method, segments.first().copied()) {
        ("GET", Some("health")) => ProxyResponse::json(200, json!({ "status": "ok" })),

        ("POST", Some("run")) => {
            let Some(prompt) = str_field(&body, "prompt") else {
                return ProxyResponse::error(400, "Prompt is required");
            };
            match upstream.post_json("/run", &json!({ "prompt": prompt }), "AI").await {
                Ok(data) => ProxyResponse::json(200, data),
                Err(e) => upstream_error(e),
            }
        }

        ("POST", Some("build")) => {
            let Some(job_id) = job_id(&segments, &body) else {
                return ProxyResponse::error(400, "Job ID is required");
            };
            match upstream.post_json("/build", &json!({ "jobId": job_id }), "Build").await {
                Ok(data) => ProxyResponse::json(200, data),
                Err(e) => upstream_error(e),
            }
        }

        ("POST", Some("improve")) => {
            let (Some(job_id), Some(prompt)) = (job_id(&segments, &body), str_field(&body, "prompt")) else {
                return ProxyResponse::error(400, "Job ID and prompt are required");
            };
            let payload = json!({ "jobId": job_id, "prompt": prompt });
            match upstream.post_json("/improve", &payload, "Improve").await {
                Ok(data) => ProxyResponse::json(200, data),
                Err(e) => upstream_error(e),
            }
        }

        ("GET" | "POST", Some("logs")) => {
            let Some(job_id) = job_id(&segments, &body) else {
                return ProxyResponse::error(400, "Job ID is required");
            };
            match upstream.get_json(&format!("/logs/{job_id}"), "Logs").await {
                Ok(data) => ProxyResponse::json(200, data),
                Err(e) => ProxyResponse::json(500, json!({ "error": e.to_string(), "logs": [] })),
            }
        }

        ("GET" | "POST", Some("download")) => {
            let Some(job_id) = job_id(&segments, &body) else {
                return ProxyResponse::error(400, "Job ID is required");
            };
            ProxyResponse::json(200, json!({ "download": upstream.archive_url(job_id) }))
        }

        _ => ProxyResponse::error(400, "Unknown endpoint"),
    }
}
