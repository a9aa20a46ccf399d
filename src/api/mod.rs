use crate::error::PipelineError;
use crate::mail::MailTransport;
use crate::orchestrator::DetectionOrchestrator;
use crate::query::{LanguageModel, QueryGateway};
use crate::report::ViolationReport;
use anyhow::{anyhow, Result};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

mod multipart;

const MAX_HEADER_BYTES: usize = 16 * 1024;
const READ_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    pub max_body_bytes: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8000".to_string(),
            max_body_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Collaborators shared by every request handler. Nothing in here is mutated
/// by a request; all state lives in the violation store.
#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: DetectionOrchestrator,
    pub llm: Arc<dyn LanguageModel>,
    pub mail: Arc<dyn MailTransport>,
    pub mail_recipient: String,
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
    state: ApiState,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, state: ApiState) -> Self {
        Self { cfg, state }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let cfg = self.cfg;
        let state = Arc::new(self.state);
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, cfg, state, shutdown_thread) {
                log::error!("ppe api stopped: {}", err);
            }
        });

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    cfg: ApiConfig,
    state: Arc<ApiState>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let mut workers: Vec<JoinHandle<()>> = Vec::new();
    let result: Result<()> = loop {
        if shutdown.load(Ordering::SeqCst) {
            break Ok(());
        }
        workers.retain(|worker| !worker.is_finished());
        match listener.accept() {
            Ok((stream, peer)) => {
                let state = state.clone();
                let cfg = cfg.clone();
                workers.push(std::thread::spawn(move || {
                    if let Err(err) = handle_connection(stream, &state, &cfg) {
                        log::warn!("ppe api request from {} failed: {:#}", peer, err);
                    }
                }));
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(err) => break Err(err.into()),
        }
    };

    // In-flight requests run to completion before the server reports stopped.
    if !workers.is_empty() {
        log::info!("waiting for {} in-flight request(s)", workers.len());
    }
    for worker in workers {
        if worker.join().is_err() {
            log::error!("ppe api worker panicked");
        }
    }
    result
}

fn handle_connection(mut stream: TcpStream, state: &ApiState, cfg: &ApiConfig) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(READ_TIMEOUT))?;

    let request = match read_request(&mut stream, cfg.max_body_bytes) {
        Ok(request) => request,
        Err(RequestError::TooLarge) => {
            write_json_response(&mut stream, 413, &json!({"error": "payload_too_large"}))?;
            return Ok(());
        }
        Err(RequestError::Malformed(err)) => {
            write_json_response(&mut stream, 400, &json!({"error": "bad_request"}))?;
            return Err(err);
        }
    };
    log::debug!("{} {}", request.method, request.path);

    if request.method == "OPTIONS" {
        return write_response(&mut stream, 204, "text/plain", &[], &[]);
    }

    match (request.path.as_str(), request.method.as_str()) {
        ("/", "GET") => write_json_response(&mut stream, 200, &json!({"message": "API running"})),
        ("/health", "GET") => write_json_response(&mut stream, 200, &json!({"status": "ok"})),
        ("/detect", "POST") => handle_detect(&mut stream, state, &request),
        ("/download_violations", "GET") => handle_download(&mut stream, state),
        ("/ask", "POST") => handle_ask(&mut stream, state, &request),
        ("/send-mail", "POST") => handle_send_mail(&mut stream, state),
        ("/" | "/health" | "/detect" | "/download_violations" | "/ask" | "/send-mail", _) => {
            write_json_response(&mut stream, 405, &json!({"error": "method_not_allowed"}))
        }
        _ => write_json_response(&mut stream, 404, &json!({"error": "not_found"})),
    }
}

fn handle_detect(stream: &mut TcpStream, state: &ApiState, request: &HttpRequest) -> Result<()> {
    let boundary = match request
        .header("content-type")
        .and_then(multipart::boundary_from_content_type)
    {
        Some(boundary) => boundary,
        None => {
            return write_json_response(
                stream,
                400,
                &json!({"error": "bad_request", "detail": "expected multipart/form-data upload"}),
            )
        }
    };
    let upload = match multipart::parse(&request.body, &boundary)
        .and_then(|parts| multipart::select_upload(parts, "file"))
    {
        Ok(upload) => upload,
        Err(err) => {
            return write_json_response(
                stream,
                400,
                &json!({"error": "bad_request", "detail": format!("{:#}", err)}),
            )
        }
    };

    let filename = upload.filename.clone().unwrap_or_default();
    match state.orchestrator.process(&upload.content, &filename) {
        Ok(outcome) => write_response(
            stream,
            200,
            "image/jpeg",
            &outcome.annotated_jpeg,
            &[("X-Event-Id", outcome.event_id.to_string())],
        ),
        Err(err) => {
            log::warn!("detect failed for '{}': {}", filename, err);
            write_pipeline_error(stream, &err)
        }
    }
}

fn handle_download(stream: &mut TcpStream, state: &ApiState) -> Result<()> {
    match ViolationReport::build(state.orchestrator.store().as_ref()) {
        Ok(report) => write_response(
            stream,
            200,
            "text/csv",
            report.to_csv().as_bytes(),
            &[(
                "Content-Disposition",
                "attachment; filename=violations.csv".to_string(),
            )],
        ),
        Err(err) => write_pipeline_error(stream, &PipelineError::Persistence(err)),
    }
}

#[derive(Debug, Default, Deserialize)]
struct AskRequest {
    #[serde(default)]
    question: String,
}

fn handle_ask(stream: &mut TcpStream, state: &ApiState, request: &HttpRequest) -> Result<()> {
    let ask: AskRequest = if request.body.is_empty() {
        AskRequest::default()
    } else {
        match serde_json::from_slice(&request.body) {
            Ok(ask) => ask,
            Err(err) => {
                return write_json_response(
                    stream,
                    400,
                    &json!({"error": "bad_request", "detail": err.to_string()}),
                )
            }
        }
    };
    let gateway = QueryGateway::new(state.llm.as_ref(), state.orchestrator.store().as_ref());
    let outcome = gateway.ask(&ask.question);
    write_json_response(stream, 200, &json!({"answer": outcome.answer}))
}

fn handle_send_mail(stream: &mut TcpStream, state: &ApiState) -> Result<()> {
    let report = match ViolationReport::build(state.orchestrator.store().as_ref()) {
        Ok(report) => report,
        Err(err) => return write_pipeline_error(stream, &PipelineError::Persistence(err)),
    };
    let csv = report.to_csv();
    let html = report.to_html();
    if let Err(err) = state.mail.send_mail(&html, &csv, &state.mail_recipient) {
        log::warn!("report mail failed: {:#}", err);
        return write_json_response(
            stream,
            502,
            &json!({"error": "mail", "detail": format!("{:#}", err)}),
        );
    }
    log::info!(
        "violations report ({} rows) sent to {}",
        report.rows.len(),
        state.mail_recipient
    );
    write_json_response(stream, 200, &json!({"message": "Email sent successfully"}))
}

fn write_pipeline_error(stream: &mut TcpStream, err: &PipelineError) -> Result<()> {
    let status = match err {
        PipelineError::ModelInference(_) => 422,
        PipelineError::Persistence(_) => 500,
    };
    write_json_response(
        stream,
        status,
        &json!({"error": err.kind(), "detail": err.detail()}),
    )
}

enum RequestError {
    TooLarge,
    Malformed(anyhow::Error),
}

impl From<std::io::Error> for RequestError {
    fn from(err: std::io::Error) -> Self {
        RequestError::Malformed(err.into())
    }
}

fn read_request(stream: &mut TcpStream, max_body_bytes: usize) -> Result<HttpRequest, RequestError> {
    let mut buf = [0u8; 8192];
    let mut data = Vec::new();
    let header_end = loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(RequestError::Malformed(anyhow!("connection closed before headers")));
        }
        data.extend_from_slice(&buf[..n]);
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        if data.len() > MAX_HEADER_BYTES {
            return Err(RequestError::TooLarge);
        }
    };

    let text = String::from_utf8_lossy(&data[..header_end]).into_owned();
    let mut lines = text.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| RequestError::Malformed(anyhow!("empty request")))?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| RequestError::Malformed(anyhow!("missing method")))?;
    let raw_path = parts
        .next()
        .ok_or_else(|| RequestError::Malformed(anyhow!("missing path")))?;
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| RequestError::Malformed(anyhow!("invalid content-length")))?,
        None => 0,
    };
    if content_length > max_body_bytes {
        return Err(RequestError::TooLarge);
    }

    if content_length > 0
        && headers
            .get("expect")
            .is_some_and(|v| v.eq_ignore_ascii_case("100-continue"))
    {
        stream.write_all(b"HTTP/1.1 100 Continue\r\n\r\n")?;
    }

    let mut body = data.split_off(header_end + 4);
    body.truncate(content_length);
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(RequestError::Malformed(anyhow!(
                "body truncated at {} of {} bytes",
                body.len(),
                content_length
            )));
        }
        let take = n.min(content_length - body.len());
        body.extend_from_slice(&buf[..take]);
    }

    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        headers,
        body,
    })
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &serde_json::Value) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    write_response(stream, status, "application/json", &payload, &[])
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
    extra_headers: &[(&str, String)],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        204 => "HTTP/1.1 204 No Content",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        413 => "HTTP/1.1 413 Payload Too Large",
        422 => "HTTP/1.1 422 Unprocessable Entity",
        502 => "HTTP/1.1 502 Bad Gateway",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let mut header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    header.push_str("Access-Control-Allow-Origin: *\r\n");
    header.push_str("Access-Control-Allow-Methods: *\r\n");
    header.push_str("Access-Control-Allow-Headers: *\r\n");
    for (name, value) in extra_headers {
        header.push_str(&format!("{}: {}\r\n", name, value));
    }
    header.push_str("\r\n");
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
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
}
