use anyhow::Result;
use image::{DynamicImage, Rgb, RgbImage};
use serde_json::Value;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::time::Duration;
use tempfile::tempdir;

use ppe_monitor::api::{ApiConfig, ApiHandle, ApiServer, ApiState};
use ppe_monitor::detect::annotate::encode_jpeg;
use ppe_monitor::detect::{BackendRegistry, DetectedObject, DetectorBackend, StubBackend};
use ppe_monitor::mail::SpoolMailTransport;
use ppe_monitor::query::{StaticLanguageModel, UNSAFE_SQL_ANSWER};
use ppe_monitor::{
    ComplianceStatus, DetectionOrchestrator, LabelRules, SqliteViolationStore, ViolationStore,
};

struct TestApi {
    dir: tempfile::TempDir,
    store: Arc<SqliteViolationStore>,
    api_handle: Option<ApiHandle>,
}

impl TestApi {
    fn new<B: DetectorBackend + 'static>(backend: B, llm_response: &str) -> Result<Self> {
        let dir = tempdir()?;
        let db_path = dir.path().join("ppe.db");
        let store = Arc::new(SqliteViolationStore::open(&db_path.to_string_lossy())?);

        let mut registry = BackendRegistry::new();
        registry.register(backend);
        let orchestrator = DetectionOrchestrator::new(
            registry,
            LabelRules::default(),
            store.clone(),
            dir.path().join("outputs"),
        );
        let state = ApiState {
            orchestrator,
            llm: Arc::new(StaticLanguageModel::answering(llm_response)),
            mail: Arc::new(SpoolMailTransport::new(
                dir.path().join("outbox"),
                "monitor@example.com",
            )),
            mail_recipient: "safety@example.com".to_string(),
        };
        let api_config = ApiConfig {
            addr: "127.0.0.1:0".to_string(),
            max_body_bytes: 1024 * 1024,
        };
        let api_handle = ApiServer::new(api_config, state).spawn()?;

        Ok(Self {
            dir,
            store,
            api_handle: Some(api_handle),
        })
    }

    fn handle(&self) -> &ApiHandle {
        self.api_handle
            .as_ref()
            .expect("test API handle should be initialized")
    }

    fn outbox(&self) -> PathBuf {
        self.dir.path().join("outbox")
    }

    fn send(&self, head: &str, body: &[u8]) -> Result<(String, Vec<u8>)> {
        exchange(self.handle().addr, head, body)
    }

    fn get(&self, path: &str) -> Result<(String, Vec<u8>)> {
        self.send(
            &format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path),
            &[],
        )
    }

    fn post_json(&self, path: &str, body: &str) -> Result<(String, Vec<u8>)> {
        self.send(
            &format!(
                "POST {} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
                path,
                body.len()
            ),
            body.as_bytes(),
        )
    }

    fn upload(&self, filename: &str, content: &[u8]) -> Result<(String, Vec<u8>)> {
        let (head, body) = upload_request(filename, content);
        self.send(&head, &body)
    }
}

fn exchange(addr: SocketAddr, head: &str, body: &[u8]) -> Result<(String, Vec<u8>)> {
    let mut stream = TcpStream::connect(addr)?;
    stream.write_all(head.as_bytes())?;
    stream.write_all(body)?;
    let mut response = Vec::new();
    stream.read_to_end(&mut response)?;
    let split = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("response has a header terminator");
    let headers = String::from_utf8_lossy(&response[..split]).into_owned();
    Ok((headers, response[split + 4..].to_vec()))
}

fn upload_request(filename: &str, content: &[u8]) -> (String, Vec<u8>) {
    let boundary = "----ppe-test-boundary";
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\nContent-Type: image/jpeg\r\n\r\n",
            filename
        )
        .as_bytes(),
    );
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
    let head = format!(
        "POST /detect HTTP/1.1\r\nHost: localhost\r\nContent-Type: multipart/form-data; boundary={}\r\nContent-Length: {}\r\n\r\n",
        boundary,
        body.len()
    );
    (head, body)
}

/// Detector that announces it has started and then takes its time.
struct SlowBackend {
    started: mpsc::Sender<()>,
    delay: Duration,
}

impl DetectorBackend for SlowBackend {
    fn name(&self) -> &'static str {
        "slow"
    }

    fn detect(&mut self, _image: &DynamicImage) -> anyhow::Result<Vec<DetectedObject>> {
        let _ = self.started.send(());
        std::thread::sleep(self.delay);
        Ok(vec![DetectedObject::new("no_glove", 0.8, [5.0, 5.0, 50.0, 50.0])])
    }
}

impl Drop for TestApi {
    fn drop(&mut self) {
        if let Some(handle) = self.api_handle.take() {
            handle.stop().expect("failed to stop API server");
        }
    }
}

fn site_image() -> Vec<u8> {
    let frame = DynamicImage::ImageRgb8(RgbImage::from_pixel(160, 120, Rgb([180, 180, 180])));
    encode_jpeg(&frame).expect("encode test frame")
}

fn mixed_fixture() -> StubBackend {
    StubBackend::new(vec![
        DetectedObject::new("no_glove", 0.91, [10.0, 10.0, 60.0, 70.0]),
        DetectedObject::new("goggles", 0.77, [80.0, 20.0, 140.0, 50.0]),
    ])
}

fn json(body: &[u8]) -> Value {
    serde_json::from_slice(body).expect("json body")
}

#[test]
fn detect_returns_annotated_jpeg_and_persists_event() -> Result<()> {
    let api = TestApi::new(mixed_fixture(), "SELECT 1")?;

    let (headers, body) = api.upload("site_4.jpg", &site_image())?;
    assert!(headers.contains("200 OK"), "{}", headers);
    assert!(headers.contains("Content-Type: image/jpeg"));
    assert!(headers.contains("X-Event-Id: 1"));
    assert_eq!(&body[..2], &[0xFF, 0xD8]);

    let event = api.store.get_event(1)?.expect("event 1 stored");
    assert_eq!(event.image_name, "site_4.jpg");
    assert_eq!(event.overall_status, ComplianceStatus::Violation);
    assert_eq!(api.store.detections_for_event(1)?.len(), 2);
    assert!(api.dir.path().join("outputs").join("event_1.jpg").exists());

    Ok(())
}

#[test]
fn detect_rejects_undecodable_image_without_persisting() -> Result<()> {
    let api = TestApi::new(mixed_fixture(), "SELECT 1")?;

    let (headers, body) = api.upload("broken.jpg", b"not a jpeg at all")?;
    assert!(headers.contains("422 Unprocessable Entity"), "{}", headers);
    assert_eq!(json(&body)["error"], "model_inference");
    assert!(api.store.get_event(1)?.is_none());

    Ok(())
}

#[test]
fn detect_requires_multipart_upload() -> Result<()> {
    let api = TestApi::new(mixed_fixture(), "SELECT 1")?;
    let (headers, _body) = api.post_json("/detect", "{}")?;
    assert!(headers.contains("400 Bad Request"));
    Ok(())
}

#[test]
fn download_lists_only_violation_rows() -> Result<()> {
    let api = TestApi::new(mixed_fixture(), "SELECT 1")?;
    api.upload("a.jpg", &site_image())?;

    let (headers, body) = api.get("/download_violations")?;
    assert!(headers.contains("Content-Type: text/csv"));
    assert!(headers.contains("attachment; filename=violations.csv"));

    let csv = String::from_utf8(body)?;
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(
        lines[0],
        "id,metadata_id,ppe_type,confidence,x1,y1,x2,y2,image_name,overall_status"
    );
    assert_eq!(lines.len(), 2);
    assert!(lines[1].starts_with("1,1,no_glove,0.91,"));
    assert!(lines[1].ends_with(",a.jpg,violation"));

    Ok(())
}

#[test]
fn ask_answers_counts_from_generated_sql() -> Result<()> {
    let api = TestApi::new(
        mixed_fixture(),
        "```sql\nSELECT COUNT(*) FROM violations WHERE ppe_type ILIKE 'no%';\n```",
    )?;
    api.upload("a.jpg", &site_image())?;
    api.upload("b.jpg", &site_image())?;

    let (headers, body) = api.post_json("/ask", r#"{"question":"how many violations?"}"#)?;
    assert!(headers.contains("200 OK"));
    assert_eq!(json(&body)["answer"], "2");

    Ok(())
}

#[test]
fn ask_blocks_destructive_sql_and_keeps_data() -> Result<()> {
    let api = TestApi::new(mixed_fixture(), "DROP TABLE violations;")?;
    api.upload("a.jpg", &site_image())?;

    let (headers, body) = api.post_json("/ask", r#"{"question":"clean up please"}"#)?;
    assert!(headers.contains("200 OK"));
    assert_eq!(json(&body)["answer"], UNSAFE_SQL_ANSWER);
    assert_eq!(api.store.detections_for_event(1)?.len(), 2);

    Ok(())
}

#[test]
fn ask_reports_sql_errors_inline() -> Result<()> {
    let api = TestApi::new(mixed_fixture(), "SELECT * FROM helmets")?;

    let (headers, body) = api.post_json("/ask", r#"{"question":"helmets?"}"#)?;
    assert!(headers.contains("200 OK"));
    let answer = json(&body)["answer"].as_str().unwrap_or_default().to_string();
    assert!(answer.starts_with("SQL Error: "), "{}", answer);

    Ok(())
}

#[test]
fn send_mail_spools_report() -> Result<()> {
    let api = TestApi::new(mixed_fixture(), "SELECT 1")?;
    api.upload("a.jpg", &site_image())?;

    let (headers, body) = api.post_json("/send-mail", "")?;
    assert!(headers.contains("200 OK"), "{}", headers);
    assert_eq!(json(&body)["message"], "Email sent successfully");

    let messages: Vec<_> = std::fs::read_dir(api.outbox())?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".eml"))
        .collect();
    assert_eq!(messages.len(), 1);
    let message = std::fs::read_to_string(messages[0].path())?;
    assert!(message.contains("To: safety@example.com"));
    assert!(message.contains("no_glove"));

    Ok(())
}

#[test]
fn unknown_routes_and_methods() -> Result<()> {
    let api = TestApi::new(StubBackend::default(), "SELECT 1")?;

    let (headers, _) = api.get("/events")?;
    assert!(headers.contains("404 Not Found"));
    let (headers, _) = api.get("/detect")?;
    assert!(headers.contains("405 Method Not Allowed"));
    let (headers, body) = api.get("/health")?;
    assert!(headers.contains("Access-Control-Allow-Origin: *"));
    assert_eq!(json(&body)["status"], "ok");

    Ok(())
}

#[test]
fn oversized_body_is_refused() -> Result<()> {
    let api = TestApi::new(StubBackend::default(), "SELECT 1")?;
    let (headers, _) = api.send(
        "POST /ask HTTP/1.1\r\nHost: localhost\r\nContent-Length: 10485760\r\n\r\n",
        &[],
    )?;
    assert!(headers.contains("413 Payload Too Large"));
    Ok(())
}

#[test]
fn stop_lets_in_flight_detection_finish() -> Result<()> {
    let (started_tx, started_rx) = mpsc::channel();
    let mut api = TestApi::new(
        SlowBackend {
            started: started_tx,
            delay: Duration::from_millis(400),
        },
        "SELECT 1",
    )?;
    let addr = api.handle().addr;
    let (head, body) = upload_request("slow.jpg", &site_image());
    let client = std::thread::spawn(move || exchange(addr, &head, &body));

    started_rx.recv_timeout(Duration::from_secs(10))?;
    api.api_handle
        .take()
        .expect("test API handle should be initialized")
        .stop()?;

    let (headers, body) = client.join().expect("client thread panicked")?;
    assert!(headers.contains("200 OK"), "{}", headers);
    assert!(headers.contains("X-Event-Id: 1"));
    assert_eq!(&body[..2], &[0xFF, 0xD8]);
    assert!(api.dir.path().join("outputs").join("event_1.jpg").exists());
    assert_eq!(api.store.detections_for_event(1)?.len(), 1);

    Ok(())
}
