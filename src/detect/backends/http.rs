use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use image::DynamicImage;
use serde::Deserialize;
use url::Url;

use crate::detect::annotate::encode_jpeg;
use crate::detect::backend::DetectorBackend;
use crate::detect::result::DetectedObject;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Backend for a remote inference service.
///
/// The frame is POSTed as `image/jpeg`; the service answers with
/// `{"detections":[{"label","confidence","x1","y1","x2","y2"}, ...]}` in the
/// pixel space of the submitted frame.
pub struct HttpBackend {
    agent: ureq::Agent,
    url: Url,
}

#[derive(Debug, Deserialize)]
struct DetectResponse {
    detections: Vec<DetectedObject>,
}

impl HttpBackend {
    pub fn new(url: &str) -> Result<Self> {
        Self::with_timeout(url, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    pub fn with_timeout(url: &str, timeout: Duration) -> Result<Self> {
        let url = Url::parse(url).with_context(|| format!("parse detector url '{}'", url))?;
        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(anyhow!(
                    "unsupported detector scheme '{}'; expected http(s)",
                    other
                ))
            }
        }
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Ok(Self { agent, url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl DetectorBackend for HttpBackend {
    fn name(&self) -> &'static str {
        "http"
    }

    fn detect(&mut self, image: &DynamicImage) -> Result<Vec<DetectedObject>> {
        let jpeg = encode_jpeg(image)?;
        let response = self
            .agent
            .post(self.url.as_str())
            .set("Content-Type", "image/jpeg")
            .send_bytes(&jpeg)
            .with_context(|| format!("detector request to {} failed", self.url))?;
        let body = response
            .into_string()
            .context("read detector response body")?;
        parse_response(&body)
    }
}

fn parse_response(body: &str) -> Result<Vec<DetectedObject>> {
    let parsed: DetectResponse =
        serde_json::from_str(body).context("detector returned malformed json")?;
    for det in &parsed.detections {
        if !(0.0..=1.0).contains(&det.confidence) {
            return Err(anyhow!(
                "detector returned confidence {} outside 0..=1 for '{}'",
                det.confidence,
                det.label
            ));
        }
    }
    Ok(parsed.detections)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_http_urls() {
        assert!(HttpBackend::new("udp://127.0.0.1:9000").is_err());
        assert!(HttpBackend::new("not a url").is_err());
        assert!(HttpBackend::new("http://127.0.0.1:9000/detect").is_ok());
    }

    #[test]
    fn parses_detection_payload() {
        let body = r#"{"detections":[
            {"label":"glove","confidence":0.8,"x1":1,"y1":1,"x2":5,"y2":5},
            {"label":"no_goggles","confidence":0.6,"x1":2,"y1":2,"x2":9,"y2":9}
        ]}"#;
        let dets = parse_response(body).unwrap();
        assert_eq!(dets.len(), 2);
        assert_eq!(dets[1].label, "no_goggles");
    }

    #[test]
    fn rejects_out_of_range_confidence() {
        let body = r#"{"detections":[{"label":"glove","confidence":1.5,"x1":1,"y1":1,"x2":5,"y2":5}]}"#;
        assert!(parse_response(body).is_err());
        assert!(parse_response("{}").is_err());
    }
}
