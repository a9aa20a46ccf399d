//! Minimal `multipart/form-data` reader for image uploads.

use anyhow::{anyhow, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    pub name: Option<String>,
    pub filename: Option<String>,
    pub content: Vec<u8>,
}

pub fn boundary_from_content_type(value: &str) -> Option<String> {
    let mut params = value.split(';');
    let mime = params.next()?.trim();
    if !mime.eq_ignore_ascii_case("multipart/form-data") {
        return None;
    }
    params
        .filter_map(|param| param.split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, value)| value.trim().trim_matches('"').to_string())
        .filter(|boundary| !boundary.is_empty())
}

pub fn parse(body: &[u8], boundary: &str) -> Result<Vec<Part>> {
    let opening = format!("--{}", boundary);
    let delimiter = format!("\r\n--{}", boundary);
    let mut pos = find(body, opening.as_bytes(), 0)
        .ok_or_else(|| anyhow!("multipart boundary not found"))?
        + opening.len();

    let mut parts = Vec::new();
    loop {
        let rest = &body[pos..];
        if rest.starts_with(b"--") {
            break;
        }
        if !rest.starts_with(b"\r\n") {
            return Err(anyhow!("malformed multipart delimiter"));
        }
        pos += 2;

        let (headers, content_start) = if body[pos..].starts_with(b"\r\n") {
            (String::new(), pos + 2)
        } else {
            let header_end = find(body, b"\r\n\r\n", pos)
                .ok_or_else(|| anyhow!("unterminated multipart headers"))?;
            (
                String::from_utf8_lossy(&body[pos..header_end]).into_owned(),
                header_end + 4,
            )
        };
        let content_end = find(body, delimiter.as_bytes(), content_start)
            .ok_or_else(|| anyhow!("unterminated multipart part"))?;

        let (name, filename) = disposition(&headers);
        parts.push(Part {
            name,
            filename,
            content: body[content_start..content_end].to_vec(),
        });
        pos = content_end + delimiter.len();
    }
    Ok(parts)
}

/// First part carrying a filename, else the part named `field`.
pub fn select_upload(parts: Vec<Part>, field: &str) -> Result<Part> {
    let mut named = None;
    for part in parts {
        if part.filename.is_some() {
            return Ok(part);
        }
        if named.is_none() && part.name.as_deref() == Some(field) {
            named = Some(part);
        }
    }
    named.ok_or_else(|| anyhow!("no file part in upload"))
}

fn disposition(headers: &str) -> (Option<String>, Option<String>) {
    let mut name = None;
    let mut filename = None;
    for line in headers.split("\r\n") {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        if !key.trim().eq_ignore_ascii_case("content-disposition") {
            continue;
        }
        for param in value.split(';').skip(1) {
            if let Some((k, v)) = param.split_once('=') {
                let v = v.trim().trim_matches('"').to_string();
                match k.trim().to_ascii_lowercase().as_str() {
                    "name" => name = Some(v),
                    "filename" => filename = Some(v),
                    _ => {}
                }
            }
        }
    }
    (name, filename)
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() || needle.is_empty() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| i + from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(parts: &[(&str, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        for (headers, content) in parts {
            out.extend_from_slice(b"--XyZ\r\n");
            out.extend_from_slice(headers.as_bytes());
            out.extend_from_slice(b"\r\n\r\n");
            out.extend_from_slice(content);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"--XyZ--\r\n");
        out
    }

    #[test]
    fn boundary_is_extracted() {
        assert_eq!(
            boundary_from_content_type("multipart/form-data; boundary=\"abc123\"").as_deref(),
            Some("abc123")
        );
        assert_eq!(
            boundary_from_content_type("Multipart/Form-Data;boundary=----x").as_deref(),
            Some("----x")
        );
        assert!(boundary_from_content_type("application/json").is_none());
    }

    #[test]
    fn parses_binary_parts() {
        let jpeg: &[u8] = &[0xFF, 0xD8, b'\r', b'\n', 0x00, 0xFF, 0xD9];
        let raw = body(&[
            ("Content-Disposition: form-data; name=\"note\"", b"hello"),
            (
                "Content-Disposition: form-data; name=\"file\"; filename=\"site 4.jpg\"\r\nContent-Type: image/jpeg",
                jpeg,
            ),
        ]);
        let parts = parse(&raw, "XyZ").unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].name.as_deref(), Some("note"));
        assert_eq!(parts[0].content, b"hello");

        let upload = select_upload(parts, "file").unwrap();
        assert_eq!(upload.filename.as_deref(), Some("site 4.jpg"));
        assert_eq!(upload.content, jpeg);
    }

    #[test]
    fn falls_back_to_named_field() {
        let raw = body(&[("Content-Disposition: form-data; name=\"file\"", b"data")]);
        let upload = select_upload(parse(&raw, "XyZ").unwrap(), "file").unwrap();
        assert_eq!(upload.content, b"data");
        assert!(upload.filename.is_none());
    }

    #[test]
    fn rejects_missing_boundary_and_file() {
        assert!(parse(b"no boundary here", "XyZ").is_err());
        let raw = body(&[("Content-Disposition: form-data; name=\"other\"", b"x")]);
        assert!(select_upload(parse(&raw, "XyZ").unwrap(), "file").is_err());
    }
}
