//! Minimal `multipart/form-data` reader for file uploads.

#[derive(Debug)]
pub(super) struct Part<'a> {
    pub name: String,
    pub filename: Option<String>,
    pub data: &'a [u8],
}

/// Boundary parameter of a `multipart/form-data` content type.
pub(super) fn boundary(content_type: &str) -> Option<String> {
    content_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.trim().split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, value)| value.trim().trim_matches('"').to_string())
        .filter(|value| !value.is_empty())
}

pub(super) fn parse<'a>(body: &'a [u8], boundary: &str) -> Vec<Part<'a>> {
    let delimiter = format!("--{}", boundary);
    let delimiter = delimiter.as_bytes();
    let starts = find_all(body, delimiter);

    let mut parts = Vec::new();
    for pair in starts.windows(2) {
        let segment = &body[pair[0] + delimiter.len()..pair[1]];
        if segment.starts_with(b"--") {
            break;
        }
        if let Some(part) = parse_part(segment) {
            parts.push(part);
        }
    }
    parts
}

fn parse_part(segment: &[u8]) -> Option<Part<'_>> {
    let segment = segment.strip_prefix(b"\r\n").unwrap_or(segment);
    let split = find(segment, b"\r\n\r\n")?;
    let head = String::from_utf8_lossy(&segment[..split]);
    let data = &segment[split + 4..];
    let data = data.strip_suffix(b"\r\n").unwrap_or(data);

    let disposition = head.split("\r\n").find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim()
            .eq_ignore_ascii_case("content-disposition")
            .then(|| value.to_string())
    })?;

    let mut name = None;
    let mut filename = None;
    for param in disposition.split(';').skip(1) {
        let Some((key, value)) = param.trim().split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').to_string();
        match key.trim().to_lowercase().as_str() {
            "name" => name = Some(value),
            "filename" => filename = Some(value),
            _ => {}
        }
    }

    Some(Part {
        name: name?,
        filename,
        data,
    })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn find_all(haystack: &[u8], needle: &[u8]) -> Vec<usize> {
    let mut positions = Vec::new();
    let mut offset = 0;
    while let Some(pos) = find(&haystack[offset..], needle) {
        positions.push(offset + pos);
        offset += pos + needle.len();
    }
    positions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(boundary: &str) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        out.extend_from_slice(b"Content-Disposition: form-data; name=\"note\"\r\n\r\nhello\r\n");
        out.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        out.extend_from_slice(
            b"Content-Disposition: form-data; name=\"image\"; filename=\"frame.jpg\"\r\n",
        );
        out.extend_from_slice(b"Content-Type: image/jpeg\r\n\r\n");
        out.extend_from_slice(&[0xFF, 0xD8, 0x00, 0x0D, 0x0A, 0xFF, 0xD9]);
        out.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
        out
    }

    #[test]
    fn extracts_boundary_from_content_type() {
        assert_eq!(
            boundary("multipart/form-data; boundary=----abc123").as_deref(),
            Some("----abc123")
        );
        assert_eq!(
            boundary("multipart/form-data; charset=utf-8; boundary=\"q\"").as_deref(),
            Some("q")
        );
        assert_eq!(boundary("multipart/form-data"), None);
    }

    #[test]
    fn parses_fields_and_binary_file() {
        let raw = body("XyZ");
        let parts = parse(&raw, "XyZ");
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].name, "note");
        assert_eq!(parts[0].data, b"hello");
        assert_eq!(parts[0].filename, None);
        assert_eq!(parts[1].name, "image");
        assert_eq!(parts[1].filename.as_deref(), Some("frame.jpg"));
        assert_eq!(parts[1].data, &[0xFF, 0xD8, 0x00, 0x0D, 0x0A, 0xFF, 0xD9]);
    }

    #[test]
    fn unterminated_body_yields_nothing() {
        assert!(parse(b"garbage", "XyZ").is_empty());
    }
}
