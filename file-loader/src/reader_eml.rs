//! RFC 822 message reader.
//!
//! Headers become document metadata (`Subject` -> title, `From` -> author,
//! `Date` -> created_ts, `Message-ID` -> external id). The body is reduced to
//! plain text: the first `text/plain` part wins, falling back to a de-tagged
//! `text/html` part. Non-text attachments are ignored.

use std::collections::BTreeMap;
use std::fs;

use base64::Engine as _;

use crate::blocks::{assemble, Block};
use crate::{normalise_text, LoadError, LoadedDoc};

pub fn load_eml(path: &str) -> Result<LoadedDoc, LoadError> {
    let bytes = fs::read(path).map_err(|e| LoadError::io(path, e))?;
    parse_message(&bytes, path)
}

/// Parse one raw message. Shared with the mbox reader.
pub fn parse_message(bytes: &[u8], path: &str) -> Result<LoadedDoc, LoadError> {
    let raw = String::from_utf8_lossy(bytes);
    let (headers, body) = split_headers(&raw);

    let title = headers.get("subject").map(|s| decode_rfc2047(s));
    let author = headers.get("from").map(|s| decode_rfc2047(s));
    let created_ts = headers.get("date").map(|raw| {
        chrono::DateTime::parse_from_rfc2822(raw.trim())
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_else(|_| raw.trim().to_string())
    });
    let external_id = headers
        .get("message-id")
        .map(|s| s.trim().trim_start_matches('<').trim_end_matches('>').to_string());

    let content_type = headers
        .get("content-type")
        .cloned()
        .unwrap_or_else(|| "text/plain".to_string());
    let transfer = headers
        .get("content-transfer-encoding")
        .map(|s| s.trim().to_ascii_lowercase())
        .unwrap_or_default();

    let text_body = extract_text(&content_type, &transfer, body).ok_or_else(|| LoadError::Decode {
        path: path.to_string(),
        detail: "no text/* part in message".into(),
    })?;
    let text_body = normalise_text(&text_body);

    let blocks: Vec<Block> = split_paragraphs(&text_body).into_iter().map(Block::paragraph).collect();
    let (text, segments) = assemble(&blocks);
    if text.trim().is_empty() {
        return Err(LoadError::Empty { path: path.to_string() });
    }

    let mut meta = BTreeMap::new();
    if let Some(to) = headers.get("to") {
        meta.insert("to".to_string(), serde_json::Value::String(decode_rfc2047(to)));
    }

    Ok(LoadedDoc {
        text,
        mime: "message/rfc822".to_string(),
        title,
        author,
        created_ts,
        external_id,
        meta,
        segments,
    })
}

/// Split raw message text into unfolded headers and the body slice.
fn split_headers(raw: &str) -> (BTreeMap<String, String>, &str) {
    let mut headers = BTreeMap::new();
    let mut last_key: Option<String> = None;
    let mut offset = 0usize;

    for line in raw.split_inclusive('\n') {
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            offset += line.len();
            break;
        }
        if (line.starts_with(' ') || line.starts_with('\t')) && last_key.is_some() {
            // Folded continuation of the previous header.
            if let Some(key) = &last_key {
                let entry = headers.entry(key.clone()).or_insert_with(String::new);
                entry.push(' ');
                entry.push_str(trimmed.trim_start());
            }
        } else if let Some(colon) = trimmed.find(':') {
            let key = trimmed[..colon].trim().to_ascii_lowercase();
            let value = trimmed[colon + 1..].trim().to_string();
            headers.insert(key.clone(), value);
            last_key = Some(key);
        }
        offset += line.len();
    }
    (headers, &raw[offset..])
}

/// Pull the best text rendition out of a (possibly multipart) body.
fn extract_text(content_type: &str, transfer: &str, body: &str) -> Option<String> {
    let (mime, params) = parse_content_type(content_type);

    if mime.starts_with("multipart/") {
        let boundary = params.get("boundary")?;
        let parts = split_multipart(body, boundary);
        // Prefer plain text; fall back to de-tagged HTML.
        let mut html: Option<String> = None;
        for part in parts {
            let (part_headers, part_body) = split_headers(&part);
            let part_type = part_headers
                .get("content-type")
                .cloned()
                .unwrap_or_else(|| "text/plain".to_string());
            let part_transfer = part_headers
                .get("content-transfer-encoding")
                .map(|s| s.trim().to_ascii_lowercase())
                .unwrap_or_default();
            let (part_mime, _) = parse_content_type(&part_type);
            if part_mime == "text/plain" {
                if let Some(t) = extract_text(&part_type, &part_transfer, part_body) {
                    return Some(t);
                }
            } else if part_mime == "text/html" && html.is_none() {
                html = extract_text(&part_type, &part_transfer, part_body);
            } else if part_mime.starts_with("multipart/") {
                if let Some(t) = extract_text(&part_type, &part_transfer, part_body) {
                    return Some(t);
                }
            }
        }
        return html;
    }

    if !mime.starts_with("text/") {
        return None;
    }
    let decoded = decode_transfer(body, transfer);
    let charset = params.get("charset").map(|s| s.as_str()).unwrap_or("utf-8");
    let text = decode_charset(&decoded, charset);
    if mime == "text/html" {
        Some(html_to_text(&text))
    } else {
        Some(text)
    }
}

fn parse_content_type(value: &str) -> (String, BTreeMap<String, String>) {
    let mut parts = value.split(';');
    let mime = parts.next().unwrap_or("").trim().to_ascii_lowercase();
    let mut params = BTreeMap::new();
    for p in parts {
        if let Some(eq) = p.find('=') {
            let key = p[..eq].trim().to_ascii_lowercase();
            let val = p[eq + 1..].trim().trim_matches('"').to_string();
            params.insert(key, val);
        }
    }
    (mime, params)
}

fn split_multipart(body: &str, boundary: &str) -> Vec<String> {
    let delim = format!("--{boundary}");
    let mut parts = Vec::new();
    let mut current: Option<String> = None;
    for line in body.lines() {
        if line.starts_with(&delim) {
            if let Some(done) = current.take() {
                parts.push(done);
            }
            // The closing delimiter ends the walk.
            if line.starts_with(&format!("{delim}--")) {
                break;
            }
            current = Some(String::new());
            continue;
        }
        if let Some(cur) = current.as_mut() {
            cur.push_str(line);
            cur.push('\n');
        }
    }
    if let Some(done) = current.take() {
        parts.push(done);
    }
    parts
}

fn decode_transfer(body: &str, transfer: &str) -> Vec<u8> {
    match transfer {
        "base64" => {
            let compact: String = body.chars().filter(|c| !c.is_whitespace()).collect();
            base64::engine::general_purpose::STANDARD
                .decode(compact.as_bytes())
                .unwrap_or_else(|_| body.as_bytes().to_vec())
        }
        "quoted-printable" => decode_quoted_printable(body),
        _ => body.as_bytes().to_vec(),
    }
}

fn decode_quoted_printable(body: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    let bytes = body.as_bytes();
    let mut i = 0usize;
    while i < bytes.len() {
        if bytes[i] == b'=' {
            // Soft line break: `=` before CRLF or LF.
            if bytes.get(i + 1) == Some(&b'\r') && bytes.get(i + 2) == Some(&b'\n') {
                i += 3;
                continue;
            }
            if bytes.get(i + 1) == Some(&b'\n') {
                i += 2;
                continue;
            }
            if i + 2 < bytes.len() {
                let hi = (bytes[i + 1] as char).to_digit(16);
                let lo = (bytes[i + 2] as char).to_digit(16);
                if let (Some(hi), Some(lo)) = (hi, lo) {
                    out.push((hi * 16 + lo) as u8);
                    i += 3;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}

fn decode_charset(bytes: &[u8], charset: &str) -> String {
    match encoding_rs::Encoding::for_label(charset.as_bytes()) {
        Some(enc) => {
            let (text, _, _) = enc.decode(bytes);
            text.into_owned()
        }
        None => String::from_utf8_lossy(bytes).into_owned(),
    }
}

/// Decode RFC 2047 encoded words (`=?charset?B|Q?payload?=`) in a header.
fn decode_rfc2047(value: &str) -> String {
    let mut out = String::new();
    let mut rest = value;
    while let Some(start) = rest.find("=?") {
        out.push_str(&rest[..start]);
        let tail = &rest[start + 2..];
        let Some((charset, tail)) = tail.split_once('?') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let Some((enc, tail)) = tail.split_once('?') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let Some((payload, tail)) = tail.split_once("?=") else {
            out.push_str(&rest[start..]);
            return out;
        };
        let bytes = match enc {
            "B" | "b" => base64::engine::general_purpose::STANDARD
                .decode(payload.as_bytes())
                .unwrap_or_else(|_| payload.as_bytes().to_vec()),
            "Q" | "q" => decode_quoted_printable(&payload.replace('_', " ")),
            _ => payload.as_bytes().to_vec(),
        };
        out.push_str(&decode_charset(&bytes, charset));
        rest = tail;
    }
    out.push_str(rest);
    out.trim().to_string()
}

/// Reduce HTML to readable plain text: block tags become breaks, remaining
/// tags are stripped, a handful of common entities are decoded.
fn html_to_text(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut rest = html;
    loop {
        let Some(lt) = rest.find('<') else {
            out.push_str(rest);
            break;
        };
        out.push_str(&rest[..lt]);
        let after = &rest[lt..];
        let Some(close) = after.find('>') else {
            break;
        };
        let tag = after[1..close].trim().to_ascii_lowercase();
        let name =
            tag.trim_start_matches('/').split_whitespace().next().unwrap_or("").to_string();
        if matches!(name.as_str(), "p" | "div" | "br" | "li" | "tr" | "h1" | "h2" | "h3" | "h4") {
            out.push('\n');
        }
        let mut next = &after[close + 1..];
        if matches!(name.as_str(), "style" | "script") && !tag.starts_with('/') {
            // Drop embedded style/script bodies entirely.
            if let Some(end) = next.to_ascii_lowercase().find(&format!("</{name}")) {
                let closing = &next[end..];
                next = match closing.find('>') {
                    Some(gt) => &closing[gt + 1..],
                    None => "",
                };
            }
        }
        rest = next;
    }
    let decoded = out
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'");
    // Collapse 3+ newlines into paragraph breaks.
    let mut collapsed = String::with_capacity(decoded.len());
    let mut run = 0usize;
    for ch in decoded.chars() {
        if ch == '\n' {
            run += 1;
            if run <= 2 {
                collapsed.push('\n');
            }
        } else {
            run = 0;
            collapsed.push(ch);
        }
    }
    collapsed.trim().to_string()
}

pub(crate) fn split_paragraphs(text: &str) -> Vec<String> {
    text.split("\n\n")
        .map(|p| p.trim_matches('\n').trim())
        .filter(|p| !p.is_empty())
        .map(|p| p.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE: &str = "From: Ada <ada@example.com>\r\n\
Subject: Meeting notes\r\n\
Date: Mon, 12 Jan 2026 09:30:00 +0000\r\n\
Message-ID: <abc123@example.com>\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
First paragraph of the body.\r\n\
\r\n\
Second paragraph.\r\n";

    #[test]
    fn headers_map_onto_document_fields() {
        let doc = parse_message(SIMPLE.as_bytes(), "m.eml").expect("parse");
        assert_eq!(doc.title.as_deref(), Some("Meeting notes"));
        assert_eq!(doc.author.as_deref(), Some("Ada <ada@example.com>"));
        assert_eq!(doc.external_id.as_deref(), Some("abc123@example.com"));
        assert!(doc.created_ts.as_deref().unwrap().starts_with("2026-01-12"));
        assert_eq!(doc.segments.len(), 2);
        assert_eq!(doc.text, "First paragraph of the body.\n\nSecond paragraph.");
    }

    #[test]
    fn multipart_prefers_the_plain_part() {
        let msg = "Subject: Multi\r\n\
Content-Type: multipart/alternative; boundary=\"xyz\"\r\n\
\r\n\
--xyz\r\n\
Content-Type: text/html\r\n\
\r\n\
<p>Hello <b>world</b></p>\r\n\
--xyz\r\n\
Content-Type: text/plain\r\n\
\r\n\
Hello world plain\r\n\
--xyz--\r\n";
        let doc = parse_message(msg.as_bytes(), "m.eml").expect("parse");
        assert_eq!(doc.text, "Hello world plain");
    }

    #[test]
    fn html_only_messages_are_detagged() {
        let msg = "Subject: Html\r\n\
Content-Type: text/html; charset=utf-8\r\n\
\r\n\
<html><body><p>One &amp; two</p><p>Three</p></body></html>\r\n";
        let doc = parse_message(msg.as_bytes(), "m.eml").expect("parse");
        assert!(doc.text.contains("One & two"));
        assert!(doc.text.contains("Three"));
        assert!(!doc.text.contains('<'));
    }

    #[test]
    fn quoted_printable_bodies_decode() {
        let msg = "Subject: QP\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
Content-Transfer-Encoding: quoted-printable\r\n\
\r\n\
caf=C3=A9 time\r\n";
        let doc = parse_message(msg.as_bytes(), "m.eml").expect("parse");
        assert_eq!(doc.text, "café time");
    }

    #[test]
    fn encoded_word_subjects_decode() {
        assert_eq!(decode_rfc2047("=?utf-8?Q?caf=C3=A9?= hours"), "café hours");
        assert_eq!(decode_rfc2047("plain subject"), "plain subject");
    }

    #[test]
    fn bodyless_message_reports_empty() {
        let msg = "Subject: Nothing\r\nContent-Type: text/plain\r\n\r\n\r\n";
        let err = parse_message(msg.as_bytes(), "m.eml").unwrap_err();
        assert_eq!(err.kind(), "empty");
    }
}
