//! Mbox reader: one document per message.
//!
//! Messages are delimited by `From ` separator lines. Each message parses
//! like an `.eml` file; when it lacks a Message-ID, the byte offset of the
//! message within the mbox is hashed into a stable external id.

use std::fs;

use sha2::Digest;

use crate::reader_eml::parse_message;
use crate::{LoadError, LoadedDoc};

pub fn load_mbox(path: &str) -> Result<Vec<LoadedDoc>, LoadError> {
    let bytes = fs::read(path).map_err(|e| LoadError::io(path, e))?;
    let mut docs = Vec::new();

    for (offset, message) in split_messages(&bytes) {
        let mut doc = match parse_message(message, path) {
            Ok(d) => d,
            // Skip unreadable messages; the container itself loaded fine.
            Err(_) => continue,
        };
        doc.mime = "application/mbox".to_string();
        if doc.external_id.is_none() {
            doc.external_id = Some(offset_id(path, offset));
        }
        docs.push(doc);
    }

    if docs.is_empty() {
        return Err(LoadError::Empty { path: path.to_string() });
    }
    Ok(docs)
}

/// Yield `(byte_offset, message_bytes)` for each message. The `From ` line
/// itself is not part of the message.
fn split_messages(bytes: &[u8]) -> Vec<(usize, &[u8])> {
    let mut starts: Vec<usize> = Vec::new();
    if bytes.starts_with(b"From ") {
        starts.push(0);
    }
    let mut i = 0usize;
    while i + 6 < bytes.len() {
        if bytes[i] == b'\n' && bytes[i + 1..].starts_with(b"From ") {
            starts.push(i + 1);
        }
        i += 1;
    }

    let mut out = Vec::with_capacity(starts.len());
    for (n, &start) in starts.iter().enumerate() {
        let end = starts.get(n + 1).copied().unwrap_or(bytes.len());
        let body = &bytes[start..end];
        // Drop the separator line.
        match body.iter().position(|&b| b == b'\n') {
            Some(nl) => out.push((start, &body[nl + 1..])),
            None => continue,
        }
    }
    out
}

fn offset_id(path: &str, offset: usize) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(path.as_bytes());
    hasher.update(offset.to_le_bytes());
    let digest = hasher.finalize();
    format!("mbox-{}", hex::encode(&digest[..8]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MBOX: &str = "From alice@example.com Mon Jan 12 09:30:00 2026\n\
From: Alice <alice@example.com>\n\
Subject: First\n\
Message-ID: <one@example.com>\n\
\n\
Body of the first message.\n\
\n\
From bob@example.com Mon Jan 12 10:00:00 2026\n\
From: Bob <bob@example.com>\n\
Subject: Second\n\
\n\
Body of the second message.\n";

    #[test]
    fn each_message_becomes_a_document() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mail.mbox");
        let mut f = std::fs::File::create(&path).expect("create");
        f.write_all(MBOX.as_bytes()).expect("write");

        let docs = load_mbox(&path.to_string_lossy()).expect("load");
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].title.as_deref(), Some("First"));
        assert_eq!(docs[0].external_id.as_deref(), Some("one@example.com"));
        assert_eq!(docs[1].title.as_deref(), Some("Second"));
        // No Message-ID: the offset hash stands in, and it is stable.
        let fallback = docs[1].external_id.clone().expect("fallback id");
        assert!(fallback.starts_with("mbox-"));
        let again = load_mbox(&path.to_string_lossy()).expect("reload");
        assert_eq!(again[1].external_id.as_deref(), Some(fallback.as_str()));
    }

    #[test]
    fn an_empty_mbox_reports_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("empty.mbox");
        std::fs::File::create(&path).expect("create");
        let err = load_mbox(&path.to_string_lossy()).unwrap_err();
        assert_eq!(err.kind(), "empty");
    }
}
