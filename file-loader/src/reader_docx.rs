//! DOCX reader: streams `word/document.xml` out of the zip container and
//! flattens it to paragraph blocks, keeping heading depth as `#` markers so
//! the chunker sees the same structure markdown gives it.

use std::fs::File;
use std::io::Read;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::blocks::{assemble, heading_title, Block};
use crate::{normalise_text, LoadError, LoadedDoc};

fn local_name(q: &[u8]) -> &[u8] {
    match q.iter().position(|&b| b == b':') {
        Some(i) => &q[i + 1..],
        None => q,
    }
}

fn attr_val(e: &BytesStart<'_>, key_local: &[u8]) -> Option<String> {
    for a in e.attributes().with_checks(false).flatten() {
        if local_name(a.key.as_ref()) == key_local {
            return Some(String::from_utf8_lossy(&a.value).into_owned());
        }
    }
    None
}

pub fn load_docx(path: &str) -> Result<LoadedDoc, LoadError> {
    let file = File::open(path).map_err(|e| LoadError::io(path, e))?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| LoadError::Decode {
        path: path.to_string(),
        detail: format!("not a zip container: {e}"),
    })?;
    let mut xml = String::new();
    zip.by_name("word/document.xml")
        .map_err(|e| LoadError::Decode {
            path: path.to_string(),
            detail: format!("missing word/document.xml: {e}"),
        })?
        .read_to_string(&mut xml)
        .map_err(|e| LoadError::io(path, e))?;

    let blocks = parse_document_xml(&xml);
    let (text, segments) = assemble(&blocks);
    if text.trim().is_empty() {
        return Err(LoadError::Empty { path: path.to_string() });
    }

    let title = blocks
        .iter()
        .find(|b| b.heading_level.is_some())
        .map(|b| heading_title(&b.text));

    Ok(LoadedDoc {
        text,
        mime: "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            .to_string(),
        title,
        author: None,
        created_ts: None,
        external_id: None,
        meta: Default::default(),
        segments,
    })
}

fn parse_document_xml(xml: &str) -> Vec<Block> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(false);
    let mut buf = Vec::new();

    let mut blocks: Vec<Block> = Vec::new();
    let mut in_para = false;
    let mut para_text = String::new();
    let mut heading: Option<u8> = None;

    let mut in_table = false;
    let mut row_cells: Vec<String> = Vec::new();
    let mut table_rows: Vec<String> = Vec::new();

    loop {
        buf.clear();
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match local_name(e.name().as_ref()) {
                b"p" if !in_table => {
                    in_para = true;
                    para_text.clear();
                    heading = None;
                }
                b"tbl" => {
                    in_table = true;
                    table_rows.clear();
                }
                b"tr" if in_table => row_cells.clear(),
                b"tc" if in_table => row_cells.push(String::new()),
                b"pStyle" if in_para => {
                    if let Some(level) = heading_style_level(attr_val(&e, b"val")) {
                        heading = Some(level);
                    }
                }
                _ => {}
            },
            Ok(Event::Empty(e)) => match local_name(e.name().as_ref()) {
                b"pStyle" if in_para => {
                    if let Some(level) = heading_style_level(attr_val(&e, b"val")) {
                        heading = Some(level);
                    }
                }
                b"br" if in_para => para_text.push('\n'),
                b"tab" if in_para => para_text.push('\t'),
                _ => {}
            },
            Ok(Event::Text(t)) => {
                if let Ok(cow) = t.unescape() {
                    if in_table {
                        if let Some(cell) = row_cells.last_mut() {
                            cell.push_str(&cow);
                        }
                    } else if in_para {
                        para_text.push_str(&cow);
                    }
                }
            }
            Ok(Event::End(e)) => match local_name(e.name().as_ref()) {
                b"p" if in_para && !in_table => {
                    in_para = false;
                    // Normalise before assembly so segment offsets stay
                    // byte-exact against the document text.
                    let text = normalise_text(&para_text);
                    let text = text.trim();
                    if !text.is_empty() {
                        match heading {
                            Some(level) => {
                                let marker = "#".repeat(level as usize);
                                blocks.push(Block::heading(format!("{marker} {text}"), level));
                            }
                            None => blocks.push(Block::paragraph(text.to_string())),
                        }
                    }
                }
                b"tr" if in_table => table_rows.push(row_cells.join("\t")),
                b"tbl" if in_table => {
                    in_table = false;
                    let rows = normalise_text(&table_rows.join("\n"));
                    if !rows.trim().is_empty() {
                        blocks.push(Block::paragraph(rows));
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
    }
    blocks
}

/// `Heading1`..`Heading9` (and `Title`, treated as level 1).
fn heading_style_level(val: Option<String>) -> Option<u8> {
    let val = val?;
    if val.eq_ignore_ascii_case("title") {
        return Some(1);
    }
    let rest = val.strip_prefix("Heading").or_else(|| val.strip_prefix("heading"))?;
    rest.parse::<u8>().ok().filter(|l| (1..=9).contains(l))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC_XML: &str = r#"<?xml version="1.0"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
  <w:body>
    <w:p><w:pPr><w:pStyle w:val="Heading1"/></w:pPr><w:r><w:t>Overview</w:t></w:r></w:p>
    <w:p><w:r><w:t>First paragraph </w:t></w:r><w:r><w:t>in two runs.</w:t></w:r></w:p>
    <w:p><w:pPr><w:pStyle w:val="Heading2"/></w:pPr><w:r><w:t>Details</w:t></w:r></w:p>
    <w:p><w:r><w:t>Second paragraph.</w:t></w:r></w:p>
  </w:body>
</w:document>"#;

    #[test]
    fn paragraphs_and_heading_depth_survive_flattening() {
        let blocks = parse_document_xml(DOC_XML);
        assert_eq!(blocks.len(), 4);
        assert_eq!(blocks[0].text, "# Overview");
        assert_eq!(blocks[0].heading_level, Some(1));
        assert_eq!(blocks[1].text, "First paragraph in two runs.");
        assert_eq!(blocks[2].text, "## Details");
        assert_eq!(blocks[2].heading_level, Some(2));
    }

    #[test]
    fn heading_styles_parse_levels() {
        assert_eq!(heading_style_level(Some("Heading1".into())), Some(1));
        assert_eq!(heading_style_level(Some("Heading9".into())), Some(9));
        assert_eq!(heading_style_level(Some("Title".into())), Some(1));
        assert_eq!(heading_style_level(Some("BodyText".into())), None);
        assert_eq!(heading_style_level(None), None);
    }
}
