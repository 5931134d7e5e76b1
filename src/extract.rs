//! Format detection, structural validation, and text extraction.
//!
//! The consume pipeline hands this module raw bytes plus a MIME type and
//! gets back plain UTF-8 text. OCR is never attempted: a PDF without a text
//! layer yields empty content.

use std::io::Read;
use std::path::Path;

use thiserror::Error;

pub const MIME_TEXT: &str = "text/plain";
pub const MIME_MARKDOWN: &str = "text/markdown";
pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_PPTX: &str =
    "application/vnd.openxmlformats-officedocument.presentationml.presentation";
pub const MIME_XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

/// Decompressed size cap for a single ZIP member (zip-bomb protection).
const MAX_ZIP_ENTRY_BYTES: u64 = 50 * 1024 * 1024;
/// How far from the end of a PDF the `%%EOF` marker may sit.
const PDF_TRAILER_WINDOW: usize = 1024;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported file type: {0}")]
    Unsupported(String),
    #[error("malformed file: {0}")]
    Malformed(String),
    #[error("text is not valid UTF-8")]
    Encoding,
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),
}

/// Map a file name to a supported MIME type by extension.
pub fn detect_mime(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "txt" | "text" => Some(MIME_TEXT),
        "md" | "markdown" => Some(MIME_MARKDOWN),
        "pdf" => Some(MIME_PDF),
        "docx" => Some(MIME_DOCX),
        "pptx" => Some(MIME_PPTX),
        "xlsx" => Some(MIME_XLSX),
        _ => None,
    }
}

/// File extension used when storing an original of this MIME type.
pub fn extension_for(mime: &str) -> &'static str {
    match mime {
        MIME_PDF => "pdf",
        MIME_DOCX => "docx",
        MIME_PPTX => "pptx",
        MIME_XLSX => "xlsx",
        MIME_MARKDOWN => "md",
        _ => "txt",
    }
}

/// Cheap structural checks run before extraction.
pub fn validate(bytes: &[u8], mime: &str) -> Result<(), ExtractError> {
    if bytes.is_empty() {
        return Err(ExtractError::Malformed("file is empty".to_string()));
    }
    match mime {
        MIME_PDF => validate_pdf(bytes),
        MIME_DOCX | MIME_PPTX | MIME_XLSX => {
            if bytes.starts_with(b"PK") {
                Ok(())
            } else {
                Err(ExtractError::Malformed("not a ZIP container".to_string()))
            }
        }
        _ => Ok(()),
    }
}

pub fn validate_pdf(bytes: &[u8]) -> Result<(), ExtractError> {
    if !bytes.starts_with(b"%PDF-") {
        return Err(ExtractError::Malformed("missing %PDF- header".to_string()));
    }
    let tail_start = bytes.len().saturating_sub(PDF_TRAILER_WINDOW);
    if find(&bytes[tail_start..], b"%%EOF").is_none() {
        return Err(ExtractError::Malformed("missing %%EOF trailer".to_string()));
    }
    Ok(())
}

pub fn extract_text(bytes: &[u8], mime: &str) -> Result<String, ExtractError> {
    match mime {
        MIME_TEXT | MIME_MARKDOWN => std::str::from_utf8(bytes)
            .map(|s| s.to_string())
            .map_err(|_| ExtractError::Encoding),
        MIME_PDF => extract_pdf(bytes),
        MIME_DOCX => {
            let mut archive = open_zip(bytes)?;
            let xml = read_zip_entry(&mut archive, "word/document.xml")?;
            collect_text_runs(&xml)
        }
        MIME_PPTX => extract_pptx(bytes),
        MIME_XLSX => extract_xlsx(bytes),
        other => Err(ExtractError::Unsupported(other.to_string())),
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    // pdf-extract panics on some malformed inputs instead of returning Err
    let owned = bytes.to_vec();
    match std::panic::catch_unwind(move || pdf_extract::extract_text_from_mem(&owned)) {
        Ok(Ok(text)) => Ok(text.trim().to_string()),
        Ok(Err(e)) => Err(ExtractError::Pdf(e.to_string())),
        Err(_) => Err(ExtractError::Pdf("parser panicked".to_string())),
    }
}

fn extract_pptx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_zip(bytes)?;
    let mut parts = Vec::new();
    for name in numbered_members(&archive, "ppt/slides/slide") {
        let xml = read_zip_entry(&mut archive, &name)?;
        let text = collect_text_runs(&xml)?;
        if !text.is_empty() {
            parts.push(text);
        }
    }
    Ok(parts.join(" "))
}

/// Cell text of every worksheet in sheet order. Shared-string cells are
/// resolved; numbers and inline strings are taken as written.
fn extract_xlsx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_zip(bytes)?;
    let shared = if archive.file_names().any(|n| n == "xl/sharedStrings.xml") {
        shared_strings(&read_zip_entry(&mut archive, "xl/sharedStrings.xml")?)?
    } else {
        Vec::new()
    };

    let mut cells = Vec::new();
    for name in numbered_members(&archive, "xl/worksheets/sheet") {
        let xml = read_zip_entry(&mut archive, &name)?;
        cells.extend(sheet_cells(&xml, &shared)?);
    }
    Ok(cells.join(" "))
}

/// Members named `{prefix}{n}.xml`, ordered by `n`.
fn numbered_members(archive: &zip::ZipArchive<std::io::Cursor<&[u8]>>, prefix: &str) -> Vec<String> {
    let mut members: Vec<(u32, String)> = archive
        .file_names()
        .filter_map(|name| {
            let number = name.strip_prefix(prefix)?.strip_suffix(".xml")?.parse::<u32>().ok()?;
            Some((number, name.to_string()))
        })
        .collect();
    members.sort();
    members.into_iter().map(|(_, name)| name).collect()
}

fn shared_strings(xml: &[u8]) -> Result<Vec<String>, ExtractError> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut strings = Vec::new();
    let mut current = String::new();
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"si" => strings.push(String::new()),
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"si" => strings.push(std::mem::take(&mut current)),
                _ => {}
            },
            Ok(Event::Text(t)) if in_text => {
                let text = t.unescape().map_err(|e| ExtractError::Ooxml(e.to_string()))?;
                current.push_str(&text);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    Ok(strings)
}

fn sheet_cells(xml: &[u8], shared: &[String]) -> Result<Vec<String>, ExtractError> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut cells = Vec::new();
    let mut shared_cell = false;
    let mut in_value = false;
    let mut in_inline = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"c" => {
                    shared_cell = e
                        .attributes()
                        .flatten()
                        .any(|a| a.key.as_ref() == b"t" && a.value.as_ref() == b"s");
                }
                b"v" => in_value = true,
                b"t" => in_inline = true,
                _ => {}
            },
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" => in_value = false,
                b"t" => in_inline = false,
                b"c" => shared_cell = false,
                _ => {}
            },
            Ok(Event::Text(t)) if in_value || in_inline => {
                let raw = t.unescape().map_err(|e| ExtractError::Ooxml(e.to_string()))?;
                let value = raw.trim();
                let text = if in_value && shared_cell {
                    value
                        .parse::<usize>()
                        .ok()
                        .and_then(|i| shared.get(i))
                        .map(|s| s.trim())
                        .ok_or_else(|| {
                            ExtractError::Ooxml(format!("bad shared string index: {}", value))
                        })?
                } else {
                    value
                };
                if !text.is_empty() {
                    cells.push(text.to_string());
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    Ok(cells)
}

fn open_zip(bytes: &[u8]) -> Result<zip::ZipArchive<std::io::Cursor<&[u8]>>, ExtractError> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| ExtractError::Ooxml(e.to_string()))
}

fn read_zip_entry(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Ooxml(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry
        .take(MAX_ZIP_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if out.len() as u64 >= MAX_ZIP_ENTRY_BYTES {
        return Err(ExtractError::Ooxml(format!("{} exceeds size limit", name)));
    }
    Ok(out)
}

/// Concatenate the text of every `<*:t>` element (WordprocessingML `w:t`,
/// DrawingML `a:t`), separating paragraphs with a space.
fn collect_text_runs(xml: &[u8]) -> Result<String, ExtractError> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut out = String::new();
    let mut in_run = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_run = true,
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_run = false,
                b"p" if !out.is_empty() && !out.ends_with(' ') => out.push(' '),
                _ => {}
            },
            Ok(Event::Text(t)) if in_run => {
                let text = t.unescape().map_err(|e| ExtractError::Ooxml(e.to_string()))?;
                out.push_str(&text);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    Ok(out.trim().to_string())
}

pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

pub(crate) fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .rposition(|window| window == needle)
}
