//! Best-effort repair of damaged source files before a retry.

use std::io::Write;
use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::extract;

/// Rewrites a working copy in place so that it is more likely to ingest.
pub trait Repairer: Send + Sync {
    /// Format name used in log lines, e.g. "PDF".
    fn name(&self) -> &str;

    fn repair(&self, path: &Path) -> Result<()>;
}

/// Leaves files untouched.
pub struct NoRepair;

impl Repairer for NoRepair {
    fn name(&self) -> &str {
        "noop"
    }

    fn repair(&self, _path: &Path) -> Result<()> {
        Ok(())
    }
}

/// Fixes the common breakage in truncated or padded PDFs: bytes before the
/// `%PDF-` header, junk after the last `%%EOF`, or a missing `%%EOF`.
/// The result must parse with lopdf before it replaces the input.
pub struct PdfRepairer;

impl Repairer for PdfRepairer {
    fn name(&self) -> &str {
        "PDF"
    }

    fn repair(&self, path: &Path) -> Result<()> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let repaired = repair_pdf_bytes(&bytes)?;

        lopdf::Document::load_mem(&repaired).context("repaired PDF does not parse")?;

        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&repaired)?;
        tmp.flush()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}

fn repair_pdf_bytes(bytes: &[u8]) -> Result<Vec<u8>> {
    let Some(start) = extract::find(bytes, b"%PDF-") else {
        bail!("no %PDF- header found");
    };
    let body = &bytes[start..];

    let mut out = match extract::rfind(body, b"%%EOF") {
        Some(pos) => body[..pos + b"%%EOF".len()].to_vec(),
        None => {
            let mut v = body.to_vec();
            if !v.ends_with(b"\n") {
                v.push(b'\n');
            }
            v.extend_from_slice(b"%%EOF");
            v
        }
    };
    out.push(b'\n');
    Ok(out)
}
