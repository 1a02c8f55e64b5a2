//! Reading local files into message attachments.

use std::path::Path;

use anyhow::{bail, Context, Result};
use base64::Engine;

use crate::types::Attachment;

/// Attachments larger than this are refused before encoding.
const MAX_ATTACHMENT_BYTES: u64 = 20 * 1024 * 1024;

fn mime_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "heic" => "image/heic",
        "pdf" => "application/pdf",
        "txt" | "md" => "text/plain",
        "csv" => "text/csv",
        "json" => "application/json",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        _ => "application/octet-stream",
    }
}

pub async fn read_attachment(path: &Path) -> Result<Attachment> {
    let meta = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("Cannot attach {}", path.display()))?;
    if !meta.is_file() {
        bail!("{} is not a file", path.display());
    }
    if meta.len() > MAX_ATTACHMENT_BYTES {
        bail!(
            "{} is too large to attach ({} bytes, limit {})",
            path.display(),
            meta.len(),
            MAX_ATTACHMENT_BYTES
        );
    }
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    Ok(Attachment {
        name,
        mime_type: mime_for(path).to_string(),
        data: base64::prelude::BASE64_STANDARD.encode(bytes),
    })
}

/// Read every path, failing on the first unreadable one.
pub async fn read_attachments<P: AsRef<Path>>(paths: &[P]) -> Result<Vec<Attachment>> {
    let mut attachments = Vec::with_capacity(paths.len());
    for path in paths {
        attachments.push(read_attachment(path.as_ref()).await?);
    }
    Ok(attachments)
}
