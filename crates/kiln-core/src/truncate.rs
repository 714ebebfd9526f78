//! Output truncation and blob spill.
//!
//! Evaluation records keep at most a preview of each output stream; anything
//! larger is written to the blob store in full and referenced by location.
//! The preview cut respects UTF-8 boundaries so the stored prefix is always
//! valid text.

use std::path::PathBuf;

use anyhow::{Context, Result};

/// Default preview cap: 1 MiB.
pub const DEFAULT_PREVIEW_CAP: usize = 1024 * 1024;

/// Where spilled streams go and how much stays inline.
#[derive(Debug, Clone)]
pub struct TruncationConfig {
    pub preview_cap_bytes: usize,
    pub blob_dir: PathBuf,
}

impl TruncationConfig {
    pub fn new(preview_cap_bytes: usize, blob_dir: impl Into<PathBuf>) -> Self {
        Self {
            preview_cap_bytes,
            blob_dir: blob_dir.into(),
        }
    }
}

/// A stream after the cap has been applied.
#[derive(Debug, Clone, PartialEq)]
pub struct CappedStream {
    /// At most `preview_cap_bytes` of the stream, on a char boundary.
    pub preview: String,
    pub truncated: bool,
    /// Full size of the original stream in bytes.
    pub size: i64,
    /// Blob location of the full stream, set only when truncated.
    pub location: Option<String>,
}

impl CappedStream {
    /// An empty stream: nothing stored, nothing spilled.
    pub fn empty() -> Self {
        Self {
            preview: String::new(),
            truncated: false,
            size: 0,
            location: None,
        }
    }
}

/// Apply the preview cap to one output stream.
///
/// When the stream exceeds the cap, the full body is spilled to
/// `{blob_dir}/{eval_id}.{stream_name}` and the returned preview holds the
/// leading bytes. A spill failure degrades to plain truncation (preview
/// kept, location absent) rather than failing the evaluation.
pub fn cap_stream(
    config: &TruncationConfig,
    eval_id: &str,
    stream_name: &str,
    content: &str,
) -> CappedStream {
    let size = content.len() as i64;

    if content.len() <= config.preview_cap_bytes {
        return CappedStream {
            preview: content.to_owned(),
            truncated: false,
            size,
            location: None,
        };
    }

    let cut = floor_char_boundary(content, config.preview_cap_bytes);
    let preview = content[..cut].to_owned();

    let location = match spill(config, eval_id, stream_name, content) {
        Ok(location) => Some(location),
        Err(e) => {
            tracing::warn!(
                eval_id = %eval_id,
                stream = %stream_name,
                error = %e,
                "failed to spill oversized stream; keeping preview only"
            );
            None
        }
    };

    CappedStream {
        preview,
        truncated: true,
        size,
        location,
    }
}

/// Write the full stream to the blob directory, returning its location URI.
fn spill(
    config: &TruncationConfig,
    eval_id: &str,
    stream_name: &str,
    content: &str,
) -> Result<String> {
    std::fs::create_dir_all(&config.blob_dir).with_context(|| {
        format!("failed to create blob directory {}", config.blob_dir.display())
    })?;

    let path = config.blob_dir.join(format!("{eval_id}.{stream_name}"));
    std::fs::write(&path, content)
        .with_context(|| format!("failed to write blob {}", path.display()))?;

    Ok(format!("file://{}", path.display()))
}

/// Largest index `<= max` that falls on a char boundary of `s`.
fn floor_char_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut idx = max;
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}
