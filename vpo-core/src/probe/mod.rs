//! Media probing.
//!
//! [`probe_file`] shells out to ffprobe and hands the captured JSON to
//! [`parse_probe_output`], which is a pure function so tests can feed it
//! recorded output. Malformed or missing fields degrade instead of
//! failing: language falls back to `und`, dispositions to false, and a
//! duplicated stream index keeps the first occurrence with a warning.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};
use vpo_model::{
    normalize_container, normalize_language, AudioInfo, FileInfo, HdrColorInfo,
    Track, TrackKind, VideoInfo,
};

use crate::error::{CoreError, Result};
use crate::tools::{Tool, ToolRegistry};

/// Raw per-stream record as ffprobe emits it. Everything is optional;
/// canonicalization decides what survives.
#[derive(Debug, Deserialize)]
struct RawStream {
    index: Option<i64>,
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<i64>,
    height: Option<i64>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    channels: Option<i64>,
    channel_layout: Option<String>,
    color_transfer: Option<String>,
    color_primaries: Option<String>,
    color_space: Option<String>,
    color_range: Option<String>,
    #[serde(default)]
    disposition: RawDisposition,
    #[serde(default)]
    tags: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct RawDisposition {
    #[serde(default)]
    default: i64,
    #[serde(default)]
    forced: i64,
}

#[derive(Debug, Default, Deserialize)]
struct RawFormat {
    format_name: Option<String>,
    duration: Option<String>,
    #[serde(default)]
    tags: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawProbe {
    #[serde(default)]
    streams: Vec<RawStream>,
    #[serde(default)]
    format: Option<RawFormat>,
}

/// Probe a file on disk.
pub async fn probe_file(registry: &ToolRegistry, path: &Path) -> Result<FileInfo> {
    let ffprobe = registry.require(Tool::Ffprobe)?;
    let output = tokio::process::Command::new(&ffprobe.path)
        .arg("-v")
        .arg("error")
        .arg("-show_streams")
        .arg("-show_format")
        .arg("-of")
        .arg("json")
        .arg(path)
        .output()
        .await?;

    if !output.status.success() {
        return Err(CoreError::Subprocess {
            tool: "ffprobe".into(),
            code: output.status.code(),
            detail: String::from_utf8_lossy(&output.stderr)
                .lines()
                .take(5)
                .collect::<Vec<_>>()
                .join("\n"),
        });
    }

    let metadata = tokio::fs::metadata(path).await?;
    let modified_at = metadata
        .modified()
        .ok()
        .map(DateTime::<Utc>::from);

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut info = parse_probe_output(path, &stdout)?;
    info.size_bytes = metadata.len();
    info.modified_at = modified_at;
    Ok(info)
}

/// Parse captured ffprobe JSON into a canonical [`FileInfo`].
///
/// Size and mtime are filled by the caller; this function only sees the
/// probe text.
pub fn parse_probe_output(path: &Path, json: &str) -> Result<FileInfo> {
    let raw: RawProbe = serde_json::from_str(json)
        .map_err(|e| CoreError::Probe(format!("{}: {e}", path.display())))?;

    let format = raw.format.unwrap_or_default();
    let container = normalize_container(format.format_name.as_deref().unwrap_or(""));
    let duration_seconds = format
        .duration
        .as_deref()
        .and_then(|d| d.trim().parse::<f64>().ok());

    let tags = lowercase_tags(&format.tags);

    let mut tracks: Vec<Track> = Vec::with_capacity(raw.streams.len());
    let mut seen = std::collections::BTreeSet::new();
    for (position, stream) in raw.streams.into_iter().enumerate() {
        let index = match stream.index {
            Some(i) if i >= 0 => i as usize,
            _ => {
                debug!(position, "stream without index, using ordinal position");
                position
            }
        };
        if !seen.insert(index) {
            warn!(
                path = %path.display(),
                index,
                "duplicate stream index in probe output, keeping first"
            );
            continue;
        }
        tracks.push(canonicalize_stream(index, stream));
    }
    tracks.sort_by_key(|t| t.index);

    Ok(FileInfo {
        path: path.to_path_buf(),
        container,
        size_bytes: 0,
        modified_at: None,
        duration_seconds,
        tags,
        tracks,
    })
}

fn canonicalize_stream(index: usize, stream: RawStream) -> Track {
    let kind = stream
        .codec_type
        .as_deref()
        .map(TrackKind::from_codec_type)
        .unwrap_or(TrackKind::Other);

    let language = normalize_language(
        stream
            .tags
            .get("language")
            .and_then(|v| v.as_str()),
    );
    let title = stream
        .tags
        .get("title")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    let video = (kind == TrackKind::Video).then(|| {
        let color = HdrColorInfo {
            color_transfer: stream.color_transfer.clone(),
            color_primaries: stream.color_primaries.clone(),
            color_space: stream.color_space.clone(),
            color_range: stream.color_range.clone(),
        };
        VideoInfo {
            width: stream.width.and_then(|w| u32::try_from(w).ok()),
            height: stream.height.and_then(|h| u32::try_from(h).ok()),
            frame_rate: pick_frame_rate(
                stream.r_frame_rate.as_deref(),
                stream.avg_frame_rate.as_deref(),
            ),
            color: (!color.is_empty()).then_some(color),
        }
    });

    let audio = (kind == TrackKind::Audio).then(|| AudioInfo {
        channels: stream.channels.and_then(|c| u32::try_from(c).ok()),
        channel_layout: stream.channel_layout.clone(),
    });

    Track {
        index,
        kind,
        codec: stream.codec_name,
        language,
        title,
        is_default: stream.disposition.default != 0,
        is_forced: stream.disposition.forced != 0,
        video,
        audio,
    }
}

/// `r_frame_rate` is preferred; `0/0` placeholders fall through to
/// `avg_frame_rate`.
fn pick_frame_rate(r: Option<&str>, avg: Option<&str>) -> Option<String> {
    let usable = |rate: &str| !rate.is_empty() && rate != "0/0";
    match r {
        Some(rate) if usable(rate) => Some(rate.to_string()),
        _ => avg.filter(|rate| usable(rate)).map(str::to_string),
    }
}

fn lowercase_tags(tags: &HashMap<String, serde_json::Value>) -> BTreeMap<String, String> {
    tags.iter()
        .map(|(k, v)| {
            let value = match v.as_str() {
                Some(s) => s.to_string(),
                None => v.to_string(),
            };
            (k.to_ascii_lowercase(), value)
        })
        .collect()
}
