//! External-tool detection and capability caching.
//!
//! The registry probes ffmpeg, ffprobe, mkvmerge and mkvpropedit once at
//! startup: path resolution (explicit override, else PATH), version
//! capture, and for ffmpeg the `-encoders`/`-muxers`/`-filters` lists.
//! Everything downstream asks the registry instead of re-running tools,
//! and preflight turns a missing entry into a typed error.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tool {
    Ffmpeg,
    Ffprobe,
    Mkvmerge,
    Mkvpropedit,
}

impl Tool {
    pub fn binary_name(&self) -> &'static str {
        match self {
            Self::Ffmpeg => "ffmpeg",
            Self::Ffprobe => "ffprobe",
            Self::Mkvmerge => "mkvmerge",
            Self::Mkvpropedit => "mkvpropedit",
        }
    }

    pub const ALL: [Tool; 4] = [Tool::Ffmpeg, Tool::Ffprobe, Tool::Mkvmerge, Tool::Mkvpropedit];
}

impl std::fmt::Display for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.binary_name())
    }
}

/// Explicit path overrides, resolved from config/environment.
#[derive(Debug, Clone, Default)]
pub struct ToolPaths {
    pub ffmpeg: Option<PathBuf>,
    pub ffprobe: Option<PathBuf>,
    pub mkvmerge: Option<PathBuf>,
    pub mkvpropedit: Option<PathBuf>,
}

impl ToolPaths {
    fn override_for(&self, tool: Tool) -> Option<&PathBuf> {
        match tool {
            Tool::Ffmpeg => self.ffmpeg.as_ref(),
            Tool::Ffprobe => self.ffprobe.as_ref(),
            Tool::Mkvmerge => self.mkvmerge.as_ref(),
            Tool::Mkvpropedit => self.mkvpropedit.as_ref(),
        }
    }
}

/// ffmpeg build capabilities.
#[derive(Debug, Clone, Default)]
pub struct FfmpegCapabilities {
    pub encoders: HashSet<String>,
    pub muxers: HashSet<String>,
    pub filters: HashSet<String>,
}

#[derive(Debug, Clone)]
pub struct ToolInfo {
    pub tool: Tool,
    pub path: PathBuf,
    pub version: String,
    pub version_triple: (u32, u32, u32),
    pub detected_at: DateTime<Utc>,
    pub capabilities: Option<FfmpegCapabilities>,
}

impl ToolInfo {
    pub fn meets_version(&self, minimum: (u32, u32, u32)) -> bool {
        self.version_triple >= minimum
    }
}

/// Detected tools, cached for the process lifetime.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: Vec<ToolInfo>,
}

impl ToolRegistry {
    /// Detect every tool. Missing tools are recorded as absent, not
    /// errors; preflight decides which absences matter for a given plan.
    pub async fn detect(paths: &ToolPaths) -> Self {
        let mut tools = Vec::new();
        for tool in Tool::ALL {
            match detect_tool(tool, paths.override_for(tool)).await {
                Ok(info) => {
                    info!(
                        tool = %tool,
                        path = %info.path.display(),
                        version = %info.version,
                        "detected external tool"
                    );
                    tools.push(info);
                }
                Err(err) => {
                    warn!(tool = %tool, "tool not detected: {err}");
                }
            }
        }
        Self { tools }
    }

    /// Registry over explicit, already-verified entries (tests).
    pub fn from_parts(tools: Vec<ToolInfo>) -> Self {
        Self { tools }
    }

    pub fn get(&self, tool: Tool) -> Option<&ToolInfo> {
        self.tools.iter().find(|t| t.tool == tool)
    }

    pub fn require(&self, tool: Tool) -> Result<&ToolInfo> {
        self.get(tool).ok_or_else(|| CoreError::ToolMissing {
            tool: tool.binary_name().to_string(),
        })
    }

    pub fn has_encoder(&self, name: &str) -> bool {
        self.get(Tool::Ffmpeg)
            .and_then(|t| t.capabilities.as_ref())
            .is_some_and(|c| c.encoders.contains(name))
    }

    pub fn has_muxer(&self, name: &str) -> bool {
        self.get(Tool::Ffmpeg)
            .and_then(|t| t.capabilities.as_ref())
            .is_some_and(|c| c.muxers.contains(name))
    }

    pub fn has_filter(&self, name: &str) -> bool {
        self.get(Tool::Ffmpeg)
            .and_then(|t| t.capabilities.as_ref())
            .is_some_and(|c| c.filters.contains(name))
    }

    /// `-fps_mode` replaced `-vsync` in ffmpeg 5.1.
    pub fn supports_fps_mode(&self) -> bool {
        self.get(Tool::Ffmpeg)
            .is_some_and(|t| t.meets_version((5, 1, 0)))
    }

    /// `-stats_period` appeared in ffmpeg 4.4.
    pub fn supports_stats_period(&self) -> bool {
        self.get(Tool::Ffmpeg)
            .is_some_and(|t| t.meets_version((4, 4, 0)))
    }

    /// Old builds need an explicit `-acodec pcm_s16le` for WAV output.
    pub fn requires_explicit_pcm(&self) -> bool {
        self.get(Tool::Ffmpeg)
            .is_some_and(|t| !t.meets_version((4, 0, 0)))
    }

    /// Runtime probe: encode a second of synthetic video with the given
    /// encoder. Listing in `-encoders` only proves the build flag; this
    /// proves the device actually initializes.
    pub async fn probe_encoder(&self, encoder: &str) -> Result<bool> {
        let ffmpeg = self.require(Tool::Ffmpeg)?;
        let output = Command::new(&ffmpeg.path)
            .arg("-hide_banner")
            .arg("-f")
            .arg("lavfi")
            .arg("-i")
            .arg("nullsrc=s=256x256:d=1")
            .arg("-c:v")
            .arg(encoder)
            .arg("-f")
            .arg("null")
            .arg("-")
            .output()
            .await?;
        debug!(encoder, success = output.status.success(), "encoder probe");
        Ok(output.status.success())
    }
}

async fn detect_tool(tool: Tool, explicit: Option<&PathBuf>) -> Result<ToolInfo> {
    let path = match explicit {
        Some(path) => {
            if !path.exists() {
                return Err(CoreError::Config(format!(
                    "configured path for {tool} does not exist: {}",
                    path.display()
                )));
            }
            path.clone()
        }
        None => which(tool.binary_name()).ok_or_else(|| CoreError::ToolMissing {
            tool: tool.binary_name().to_string(),
        })?,
    };

    let version_output = Command::new(&path).arg("--version").output().await;
    // ffmpeg-family tools want -version; mkvtoolnix wants --version.
    let version_output = match version_output {
        Ok(out) if out.status.success() => out,
        _ => Command::new(&path).arg("-version").output().await?,
    };
    let first_line = String::from_utf8_lossy(&version_output.stdout)
        .lines()
        .next()
        .unwrap_or_default()
        .to_string();
    let version_triple = parse_version_triple(&first_line).unwrap_or((0, 0, 0));

    let capabilities = if tool == Tool::Ffmpeg {
        Some(detect_ffmpeg_capabilities(&path).await?)
    } else {
        None
    };

    Ok(ToolInfo {
        tool,
        path,
        version: first_line,
        version_triple,
        detected_at: Utc::now(),
        capabilities,
    })
}

async fn detect_ffmpeg_capabilities(path: &Path) -> Result<FfmpegCapabilities> {
    let encoders = list_names(path, "-encoders").await?;
    let muxers = list_names(path, "-muxers").await?;
    let filters = list_names(path, "-filters").await?;
    Ok(FfmpegCapabilities { encoders, muxers, filters })
}

/// Parse an ffmpeg listing (`-encoders`, `-muxers`, `-filters`): skip the
/// header, take the second whitespace-separated column.
async fn list_names(path: &Path, flag: &str) -> Result<HashSet<String>> {
    let output = Command::new(path)
        .arg("-hide_banner")
        .arg(flag)
        .output()
        .await?;
    let text = String::from_utf8_lossy(&output.stdout);
    Ok(parse_listing(&text))
}

fn parse_listing(text: &str) -> HashSet<String> {
    let mut names = HashSet::new();
    let mut in_body = false;
    for line in text.lines() {
        // The header ends with a divider line of dashes.
        if !in_body {
            if line.trim_start().starts_with("--") || line.contains("-----") {
                in_body = true;
            }
            continue;
        }
        let mut cols = line.split_whitespace();
        let (Some(_flags), Some(name)) = (cols.next(), cols.next()) else {
            continue;
        };
        names.insert(name.to_string());
    }
    names
}

/// Parse `X.Y[.Z]` out of a version banner line.
pub(crate) fn parse_version_triple(line: &str) -> Option<(u32, u32, u32)> {
    let digits_start = line.find(|c: char| c.is_ascii_digit())?;
    let tail = &line[digits_start..];
    let token: String = tail
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let mut parts = token.split('.').filter_map(|p| p.parse::<u32>().ok());
    let major = parts.next()?;
    let minor = parts.next().unwrap_or(0);
    let patch = parts.next().unwrap_or(0);
    Some((major, minor, patch))
}

/// Minimal PATH lookup.
fn which(binary: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(binary);
        if candidate.is_file() {
            return Some(candidate);
        }
        #[cfg(windows)]
        {
            let exe = dir.join(format!("{binary}.exe"));
            if exe.is_file() {
                return Some(exe);
            }
        }
    }
    None
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Registry with a fake ffmpeg entry carrying the given capabilities.
    pub fn fake_registry(
        version: (u32, u32, u32),
        encoders: &[&str],
        muxers: &[&str],
        filters: &[&str],
    ) -> ToolRegistry {
        let caps = FfmpegCapabilities {
            encoders: encoders.iter().map(|s| s.to_string()).collect(),
            muxers: muxers.iter().map(|s| s.to_string()).collect(),
            filters: filters.iter().map(|s| s.to_string()).collect(),
        };
        let mk = |tool: Tool, capabilities: Option<FfmpegCapabilities>| ToolInfo {
            tool,
            path: PathBuf::from(format!("/usr/bin/{}", tool.binary_name())),
            version: format!("{} version {}.{}.{}", tool.binary_name(), version.0, version.1, version.2),
            version_triple: version,
            detected_at: Utc::now(),
            capabilities,
        };
        ToolRegistry::from_parts(vec![
            mk(Tool::Ffmpeg, Some(caps)),
            mk(Tool::Ffprobe, None),
            mk(Tool::Mkvmerge, None),
            mk(Tool::Mkvpropedit, None),
        ])
    }
}
