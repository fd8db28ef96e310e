//! ffmpeg stderr progress parsing and metrics aggregation.
//!
//! ffmpeg reports status on stderr in the classic
//! `frame= 1234 fps= 48 q=28.0 size=  12345KiB time=00:08:41.36 bitrate=1943.1kbits/s speed=1.93x`
//! shape. Each parsed sample feeds the metrics aggregator (mean/peak fps,
//! mean bitrate, total frames) and the caller's progress callback.

use serde::{Deserialize, Serialize};

/// One parsed ffmpeg status sample.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FfmpegProgress {
    pub frame: Option<u64>,
    pub fps: Option<f64>,
    pub time_seconds: Option<f64>,
    pub bitrate_kbps: Option<f64>,
    pub speed: Option<f64>,
    /// 0.0-1.0 when the total duration is known.
    pub fraction: Option<f64>,
}

/// Parse one stderr line; returns None for non-status lines.
pub fn parse_progress_line(line: &str, total_duration: Option<f64>) -> Option<FfmpegProgress> {
    if !line.contains("frame=") && !line.contains("time=") {
        return None;
    }
    let frame = extract_value(line, "frame=").and_then(|v| v.parse().ok());
    let fps = extract_value(line, "fps=").and_then(|v| v.parse().ok());
    let time_seconds = extract_value(line, "time=").and_then(parse_clock_time);
    let bitrate_kbps = extract_value(line, "bitrate=").and_then(parse_bitrate);
    let speed = extract_value(line, "speed=")
        .map(|v| v.trim_end_matches(['x', 'X']).to_string())
        .and_then(|v| v.parse().ok());

    if frame.is_none() && time_seconds.is_none() {
        return None;
    }

    let fraction = match (time_seconds, total_duration) {
        (Some(t), Some(total)) if total > 0.0 => Some((t / total).clamp(0.0, 1.0)),
        _ => None,
    };

    Some(FfmpegProgress {
        frame,
        fps,
        time_seconds,
        bitrate_kbps,
        speed,
        fraction,
    })
}

/// Pull the value that follows `key` up to the next whitespace run.
/// ffmpeg pads values (`frame=  124`), so leading spaces are skipped.
fn extract_value<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let start = line.find(key)? + key.len();
    let rest = line[start..].trim_start();
    let end = rest
        .find(char::is_whitespace)
        .unwrap_or(rest.len());
    let value = &rest[..end];
    (!value.is_empty() && value != "N/A").then_some(value)
}

/// `hh:mm:ss.cc` to seconds.
fn parse_clock_time(raw: &str) -> Option<f64> {
    let mut parts = raw.split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// `1943.1kbits/s` (or mbits/bits variants) normalized to kbps.
fn parse_bitrate(raw: &str) -> Option<f64> {
    let lowered = raw.to_ascii_lowercase();
    let (number, factor) = if let Some(n) = lowered.strip_suffix("mbits/s") {
        (n, 1000.0)
    } else if let Some(n) = lowered.strip_suffix("kbits/s") {
        (n, 1.0)
    } else if let Some(n) = lowered.strip_suffix("bits/s") {
        (n, 0.001)
    } else {
        (lowered.as_str(), 1.0)
    };
    number.trim().parse::<f64>().ok().map(|v| v * factor)
}

/// Running aggregation over progress samples. Feeds the per-transcode
/// stats row.
#[derive(Debug, Default, Clone)]
pub struct MetricsAggregator {
    fps_sum: f64,
    fps_samples: u64,
    fps_peak: f64,
    bitrate_sum: f64,
    bitrate_samples: u64,
    last_frame: Option<u64>,
}

impl MetricsAggregator {
    pub fn record(&mut self, sample: &FfmpegProgress) {
        if let Some(fps) = sample.fps {
            if fps > 0.0 {
                self.fps_sum += fps;
                self.fps_samples += 1;
                if fps > self.fps_peak {
                    self.fps_peak = fps;
                }
            }
        }
        if let Some(bitrate) = sample.bitrate_kbps {
            if bitrate > 0.0 {
                self.bitrate_sum += bitrate;
                self.bitrate_samples += 1;
            }
        }
        if let Some(frame) = sample.frame {
            self.last_frame = Some(frame);
        }
    }

    pub fn mean_fps(&self) -> Option<f64> {
        (self.fps_samples > 0).then(|| self.fps_sum / self.fps_samples as f64)
    }

    pub fn peak_fps(&self) -> Option<f64> {
        (self.fps_samples > 0).then_some(self.fps_peak)
    }

    pub fn mean_bitrate_kbps(&self) -> Option<f64> {
        (self.bitrate_samples > 0).then(|| self.bitrate_sum / self.bitrate_samples as f64)
    }

    pub fn total_frames(&self) -> Option<u64> {
        self.last_frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATUS_LINE: &str = "frame= 1234 fps= 48 q=28.0 size=   12345KiB time=00:08:41.36 bitrate=1943.1kbits/s speed=1.93x";

    #[test]
    fn parses_status_line() {
        let sample = parse_progress_line(STATUS_LINE, Some(2.0 * 521.36)).unwrap();
        assert_eq!(sample.frame, Some(1234));
        assert_eq!(sample.fps, Some(48.0));
        assert!((sample.time_seconds.unwrap() - 521.36).abs() < 1e-6);
        assert!((sample.bitrate_kbps.unwrap() - 1943.1).abs() < 1e-6);
        assert!((sample.speed.unwrap() - 1.93).abs() < 1e-6);
        assert!((sample.fraction.unwrap() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn non_status_lines_ignored() {
        assert!(parse_progress_line("Press [q] to stop, [?] for help", None).is_none());
        assert!(parse_progress_line("[libx265] frame I: 52", None).is_none());
        assert!(parse_progress_line("Stream mapping:", None).is_none());
    }

    #[test]
    fn na_values_are_skipped() {
        let line = "frame=   10 fps=0.0 q=0.0 size=       0KiB time=00:00:00.40 bitrate=N/A speed=0.79x";
        let sample = parse_progress_line(line, None).unwrap();
        assert_eq!(sample.frame, Some(10));
        assert!(sample.bitrate_kbps.is_none());
    }

    #[test]
    fn bitrate_units() {
        assert_eq!(parse_bitrate("1943.1kbits/s"), Some(1943.1));
        assert_eq!(parse_bitrate("2.5mbits/s"), Some(2500.0));
        assert_eq!(parse_bitrate("800bits/s"), Some(0.8));
    }

    #[test]
    fn aggregator_mean_and_peak() {
        let mut agg = MetricsAggregator::default();
        for (fps, bitrate, frame) in [(30.0, 1000.0, 100), (60.0, 3000.0, 200), (45.0, 2000.0, 300)] {
            agg.record(&FfmpegProgress {
                frame: Some(frame),
                fps: Some(fps),
                bitrate_kbps: Some(bitrate),
                ..Default::default()
            });
        }
        assert_eq!(agg.mean_fps(), Some(45.0));
        assert_eq!(agg.peak_fps(), Some(60.0));
        assert_eq!(agg.mean_bitrate_kbps(), Some(2000.0));
        assert_eq!(agg.total_frames(), Some(300));
    }

    #[test]
    fn aggregator_empty_yields_none() {
        let agg = MetricsAggregator::default();
        assert_eq!(agg.mean_fps(), None);
        assert_eq!(agg.peak_fps(), None);
        assert_eq!(agg.mean_bitrate_kbps(), None);
        assert_eq!(agg.total_frames(), None);
    }
}
