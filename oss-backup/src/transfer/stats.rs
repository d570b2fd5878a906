//! Size and timing diagnostics for compressed artifacts.

use std::fmt;
use std::time::{Duration, Instant};

/// Original vs. compressed size of one artifact.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompressionStats {
    /// Bytes before compression
    pub original_bytes: u64,

    /// Bytes of the artifact on disk
    pub compressed_bytes: u64,

    /// Wall time spent compressing
    pub elapsed: Duration,
}

impl CompressionStats {
    pub fn new(original_bytes: u64, compressed_bytes: u64, elapsed: Duration) -> Self {
        Self {
            original_bytes,
            compressed_bytes,
            elapsed,
        }
    }

    /// compressed / original × 100. `None` for an empty original.
    pub fn ratio_percent(&self) -> Option<f64> {
        if self.original_bytes == 0 {
            return None;
        }
        Some(self.compressed_bytes as f64 / self.original_bytes as f64 * 100.0)
    }

    /// Original bytes consumed per second
    pub fn throughput(&self) -> u64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            (self.original_bytes as f64 / secs) as u64
        } else {
            0
        }
    }
}

impl fmt::Display for CompressionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {}",
            format_bytes(self.original_bytes),
            format_bytes(self.compressed_bytes)
        )?;
        if let Some(ratio) = self.ratio_percent() {
            write!(f, " ({:.2}%)", ratio)?;
        }
        write!(f, " in {}", format_duration(self.elapsed.as_secs()))
    }
}

/// Measures one stage from construction to [`StageTimer::finish`].
pub struct StageTimer {
    start_time: Instant,
}

impl StageTimer {
    pub fn start() -> Self {
        Self {
            start_time: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn finish(self, original_bytes: u64, compressed_bytes: u64) -> CompressionStats {
        CompressionStats::new(original_bytes, compressed_bytes, self.elapsed())
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format speed as human-readable string
pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

/// Format duration as human-readable string
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ratio_is_compressed_over_original() {
        let stats = CompressionStats::new(1000, 250, Duration::from_secs(1));
        assert!((stats.ratio_percent().unwrap() - 25.0).abs() < 0.001);
        assert_eq!(stats.throughput(), 1000);
    }

    #[test]
    fn test_ratio_omitted_for_empty_original() {
        let stats = CompressionStats::new(0, 13, Duration::ZERO);
        assert!(stats.ratio_percent().is_none());
        assert_eq!(stats.throughput(), 0);
        assert!(!stats.to_string().contains('%'));
    }

    #[test]
    fn test_display() {
        let stats = CompressionStats::new(2048, 1024, Duration::from_secs(90));
        assert_eq!(stats.to_string(), "2.00 KB -> 1.00 KB (50.00%) in 1m 30s");
    }

    #[test]
    fn test_timer_records_sizes() {
        let timer = StageTimer::start();
        let stats = timer.finish(10, 5);
        assert_eq!(stats.original_bytes, 10);
        assert_eq!(stats.compressed_bytes, 5);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1023), "1023.00 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
        assert_eq!(format_bytes(1024 * 1024 * 1024), "1.00 GB");
    }

    #[test]
    fn test_format_speed() {
        assert_eq!(format_speed(1024), "1.00 KB/s");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(30), "30s");
        assert_eq!(format_duration(90), "1m 30s");
        assert_eq!(format_duration(3665), "1h 1m");
    }
}
