//! Segment progress tracking with rate-bounded snapshots

use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// Progress of a multi-segment job
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentProgress {
    pub job_id: String,
    pub completed: usize,
    pub total: usize,
    /// Bytes received so far
    pub bytes: u64,
    /// 0.0 to 100.0
    pub percent: f64,
    /// Bytes per second since the job started
    pub speed: Option<f64>,
    /// Segments per second since the job started
    pub segments_per_second: Option<f64>,
    pub eta: Option<Duration>,
}

impl SegmentProgress {
    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.completed >= self.total
    }

    pub fn speed_string(&self) -> String {
        self.speed
            .map(format_bytes_per_second)
            .unwrap_or_else(|| "Unknown".to_string())
    }

    pub fn eta_string(&self) -> String {
        self.eta
            .map(format_duration)
            .unwrap_or_else(|| "Unknown".to_string())
    }
}

/// Accumulates segment completions and hands out snapshots no more often
/// than `interval`. The final snapshot is never suppressed.
#[derive(Debug)]
pub struct ProgressTracker {
    job_id: String,
    total: usize,
    completed: usize,
    bytes: u64,
    started: Instant,
    last_emit: Option<Instant>,
    interval: Duration,
}

impl ProgressTracker {
    pub fn new(job_id: &str, total: usize, interval: Duration) -> Self {
        Self {
            job_id: job_id.to_string(),
            total,
            completed: 0,
            bytes: 0,
            started: Instant::now(),
            last_emit: None,
            interval,
        }
    }

    /// Record one finished segment; returns a snapshot when one is due
    pub fn record(&mut self, bytes: usize) -> Option<SegmentProgress> {
        self.completed += 1;
        self.bytes += bytes as u64;

        let now = Instant::now();
        let due = match self.last_emit {
            None => true,
            Some(last) => now.duration_since(last) >= self.interval,
        };
        if due || self.completed >= self.total {
            self.last_emit = Some(now);
            Some(self.snapshot())
        } else {
            None
        }
    }

    pub fn completed(&self) -> usize {
        self.completed
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Current state regardless of throttling
    pub fn snapshot(&self) -> SegmentProgress {
        let percent = if self.total > 0 {
            (self.completed as f64 / self.total as f64) * 100.0
        } else {
            0.0
        };

        let elapsed = self.started.elapsed().as_secs_f64();
        let (speed, segments_per_second) = if elapsed > 0.0 {
            (
                Some(self.bytes as f64 / elapsed),
                Some(self.completed as f64 / elapsed),
            )
        } else {
            (None, None)
        };

        let eta = segments_per_second
            .filter(|rate| *rate > 0.0)
            .map(|rate| {
                let remaining = self.total.saturating_sub(self.completed) as f64;
                Duration::from_secs_f64(remaining / rate)
            });

        SegmentProgress {
            job_id: self.job_id.clone(),
            completed: self.completed,
            total: self.total,
            bytes: self.bytes,
            percent,
            speed,
            segments_per_second,
            eta,
        }
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    const THRESHOLD: f64 = 1024.0;

    if bytes == 0 {
        return "0 B".to_string();
    }

    let bytes_f64 = bytes as f64;
    let exp = (bytes_f64.ln() / THRESHOLD.ln()).floor() as usize;
    let exp = exp.min(UNITS.len() - 1);

    if exp == 0 {
        format!("{} {}", bytes, UNITS[exp])
    } else {
        format!("{:.1} {}", bytes_f64 / THRESHOLD.powi(exp as i32), UNITS[exp])
    }
}

pub fn format_bytes_per_second(bytes_per_second: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_second as u64))
}

/// Format duration as human-readable string
pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();

    if total_seconds < 60 {
        format!("{}s", total_seconds)
    } else if total_seconds < 3600 {
        let (minutes, seconds) = (total_seconds / 60, total_seconds % 60);
        if seconds == 0 {
            format!("{}m", minutes)
        } else {
            format!("{}m {}s", minutes, seconds)
        }
    } else {
        let (hours, minutes) = (total_seconds / 3600, (total_seconds % 3600) / 60);
        if minutes == 0 {
            format!("{}h", hours)
        } else {
            format!("{}h {}m", hours, minutes)
        }
    }
}
