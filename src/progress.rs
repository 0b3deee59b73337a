//! Progress reporting for long scans (ingest, embed).
//!
//! Progress is emitted on stderr so stdout stays parseable; machine
//! formats pass [`NoProgress`]. Embedding progress is measured in bytes
//! processed, which gives a stable ETA regardless of chunk counts.

use std::io::Write;
use std::sync::Mutex;
use std::time::Instant;

pub trait ProgressSink: Send + Sync {
    fn begin(&self, label: &str, total_bytes: u64);
    fn advance(&self, bytes: u64);
    fn finish(&self);
}

/// No-op sink for machine formats and tests.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn begin(&self, _label: &str, _total_bytes: u64) {}
    fn advance(&self, _bytes: u64) {}
    fn finish(&self) {}
}

struct BarState {
    label: String,
    total: u64,
    done: u64,
    started: Instant,
}

/// Single-line stderr progress bar using the erase-line escape.
pub struct StderrProgress {
    state: Mutex<Option<BarState>>,
}

impl StderrProgress {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(None),
        }
    }

    fn render(state: &BarState) {
        let pct = if state.total == 0 {
            100.0
        } else {
            state.done as f64 / state.total as f64 * 100.0
        };
        let eta = eta_seconds(state.done, state.total, state.started.elapsed().as_secs_f64());
        let line = format!(
            "\x1b[2K\r{}  {:>5.1}%  {} / {}  ETA {}",
            state.label,
            pct.min(100.0),
            format_bytes(state.done),
            format_bytes(state.total),
            format_eta(eta),
        );
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

impl Default for StderrProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for StderrProgress {
    fn begin(&self, label: &str, total_bytes: u64) {
        let mut state = self.state.lock().expect("progress lock");
        *state = Some(BarState {
            label: label.to_string(),
            total: total_bytes,
            done: 0,
            started: Instant::now(),
        });
        if let Some(s) = state.as_ref() {
            Self::render(s);
        }
    }

    fn advance(&self, bytes: u64) {
        let mut state = self.state.lock().expect("progress lock");
        if let Some(s) = state.as_mut() {
            s.done += bytes;
            Self::render(s);
        }
    }

    fn finish(&self) {
        let mut state = self.state.lock().expect("progress lock");
        if state.take().is_some() {
            let mut stderr = std::io::stderr().lock();
            let _ = stderr.write_all(b"\x1b[2K\r");
            let _ = stderr.flush();
        }
    }
}

fn eta_seconds(done: u64, total: u64, elapsed: f64) -> Option<u64> {
    if done == 0 || total == 0 || done >= total {
        return None;
    }
    let rate = done as f64 / elapsed.max(0.001);
    Some(((total - done) as f64 / rate).round() as u64)
}

pub fn format_bytes(n: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = n as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{n} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

pub fn format_eta(eta: Option<u64>) -> String {
    match eta {
        None => "--".to_string(),
        Some(s) if s < 60 => format!("{s}s"),
        Some(s) if s < 3600 => format!("{}m{:02}s", s / 60, s % 60),
        Some(s) => format!("{}h{:02}m", s / 3600, (s % 3600) / 60),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_formatting() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MiB");
    }

    #[test]
    fn eta_formatting() {
        assert_eq!(format_eta(None), "--");
        assert_eq!(format_eta(Some(42)), "42s");
        assert_eq!(format_eta(Some(90)), "1m30s");
        assert_eq!(format_eta(Some(7200)), "2h00m");
    }

    #[test]
    fn eta_requires_progress() {
        assert_eq!(eta_seconds(0, 100, 5.0), None);
        assert_eq!(eta_seconds(100, 100, 5.0), None);
        let eta = eta_seconds(50, 100, 5.0).unwrap();
        assert!((4..=6).contains(&eta), "half done in 5s means roughly 5s left");
    }
}
