use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

/// Cross-cutting logger for pipeline orchestration events.
///
/// Stage workers report timings and queue depths here; the CLI chooses
/// whether they end up on stdout or nowhere.
pub trait PipelineLogger: Send {
    /// Report that `frames` frames have been captured so far.
    fn progress(&mut self, frames: u64);

    /// Record how long a named stage took for one unit of work.
    fn timing(&mut self, stage: &str, duration_ms: f64);

    /// Record a point-in-time metric such as a queue depth.
    fn metric(&mut self, name: &str, value: f64);

    fn info(&mut self, message: &str);

    /// Emit an end-of-run summary. Default: no-op.
    fn summary(&self) {}
}

/// Logger handle shared by every pipeline thread.
///
/// Each call holds the lock only for the duration of the record.
#[derive(Clone)]
pub struct SharedLogger(Arc<Mutex<Box<dyn PipelineLogger>>>);

impl SharedLogger {
    pub fn new(logger: Box<dyn PipelineLogger>) -> Self {
        Self(Arc::new(Mutex::new(logger)))
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut dyn PipelineLogger) -> R) -> R {
        let mut guard = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        f(guard.as_mut())
    }

    pub fn timing(&self, stage: &str, started: Instant) {
        let ms = started.elapsed().as_secs_f64() * 1000.0;
        self.with(|l| l.timing(stage, ms));
    }

    pub fn metric(&self, name: &str, value: f64) {
        self.with(|l| l.metric(name, value));
    }
}

/// Silent logger for tests and embedding callers.
pub struct NullPipelineLogger;

impl PipelineLogger for NullPipelineLogger {
    fn progress(&mut self, _frames: u64) {}
    fn timing(&mut self, _stage: &str, _duration_ms: f64) {}
    fn metric(&mut self, _name: &str, _value: f64) {}
    fn info(&mut self, _message: &str) {}
}

/// Running aggregate of one timing or metric series.
///
/// The camera source runs indefinitely, so samples are folded instead of
/// kept.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SeriesStats {
    pub count: u64,
    pub total: f64,
    pub max: f64,
}

impl SeriesStats {
    fn record(&mut self, value: f64) {
        self.count += 1;
        self.total += value;
        if self.count == 1 || value > self.max {
            self.max = value;
        }
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total / self.count as f64
        }
    }
}

/// CLI logger that aggregates per-stage timings and metrics and prints a
/// summary when the pipeline stops.
///
/// Progress lines are throttled to one every `throttle_frames` frames.
pub struct StdoutPipelineLogger {
    throttle_frames: u64,
    timings: BTreeMap<String, SeriesStats>,
    metrics: BTreeMap<String, SeriesStats>,
    start_time: Instant,
    frames: u64,
}

impl StdoutPipelineLogger {
    pub fn new(throttle_frames: u64) -> Self {
        Self {
            throttle_frames: throttle_frames.max(1),
            timings: BTreeMap::new(),
            metrics: BTreeMap::new(),
            start_time: Instant::now(),
            frames: 0,
        }
    }

    /// Returns the formatted summary, or `None` if nothing was recorded.
    pub fn summary_string(&self) -> Option<String> {
        if self.timings.is_empty() && self.metrics.is_empty() {
            return None;
        }

        let elapsed_s = self.start_time.elapsed().as_secs_f64();
        let mut lines = vec![format!(
            "Pipeline summary ({} frames, {elapsed_s:.1}s running):",
            self.frames
        )];

        for (stage, stats) in &self.timings {
            lines.push(format!(
                "  {stage:12}: avg {:6.1}ms  max {:6.1}ms  ({} calls)",
                stats.mean(),
                stats.max,
                stats.count
            ));
        }
        for (name, stats) in &self.metrics {
            lines.push(format!("  {name}: avg {:.1}  max {:.0}", stats.mean(), stats.max));
        }

        if self.frames > 0 && elapsed_s > 0.0 {
            lines.push(format!("  Throughput: {:.1} fps", self.frames as f64 / elapsed_s));
        }
        Some(lines.join("\n"))
    }

    pub fn timing_stats(&self, stage: &str) -> Option<SeriesStats> {
        self.timings.get(stage).copied()
    }

    pub fn metric_stats(&self, name: &str) -> Option<SeriesStats> {
        self.metrics.get(name).copied()
    }
}

impl Default for StdoutPipelineLogger {
    fn default() -> Self {
        Self::new(100)
    }
}

impl PipelineLogger for StdoutPipelineLogger {
    fn progress(&mut self, frames: u64) {
        self.frames = frames;
        if frames % self.throttle_frames == 0 {
            let elapsed = self.start_time.elapsed().as_secs_f64();
            log::info!("Captured {frames} frames ({elapsed:.0}s)");
        }
    }

    fn timing(&mut self, stage: &str, duration_ms: f64) {
        self.timings
            .entry(stage.to_string())
            .or_default()
            .record(duration_ms);
    }

    fn metric(&mut self, name: &str, value: f64) {
        self.metrics.entry(name.to_string()).or_default().record(value);
    }

    fn info(&mut self, message: &str) {
        log::info!("{message}");
    }

    fn summary(&self) {
        if let Some(text) = self.summary_string() {
            log::info!("\n\n{text}");
        }
    }
}
