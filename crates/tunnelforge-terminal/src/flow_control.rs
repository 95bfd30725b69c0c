//! Backpressure for transcript ingestion.
//!
//! While a session is paused its file watch is torn down, so nothing new is
//! read; lines that were already read are parked in a bounded queue and
//! drained in order once the emulator's buffer has room again.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowControlConfig {
    /// Pause when utilization rises above this.
    pub high_watermark: f64,
    /// Resume only once utilization is strictly below this.
    pub low_watermark: f64,
    /// How often paused sessions are re-checked.
    pub check_interval_ms: u64,
    pub max_pending_lines: usize,
    /// Paused sessions are force-resumed after this long, discarding the queue.
    pub max_pause_ms: u64,
    /// Utilization is evaluated once every this many lines.
    pub buffer_check_interval: usize,
}

impl Default for FlowControlConfig {
    fn default() -> Self {
        Self {
            high_watermark: 0.8,
            low_watermark: 0.5,
            check_interval_ms: 100,
            max_pending_lines: 10_000,
            max_pause_ms: 5 * 60 * 1000,
            buffer_check_interval: 100,
        }
    }
}

impl FlowControlConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms.max(1))
    }

    pub fn max_pause(&self) -> Duration {
        Duration::from_millis(self.max_pause_ms)
    }
}

/// What to do with a line handed to [`FlowControl::admit`].
#[derive(Debug, PartialEq, Eq)]
pub enum Admission {
    /// Apply it to the emulator now.
    Apply,
    /// It was queued. `just_paused` is set when this line tripped the high
    /// watermark and the caller must stop watching the file.
    Queued { just_paused: bool },
    /// The queue is full and the line was discarded.
    Dropped,
}

/// Outcome of a periodic check on a session.
#[derive(Debug, PartialEq, Eq)]
pub enum Tick {
    NotPaused,
    StillPaused,
    /// Utilization fell below the low watermark. Apply these lines in order,
    /// then restart the file watch.
    Resume(Vec<String>),
    /// Paused for too long. The queue was discarded; restart the file watch.
    TimedOut { discarded: usize },
}

#[derive(Debug)]
pub struct FlowControl {
    config: FlowControlConfig,
    paused: bool,
    pending: VecDeque<String>,
    paused_at: Option<Instant>,
    lines_since_check: usize,
    dropped: usize,
}

impl FlowControl {
    pub fn new(config: FlowControlConfig) -> Self {
        Self {
            config,
            paused: false,
            pending: VecDeque::new(),
            paused_at: None,
            lines_since_check: 0,
            dropped: 0,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn paused_at(&self) -> Option<Instant> {
        self.paused_at
    }

    /// Decide what happens to the next line. `utilization` is only called on
    /// check boundaries.
    pub fn admit(
        &mut self,
        session_id: &str,
        line: &str,
        now: Instant,
        utilization: impl FnOnce() -> f64,
    ) -> Admission {
        if self.paused {
            return self.enqueue(session_id, line);
        }

        self.lines_since_check += 1;
        if self.lines_since_check < self.config.buffer_check_interval.max(1) {
            return Admission::Apply;
        }
        self.lines_since_check = 0;

        let utilization = utilization();
        if utilization <= self.config.high_watermark {
            return Admission::Apply;
        }

        log::warn!(
            "Pausing {}: buffer utilization {:.1}% above high watermark",
            session_id,
            utilization * 100.0
        );
        self.paused = true;
        self.paused_at = Some(now);
        self.dropped = 0;
        match self.enqueue(session_id, line) {
            Admission::Queued { .. } => Admission::Queued { just_paused: true },
            other => other,
        }
    }

    fn enqueue(&mut self, session_id: &str, line: &str) -> Admission {
        if self.pending.len() >= self.config.max_pending_lines {
            if self.dropped == 0 {
                log::warn!(
                    "Pending queue for {} full ({} lines), dropping further output until resume",
                    session_id,
                    self.config.max_pending_lines
                );
            }
            self.dropped += 1;
            return Admission::Dropped;
        }
        self.pending.push_back(line.to_string());
        Admission::Queued { just_paused: false }
    }

    /// Re-evaluate a paused session.
    pub fn tick(&mut self, session_id: &str, utilization: f64, now: Instant) -> Tick {
        if !self.paused {
            return Tick::NotPaused;
        }

        let paused_for = self
            .paused_at
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or_default();
        if paused_for > self.config.max_pause() {
            let discarded = self.pending.len();
            log::warn!(
                "{} paused for {:?}, discarding {} queued lines ({} dropped)",
                session_id,
                paused_for,
                discarded,
                self.dropped
            );
            self.reset();
            return Tick::TimedOut { discarded };
        }

        if utilization < self.config.low_watermark {
            let lines: Vec<String> = self.pending.drain(..).collect();
            if self.dropped > 0 {
                log::warn!("Resuming {}: {} lines were dropped while paused", session_id, self.dropped);
            } else {
                log::info!("Resuming {} with {} queued lines", session_id, lines.len());
            }
            self.reset();
            return Tick::Resume(lines);
        }

        Tick::StillPaused
    }

    fn reset(&mut self) {
        self.paused = false;
        self.paused_at = None;
        self.pending.clear();
        self.lines_since_check = 0;
        self.dropped = 0;
    }
}
