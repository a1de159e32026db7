//! Wall-clock instrumentation for registrations.
//!
//! Timing is collected only when the `profiling` feature is enabled. Without
//! the feature, [`Timer`], [`TimingCollector`] and [`time_phase!`] compile to
//! no-ops.

use serde::{Deserialize, Serialize};
use std::time::Duration;
#[cfg(feature = "profiling")]
use std::time::Instant;

/// Phases of a registration that are timed separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Building target geometry and the loss.
    Setup,
    /// One loss + gradient evaluation (shooting, attachment, backward pass).
    Evaluation,
}

/// Timing breakdown for a single registration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchTiming {
    pub total_ms: f64,
    pub setup_ms: f64,
    /// Sum over all loss evaluations.
    pub evaluation_ms: f64,
    pub evaluations: usize,
    /// Per outer step breakdown.
    pub steps: Vec<StepTiming>,
}

/// Timing for one outer optimizer step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepTiming {
    pub iteration: usize,
    pub total_ms: f64,
    pub evaluation_ms: f64,
    pub evaluations: usize,
}

impl StepTiming {
    /// Mean time of one evaluation in this step.
    pub fn mean_evaluation_ms(&self) -> f64 {
        if self.evaluations == 0 {
            0.0
        } else {
            self.evaluation_ms / self.evaluations as f64
        }
    }
}

/// Timer that can be enabled/disabled at compile time.
#[cfg(feature = "profiling")]
pub struct Timer {
    start: Instant,
    name: &'static str,
}

#[cfg(feature = "profiling")]
impl Timer {
    #[inline]
    pub fn new(name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            name,
        }
    }

    #[inline]
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    #[inline]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// No-op timer when profiling is disabled.
#[cfg(not(feature = "profiling"))]
pub struct Timer;

#[cfg(not(feature = "profiling"))]
impl Timer {
    #[inline(always)]
    pub fn new(_name: &'static str) -> Self {
        Self
    }

    #[inline(always)]
    pub fn elapsed_ms(&self) -> f64 {
        0.0
    }

    #[inline(always)]
    pub fn elapsed(&self) -> Duration {
        Duration::ZERO
    }

    #[inline(always)]
    pub fn name(&self) -> &'static str {
        ""
    }
}

/// Collector for timing data during a registration.
#[cfg(feature = "profiling")]
#[derive(Debug, Default)]
pub struct TimingCollector {
    match_start: Option<Instant>,
    step_start: Option<Instant>,
    current_step: StepTiming,
    timing: MatchTiming,
}

#[cfg(feature = "profiling")]
impl TimingCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_match(&mut self) {
        self.match_start = Some(Instant::now());
        self.timing = MatchTiming::default();
    }

    pub fn start_step(&mut self, iteration: usize) {
        self.step_start = Some(Instant::now());
        self.current_step = StepTiming {
            iteration,
            ..Default::default()
        };
    }

    pub fn record_phase(&mut self, phase: Phase, duration_ms: f64) {
        match phase {
            Phase::Setup => self.timing.setup_ms += duration_ms,
            Phase::Evaluation => {
                self.timing.evaluation_ms += duration_ms;
                self.timing.evaluations += 1;
                self.current_step.evaluation_ms += duration_ms;
                self.current_step.evaluations += 1;
            }
        }
    }

    /// Close the current step and return its timing.
    pub fn end_step(&mut self) -> StepTiming {
        let mut step = std::mem::take(&mut self.current_step);
        step.total_ms = self
            .step_start
            .take()
            .map(|s| s.elapsed().as_secs_f64() * 1000.0)
            .unwrap_or(0.0);
        self.timing.steps.push(step.clone());
        step
    }

    pub fn finish(&mut self) -> MatchTiming {
        self.timing.total_ms = self
            .match_start
            .take()
            .map(|s| s.elapsed().as_secs_f64() * 1000.0)
            .unwrap_or(0.0);

        std::mem::take(&mut self.timing)
    }
}

/// No-op collector when profiling is disabled.
#[cfg(not(feature = "profiling"))]
#[derive(Debug, Default)]
pub struct TimingCollector;

#[cfg(not(feature = "profiling"))]
impl TimingCollector {
    #[inline(always)]
    pub fn new() -> Self {
        Self
    }

    #[inline(always)]
    pub fn start_match(&mut self) {}

    #[inline(always)]
    pub fn start_step(&mut self, _iteration: usize) {}

    #[inline(always)]
    pub fn record_phase(&mut self, _phase: Phase, _duration_ms: f64) {}

    #[inline(always)]
    pub fn end_step(&mut self) -> StepTiming {
        StepTiming::default()
    }

    #[inline(always)]
    pub fn finish(&mut self) -> MatchTiming {
        MatchTiming::default()
    }
}

/// Time a block and record it under a [`Phase`].
///
/// Usage:
/// ```ignore
/// let value = time_phase!(collector, Phase::Evaluation, {
///     loss.value_and_gradient(&momentum)
/// });
/// ```
#[macro_export]
macro_rules! time_phase {
    ($collector:expr, $phase:expr, $block:expr) => {{
        #[cfg(feature = "profiling")]
        let _timer = $crate::timing::Timer::new(stringify!($phase));

        let result = $block;

        #[cfg(feature = "profiling")]
        $collector.record_phase($phase, _timer.elapsed_ms());

        result
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timing_collector() {
        let mut collector = TimingCollector::new();

        collector.start_match();
        collector.record_phase(Phase::Setup, 4.0);
        collector.start_step(0);
        collector.record_phase(Phase::Evaluation, 1.0);
        collector.record_phase(Phase::Evaluation, 3.0);
        let step = collector.end_step();

        let timing = collector.finish();

        #[cfg(feature = "profiling")]
        {
            assert_eq!(step.evaluations, 2);
            assert_eq!(step.mean_evaluation_ms(), 2.0);
            assert_eq!(timing.steps.len(), 1);
            assert_eq!(timing.setup_ms, 4.0);
            assert_eq!(timing.evaluation_ms, 4.0);
        }

        #[cfg(not(feature = "profiling"))]
        {
            assert_eq!(step.mean_evaluation_ms(), 0.0);
            assert_eq!(timing.total_ms, 0.0);
            assert!(timing.steps.is_empty());
        }
    }
}
