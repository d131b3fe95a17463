use std::collections::VecDeque;

use serde::Serialize;

use crate::utils::now_epoch_ms;

const DEFAULT_WINDOW_SIZE: usize = 256;
const LLM_P95_TARGET_MS: u64 = 15_000;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSummary {
    pub samples: usize,
    pub average_ms: u64,
    pub p95_ms: u64,
    pub max_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceReport {
    pub generated_at_ms: u64,
    pub capture: MetricSummary,
    pub llm: MetricSummary,
    pub apply: MetricSummary,
    pub end_to_end: MetricSummary,
    pub completed_sessions: u64,
    pub dropped_triggers: u64,
    pub invalid_selections: u64,
    pub llm_failures: u64,
    pub apply_failures: u64,
    pub warnings: Vec<String>,
}

#[derive(Debug)]
struct RollingMetric {
    values: VecDeque<u64>,
    capacity: usize,
}

impl RollingMetric {
    fn new(capacity: usize) -> Self {
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn record(&mut self, value_ms: u64) {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value_ms);
    }

    fn summary(&self) -> MetricSummary {
        if self.values.is_empty() {
            return MetricSummary::default();
        }

        let samples = self.values.len();
        let sum: u64 = self.values.iter().sum();
        let mut sorted = self.values.iter().copied().collect::<Vec<_>>();
        sorted.sort_unstable();
        let p95_index = ((samples as f64 * 0.95).ceil() as usize)
            .saturating_sub(1)
            .min(samples - 1);

        MetricSummary {
            samples,
            average_ms: sum / samples as u64,
            p95_ms: sorted[p95_index],
            max_ms: sorted[samples - 1],
        }
    }
}

/// Latency windows and failure counters for the capture/process/apply cycle.
#[derive(Debug)]
pub struct RuntimeMetrics {
    capture_ms: RollingMetric,
    llm_ms: RollingMetric,
    apply_ms: RollingMetric,
    end_to_end_ms: RollingMetric,
    completed_sessions: u64,
    dropped_triggers: u64,
    invalid_selections: u64,
    llm_failures: u64,
    apply_failures: u64,
}

impl RuntimeMetrics {
    pub fn new() -> Self {
        Self {
            capture_ms: RollingMetric::new(DEFAULT_WINDOW_SIZE),
            llm_ms: RollingMetric::new(DEFAULT_WINDOW_SIZE),
            apply_ms: RollingMetric::new(DEFAULT_WINDOW_SIZE),
            end_to_end_ms: RollingMetric::new(DEFAULT_WINDOW_SIZE),
            completed_sessions: 0,
            dropped_triggers: 0,
            invalid_selections: 0,
            llm_failures: 0,
            apply_failures: 0,
        }
    }

    pub fn record_capture(&mut self, elapsed_ms: u64) {
        self.capture_ms.record(elapsed_ms);
    }

    pub fn record_llm(&mut self, elapsed_ms: u64) {
        self.llm_ms.record(elapsed_ms);
    }

    pub fn record_apply(&mut self, elapsed_ms: u64) {
        self.apply_ms.record(elapsed_ms);
    }

    pub fn record_end_to_end(&mut self, elapsed_ms: u64) {
        self.end_to_end_ms.record(elapsed_ms);
        self.completed_sessions += 1;
    }

    pub fn record_dropped_trigger(&mut self) {
        self.dropped_triggers += 1;
    }

    pub fn record_invalid_selection(&mut self) {
        self.invalid_selections += 1;
    }

    pub fn record_llm_failure(&mut self) {
        self.llm_failures += 1;
    }

    pub fn record_apply_failure(&mut self) {
        self.apply_failures += 1;
    }

    pub fn report(&self) -> PerformanceReport {
        let llm = self.llm_ms.summary();

        let mut warnings = Vec::new();
        if llm.samples > 0 && llm.p95_ms > LLM_P95_TARGET_MS {
            warnings.push(format!(
                "LLM P95 latency {}ms exceeded target {}ms.",
                llm.p95_ms, LLM_P95_TARGET_MS
            ));
        }
        if self.apply_failures > 0 {
            warnings.push(format!(
                "{} apply attempts failed; check accessibility permissions.",
                self.apply_failures
            ));
        }

        PerformanceReport {
            generated_at_ms: now_epoch_ms(),
            capture: self.capture_ms.summary(),
            llm,
            apply: self.apply_ms.summary(),
            end_to_end: self.end_to_end_ms.summary(),
            completed_sessions: self.completed_sessions,
            dropped_triggers: self.dropped_triggers,
            invalid_selections: self.invalid_selections,
            llm_failures: self.llm_failures,
            apply_failures: self.apply_failures,
            warnings,
        }
    }
}

impl Default for RuntimeMetrics {
    fn default() -> Self {
        Self::new()
    }
}
