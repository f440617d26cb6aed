//  Copyright 2024 SRA Tools Authors
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

//! The memory-budget sampler (§5 and §10.6): projects total resident memory from a
//! handful of early samples and fails the load before it actually exhausts the
//! configured ceiling, rather than after.

use spot_common::error::{LoaderError, Result};

/// Samples taken past 10% progress feed a two-point line fit projecting usage at 50%.
const LINE_FIT_HORIZON: f64 = 0.50;
/// Before this fraction of input consumed, projection is a direct ratio from the
/// current live-spot density instead of a line fit (too few samples to fit a line yet).
const EARLY_PHASE_HORIZON: f64 = 0.10;
/// A projection (immediate or 50%-horizon) exceeding this multiple of the configured
/// limit, for more than 3 consecutive samples, fails the load.
const OVER_BUDGET_FACTOR: f64 = 1.25;
/// Consecutive over-budget samples tolerated before failing (the 4th fails).
const MAX_CONSECUTIVE_OVER: u32 = 3;

#[derive(Debug, Clone, Copy)]
pub struct MemorySample {
    pub live_spot_memory: u64,
    pub current_spot_count: u64,
    pub reference_memory: u64,
    pub filter_memory: u64,
}

impl MemorySample {
    fn ambient(self) -> u64 {
        self.reference_memory + self.filter_memory
    }
}

/// Owns the projection state across a load: the early-phase density estimate and the
/// two-point line fit used between 10% and 50% progress, plus the consecutive-overage
/// counter that turns a sustained prediction into [`LoaderError::OutOfMemoryPrediction`].
#[derive(Debug)]
pub struct MemorySampler {
    limit_bytes: u64,
    unknown_length: bool,
    line_fit_points: Vec<(f64, f64)>,
    consecutive_over: u32,
}

impl MemorySampler {
    pub fn new(limit_bytes: u64, unknown_length: bool) -> Self {
        Self { limit_bytes, unknown_length, line_fit_points: Vec::new(), consecutive_over: 0 }
    }

    /// Takes one sample. `progress` is the fraction of the input stream consumed so
    /// far (`0.0..=1.0`); callers with unknown-length input should pass `0.0` and rely
    /// on [`Self`] having been constructed with `unknown_length = true` instead.
    pub fn sample(&mut self, progress: f64, sample: MemorySample) -> Result<()> {
        if self.unknown_length {
            // No stream length to project against; this is actual current usage, not a
            // noisy extrapolation, so a single over-budget sample fails immediately
            // instead of waiting out the consecutive-overage streak below.
            let actual = (sample.live_spot_memory + sample.ambient()) as f64;
            let threshold = OVER_BUDGET_FACTOR * self.limit_bytes as f64;
            return if actual > threshold {
                Err(LoaderError::OutOfMemoryPrediction { projected: actual as u64, limit: self.limit_bytes, consecutive: 1 })
            } else {
                Ok(())
            };
        }
        let projected = if progress < EARLY_PHASE_HORIZON {
            self.project_early_phase(progress, sample)
        } else {
            self.project_line_fit(progress.min(LINE_FIT_HORIZON), sample)
        };
        self.check(projected)
    }

    fn project_early_phase(&self, progress: f64, sample: MemorySample) -> f64 {
        if sample.current_spot_count == 0 || progress <= 0.0 {
            return sample.ambient() as f64;
        }
        let per_spot = sample.live_spot_memory as f64 / sample.current_spot_count as f64;
        let projected_spot_count = sample.current_spot_count as f64 / progress;
        per_spot * projected_spot_count + sample.ambient() as f64
    }

    fn project_line_fit(&mut self, progress: f64, sample: MemorySample) -> f64 {
        let total = (sample.live_spot_memory + sample.ambient()) as f64;
        self.line_fit_points.push((progress, total));
        if self.line_fit_points.len() < 2 {
            return total;
        }
        let (x1, y1) = self.line_fit_points[self.line_fit_points.len() - 2];
        let (x2, y2) = self.line_fit_points[self.line_fit_points.len() - 1];
        if (x2 - x1).abs() < f64::EPSILON {
            return total;
        }
        let m = (y2 - y1) / (x2 - x1);
        let b = y1 - m * x1;
        let projected_at_horizon = m * LINE_FIT_HORIZON + b;
        projected_at_horizon.max(total)
    }

    fn check(&mut self, projected: f64) -> Result<()> {
        let threshold = OVER_BUDGET_FACTOR * self.limit_bytes as f64;
        if projected > threshold {
            self.consecutive_over += 1;
            if self.consecutive_over > MAX_CONSECUTIVE_OVER {
                return Err(LoaderError::OutOfMemoryPrediction {
                    projected: projected as u64,
                    limit: self.limit_bytes,
                    consecutive: self.consecutive_over,
                });
            }
        } else {
            self.consecutive_over = 0;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(live: u64, count: u64) -> MemorySample {
        MemorySample { live_spot_memory: live, current_spot_count: count, reference_memory: 0, filter_memory: 0 }
    }

    #[test]
    fn comfortably_under_budget_never_trips() {
        let mut sampler = MemorySampler::new(1_000_000, false);
        for i in 1..20 {
            let progress = i as f64 / 20.0;
            assert!(sampler.sample(progress, sample(1_000, i * 10)).is_ok());
        }
    }

    #[test]
    fn sustained_overage_fails_after_three_consecutive_samples() {
        let mut sampler = MemorySampler::new(100, false);
        // Early-phase projection: tiny progress with huge live memory relative to spot
        // count blows the extrapolated total far past budget every time.
        for i in 0..3 {
            let result = sampler.sample(0.01, sample(1_000_000, 10));
            assert!(result.is_ok(), "sample {i} should not yet trip the failure");
        }
        let result = sampler.sample(0.01, sample(1_000_000, 10));
        assert!(result.is_err(), "the 4th consecutive over-budget sample must fail");
    }

    #[test]
    fn a_single_healthy_sample_resets_the_streak() {
        let mut sampler = MemorySampler::new(100, false);
        for _ in 0..3 {
            sampler.sample(0.01, sample(1_000_000, 10)).unwrap();
        }
        sampler.sample(0.01, sample(1, 1_000_000)).unwrap();
        assert!(sampler.sample(0.01, sample(1_000_000, 10)).is_ok(), "streak must have reset");
    }

    #[test]
    fn unknown_length_input_checks_current_usage_directly() {
        let mut sampler = MemorySampler::new(100, true);
        assert!(sampler.sample(0.0, sample(10, 1)).is_ok());
        assert!(sampler.sample(0.0, MemorySample { live_spot_memory: 1_000, current_spot_count: 1, reference_memory: 0, filter_memory: 0 }).is_err());
    }
}
