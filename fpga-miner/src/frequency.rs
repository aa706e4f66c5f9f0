//! Clock tuning against an online error-rate model.
//!
//! Every frequency step keeps a decayed count of failed result checks. The
//! controller picks the step with the best expected throughput among the
//! steps whose smoothed maximum error rate stays under the ceiling, and
//! watches for two faults: the die running too hot, and the best achievable
//! throughput collapsing relative to the peak seen so far.

use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

use crate::device::DeviceDescriptor;

/// Decay applied to counts and weights on every recorded poll.
const DECAY: f64 = 0.995;

/// Bonus given to the current step when ranking steps.
const HYSTERESIS: f64 = 0.1;

/// Results are not judged for this long after new work was sent.
pub const DISPATCH_GRACE: Duration = Duration::from_millis(500);

/// Results are not judged for this long after a frequency change.
pub const FREQUENCY_GRACE: Duration = Duration::from_secs(2);

/// Controller settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrequencyConfig {
    /// Highest tolerated maximum error rate of a step.
    pub max_error_rate: f64,
    /// Relative throughput drop that is treated as a fault.
    pub overheat_threshold: f64,
    /// Temperature limit in degrees Celsius.
    pub temp_limit: f64,
}

impl Default for FrequencyConfig {
    fn default() -> Self {
        Self {
            max_error_rate: 0.05,
            overheat_threshold: 0.04,
            temp_limit: 65.0,
        }
    }
}

/// Faults detected by the controller. Both are fatal for the device.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FrequencyFault {
    #[error("overheating detected: T={temperature:.1}C (limit {limit:.1}C), unit shut down")]
    Thermal { temperature: f64, limit: f64 },

    #[error("hash rate drop of {drop_percent:.1}% detected, possibly caused by overheating, unit shut down")]
    Regression { drop_percent: f64 },
}

/// Error statistics of one frequency step.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ErrorRateBin {
    pub count: f64,
    pub weight: f64,
    pub rate: f64,
    pub max_rate: f64,
}

/// Per-unit frequency controller.
#[derive(Debug, Clone)]
pub struct FrequencyController {
    bins: Vec<ErrorRateBin>,
    default_step: u8,
    max_step: u8,
    current: u8,
    /// Best `(step + 1) * (1 - rate)` observed on a well-sampled step.
    peak: f64,
    freq_unit_mhz: f64,
    grace_until: Option<Instant>,
    config: FrequencyConfig,
}

impl FrequencyController {
    pub fn new(desc: &DeviceDescriptor, config: FrequencyConfig) -> Self {
        Self::with_steps(desc.default_step, desc.max_step, desc.freq_unit_mhz, config)
    }

    pub fn with_steps(default_step: u8, max_step: u8, freq_unit_mhz: f64, config: FrequencyConfig) -> Self {
        let default_step = default_step.min(max_step);
        Self {
            bins: vec![ErrorRateBin::default(); max_step as usize + 1],
            default_step,
            max_step,
            current: default_step,
            peak: f64::from(default_step) + 1.0,
            freq_unit_mhz,
            grace_until: None,
            config,
        }
    }

    pub fn current_step(&self) -> u8 {
        self.current
    }

    pub fn default_step(&self) -> u8 {
        self.default_step
    }

    /// Frequency of the current step in MHz.
    pub fn frequency_mhz(&self) -> f64 {
        Self::step_mhz(self.current, self.freq_unit_mhz)
    }

    fn step_mhz(step: u8, unit: f64) -> f64 {
        (f64::from(step) + 1.0) * unit
    }

    pub fn bin(&self, step: u8) -> ErrorRateBin {
        self.bins[step as usize]
    }

    /// Statistics of the current step.
    pub fn current_bin(&self) -> ErrorRateBin {
        self.bin(self.current)
    }

    pub fn peak(&self) -> f64 {
        self.peak
    }

    /// Open the grace window that follows a work dispatch.
    pub fn note_dispatch(&mut self, now: Instant) {
        self.extend_grace(now + DISPATCH_GRACE);
    }

    /// Open the grace window that follows a frequency change.
    pub fn note_frequency_change(&mut self, now: Instant) {
        self.extend_grace(now + FREQUENCY_GRACE);
    }

    fn extend_grace(&mut self, until: Instant) {
        self.grace_until = Some(self.grace_until.map_or(until, |t| t.max(until)));
    }

    pub fn in_grace(&self, now: Instant) -> bool {
        self.grace_until.is_some_and(|t| now < t)
    }

    /// Record the outcome of one poll: `failures` of `samples` result checks
    /// failed. Ignored inside the grace window. Returns whether the outcome
    /// was recorded.
    pub fn record_outcomes(&mut self, failures: usize, samples: usize, now: Instant) -> bool {
        if self.in_grace(now) || samples == 0 {
            return false;
        }

        let step = self.current;
        let bin = &mut self.bins[step as usize];
        bin.count = bin.count * DECAY + failures as f64 / samples as f64;
        bin.weight = bin.weight * DECAY + 1.0;
        bin.rate = bin.count / bin.weight * (bin.weight * 0.01).min(1.0);
        if bin.rate > bin.max_rate {
            bin.max_rate = bin.rate;
        }
        if bin.weight > 120.0 {
            self.peak = self.peak.max((f64::from(step) + 1.0) * (1.0 - bin.rate));
        }
        true
    }

    /// Smooth the maximum error rates in place and return the step with
    /// the best expected throughput.
    ///
    /// Smoothing raises each step's maximum error rate to at least
    /// `max[i] * (1 + 20/i)`, so a step is never believed to be much better
    /// than the one below it. A non-zero rate at step 0 becomes infinite and
    /// pins the unit to step 0.
    pub fn recommend_step(&mut self) -> u8 {
        let max_step = self.max_step as usize;
        for i in 0..max_step {
            let fi = i as f64;
            if self.bins[i + 1].max_rate * fi < self.bins[i].max_rate * (fi + 20.0) {
                self.bins[i + 1].max_rate = self.bins[i].max_rate * (1.0 + 20.0 / fi);
            }
        }

        let ceiling = self.config.max_error_rate;
        let mut max_m = 0usize;
        while max_m < self.default_step as usize && self.bins[max_m + 1].max_rate < ceiling {
            max_m += 1;
        }
        while max_m < max_step
            && self.bins[max_m].weight > 150.0
            && self.bins[max_m + 1].max_rate < ceiling
        {
            max_m += 1;
        }

        let mut best = 0usize;
        let mut best_r = 0.0;
        for i in 0..=max_m {
            let bonus = if i == self.current as usize { HYSTERESIS } else { 0.0 };
            let r = (i as f64 + 1.0 + bonus) * (1.0 - self.bins[i].max_rate);
            if r > best_r {
                best = i;
                best_r = r;
            }
        }
        // Bounded by max_step, which fits in u8.
        best.min(max_step) as u8
    }

    /// Run one tuning round.
    ///
    /// Returns the new step if the clock should change. `temperature` is
    /// `None` when the sensor could not be read, which is not a fault.
    pub fn evaluate(&mut self, temperature: Option<f64>) -> Result<Option<u8>, FrequencyFault> {
        let best = self.recommend_step();
        let changed = if best != self.current {
            self.current = best;
            Some(best)
        } else {
            None
        };

        let mut near = self.default_step as usize;
        while near < self.max_step as usize && self.bins[near + 1].weight > 100.0 {
            near += 1;
        }
        let best_f = f64::from(best) + 1.0;
        if best_f < (1.0 - self.config.overheat_threshold) * self.peak && (best as usize) + 1 < near {
            return Err(FrequencyFault::Regression {
                drop_percent: (1.0 - best_f / self.peak) * 100.0,
            });
        }

        if let Some(temperature) = temperature {
            if temperature > self.config.temp_limit {
                return Err(FrequencyFault::Thermal {
                    temperature,
                    limit: self.config.temp_limit,
                });
            }
        }

        Ok(changed)
    }

    /// Describe a step change for logs.
    pub fn describe_change(&self, from: u8, to: u8) -> String {
        format!(
            "{:.2}MHz -> {:.2}MHz",
            Self::step_mhz(from, self.freq_unit_mhz),
            Self::step_mhz(to, self.freq_unit_mhz)
        )
    }

    /// Forget most of the collected statistics.
    ///
    /// The default step first moves up over well-sampled steps below the
    /// current one, so the next search starts from proven ground.
    pub fn reset_counters(&mut self) {
        while self.default_step < self.current
            && self.bins[self.default_step as usize + 1].weight > 100.0
        {
            self.default_step += 1;
        }
        for bin in &mut self.bins {
            bin.count *= 0.05;
            bin.weight *= 0.05;
            bin.rate = 0.0;
            bin.max_rate = 0.0;
        }
    }
}
