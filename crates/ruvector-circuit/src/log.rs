//! Training statistics and the early-termination signal.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::EarlyStopConfig;
use crate::error::Result;

/// Steps averaged into one rolling or historical mean.
const AVG_WINDOW: usize = 10;
/// How far back historical windows reach.
const COMPARE_WINDOW: usize = 200;

/// Per-step training statistics, one series per key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingLog {
    series: BTreeMap<String, Vec<f32>>,
    t: usize,
}

impl TrainingLog {
    /// Log tracking `keys`.
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            series: keys.into_iter().map(|k| (k.into(), Vec::new())).collect(),
            t: 0,
        }
    }

    /// Number of entries added.
    pub fn t(&self) -> usize {
        self.t
    }

    /// Tracked keys.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.series.keys().map(String::as_str)
    }

    /// Full series of `key`.
    pub fn series(&self, key: &str) -> Option<&[f32]> {
        self.series.get(key).map(Vec::as_slice)
    }

    /// Most recent value of `key`.
    pub fn last(&self, key: &str) -> Option<f32> {
        self.series.get(key).and_then(|s| s.last().copied())
    }

    /// Append one step. Tracked keys missing from `entry` repeat their last
    /// value (zero on the first step); keys that are not tracked are ignored.
    pub fn add_entry(&mut self, entry: &BTreeMap<String, f32>) {
        for (key, series) in self.series.iter_mut() {
            let value = match entry.get(key) {
                Some(&v) => v,
                None => series.last().copied().unwrap_or(0.0),
            };
            series.push(value);
        }
        for key in entry.keys().filter(|k| !self.series.contains_key(*k)) {
            debug!(key = %key, "untracked log key ignored");
        }
        self.t += 1;
    }

    /// Relative decline and growth of the last 10-step mean of `key`
    /// compared with the 10% and 90% quantiles of 10-step means taken 100 to
    /// 200 steps back: `(1 - rolling / q10, rolling / q90 - 1)`.
    ///
    /// A series that sits at zero in both windows has neither declined nor
    /// grown. Returns `None` while the log is too short, when `key` is not
    /// tracked, or when a ratio is undefined (zero quantile, non-zero mean).
    pub fn stat_sig_growth(&self, key: &str) -> Option<(f32, f32)> {
        if self.t <= COMPARE_WINDOW + AVG_WINDOW + 1 {
            return None;
        }
        let series = self.series.get(key)?;
        let n = series.len();
        if n <= COMPARE_WINDOW + AVG_WINDOW + 1 {
            return None;
        }
        let historical: Vec<f32> = (COMPARE_WINDOW / 2..COMPARE_WINDOW)
            .step_by(AVG_WINDOW / 3)
            .map(|i| mean(&series[n - i - AVG_WINDOW - 1..n - i - 1]))
            .collect();
        let rolling = mean(&series[n - AVG_WINDOW..]);
        let q10 = quantile(&historical, 0.1);
        let q90 = quantile(&historical, 0.9);
        Some((1.0 - ratio(rolling, q10)?, ratio(rolling, q90)? - 1.0))
    }

    /// Write the log as JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    /// Read a log written by [`TrainingLog::save`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Ok(serde_json::from_slice(&fs::read(path)?)?)
    }
}

/// `num / den`, with `0 / 0` read as no change.
fn ratio(num: f32, den: f32) -> Option<f32> {
    if den == 0.0 {
        return (num == 0.0).then_some(1.0);
    }
    let r = num / den;
    r.is_finite().then_some(r)
}

fn mean(values: &[f32]) -> f32 {
    values.iter().sum::<f32>() / values.len().max(1) as f32
}

/// Linearly interpolated quantile.
fn quantile(values: &[f32], q: f32) -> f32 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    if sorted.is_empty() {
        return f32::NAN;
    }
    let pos = q * (sorted.len() - 1) as f32;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f32)
}

/// Counter that grows while training has stopped making progress.
#[derive(Debug, Clone)]
pub struct EarlyTermination {
    config: EarlyStopConfig,
    count: usize,
}

impl EarlyTermination {
    /// Fresh counter.
    pub fn new(config: EarlyStopConfig) -> Self {
        Self { config, count: 0 }
    }

    /// Current counter value.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Whether the counter has reached the configured patience.
    pub fn should_stop(&self) -> bool {
        self.count >= self.config.patience
    }

    /// Update from the latest log state and return the counter.
    ///
    /// Increments when KL and complexity declines are both below their
    /// thresholds and the average temperature has settled; otherwise
    /// decreases by 2, floored at zero. Inactive before `min_steps`.
    pub fn update(&mut self, log: &TrainingLog) -> usize {
        if log.t() < self.config.min_steps {
            return 0;
        }
        let kl = log.stat_sig_growth("kl_loss").map(|(decline, _)| decline);
        let complexity = log.stat_sig_growth("complexity_loss").map(|(decline, _)| decline);
        let temp = log.last("temp");
        let stalled = match (kl, complexity, temp) {
            (Some(kl), Some(complexity), Some(temp)) => {
                kl < self.config.kl_decline
                    && complexity < self.config.decline_pct
                    && temp < self.config.temperature_threshold
            }
            _ => false,
        };
        if stalled {
            self.count += 1;
        } else {
            self.count = self.count.saturating_sub(2);
        }
        self.count
    }
}
