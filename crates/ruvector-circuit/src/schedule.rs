//! Annealing of the temperature-regularization coefficient.
//!
//! The coefficient is zero during warmup. Afterwards it starts at `start` and
//! is multiplied by `factor` (up to `end`) on every step where the training
//! log shows the complexity loss has stopped declining, which pushes
//! temperatures towards zero and the gates towards hard 0/1 decisions once
//! sparsity has plateaued.

use tracing::debug;

use crate::config::TemperatureScheduleConfig;
use crate::log::TrainingLog;

/// Plateau-driven schedule for the temperature-regularization coefficient.
#[derive(Debug, Clone)]
pub struct TemperatureSchedule {
    config: TemperatureScheduleConfig,
    current: f32,
    advances: usize,
}

impl TemperatureSchedule {
    /// Schedule at its post-warmup starting value.
    pub fn new(config: TemperatureScheduleConfig) -> Self {
        Self {
            current: config.start,
            config,
            advances: 0,
        }
    }

    /// Coefficient for the step about to be taken, advancing the schedule if
    /// the log shows a complexity plateau.
    pub fn step(&mut self, log: &TrainingLog) -> f32 {
        if log.t() < self.config.warmup_steps {
            return 0.0;
        }
        let stalled = log
            .stat_sig_growth("complexity_loss")
            .map_or(false, |(decline, _)| decline < self.config.stall_threshold);
        if stalled && self.current < self.config.end {
            self.current = (self.current * self.config.factor).min(self.config.end);
            self.advances += 1;
            debug!(
                coefficient = self.current,
                advances = self.advances,
                "temperature schedule advanced"
            );
        }
        self.current
    }

    /// Coefficient after warmup without advancing.
    pub fn coefficient(&self) -> f32 {
        self.current
    }

    /// Return to the starting value.
    pub fn reset(&mut self) {
        self.current = self.config.start;
        self.advances = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::collections::BTreeMap;

    fn flat_log(steps: usize) -> TrainingLog {
        let mut log = TrainingLog::new(["complexity_loss"]);
        let entry: BTreeMap<String, f32> =
            [("complexity_loss".to_string(), 3.0)].into_iter().collect();
        for _ in 0..steps {
            log.add_entry(&entry);
        }
        log
    }

    #[test]
    fn test_zero_during_warmup() {
        let mut schedule = TemperatureSchedule::new(TemperatureScheduleConfig::default());
        assert_eq!(schedule.step(&flat_log(10)), 0.0);
        assert_eq!(schedule.coefficient(), 1e-4);
    }

    #[test]
    fn test_advances_on_plateau_up_to_end() {
        let config = TemperatureScheduleConfig {
            warmup_steps: 0,
            start: 0.01,
            end: 0.02,
            factor: 1.5,
            stall_threshold: 5e-3,
        };
        let mut schedule = TemperatureSchedule::new(config);
        // Too little history to detect a plateau: hold the start value.
        assert_relative_eq!(schedule.step(&flat_log(50)), 0.01);
        let log = flat_log(300);
        assert_relative_eq!(schedule.step(&log), 0.015, epsilon = 1e-7);
        assert_relative_eq!(schedule.step(&log), 0.02);
        assert_relative_eq!(schedule.step(&log), 0.02);
        schedule.reset();
        assert_relative_eq!(schedule.coefficient(), 0.01);
    }
}
