//! Adam over named parameter tensors.
//!
//! Gate locations, gate temperatures and modal baselines are updated by
//! separate [`Adam`] instances so that each set keeps its own learning rate.

use std::collections::BTreeMap;

use ndarray::{Array, ArrayD, Dimension, Zip};

use crate::error::{CircuitError, Result};

/// Adam hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamConfig {
    /// Learning rate
    pub learning_rate: f32,
    /// Exponential decay rate for the first moment
    pub beta1: f32,
    /// Exponential decay rate for the second moment
    pub beta2: f32,
    /// Epsilon for numerical stability
    pub epsilon: f32,
}

impl AdamConfig {
    /// Standard betas with the given learning rate.
    pub fn with_learning_rate(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            ..Self::default()
        }
    }
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

/// Moment estimates of one tensor.
#[derive(Debug, Clone)]
struct Slot {
    m: ArrayD<f32>,
    v: ArrayD<f32>,
    t: i32,
}

/// Adam optimizer with one state slot per named tensor.
#[derive(Debug, Clone)]
pub struct Adam {
    config: AdamConfig,
    slots: BTreeMap<String, Slot>,
}

impl Adam {
    /// Create an optimizer with empty state.
    pub fn new(config: AdamConfig) -> Self {
        Self {
            config,
            slots: BTreeMap::new(),
        }
    }

    /// Hyperparameters.
    pub fn config(&self) -> &AdamConfig {
        &self.config
    }

    /// Number of steps taken for `name`.
    pub fn steps(&self, name: &str) -> usize {
        self.slots.get(name).map_or(0, |slot| slot.t as usize)
    }

    /// Update `params` in place from `grads`.
    ///
    /// 1. m_t = beta1 * m_{t-1} + (1 - beta1) * g_t
    /// 2. v_t = beta2 * v_{t-1} + (1 - beta2) * g_t^2
    /// 3. params -= lr * m_hat / (sqrt(v_hat) + epsilon), with bias-corrected
    ///    moments
    pub fn step<D: Dimension>(
        &mut self,
        name: &str,
        params: &mut Array<f32, D>,
        grads: &Array<f32, D>,
    ) -> Result<()> {
        if params.shape() != grads.shape() {
            return Err(CircuitError::shape_mismatch(name, params.shape(), grads.shape()));
        }
        let AdamConfig {
            learning_rate,
            beta1,
            beta2,
            epsilon,
        } = self.config;

        let slot = self.slots.entry(name.to_string()).or_insert_with(|| Slot {
            m: ArrayD::zeros(params.shape()),
            v: ArrayD::zeros(params.shape()),
            t: 0,
        });
        if slot.m.shape() != params.shape() {
            return Err(CircuitError::shape_mismatch(
                format!("optimizer state for {}", name),
                slot.m.shape(),
                params.shape(),
            ));
        }

        slot.t += 1;
        let bias_correction1 = 1.0 - beta1.powi(slot.t);
        let bias_correction2 = 1.0 - beta2.powi(slot.t);

        let m = slot.m.view_mut().into_dimensionality::<D>()?;
        let v = slot.v.view_mut().into_dimensionality::<D>()?;
        Zip::from(params)
            .and(grads)
            .and(m)
            .and(v)
            .for_each(|p, &g, m, v| {
                *m = beta1 * *m + (1.0 - beta1) * g;
                *v = beta2 * *v + (1.0 - beta2) * g * g;
                let m_hat = *m / bias_correction1;
                let v_hat = *v / bias_correction2;
                *p -= learning_rate * m_hat / (v_hat.sqrt() + epsilon);
            });
        Ok(())
    }

    /// Drop all moment estimates.
    pub fn reset(&mut self) {
        self.slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{ArrayD, IxDyn};

    #[test]
    fn test_adam_first_step_moves_by_learning_rate() {
        let mut adam = Adam::new(AdamConfig::with_learning_rate(0.1));
        let mut params = ArrayD::from_elem(IxDyn(&[2]), 1.0f32);
        let grads = ArrayD::from_shape_vec(IxDyn(&[2]), vec![0.5, -2.0]).unwrap();
        adam.step("w", &mut params, &grads).unwrap();
        // Bias-corrected first step is lr * sign(g).
        assert_relative_eq!(params[[0]], 0.9, epsilon = 1e-5);
        assert_relative_eq!(params[[1]], 1.1, epsilon = 1e-5);
        assert_eq!(adam.steps("w"), 1);
        assert_eq!(adam.steps("other"), 0);
    }

    #[test]
    fn test_adam_slots_are_independent() {
        let mut adam = Adam::new(AdamConfig::default());
        let mut a = ArrayD::zeros(IxDyn(&[3]));
        let mut b = ArrayD::zeros(IxDyn(&[2, 2]));
        for _ in 0..3 {
            adam.step("a", &mut a, &ArrayD::ones(IxDyn(&[3]))).unwrap();
        }
        adam.step("b", &mut b, &ArrayD::ones(IxDyn(&[2, 2]))).unwrap();
        assert_eq!(adam.steps("a"), 3);
        assert_eq!(adam.steps("b"), 1);
        assert!(a.iter().all(|&x| x < 0.0));
    }

    #[test]
    fn test_adam_rejects_shape_mismatch() {
        let mut adam = Adam::new(AdamConfig::default());
        let mut params = ArrayD::zeros(IxDyn(&[2]));
        assert!(adam.step("w", &mut params, &ArrayD::zeros(IxDyn(&[3]))).is_err());
    }
}
