use std::f32::consts::PI;
use std::str::FromStr;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerKind {
    Cosine,
    Linear,
    Constant,
    /// warmup, stable, decay
    Wsd,
}

impl FromStr for SchedulerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "cosine" => Ok(SchedulerKind::Cosine),
            "linear" => Ok(SchedulerKind::Linear),
            "constant" => Ok(SchedulerKind::Constant),
            "wsd" => Ok(SchedulerKind::Wsd),
            other => Err(Error::Config(format!("unknown learning rate scheduler {other:?}"))),
        }
    }
}

/// Learning rate as a function of the optimizer step.
#[derive(Debug, Clone)]
pub struct LearningRateScheduler {
    pub kind: SchedulerKind,
    pub max_lr: f32,
    pub warmup_steps: usize,
    pub max_steps: usize,
    pub final_lr_frac: f32,
}

impl LearningRateScheduler {
    pub fn new(kind: SchedulerKind, max_lr: f32, warmup_steps: usize, max_steps: usize, final_lr_frac: f32) -> Self {
        Self { kind, max_lr, warmup_steps, max_steps, final_lr_frac }
    }

    pub fn min_lr(&self) -> f32 {
        self.max_lr * self.final_lr_frac
    }

    fn warmup(&self, step: usize) -> f32 {
        self.max_lr * (step + 1) as f32 / self.warmup_steps as f32
    }

    /// Fraction of the decay phase `[from, max_steps]` covered at `step`.
    fn decay_ratio(&self, step: usize, from: usize) -> f32 {
        if self.max_steps <= from {
            return 1.0;
        }
        ((step - from) as f32 / (self.max_steps - from) as f32).clamp(0.0, 1.0)
    }

    /// cosine: linear warmup to max LR, cosine decay to the minimum LR at
    /// `max_steps`, and the minimum LR afterwards
    fn cosine(&self, step: usize) -> f32 {
        if step < self.warmup_steps {
            return self.warmup(step);
        }
        if step > self.max_steps {
            return self.min_lr();
        }
        let decay_ratio = self.decay_ratio(step, self.warmup_steps);
        let coeff = 0.5 * (1.0 + (PI * decay_ratio).cos()); // coeff starts at 1 and goes to 0
        self.min_lr() + coeff * (self.max_lr - self.min_lr())
    }

    fn linear(&self, step: usize) -> f32 {
        if step < self.warmup_steps {
            return self.warmup(step);
        }
        let decay_ratio = self.decay_ratio(step, self.warmup_steps);
        self.max_lr - decay_ratio * (self.max_lr - self.min_lr())
    }

    /// https://arxiv.org/abs/2405.18392, last 20% decays as 1 - sqrt
    fn wsd(&self, step: usize) -> f32 {
        let decay_point = (0.8 * self.max_steps as f32) as usize;
        if step < self.warmup_steps {
            self.warmup(step)
        } else if step < decay_point {
            self.max_lr
        } else {
            let decay_ratio = self.decay_ratio(step, decay_point);
            self.min_lr() + (1.0 - decay_ratio.sqrt()) * (self.max_lr - self.min_lr())
        }
    }

    pub fn get_learning_rate(&self, step: usize) -> f32 {
        match self.kind {
            SchedulerKind::Cosine => self.cosine(step),
            SchedulerKind::Linear => self.linear(step),
            SchedulerKind::Constant => self.max_lr,
            SchedulerKind::Wsd => self.wsd(step),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_approx_eq(actual: f32, expected: f32) {
        const TOLERANCE: f32 = 1e-6;
        assert!(
            (actual - expected).abs() < TOLERANCE,
            "Expected {} to be approximately equal to {} (tolerance: {})",
            actual,
            expected,
            TOLERANCE
        );
    }

    #[test]
    fn test_constant_scheduler() {
        let scheduler = LearningRateScheduler::new(SchedulerKind::Constant, 0.001, 0, 100, 1.0);
        assert_eq!(scheduler.get_learning_rate(0), 0.001);
        assert_eq!(scheduler.get_learning_rate(100), 0.001);
    }

    #[test]
    fn test_cosine_scheduler() {
        let scheduler = LearningRateScheduler::new(SchedulerKind::Cosine, 6e-4, 10, 110, 0.1);
        assert_approx_eq(scheduler.get_learning_rate(0), 6e-5);
        assert_approx_eq(scheduler.get_learning_rate(9), 6e-4);
        assert_approx_eq(scheduler.get_learning_rate(10), 6e-4);
        // halfway through the decay the cosine sits between max and min
        assert_approx_eq(scheduler.get_learning_rate(60), 6e-5 + 0.5 * (6e-4 - 6e-5));
        assert_approx_eq(scheduler.get_learning_rate(110), 6e-5);
        assert_approx_eq(scheduler.get_learning_rate(5000), 6e-5);
    }

    #[test]
    fn test_linear_scheduler() {
        let scheduler = LearningRateScheduler::new(SchedulerKind::Linear, 0.001, 10, 110, 0.1);
        assert_approx_eq(scheduler.get_learning_rate(0), 0.0001);
        assert_approx_eq(scheduler.get_learning_rate(5), 0.0006);
        assert_approx_eq(scheduler.get_learning_rate(60), 0.00055);
        assert_approx_eq(scheduler.get_learning_rate(110), 0.0001);
    }

    #[test]
    fn test_wsd_scheduler() {
        let scheduler = LearningRateScheduler::new(SchedulerKind::Wsd, 0.001, 10, 100, 0.0);
        assert_approx_eq(scheduler.get_learning_rate(50), 0.001);
        assert_approx_eq(scheduler.get_learning_rate(80), 0.001);
        assert_approx_eq(scheduler.get_learning_rate(100), 0.0);
    }

    #[test]
    fn test_parse_kind() {
        assert_eq!("wsd".parse::<SchedulerKind>().unwrap(), SchedulerKind::Wsd);
        assert!("step".parse::<SchedulerKind>().is_err());
    }
}
