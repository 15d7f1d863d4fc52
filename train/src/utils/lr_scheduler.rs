use crate::common::*;

/// The learning rate decays to this fraction of the initial rate at the last iteration.
const DECAY_FINAL_FRACTION: f64 = 0.001;

#[derive(Debug, Clone)]
pub enum LrScheduler {
    Constant {
        lr: R64,
    },
    ExponentialDecay {
        lr: R64,
        start: usize,
        end: usize,
    },
}

impl LrScheduler {
    /// Create a scheduler that decays exponentially from `decay_start` on, or a constant one.
    pub fn new(lr: f64, decay_start: Option<usize>, train_iterations: usize) -> Result<Self> {
        ensure!(lr.is_finite() && lr > 0.0, "the lr must be positive");
        let lr = r64(lr);

        let scheduler = match decay_start {
            Some(start) => {
                ensure!(
                    start < train_iterations,
                    "the decay must start before the last iteration"
                );
                Self::ExponentialDecay {
                    lr,
                    start,
                    end: train_iterations,
                }
            }
            None => Self::Constant { lr },
        };
        Ok(scheduler)
    }

    /// The learning rate at a training step.
    pub fn lr(&self, step: usize) -> f64 {
        match *self {
            Self::Constant { lr } => lr.raw(),
            Self::ExponentialDecay { lr, start, end } => {
                let progress = step.saturating_sub(start) as f64 / (end - start) as f64;
                lr.raw() * DECAY_FINAL_FRACTION.powf(progress)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_schedule() -> Result<()> {
        let scheduler = LrScheduler::new(3e-4, None, 100)?;
        assert_abs_diff_eq!(scheduler.lr(0), 3e-4);
        assert_abs_diff_eq!(scheduler.lr(99), 3e-4);
        Ok(())
    }

    #[test]
    fn exponential_decay_schedule() -> Result<()> {
        let scheduler = LrScheduler::new(1e-3, Some(15000), 25000)?;
        assert_abs_diff_eq!(scheduler.lr(0), 1e-3);
        assert_abs_diff_eq!(scheduler.lr(15000), 1e-3);
        assert_abs_diff_eq!(scheduler.lr(20000), 1e-3 * 0.001f64.sqrt(), epsilon = 1e-12);
        assert_abs_diff_eq!(scheduler.lr(25000), 1e-6, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn reject_invalid_schedule() {
        assert!(LrScheduler::new(0.0, None, 100).is_err());
        assert!(LrScheduler::new(1e-3, Some(100), 100).is_err());
    }
}
