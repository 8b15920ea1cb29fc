use burn::config::Config;
use burn::LearningRate;

/// Lowers the learning rate once a maximised metric stops improving.
#[derive(Config, Debug)]
pub struct ReduceLrOnPlateauConfig {
    /// Multiplier applied to the learning rate on every reduction.
    #[config(default = 0.5)]
    pub factor: f64,
    /// Number of epochs without improvement that are tolerated before reducing.
    #[config(default = 3)]
    pub patience: usize,
    /// Relative improvement required for a metric to count as better.
    #[config(default = 1.0e-4)]
    pub threshold: f64,
    /// Epochs to wait after a reduction before counting bad epochs again.
    #[config(default = 0)]
    pub cooldown: usize,
    #[config(default = 0.0)]
    pub min_lr: f64,
    /// Reductions smaller than this are skipped.
    #[config(default = 1.0e-8)]
    pub eps: f64,
}

impl ReduceLrOnPlateauConfig {
    pub fn init(&self, initial_lr: LearningRate) -> ReduceLrOnPlateau {
        ReduceLrOnPlateau {
            config: self.clone(),
            lr: initial_lr,
            best: f64::NEG_INFINITY,
            num_bad_epochs: 0,
            cooldown_counter: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReduceLrOnPlateau {
    config: ReduceLrOnPlateauConfig,
    lr: LearningRate,
    best: f64,
    num_bad_epochs: usize,
    cooldown_counter: usize,
}

impl ReduceLrOnPlateau {
    pub fn lr(&self) -> LearningRate {
        self.lr
    }

    /// Record the metric of the epoch that just finished and return the learning rate for the next one.
    pub fn step(&mut self, metric: f64) -> LearningRate {
        if metric > self.best * (1.0 + self.config.threshold) {
            self.best = metric;
            self.num_bad_epochs = 0;
        } else {
            self.num_bad_epochs += 1;
        }

        if self.cooldown_counter > 0 {
            self.cooldown_counter -= 1;
            self.num_bad_epochs = 0;
        }

        if self.num_bad_epochs > self.config.patience {
            let reduced = (self.lr * self.config.factor).max(self.config.min_lr);
            if self.lr - reduced > self.config.eps {
                tracing::info!(from = self.lr, to = reduced, "Reducing learning rate");
                self.lr = reduced;
            }
            self.cooldown_counter = self.config.cooldown;
            self.num_bad_epochs = 0;
        }

        self.lr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reduces_only_after_patience_is_exceeded() {
        let mut scheduler = ReduceLrOnPlateauConfig::new().init(1.0);

        // First epoch always improves on the initial best.
        assert_eq!(scheduler.step(0.5), 1.0);
        for _ in 0..3 {
            assert_eq!(scheduler.step(0.5), 1.0);
        }
        assert_eq!(scheduler.step(0.5), 0.5);
        // The bad epoch counter restarts after a reduction.
        assert_eq!(scheduler.step(0.5), 0.5);
    }

    #[test]
    fn improvement_resets_patience() {
        let mut scheduler = ReduceLrOnPlateauConfig::new().with_patience(1).init(1.0);

        scheduler.step(0.1);
        scheduler.step(0.1);
        scheduler.step(0.2);
        assert_eq!(scheduler.step(0.2), 1.0);
        assert_eq!(scheduler.step(0.2), 0.5);
    }

    #[test]
    fn tiny_improvements_do_not_count() {
        let mut scheduler = ReduceLrOnPlateauConfig::new().with_patience(0).init(1.0);

        scheduler.step(0.5);
        assert_eq!(scheduler.step(0.500_001), 0.5);
    }

    #[test]
    fn respects_min_lr_and_cooldown() {
        let mut scheduler = ReduceLrOnPlateauConfig::new()
            .with_patience(0)
            .with_cooldown(1)
            .with_min_lr(0.3)
            .init(1.0);

        scheduler.step(0.5);
        assert_eq!(scheduler.step(0.4), 0.5);
        // Cooldown swallows this bad epoch.
        assert_eq!(scheduler.step(0.4), 0.5);
        assert_eq!(scheduler.step(0.4), 0.3);
        assert_eq!(scheduler.step(0.4), 0.3);
        assert_eq!(scheduler.step(0.4), 0.3);
    }
}
