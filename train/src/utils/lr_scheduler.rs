use crate::{common::*, config::LearningRateSchedule};
use std::f64::consts::PI;

/// Per-batch learning rate: a linear warmup followed by a step, poly or
/// cosine schedule.
#[derive(Debug, Clone)]
pub struct LrScheduler {
    base_lr: f64,
    warmup_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
    decay: Decay,
    step: usize,
    lr_cache: f64,
}

#[derive(Debug, Clone)]
enum Decay {
    Step { factor: f64, steps: Vec<usize> },
    Poly,
    Cosine,
}

impl LrScheduler {
    pub fn new(
        schedule: &LearningRateSchedule,
        base_lr: f64,
        warmup_lr: f64,
        warmup_epochs: usize,
        epochs: usize,
        steps_per_epoch: usize,
        init_step: impl Into<Option<usize>>,
    ) -> Result<Self> {
        ensure!(base_lr > 0.0, "the lr must be positive");
        ensure!(warmup_lr >= 0.0, "the warmup lr must be non-negative");
        ensure!(steps_per_epoch > 0, "an epoch must have at least one step");
        ensure!(
            warmup_epochs < epochs,
            "warmup epochs must be less than the training epochs"
        );

        let decay = match *schedule {
            LearningRateSchedule::Step { lr_decay, .. } => Decay::Step {
                factor: lr_decay.raw(),
                steps: schedule
                    .decay_epochs(epochs)
                    .into_iter()
                    .map(|epoch| epoch * steps_per_epoch)
                    .collect(),
            },
            LearningRateSchedule::Poly => Decay::Poly,
            LearningRateSchedule::Cosine => Decay::Cosine,
        };

        let mut scheduler = Self {
            base_lr,
            warmup_lr,
            warmup_steps: warmup_epochs * steps_per_epoch,
            total_steps: epochs * steps_per_epoch,
            decay,
            step: 0,
            lr_cache: 0.0,
        };
        scheduler.set_step(init_step.into().unwrap_or(0));

        Ok(scheduler)
    }

    pub fn set_step(&mut self, new_step: usize) {
        self.step = new_step;
        self.lr_cache = self.lr_at(new_step);
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn lr(&self) -> f64 {
        self.lr_cache
    }

    /// Returns the lr of the current step and advances.
    pub fn next(&mut self) -> f64 {
        let lr = self.lr_at(self.step);
        self.lr_cache = lr;
        self.step += 1;
        lr
    }

    fn lr_at(&self, step: usize) -> f64 {
        let Self {
            base_lr,
            warmup_lr,
            warmup_steps,
            total_steps,
            ..
        } = *self;

        if step < warmup_steps {
            return warmup_lr + (base_lr - warmup_lr) * step as f64 / warmup_steps as f64;
        }

        let span = (total_steps - warmup_steps) as f64;
        let progress = ((step - warmup_steps) as f64 / span).min(1.0);

        match &self.decay {
            Decay::Step { factor, steps } => {
                let num_decays = steps.iter().filter(|&&decay_step| decay_step <= step).count();
                base_lr * factor.powi(num_decays as i32)
            }
            Decay::Poly => base_lr * (1.0 - progress).powi(2),
            Decay::Cosine => base_lr * (1.0 + (PI * progress).cos()) / 2.0,
        }
    }
}
