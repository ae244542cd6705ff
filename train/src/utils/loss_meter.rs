use crate::common::*;
use yolo_vid::YoloLossOutput;

/// Running means of the loss terms over an epoch.
#[derive(Debug, Clone, Default)]
pub struct LossMeter {
    count: usize,
    objectness: f64,
    center: f64,
    scale: f64,
    class: f64,
}

/// Mean loss terms, named as in logs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossMeans {
    pub objectness: f64,
    pub center: f64,
    pub scale: f64,
    pub class: f64,
}

impl LossMeans {
    pub const NAMES: [&'static str; 4] = ["ObjLoss", "BoxCenterLoss", "BoxScaleLoss", "ClassLoss"];

    pub fn values(&self) -> [f64; 4] {
        [self.objectness, self.center, self.scale, self.class]
    }

    /// `ObjLoss=..., BoxCenterLoss=..., BoxScaleLoss=..., ClassLoss=...`
    pub fn to_log_string(&self) -> String {
        izip!(Self::NAMES, self.values())
            .map(|(name, value)| format!("{}={:.3}", name, value))
            .join(", ")
    }
}

impl LossMeter {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn update(&mut self, losses: &YoloLossOutput) {
        self.update_values(
            f64::from(&losses.objectness_loss),
            f64::from(&losses.center_loss),
            f64::from(&losses.scale_loss),
            f64::from(&losses.class_loss),
        );
    }

    pub fn update_values(&mut self, objectness: f64, center: f64, scale: f64, class: f64) {
        self.count += 1;
        self.objectness += objectness;
        self.center += center;
        self.scale += scale;
        self.class += class;
    }

    pub fn means(&self) -> LossMeans {
        let count = self.count.max(1) as f64;
        LossMeans {
            objectness: self.objectness / count,
            center: self.center / count,
            scale: self.scale / count,
            class: self.class / count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_means() {
        let mut meter = LossMeter::default();
        meter.update_values(1.0, 2.0, 3.0, 4.0);
        meter.update_values(3.0, 2.0, 1.0, 0.0);

        let means = meter.means();
        assert_eq!(means.values(), [2.0, 2.0, 2.0, 2.0]);
        assert_eq!(
            means.to_log_string(),
            "ObjLoss=2.000, BoxCenterLoss=2.000, BoxScaleLoss=2.000, ClassLoss=2.000"
        );

        meter.reset();
        assert_eq!(meter.means().values(), [0.0; 4]);
    }
}
