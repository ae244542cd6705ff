use crate::{
    ap::{nan_mean, ApCalculator},
    common::*,
    detection::EvalImage,
    matching::{ApAccumulator, GtStatus, IouKind},
    voc::ClassRemap,
    DetectionMetric,
};

/// COCO-style mAP averaged over IoU thresholds 0.5:0.05:0.95 with 101-point
/// interpolation.
#[derive(Debug, Clone)]
pub struct CocoMApMetric {
    class_names: Vec<String>,
    remap: ClassRemap,
    iou_thresholds: Vec<f64>,
    accumulators: Vec<ApAccumulator>,
    calculator: ApCalculator,
}

impl CocoMApMetric {
    pub fn new(class_names: Vec<String>, class_map: Option<&[i64]>) -> Self {
        let iou_thresholds: Vec<_> = (0..10).map(|index| 0.5 + index as f64 * 0.05).collect();
        let accumulators = iou_thresholds
            .iter()
            .map(|&thresh| ApAccumulator::new(class_names.len(), thresh, IouKind::Continuous))
            .collect();

        Self {
            remap: ClassRemap::new(class_map),
            class_names,
            iou_thresholds,
            accumulators,
            calculator: ApCalculator::new_coco(),
        }
    }

    fn mean_ap_at(&self, iou_thresh: f64) -> f64 {
        self.iou_thresholds
            .iter()
            .zip(&self.accumulators)
            .find(|(thresh, _)| (**thresh - iou_thresh).abs() < 1e-9)
            .map(|(_, accumulator)| nan_mean(&accumulator.average_precisions(&self.calculator)))
            .unwrap_or(f64::NAN)
    }
}

impl DetectionMetric for CocoMApMetric {
    fn reset(&mut self) {
        self.accumulators.iter_mut().for_each(ApAccumulator::reset);
    }

    fn update(&mut self, image: &EvalImage) -> Result<()> {
        let detections = self.remap.remap(&image.detections);
        for accumulator in &mut self.accumulators {
            accumulator.add_image(&detections, &image.ground_truth, |_, gt| {
                if gt.difficult {
                    GtStatus::Ignored
                } else {
                    GtStatus::Counted
                }
            })?;
        }
        Ok(())
    }

    fn get(&self) -> (Vec<String>, Vec<f64>) {
        let per_threshold: Vec<Vec<f64>> = self
            .accumulators
            .iter()
            .map(|accumulator| accumulator.average_precisions(&self.calculator))
            .collect();

        // per class mean over thresholds
        let class_aps: Vec<f64> = (0..self.class_names.len())
            .map(|class| {
                let aps: Vec<_> = per_threshold.iter().map(|aps| aps[class]).collect();
                nan_mean(&aps)
            })
            .collect();

        let names = self
            .class_names
            .iter()
            .cloned()
            .chain(["mAP@[.5:.95]", "mAP@.5", "mAP@.75"].map(String::from))
            .collect();
        let values = class_aps
            .iter()
            .copied()
            .chain([nan_mean(&class_aps), self.mean_ap_at(0.5), self.mean_ap_at(0.75)])
            .collect();
        (names, values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::Detection;
    use approx::assert_abs_diff_eq;
    use label::Label;

    #[test]
    fn loose_box_drops_strict_thresholds() -> Result<()> {
        let mut metric = CocoMApMetric::new(vec!["person".into()], None);
        // IoU 0.64
        let image = EvalImage::new(
            vec![Detection {
                class: 0,
                score: r64(0.9),
                bbox: TLBR::from_xyxy([0.0, 0.0, 80.0, 80.0])?,
            }],
            vec![Label::new(TLBR::from_xyxy([0.0, 0.0, 100.0, 100.0])?, 0)],
        );
        metric.update(&image)?;

        let (names, values) = metric.get();
        assert_eq!(names.len(), 4);
        // thresholds 0.50, 0.55, 0.60 pass
        assert_abs_diff_eq!(values[0], 0.3, epsilon = 1e-9);
        assert_abs_diff_eq!(values[2], 1.0);
        assert_abs_diff_eq!(values[3], 0.0);
        Ok(())
    }
}
