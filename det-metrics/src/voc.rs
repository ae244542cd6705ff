use crate::{
    ap::{nan_mean, ApCalculator},
    common::*,
    detection::{Detection, EvalImage},
    matching::{ApAccumulator, GtStatus, IouKind},
    DetectionMetric,
};

/// Remaps predicted class indices into the evaluated class list.
#[derive(Debug, Clone)]
pub(crate) struct ClassRemap {
    pred_to_eval: Option<HashMap<usize, usize>>,
}

impl ClassRemap {
    /// `class_map[eval_class]` holds the predicted class index, or a
    /// negative value when the model does not know the class.
    pub fn new(class_map: Option<&[i64]>) -> Self {
        let pred_to_eval = class_map.map(|class_map| {
            class_map
                .iter()
                .enumerate()
                .filter(|(_, &pred)| pred >= 0)
                .map(|(eval, &pred)| (pred as usize, eval))
                .collect()
        });
        Self { pred_to_eval }
    }

    pub fn remap(&self, detections: &[Detection]) -> Vec<Detection> {
        match &self.pred_to_eval {
            None => detections.to_vec(),
            Some(map) => detections
                .iter()
                .filter_map(|det| {
                    let class = *map.get(&det.class)?;
                    Some(Detection {
                        class,
                        ..det.clone()
                    })
                })
                .collect(),
        }
    }
}

/// Mean average precision in the PASCAL VOC protocol.
#[derive(Debug, Clone)]
pub struct VocMApMetric {
    class_names: Vec<String>,
    remap: ClassRemap,
    accumulator: ApAccumulator,
    calculator: ApCalculator,
}

impl VocMApMetric {
    pub fn new(
        iou_thresh: f64,
        class_names: Vec<String>,
        class_map: Option<&[i64]>,
        use_07_metric: bool,
    ) -> Result<Self> {
        ensure!(
            (0.0..=1.0).contains(&iou_thresh),
            "IoU threshold must be in range [0, 1]"
        );
        if let Some(class_map) = class_map {
            ensure!(
                class_map.len() == class_names.len(),
                "class map has {} entries, but {} classes are evaluated",
                class_map.len(),
                class_names.len()
            );
        }

        let calculator = if use_07_metric {
            ApCalculator::new_voc07()
        } else {
            ApCalculator::new_voc()
        };

        Ok(Self {
            accumulator: ApAccumulator::new(class_names.len(), iou_thresh, IouKind::Pixel),
            remap: ClassRemap::new(class_map),
            class_names,
            calculator,
        })
    }
}

impl DetectionMetric for VocMApMetric {
    fn reset(&mut self) {
        self.accumulator.reset();
    }

    fn update(&mut self, image: &EvalImage) -> Result<()> {
        let detections = self.remap.remap(&image.detections);
        self.accumulator
            .add_image(&detections, &image.ground_truth, |_, gt| {
                if gt.difficult {
                    GtStatus::Ignored
                } else {
                    GtStatus::Counted
                }
            })
    }

    fn get(&self) -> (Vec<String>, Vec<f64>) {
        let aps = self.accumulator.average_precisions(&self.calculator);
        let mean_ap = nan_mean(&aps);

        let names = self
            .class_names
            .iter()
            .cloned()
            .chain(iter::once("mAP".to_string()))
            .collect();
        let values = aps.into_iter().chain(iter::once(mean_ap)).collect();
        (names, values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use label::Label;

    fn names() -> Vec<String> {
        vec!["cat".into(), "dog".into()]
    }

    #[test]
    fn perfect_and_missed_classes() -> Result<()> {
        let mut metric = VocMApMetric::new(0.5, names(), None, false)?;
        let image = EvalImage::new(
            vec![Detection {
                class: 0,
                score: r64(0.8),
                bbox: TLBR::from_xyxy([10.0, 10.0, 50.0, 50.0])?,
            }],
            vec![
                Label::new(TLBR::from_xyxy([10.0, 10.0, 50.0, 50.0])?, 0),
                Label::new(TLBR::from_xyxy([60.0, 60.0, 90.0, 90.0])?, 1),
            ],
        );
        metric.update(&image)?;

        let (names, values) = metric.get();
        assert_eq!(names, vec!["cat", "dog", "mAP"]);
        assert_abs_diff_eq!(values[0], 1.0);
        assert_abs_diff_eq!(values[1], 0.0);
        assert_abs_diff_eq!(values[2], 0.5);

        metric.reset();
        let (_, values) = metric.get();
        assert!(values.iter().all(|value| value.is_nan()));
        Ok(())
    }

    #[test]
    fn class_map_translates_predictions() -> Result<()> {
        // model class 3 is "dog", "cat" is unknown to the model
        let class_map = [-1, 3];
        let mut metric = VocMApMetric::new(0.5, names(), Some(&class_map), true)?;
        let image = EvalImage::new(
            vec![
                Detection {
                    class: 3,
                    score: r64(0.9),
                    bbox: TLBR::from_xyxy([0.0, 0.0, 20.0, 20.0])?,
                },
                Detection {
                    class: 0,
                    score: r64(0.9),
                    bbox: TLBR::from_xyxy([0.0, 0.0, 20.0, 20.0])?,
                },
            ],
            vec![Label::new(TLBR::from_xyxy([0.0, 0.0, 20.0, 20.0])?, 1)],
        );
        metric.update(&image)?;

        let (_, values) = metric.get();
        assert!(values[0].is_nan());
        assert_abs_diff_eq!(values[1], 1.0);
        assert_abs_diff_eq!(values[2], 1.0);
        assert!(VocMApMetric::new(0.5, names(), Some(&[0]), true).is_err());
        Ok(())
    }
}
