use crate::{
    ap::{nan_mean, ApCalculator},
    common::*,
    detection::EvalImage,
    matching::{ApAccumulator, GtStatus, IouKind},
    voc::ClassRemap,
    DetectionMetric,
};

/// Motion speed bucket of a ground truth box, by its IoU with the same
/// object in neighboring frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MotionBucket {
    All,
    Slow,
    Medium,
    Fast,
}

impl MotionBucket {
    pub const ALL: [MotionBucket; 4] = [Self::All, Self::Slow, Self::Medium, Self::Fast];

    pub fn contains(&self, motion_iou: f64) -> bool {
        match self {
            Self::All => true,
            Self::Slow => motion_iou > 0.9,
            Self::Medium => (0.7..=0.9).contains(&motion_iou),
            Self::Fast => motion_iou < 0.7,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::All => "mAP",
            Self::Slow => "mAP_slow",
            Self::Medium => "mAP_medium",
            Self::Fast => "mAP_fast",
        }
    }
}

/// VOC mAP overall and per motion bucket, the ImageNet VID protocol.
///
/// Within a bucket, ground truth of other speeds is ignored along with the
/// detections matched to it.
#[derive(Debug, Clone)]
pub struct VidMApMetric {
    remap: ClassRemap,
    accumulators: Vec<(MotionBucket, ApAccumulator)>,
    calculator: ApCalculator,
}

impl VidMApMetric {
    pub fn new(iou_thresh: f64, num_classes: usize, class_map: Option<&[i64]>) -> Result<Self> {
        ensure!(
            (0.0..=1.0).contains(&iou_thresh),
            "IoU threshold must be in range [0, 1]"
        );
        let accumulators = MotionBucket::ALL
            .iter()
            .map(|&bucket| {
                (
                    bucket,
                    ApAccumulator::new(num_classes, iou_thresh, IouKind::Pixel),
                )
            })
            .collect();

        Ok(Self {
            remap: ClassRemap::new(class_map),
            accumulators,
            calculator: ApCalculator::new_voc(),
        })
    }
}

impl DetectionMetric for VidMApMetric {
    fn reset(&mut self) {
        self.accumulators
            .iter_mut()
            .for_each(|(_, accumulator)| accumulator.reset());
    }

    fn update(&mut self, image: &EvalImage) -> Result<()> {
        let motion_ious = image
            .motion_ious
            .as_ref()
            .ok_or_else(|| format_err!("the VID metric requires motion IoUs"))?;
        let detections = self.remap.remap(&image.detections);

        for (bucket, accumulator) in &mut self.accumulators {
            let bucket = *bucket;
            accumulator.add_image(&detections, &image.ground_truth, |index, gt| {
                if gt.difficult || !bucket.contains(motion_ious[index]) {
                    GtStatus::Ignored
                } else {
                    GtStatus::Counted
                }
            })?;
        }
        Ok(())
    }

    fn get(&self) -> (Vec<String>, Vec<f64>) {
        self.accumulators
            .iter()
            .map(|(bucket, accumulator)| {
                let aps = accumulator.average_precisions(&self.calculator);
                (bucket.name().to_string(), nan_mean(&aps))
            })
            .unzip()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::Detection;
    use approx::assert_abs_diff_eq;
    use label::Label;

    #[test]
    fn buckets_split_by_motion() -> Result<()> {
        let mut metric = VidMApMetric::new(0.5, 1, None)?;
        let image = EvalImage::new(
            vec![Detection {
                class: 0,
                score: r64(0.9),
                bbox: TLBR::from_xyxy([0.0, 0.0, 10.0, 10.0])?,
            }],
            vec![
                Label::new(TLBR::from_xyxy([0.0, 0.0, 10.0, 10.0])?, 0),
                Label::new(TLBR::from_xyxy([40.0, 40.0, 50.0, 50.0])?, 0),
            ],
        )
        .with_motion_ious(vec![0.95, 0.5])?;
        metric.update(&image)?;

        let (names, values) = metric.get();
        assert_eq!(names, vec!["mAP", "mAP_slow", "mAP_medium", "mAP_fast"]);
        assert_abs_diff_eq!(values[0], 0.5);
        assert_abs_diff_eq!(values[1], 1.0);
        assert!(values[2].is_nan());
        assert_abs_diff_eq!(values[3], 0.0);

        let without_motion = EvalImage::new(vec![], vec![]);
        assert!(metric.update(&without_motion).is_err());
        Ok(())
    }
}
