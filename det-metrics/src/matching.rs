use crate::{ap::ApCalculator, common::*, detection::Detection};
use log::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchKind {
    TruePositive,
    FalsePositive,
    /// Matched a ground truth box excluded from evaluation.
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GtStatus {
    Counted,
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IouKind {
    /// Inclusive pixel coordinates, the VOC convention.
    Pixel,
    Continuous,
}

impl IouKind {
    fn iou(&self, lhs: &TLBR<f64>, rhs: &TLBR<f64>) -> f64 {
        match self {
            Self::Pixel => lhs.pixel_iou_with(rhs),
            Self::Continuous => lhs.iou_with(rhs, 1e-12),
        }
    }
}

/// Greedily matches detections of one class in one image, highest score first.
///
/// Each detection is paired with the ground truth of highest IoU. A pair
/// below the threshold, or with a ground truth already taken, is a false
/// positive.
pub fn match_detections(
    detections: &[&Detection],
    ground_truth: &[(&TLBR<f64>, GtStatus)],
    iou_thresh: f64,
    iou_kind: IouKind,
) -> Vec<(R64, MatchKind)> {
    let mut detections = detections.to_vec();
    detections.sort_by_key(|det| -det.score);
    let mut taken = vec![false; ground_truth.len()];

    detections
        .into_iter()
        .map(|det| {
            let best = ground_truth
                .iter()
                .enumerate()
                .map(|(index, (gt, status))| (index, *status, iou_kind.iou(&det.bbox, gt)))
                .max_by(|(_, _, lhs), (_, _, rhs)| lhs.total_cmp(rhs));

            let kind = match best {
                Some((index, status, iou)) if iou >= iou_thresh => match status {
                    GtStatus::Ignored => MatchKind::Ignored,
                    GtStatus::Counted if !taken[index] => {
                        taken[index] = true;
                        MatchKind::TruePositive
                    }
                    GtStatus::Counted => MatchKind::FalsePositive,
                },
                _ => MatchKind::FalsePositive,
            };
            (det.score, kind)
        })
        .collect()
}

/// Per-class match records accumulated over images.
#[derive(Debug, Clone)]
pub struct ApAccumulator {
    iou_thresh: f64,
    iou_kind: IouKind,
    records: Vec<Vec<(R64, MatchKind)>>,
    num_positives: Vec<usize>,
}

impl ApAccumulator {
    pub fn new(num_classes: usize, iou_thresh: f64, iou_kind: IouKind) -> Self {
        Self {
            iou_thresh,
            iou_kind,
            records: vec![vec![]; num_classes],
            num_positives: vec![0; num_classes],
        }
    }

    pub fn num_classes(&self) -> usize {
        self.records.len()
    }

    pub fn reset(&mut self) {
        self.records.iter_mut().for_each(Vec::clear);
        self.num_positives.iter_mut().for_each(|count| *count = 0);
    }

    /// Adds one image. `gt_status` decides per ground truth index whether it
    /// counts towards recall.
    pub fn add_image<F>(
        &mut self,
        detections: &[Detection],
        ground_truth: &[ObjectLabel],
        gt_status: F,
    ) -> Result<()>
    where
        F: Fn(usize, &ObjectLabel) -> GtStatus,
    {
        let num_classes = self.num_classes();
        if let Some(gt) = ground_truth.iter().find(|gt| gt.class >= num_classes) {
            bail!(
                "ground truth class {} is out of range of {} classes",
                gt.class,
                num_classes
            );
        }

        let mut dets_per_class: HashMap<usize, Vec<&Detection>> = HashMap::new();
        for det in detections {
            if det.class >= num_classes {
                warn!("ignore detection of unknown class {}", det.class);
                continue;
            }
            dets_per_class.entry(det.class).or_default().push(det);
        }

        let gts_per_class: HashMap<usize, Vec<(&TLBR<f64>, GtStatus)>> = ground_truth
            .iter()
            .enumerate()
            .map(|(index, gt)| (gt.class, (&gt.rect, gt_status(index, gt))))
            .into_group_map();

        for (&class, gts) in &gts_per_class {
            self.num_positives[class] += gts
                .iter()
                .filter(|(_, status)| *status == GtStatus::Counted)
                .count();
        }

        for (class, dets) in dets_per_class {
            let gts = gts_per_class
                .get(&class)
                .map(|gts| gts.as_slice())
                .unwrap_or(&[]);
            let matches = match_detections(&dets, gts, self.iou_thresh, self.iou_kind);
            self.records[class].extend(matches);
        }

        Ok(())
    }

    /// AP of every class, NaN for classes without ground truth.
    pub fn average_precisions(&self, calculator: &ApCalculator) -> Vec<f64> {
        self.records
            .iter()
            .zip(&self.num_positives)
            .map(|(records, &num_positives)| calculator.compute_by_matches(records, num_positives))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use label::Label;

    fn det(class: usize, score: f64, xyxy: [f64; 4]) -> Result<Detection> {
        Ok(Detection {
            class,
            score: r64(score),
            bbox: TLBR::from_xyxy(xyxy)?,
        })
    }

    #[test]
    fn duplicate_detection_is_false_positive() -> Result<()> {
        let gt = TLBR::from_xyxy([0.0, 0.0, 10.0, 10.0])?;
        let dets = [
            det(0, 0.5, [0.0, 0.0, 10.0, 10.0])?,
            det(0, 0.9, [1.0, 1.0, 10.0, 10.0])?,
            det(0, 0.3, [50.0, 50.0, 60.0, 60.0])?,
        ];
        let refs: Vec<_> = dets.iter().collect();
        let matches = match_detections(&refs, &[(&gt, GtStatus::Counted)], 0.5, IouKind::Pixel);
        assert_eq!(
            matches,
            vec![
                (r64(0.9), MatchKind::TruePositive),
                (r64(0.5), MatchKind::FalsePositive),
                (r64(0.3), MatchKind::FalsePositive),
            ]
        );
        Ok(())
    }

    #[test]
    fn ignored_ground_truth_is_not_recalled() -> Result<()> {
        let mut acc = ApAccumulator::new(2, 0.5, IouKind::Pixel);
        let gts = vec![
            Label::new(TLBR::from_xyxy([0.0, 0.0, 10.0, 10.0])?, 0),
            Label::new(TLBR::from_xyxy([20.0, 20.0, 30.0, 30.0])?, 0).with_difficult(true),
        ];
        let dets = vec![
            det(0, 0.9, [0.0, 0.0, 10.0, 10.0])?,
            det(0, 0.8, [20.0, 20.0, 30.0, 30.0])?,
        ];
        acc.add_image(&dets, &gts, |_, gt| {
            if gt.difficult {
                GtStatus::Ignored
            } else {
                GtStatus::Counted
            }
        })?;

        let aps = acc.average_precisions(&ApCalculator::new_voc());
        assert_eq!(aps[0], 1.0);
        assert!(aps[1].is_nan());

        let bad = vec![Label::new(TLBR::from_xyxy([0.0, 0.0, 1.0, 1.0])?, 5)];
        assert!(acc.add_image(&[], &bad, |_, _| GtStatus::Counted).is_err());
        Ok(())
    }
}
