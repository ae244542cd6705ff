//! Assigns ground truth boxes to anchors and builds the training targets.

use crate::{common::*, output::YoloTrainOutput};

/// Pairwise IoU of `[N, 4]` and `[M, 4]` xyxy boxes, returning `[N, M]`.
pub fn pairwise_iou(lhs: &Tensor, rhs: &Tensor) -> Tensor {
    let lhs = lhs.unsqueeze(1);
    let rhs = rhs.unsqueeze(0);
    let coord = |tensor: &Tensor, index: i64| tensor.narrow(2, index, 1).squeeze_dim(2);

    let (l1, t1, r1, b1) = (coord(&lhs, 0), coord(&lhs, 1), coord(&lhs, 2), coord(&lhs, 3));
    let (l2, t2, r2, b2) = (coord(&rhs, 0), coord(&rhs, 1), coord(&rhs, 2), coord(&rhs, 3));

    let inter_w = (r1.minimum(&r2) - l1.maximum(&l2)).clamp_min(0.0);
    let inter_h = (b1.minimum(&b2) - t1.maximum(&t2)).clamp_min(0.0);
    let inter = inter_w * inter_h;
    let area1 = (&r1 - &l1) * (&b1 - &t1);
    let area2 = (&r2 - &l2) * (&b2 - &t2);

    &inter / (area1 + area2 - &inter + 1e-12)
}

/// Per-prediction training targets, aligned with [YoloTrainOutput].
#[derive(Debug, TensorLike)]
pub struct YoloTargets {
    /// `[B, N, 1]`: the mixup weight of the assigned box for positives, `0`
    /// for negatives and `-1` for ignored predictions.
    pub objectness: Tensor,
    /// `[B, N, 2]` in-cell `(x, y)` offsets.
    pub centers: Tensor,
    /// `[B, N, 2]` log scales relative to the anchor.
    pub scales: Tensor,
    /// `[B, N, 2]` box weights, larger for small boxes.
    pub weights: Tensor,
    /// `[B, N, C]` class targets.
    pub classes: Tensor,
}

#[derive(Debug, Clone)]
pub struct TargetGeneratorInit {
    pub num_classes: usize,
    pub ignore_iou_thresh: f64,
    pub label_smooth: bool,
}

impl TargetGeneratorInit {
    pub fn build(self) -> Result<TargetGenerator> {
        let Self {
            num_classes,
            ignore_iou_thresh,
            label_smooth,
        } = self;
        ensure!(num_classes > 0, "num_classes must be positive");
        ensure!(
            (0.0..=1.0).contains(&ignore_iou_thresh),
            "ignore_iou_thresh must be in range [0, 1]"
        );

        Ok(TargetGenerator {
            num_classes,
            ignore_iou_thresh,
            label_smooth,
        })
    }
}

#[derive(Debug, Clone)]
pub struct TargetGenerator {
    num_classes: usize,
    ignore_iou_thresh: f64,
    label_smooth: bool,
}

/// Location of an anchor among all output levels.
#[derive(Debug, Clone, Copy, PartialEq)]
struct AnchorRef {
    level: usize,
    index: usize,
    w: f64,
    h: f64,
}

impl TargetGenerator {
    /// Builds the targets of a batch of canvas-pixel labels. `label_weights`
    /// holds the mixup weight of each label and `image_hw` the input size.
    pub fn generate(
        &self,
        output: &YoloTrainOutput,
        labels: &[Vec<ObjectLabel>],
        label_weights: &[Vec<f64>],
        image_hw: [i64; 2],
    ) -> Result<YoloTargets> {
        let num_classes = self.num_classes;
        let batch_size = output.batch_size();
        let num_preds = output.num_predictions();
        let device = output.device();

        ensure!(
            output.num_classes() == num_classes as i64,
            "expect {} classes in the output, but get {}",
            num_classes,
            output.num_classes()
        );
        ensure!(
            labels.len() == batch_size as usize && label_weights.len() == labels.len(),
            "expect labels and weights of {} images",
            batch_size
        );
        let [image_h, image_w] = image_hw;
        let image_area = (image_h * image_w) as f64;

        let anchors: Vec<AnchorRef> = output
            .levels
            .iter()
            .enumerate()
            .flat_map(|(level, info)| {
                info.anchors
                    .iter()
                    .enumerate()
                    .map(move |(index, &[w, h])| AnchorRef { level, index, w, h })
            })
            .collect();
        ensure!(!anchors.is_empty(), "the output has no anchors");
        let anchor_shapes: Vec<CyCxHW<f64>> = anchors
            .iter()
            .map(|anchor| CyCxHW::try_from_hw_at_origin(anchor.h, anchor.w))
            .try_collect()?;

        let (smooth_pos, smooth_neg) = if self.label_smooth {
            let delta = (1.0 / num_classes as f64).min(1.0 / 40.0);
            (1.0 - delta, delta)
        } else {
            (1.0, 0.0)
        };

        let total = (batch_size * num_preds) as usize;
        let mut objectness = vec![0f32; total];
        let mut centers = vec![0f32; total * 2];
        let mut scales = vec![0f32; total * 2];
        let mut weights = vec![0f32; total * 2];
        let mut classes = vec![0f32; total * num_classes];

        for (batch_index, (image_labels, image_weights)) in
            labels.iter().zip(label_weights).enumerate()
        {
            ensure!(
                image_labels.len() == image_weights.len(),
                "image {} has {} labels but {} weights",
                batch_index,
                image_labels.len(),
                image_weights.len()
            );

            for (label, &mix_weight) in image_labels.iter().zip(image_weights) {
                let (gt_h, gt_w) = (label.rect.h(), label.rect.w());
                if gt_h <= 0.0 || gt_w <= 0.0 {
                    continue;
                }
                ensure!(
                    label.class < num_classes,
                    "class {} is out of range for {} classes",
                    label.class,
                    num_classes
                );
                let gt_shape = CyCxHW::try_from_hw_at_origin(gt_h, gt_w)?;

                let best = anchor_shapes
                    .iter()
                    .map(|shape| r64(shape.iou_with(&gt_shape, 0.0)))
                    .position_max()
                    .map(|position| anchors[position])
                    .ok_or_else(|| format_err!("no anchor matches"))?;
                let info = &output.levels[best.level];

                let (cx, cy) = (label.rect.cx(), label.rect.cy());
                let grid_x = cx / info.stride;
                let grid_y = cy / info.stride;
                let loc_x = (grid_x.floor() as i64).clamp(0, info.feature_w - 1);
                let loc_y = (grid_y.floor() as i64).clamp(0, info.feature_h - 1);
                let anchor_count = info.anchors.len() as i64;

                let pred_index = info.start + (loc_y * info.feature_w + loc_x) * anchor_count + best.index as i64;
                let flat = batch_index * num_preds as usize + pred_index as usize;

                objectness[flat] = mix_weight as f32;
                centers[flat * 2] = (grid_x - loc_x as f64) as f32;
                centers[flat * 2 + 1] = (grid_y - loc_y as f64) as f32;
                scales[flat * 2] = (gt_w.max(1.0) / best.w).ln() as f32;
                scales[flat * 2 + 1] = (gt_h.max(1.0) / best.h).ln() as f32;
                let weight = (2.0 - gt_w * gt_h / image_area) as f32;
                weights[flat * 2] = weight;
                weights[flat * 2 + 1] = weight;

                let class_row = &mut classes[flat * num_classes..(flat + 1) * num_classes];
                class_row.iter_mut().for_each(|value| *value = smooth_neg as f32);
                class_row[label.class] = smooth_pos as f32;
            }
        }

        let to_tensor = |values: Vec<f32>, entries: i64| {
            Tensor::of_slice(&values)
                .view([batch_size, num_preds, entries])
                .to_device(device)
        };
        let objectness = to_tensor(objectness, 1);
        let ignore = self.ignore_mask(output, labels)?;
        let objectness = objectness.where_self(&objectness.gt(0.0), &(ignore.to_kind(Kind::Float) * -1.0));

        Ok(YoloTargets {
            objectness,
            centers: to_tensor(centers, 2),
            scales: to_tensor(scales, 2),
            weights: to_tensor(weights, 2),
            classes: to_tensor(classes, num_classes as i64),
        })
    }

    /// `[B, N, 1]` mask of predictions overlapping any ground truth above
    /// the ignore threshold.
    fn ignore_mask(&self, output: &YoloTrainOutput, labels: &[Vec<ObjectLabel>]) -> Result<Tensor> {
        let num_preds = output.num_predictions();
        let device = output.device();

        tch::no_grad(|| {
            let masks: Vec<Tensor> = labels
                .iter()
                .enumerate()
                .map(|(batch_index, image_labels)| {
                    if image_labels.is_empty() {
                        return Tensor::zeros(&[num_preds, 1], (Kind::Bool, device));
                    }
                    let gt: Vec<f32> = image_labels
                        .iter()
                        .flat_map(|label| label.rect.xyxy())
                        .map(|value| value as f32)
                        .collect();
                    let gt = Tensor::of_slice(&gt)
                        .view([image_labels.len() as i64, 4])
                        .to_device(device);
                    let preds = output.bbox.select(0, batch_index as i64).to_kind(Kind::Float);
                    let (best_iou, _) = pairwise_iou(&preds, &gt).max_dim(1, true);
                    best_iou.gt(self.ignore_iou_thresh)
                })
                .collect();
            Ok(Tensor::stack(&masks, 0))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::LevelInfo;
    use approx::assert_abs_diff_eq;

    fn output(bbox: Tensor) -> YoloTrainOutput {
        let levels = vec![
            LevelInfo {
                feature_h: 2,
                feature_w: 2,
                stride: 32.0,
                anchors: vec![[100.0, 100.0]],
                start: 0,
            },
            LevelInfo {
                feature_h: 4,
                feature_w: 4,
                stride: 16.0,
                anchors: vec![[20.0, 20.0]],
                start: 4,
            },
        ];
        let zeros = |entries: i64| Tensor::zeros(&[1, 20, entries], (Kind::Float, Device::Cpu));
        YoloTrainOutput {
            bbox,
            box_centers: zeros(2),
            box_scales: zeros(2),
            objectness: zeros(1),
            class_pred: zeros(3),
            levels,
        }
    }

    #[test]
    fn assign_best_anchor() -> Result<()> {
        let output = output(Tensor::zeros(&[1, 20, 4], (Kind::Float, Device::Cpu)));
        let generator = TargetGeneratorInit {
            num_classes: 3,
            ignore_iou_thresh: 0.7,
            label_smooth: false,
        }
        .build()?;

        // 20 × 20 box centred at (40, 24) goes to the stride 16 level, cell (x = 2, y = 1)
        let label = ObjectLabel::new(TLBR::from_xyxy([30.0, 14.0, 50.0, 34.0])?, 2);
        let targets = generator.generate(&output, &[vec![label]], &[vec![0.6]], [64, 64])?;

        let index = 4 + 1 * 4 + 2;
        let objectness = Vec::<f32>::from(&targets.objectness.view([-1]));
        assert_abs_diff_eq!(objectness[index], 0.6);
        assert_eq!(objectness.iter().filter(|&&value| value != 0.0).count(), 1);

        let centers = Vec::<f32>::from(&targets.centers.view([-1]));
        assert_abs_diff_eq!(centers[index * 2], 0.5);
        assert_abs_diff_eq!(centers[index * 2 + 1], 0.5);

        let scales = Vec::<f32>::from(&targets.scales.view([-1]));
        assert_abs_diff_eq!(scales[index * 2], 0.0);

        let weights = Vec::<f32>::from(&targets.weights.view([-1]));
        assert_abs_diff_eq!(weights[index * 2], 2.0 - 400.0 / 4096.0, epsilon = 1e-6);

        let classes = Vec::<f32>::from(&targets.classes.view([-1]));
        assert_eq!(&classes[index * 3..index * 3 + 3], &[0.0, 0.0, 1.0]);
        Ok(())
    }

    #[test]
    fn ignore_overlapping_predictions() -> Result<()> {
        // prediction 0 overlaps the ground truth, all others are empty boxes
        let mut boxes = vec![0f32; 20 * 4];
        boxes[..4].copy_from_slice(&[31.0, 14.0, 50.0, 34.0]);
        let output = output(Tensor::of_slice(&boxes).view([1, 20, 4]));
        let generator = TargetGeneratorInit {
            num_classes: 3,
            ignore_iou_thresh: 0.7,
            label_smooth: true,
        }
        .build()?;

        let label = ObjectLabel::new(TLBR::from_xyxy([30.0, 14.0, 50.0, 34.0])?, 0);
        let targets = generator.generate(&output, &[vec![label]], &[vec![1.0]], [64, 64])?;
        let objectness = Vec::<f32>::from(&targets.objectness.view([-1]));
        assert_eq!(objectness[0], -1.0);
        assert_eq!(objectness[10], 1.0);
        assert_eq!(objectness[1], 0.0);

        let classes = Vec::<f32>::from(&targets.classes.view([-1]));
        assert_abs_diff_eq!(classes[30], 1.0 - 1.0 / 40.0);
        assert_abs_diff_eq!(classes[31], 1.0 / 40.0);
        Ok(())
    }

    #[test]
    fn iou_matrix() {
        let lhs = Tensor::of_slice(&[0f32, 0.0, 2.0, 2.0, 10.0, 10.0, 11.0, 11.0]).view([2, 4]);
        let rhs = Tensor::of_slice(&[1f32, 1.0, 3.0, 3.0]).view([1, 4]);
        let ious = Vec::<f32>::from(&pairwise_iou(&lhs, &rhs).view([-1]));
        assert_abs_diff_eq!(ious[0], 1.0 / 7.0, epsilon = 1e-6);
        assert_abs_diff_eq!(ious[1], 0.0);
    }
}
