//! Defines loss for training.

use crate::{
    common::*,
    output::YoloTrainOutput,
    target::{TargetGenerator, TargetGeneratorInit, YoloTargets},
};
use tch_modules::{BceWithLogitsLoss, BceWithLogitsLossInit};

#[derive(Debug, TensorLike)]
pub struct YoloLossOutput {
    pub total_loss: Tensor,
    pub objectness_loss: Tensor,
    pub center_loss: Tensor,
    pub scale_loss: Tensor,
    pub class_loss: Tensor,
}

#[derive(Debug, Clone)]
pub struct YoloLossInit {
    pub num_classes: usize,
    pub ignore_iou_thresh: f64,
    pub label_smooth: bool,
}

impl YoloLossInit {
    pub fn build<'p>(self, path: impl Borrow<nn::Path<'p>>) -> Result<YoloLoss> {
        let Self {
            num_classes,
            ignore_iou_thresh,
            label_smooth,
        } = self;

        let target_generator = TargetGeneratorInit {
            num_classes,
            ignore_iou_thresh,
            label_smooth,
        }
        .build()?;
        let bce = BceWithLogitsLossInit::default(Reduction::None).build(path);

        Ok(YoloLoss {
            target_generator,
            bce,
        })
    }
}

/// Sigmoid BCE objectness, centre and class terms plus an L1 scale term.
/// Each term is summed per image and averaged over the batch.
#[derive(Debug)]
pub struct YoloLoss {
    target_generator: TargetGenerator,
    bce: BceWithLogitsLoss,
}

impl YoloLoss {
    pub fn forward(
        &self,
        output: &YoloTrainOutput,
        labels: &[Vec<ObjectLabel>],
        label_weights: &[Vec<f64>],
        image_hw: [i64; 2],
    ) -> Result<YoloLossOutput> {
        let targets = self
            .target_generator
            .generate(output, labels, label_weights, image_hw)?;
        Ok(self.forward_targets(output, &targets))
    }

    pub fn forward_targets(&self, output: &YoloTrainOutput, targets: &YoloTargets) -> YoloLossOutput {
        let YoloTrainOutput {
            box_centers,
            box_scales,
            objectness,
            class_pred,
            ..
        } = output;
        let YoloTargets {
            objectness: obj_t,
            centers: centers_t,
            scales: scales_t,
            weights: weights_t,
            classes: classes_t,
        } = targets;

        let per_image = |loss: Tensor| loss.flatten(1, -1).sum_dim_intlist(&[1], false, Kind::Float).mean(Kind::Float);

        let positive = obj_t.gt(0.0);
        // positives weigh by their mixup ratio, negatives by 1, ignored by 0
        let obj_mask = obj_t.where_self(&positive, &obj_t.ge(0.0).to_kind(obj_t.kind()));
        let hard_obj_t = positive.to_kind(obj_t.kind());
        let objectness_loss = per_image(self.bce.forward(objectness, &hard_obj_t, Some(&obj_mask)));

        let pos_weight = obj_t.clamp_min(0.0);
        let box_weights = weights_t * &pos_weight;
        let center_loss = per_image(self.bce.forward(box_centers, centers_t, Some(&box_weights)));
        let scale_loss = per_image((box_scales - scales_t).abs() * &box_weights);

        let class_mask = pos_weight.expand_as(classes_t);
        let class_loss = per_image(self.bce.forward(class_pred, classes_t, Some(&class_mask)));

        let total_loss = &objectness_loss + &center_loss + &scale_loss + &class_loss;

        YoloLossOutput {
            total_loss,
            objectness_loss,
            center_loss,
            scale_loss,
            class_loss,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::LevelInfo;
    use approx::assert_abs_diff_eq;

    fn output(vs: &nn::VarStore) -> YoloTrainOutput {
        let root = vs.root();
        let bbox = Tensor::zeros(&[2, 4, 4], (Kind::Float, Device::Cpu));
        YoloTrainOutput {
            bbox,
            box_centers: root.zeros("centers", &[2, 4, 2]),
            box_scales: root.zeros("scales", &[2, 4, 2]),
            objectness: root.zeros("objectness", &[2, 4, 1]),
            class_pred: root.zeros("classes", &[2, 4, 2]),
            levels: vec![LevelInfo {
                feature_h: 2,
                feature_w: 2,
                stride: 16.0,
                anchors: vec![[16.0, 16.0]],
                start: 0,
            }],
        }
    }

    #[test]
    fn loss_terms_at_zero_logits() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let output = output(&vs);
        let loss_fn = YoloLossInit {
            num_classes: 2,
            ignore_iou_thresh: 0.7,
            label_smooth: false,
        }
        .build(&vs.root() / "loss")?;

        // one box in the first image exactly on anchor 0 of cell (0, 0)
        let label = ObjectLabel::new(TLBR::from_xyxy([0.0, 0.0, 16.0, 16.0])?, 1);
        let losses = loss_fn.forward(&output, &[vec![label], vec![]], &[vec![1.0], vec![]], [32, 32])?;

        let ln2 = 2f64.ln();
        // every prediction costs ln 2 on objectness, 8 predictions over 2 images
        assert_abs_diff_eq!(f64::from(&losses.objectness_loss), 8.0 * ln2 / 2.0, epsilon = 1e-5);
        // the centre target is 0.5 with weight 2 - 256 / 1024
        let weight = 2.0 - 256.0 / 1024.0;
        assert_abs_diff_eq!(f64::from(&losses.center_loss), 2.0 * weight * ln2 / 2.0, epsilon = 1e-5);
        assert_abs_diff_eq!(f64::from(&losses.scale_loss), 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(f64::from(&losses.class_loss), 2.0 * ln2 / 2.0, epsilon = 1e-5);

        losses.total_loss.backward();
        assert!(bool::from(output.objectness.grad().abs().sum(Kind::Float).gt(0.0)));
        Ok(())
    }
}
