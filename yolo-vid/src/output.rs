//! YOLO output layer: the 1×1 prediction and the box decoding.

use crate::{common::*, hierarchy::Hierarchy};
use tch_modules::{Conv2DInit, ConvGru, ConvGruInit, ConvND, TemporalPool};

/// Box, objectness and class entries per anchor.
pub fn num_entries(num_classes: usize) -> usize {
    5 + num_classes
}

/// Geometry of one output level.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelInfo {
    pub feature_h: i64,
    pub feature_w: i64,
    pub stride: f64,
    /// `(w, h)` anchors in pixels.
    pub anchors: Vec<[f64; 2]>,
    /// Index of the first prediction of this level in the flat prediction axis.
    pub start: i64,
}

impl LevelInfo {
    pub fn num_predictions(&self) -> i64 {
        self.feature_h * self.feature_w * self.anchors.len() as i64
    }
}

/// Raw and decoded predictions, flattened to `[B, N, _]` where the index of
/// anchor `a` in cell `(y, x)` of a level is `start + (y · W + x) · A + a`.
#[derive(Debug, TensorLike)]
pub struct YoloTrainOutput {
    /// Decoded `[x1, y1, x2, y2]` boxes in pixels, `[B, N, 4]`.
    pub bbox: Tensor,
    /// `[B, N, 2]` logits of the `(x, y)` in-cell offsets.
    pub box_centers: Tensor,
    /// `[B, N, 2]` log scales relative to the anchors.
    pub box_scales: Tensor,
    /// `[B, N, 1]` objectness logits.
    pub objectness: Tensor,
    /// `[B, N, C]` class logits.
    pub class_pred: Tensor,
    #[tensor_like(clone)]
    pub levels: Vec<LevelInfo>,
}

impl YoloTrainOutput {
    pub fn cat(outputs: Vec<YoloTrainOutput>) -> Result<Self> {
        ensure!(!outputs.is_empty(), "no output levels to concatenate");

        let mut start = 0;
        let mut levels = vec![];
        let mut parts: [Vec<Tensor>; 5] = Default::default();

        for output in outputs {
            let YoloTrainOutput {
                bbox,
                box_centers,
                box_scales,
                objectness,
                class_pred,
                levels: output_levels,
            } = output;

            for mut level in output_levels {
                level.start = start;
                start += level.num_predictions();
                levels.push(level);
            }
            for (part, tensor) in parts
                .iter_mut()
                .zip([bbox, box_centers, box_scales, objectness, class_pred])
            {
                part.push(tensor);
            }
        }

        let [bbox, box_centers, box_scales, objectness, class_pred] =
            parts.map(|tensors| Tensor::cat(&tensors, 1));

        Ok(Self {
            bbox,
            box_centers,
            box_scales,
            objectness,
            class_pred,
            levels,
        })
    }

    pub fn batch_size(&self) -> i64 {
        self.bbox.size()[0]
    }

    pub fn num_predictions(&self) -> i64 {
        self.bbox.size()[1]
    }

    pub fn num_classes(&self) -> i64 {
        self.class_pred.size()[2]
    }

    pub fn device(&self) -> Device {
        self.bbox.device()
    }
}

#[derive(Debug)]
enum Prediction {
    Conv(ConvND),
    /// 1×1 conv-GRU over the frames, pooled over time.
    Gru { gru: ConvGru, pool: TemporalPool },
}

#[derive(Debug, Clone)]
pub struct YoloOutputLayerInit {
    pub in_c: usize,
    pub num_classes: usize,
    pub anchors: Vec<[R64; 2]>,
    pub stride: usize,
    pub agnostic: bool,
    pub hierarchy: Option<Hierarchy>,
    /// Produce the prediction with a recurrent unit and pool it over frames.
    pub rnn_pool: Option<TemporalPool>,
}

impl YoloOutputLayerInit {
    pub fn build<'p, P>(self, path: P) -> Result<YoloOutputLayer>
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        let Self {
            in_c,
            num_classes,
            anchors,
            stride,
            agnostic,
            hierarchy,
            rnn_pool,
        } = self;

        ensure!(num_classes > 0, "num_classes must be positive");
        ensure!(!anchors.is_empty(), "an output level needs anchors");
        ensure!(stride > 0, "stride must be positive");
        if let Some(hierarchy) = &hierarchy {
            hierarchy.validate(num_classes)?;
        }

        let out_c = anchors.len() * num_entries(num_classes);
        let prediction = match rnn_pool {
            Some(pool) => Prediction::Gru {
                gru: ConvGruInit {
                    in_c,
                    hidden_c: out_c,
                    k: 1,
                }
                .build(path / "prediction")?,
                pool,
            },
            None => Prediction::Conv(Conv2DInit::new(1).build(path / "prediction", in_c, out_c)?),
        };

        Ok(YoloOutputLayer {
            prediction,
            num_classes,
            anchors: anchors
                .iter()
                .map(|&[w, h]| [w.raw(), h.raw()])
                .collect(),
            stride: stride as f64,
            agnostic,
            hierarchy,
            device: path.device(),
            cache: None,
        })
    }
}

#[derive(Debug)]
struct Cache {
    feature_size: (i64, i64),
    /// `[1, H·W, 1, 2]` cell `(x, y)` offsets.
    offsets: Tensor,
    /// `[1, 1, A, 2]` anchor `(w, h)` sizes.
    anchors: Tensor,
}

#[derive(Debug)]
pub struct YoloOutputLayer {
    prediction: Prediction,
    num_classes: usize,
    anchors: Vec<[f64; 2]>,
    stride: f64,
    agnostic: bool,
    hierarchy: Option<Hierarchy>,
    device: Device,
    cache: Option<Cache>,
}

/// Decoded predictions of a level.
#[derive(Debug)]
struct Decoded {
    /// `[B, H·W, A, 5 + C]`
    pred: Tensor,
    /// `[B, H·W, A, 4]`
    bbox: Tensor,
    /// `[B, H·W, A, 1]`
    confidence: Tensor,
    /// `[B, H·W, A, C]`
    class_score: Tensor,
    info: LevelInfo,
}

impl YoloOutputLayer {
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn num_anchors(&self) -> usize {
        self.anchors.len()
    }

    pub fn stride(&self) -> f64 {
        self.stride
    }

    pub fn anchors(&self) -> &[[f64; 2]] {
        &self.anchors
    }

    fn cache(&mut self, feature_h: i64, feature_w: i64) -> (Tensor, Tensor) {
        let device = self.device;
        let is_hit = matches!(&self.cache, Some(cache) if cache.feature_size == (feature_h, feature_w));
        if !is_hit {
            self.cache = None;
        }

        let anchors = &self.anchors;
        let cache = self.cache.get_or_insert_with(|| {
            tch::no_grad(|| {
                let xs = Tensor::arange(feature_w, (Kind::Float, device))
                    .view([1, feature_w])
                    .expand(&[feature_h, feature_w], false);
                let ys = Tensor::arange(feature_h, (Kind::Float, device))
                    .view([feature_h, 1])
                    .expand(&[feature_h, feature_w], false);
                let offsets = Tensor::stack(&[xs, ys], 2).view([1, feature_h * feature_w, 1, 2]);

                let flat: Vec<f32> = anchors.iter().flatten().map(|&value| value as f32).collect();
                let anchors = Tensor::of_slice(&flat)
                    .view([1, 1, anchors.len() as i64, 2])
                    .to_device(device);

                Cache {
                    feature_size: (feature_h, feature_w),
                    offsets,
                    anchors,
                }
            })
        });

        (cache.offsets.shallow_clone(), cache.anchors.shallow_clone())
    }

    fn decode(&mut self, xs: &Tensor) -> Result<Decoded> {
        let num_anchors = self.anchors.len() as i64;
        let num_entries = num_entries(self.num_classes) as i64;

        let pred = match &self.prediction {
            Prediction::Conv(conv) => xs.apply(conv),
            Prediction::Gru { gru, pool } => gru.forward(xs)?.apply(pool),
        };
        let (batch_size, channels, feature_h, feature_w) = pred.size4()?;
        ensure!(
            channels == num_anchors * num_entries,
            "expect {} prediction channels, but get {}",
            num_anchors * num_entries,
            channels
        );

        // [B, A·P, H, W] -> [B, H·W, A, P]
        let pred = pred
            .view([batch_size, channels, feature_h * feature_w])
            .permute(&[0, 2, 1])
            .reshape(&[batch_size, feature_h * feature_w, num_anchors, num_entries]);

        let (offsets, anchors) = self.cache(feature_h, feature_w);
        let raw_centers = pred.narrow(3, 0, 2);
        let raw_scales = pred.narrow(3, 2, 2);
        let objectness = pred.narrow(3, 4, 1);
        let class_pred = pred.narrow(3, 5, self.num_classes as i64);

        let centers = (raw_centers.sigmoid() + offsets) * self.stride;
        let half = raw_scales.exp() * anchors / 2.0;
        let confidence = objectness.sigmoid();
        let class_score = class_pred.sigmoid() * &confidence;
        let bbox = Tensor::cat(&[&centers - &half, &centers + &half], 3);

        Ok(Decoded {
            pred,
            bbox,
            confidence,
            class_score,
            info: LevelInfo {
                feature_h,
                feature_w,
                stride: self.stride,
                anchors: self.anchors.clone(),
                start: 0,
            },
        })
    }

    /// Returns the raw tensors for the loss.
    pub fn forward_train(&mut self, xs: &Tensor) -> Result<YoloTrainOutput> {
        let num_classes = self.num_classes as i64;
        let Decoded {
            pred, bbox, info, ..
        } = self.decode(xs)?;
        let batch_size = pred.size()[0];

        let flat = |tensor: Tensor, entries: i64| tensor.reshape(&[batch_size, -1, entries]);

        Ok(YoloTrainOutput {
            bbox: flat(bbox, 4),
            box_centers: flat(pred.narrow(3, 0, 2), 2),
            box_scales: flat(pred.narrow(3, 2, 2), 2),
            objectness: flat(pred.narrow(3, 4, 1), 1),
            class_pred: flat(pred.narrow(3, 5, num_classes), num_classes),
            levels: vec![info],
        })
    }

    /// Returns `[B, N, 6]` detections `[class, score, x1, y1, x2, y2]`,
    /// one per anchor and class, or one per anchor in agnostic mode.
    pub fn forward_inference(&mut self, xs: &Tensor) -> Result<Tensor> {
        let num_classes = self.num_classes as i64;
        let Decoded {
            bbox,
            confidence,
            class_score,
            ..
        } = self.decode(xs)?;
        let (batch_size, num_cells, num_anchors, _) = bbox.size4()?;
        let device = bbox.device();

        if self.agnostic {
            let ids = confidence.zeros_like();
            let detections = Tensor::cat(&[&ids, &confidence, &bbox], 3);
            return Ok(detections.reshape(&[batch_size, -1, 6]));
        }

        let class_score = match &self.hierarchy {
            Some(hierarchy) => hierarchy
                .mask_scores(&class_score.reshape(&[-1, num_classes]))?
                .reshape(&[batch_size, num_cells, num_anchors, num_classes]),
            None => class_score,
        };

        // [B, C, H·W, A, _]
        let shape = [batch_size, num_classes, num_cells, num_anchors, 1];
        let scores = class_score.permute(&[0, 3, 1, 2]).unsqueeze(-1);
        let ids = Tensor::arange(num_classes, (Kind::Float, device))
            .view([1, num_classes, 1, 1, 1])
            .expand(&shape, false)
            .to_kind(scores.kind());
        let bboxes = bbox
            .unsqueeze(1)
            .expand(&[batch_size, num_classes, num_cells, num_anchors, 4], false);
        let detections = Tensor::cat(&[&ids, &scores, &bboxes], 4);

        Ok(detections.reshape(&[batch_size, -1, 6]))
    }

    /// Resizes the prediction to `num_classes` classes. For each
    /// `(new, old)` pair the class row of `old` is copied to `new` for every
    /// anchor together with the box and objectness rows. Pairs out of range
    /// are skipped with a warning, and the other rows keep a fresh
    /// initialization. The class tree of the new classes replaces the old one.
    pub fn reset_class(
        &mut self,
        num_classes: usize,
        mapping: &[(usize, usize)],
        hierarchy: Option<Hierarchy>,
    ) -> Result<()> {
        ensure!(num_classes > 0, "num_classes must be positive");
        if let Some(hierarchy) = &hierarchy {
            hierarchy.validate(num_classes)?;
        }

        let conv = match &mut self.prediction {
            Prediction::Conv(conv) => conv,
            Prediction::Gru { .. } => {
                bail!("class reset is not supported on recurrent output layers")
            }
        };

        let old_classes = self.num_classes;
        let num_anchors = self.anchors.len();
        let old_entries = num_entries(old_classes);
        let new_entries = num_entries(num_classes);

        let (new_weight, new_bias) = tch::no_grad(|| -> Result<_> {
            let old_weight = conv.weight().shallow_clone();
            let old_bias = conv
                .bias()
                .ok_or_else(|| format_err!("the prediction has no bias"))?
                .shallow_clone();
            let (_, in_c, kh, kw) = old_weight.size4()?;
            let device = old_weight.device();

            let out_c = (num_anchors * new_entries) as i64;
            let weight = nn::init(nn::Init::KaimingUniform, &[out_c, in_c, kh, kw], device);
            let bias = Tensor::zeros(&[out_c], (old_bias.kind(), device));

            let copy_row = |new_row: usize, old_row: usize| {
                weight
                    .narrow(0, new_row as i64, 1)
                    .copy_(&old_weight.narrow(0, old_row as i64, 1));
                bias.narrow(0, new_row as i64, 1)
                    .copy_(&old_bias.narrow(0, old_row as i64, 1));
            };

            for &(new_class, old_class) in mapping {
                if new_class >= num_classes || old_class >= old_classes {
                    warn!(
                        "reuse mapping {}/{} -> {}/{} out of range",
                        new_class, num_classes, old_class, old_classes
                    );
                    continue;
                }

                for anchor in 0..num_anchors {
                    let new_offset = anchor * new_entries;
                    let old_offset = anchor * old_entries;
                    copy_row(new_offset + 5 + new_class, old_offset + 5 + old_class);
                    for entry in 0..5 {
                        copy_row(new_offset + entry, old_offset + entry);
                    }
                }
            }

            Ok((weight, bias))
        })?;

        conv.set_parameters(&new_weight, Some(&new_bias))?;
        self.num_classes = num_classes;
        self.hierarchy = hierarchy;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn layer(vs: &nn::VarStore, agnostic: bool) -> Result<YoloOutputLayer> {
        YoloOutputLayerInit {
            in_c: 4,
            num_classes: 2,
            anchors: vec![[r64(10.0), r64(20.0)], [r64(30.0), r64(40.0)]],
            stride: 8,
            agnostic,
            hierarchy: None,
            rnn_pool: None,
        }
        .build(&vs.root() / "output")
    }

    #[test]
    fn decode_zero_prediction() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let mut output = layer(&vs, false)?;
        tch::no_grad(|| {
            vs.variables()
                .values_mut()
                .for_each(|var| {
                    let _ = var.zero_();
                });
        });

        let xs = Tensor::zeros(&[1, 4, 2, 3], (Kind::Float, Device::Cpu));
        let train = output.forward_train(&xs)?;
        assert_eq!(train.bbox.size(), vec![1, 12, 4]);
        assert_eq!(train.class_pred.size(), vec![1, 12, 2]);
        assert_eq!(train.levels[0].num_predictions(), 12);

        // cell (y = 1, x = 2), anchor 1: centre (2.5, 1.5) · 8, size 30 × 40
        let index: i64 = (1 * 3 + 2) * 2 + 1;
        let bbox = Vec::<f32>::from(&train.bbox.i((0i64, index)));
        assert_eq!(bbox, vec![20.0 - 15.0, 12.0 - 20.0, 20.0 + 15.0, 12.0 + 20.0]);

        let detections = output.forward_inference(&xs)?;
        assert_eq!(detections.size(), vec![1, 24, 6]);
        // class 1 block follows the 12 class 0 rows, score = 0.5 · 0.5
        let row = Vec::<f32>::from(&detections.i((0i64, 12 + index)));
        assert_eq!(row[0], 1.0);
        assert_abs_diff_eq!(row[1], 0.25);

        let vs = nn::VarStore::new(Device::Cpu);
        let mut agnostic = layer(&vs, true)?;
        let detections = agnostic.forward_inference(&xs)?;
        assert_eq!(detections.size(), vec![1, 12, 6]);
        Ok(())
    }

    #[test]
    fn class_tree_masks_inference_scores() -> Result<()> {
        // animal (0) -> dog (1)
        let vs = nn::VarStore::new(Device::Cpu);
        let mut output = YoloOutputLayerInit {
            in_c: 4,
            num_classes: 2,
            anchors: vec![[r64(10.0), r64(20.0)], [r64(30.0), r64(40.0)]],
            stride: 8,
            agnostic: false,
            hierarchy: Some(Hierarchy::new(vec![0, 1], vec![false, true])?),
            rnn_pool: None,
        }
        .build(&vs.root() / "output")?;
        let xs = Tensor::zeros(&[1, 4, 2, 3], (Kind::Float, Device::Cpu));

        let set_logits = |output: &YoloOutputLayer, animal: f32, dog: f32| {
            let conv = match &output.prediction {
                Prediction::Conv(conv) => conv,
                Prediction::Gru { .. } => unreachable!(),
            };
            // [tx, ty, tw, th, obj, animal, dog] per anchor
            let anchor = [0.0, 0.0, 0.0, 0.0, 10.0, animal, dog];
            let bias: Vec<f32> = anchor.iter().chain(anchor.iter()).copied().collect();
            tch::no_grad(|| {
                let _ = conv.weight().shallow_clone().zero_();
                if let Some(conv_bias) = conv.bias() {
                    let _ = conv_bias.shallow_clone().copy_(&Tensor::of_slice(&bias));
                }
            });
        };

        // a confident inner node without a confident leaf is dropped
        set_logits(&output, 10.0, -10.0);
        let detections = output.forward_inference(&xs)?;
        assert_eq!(detections.size(), vec![1, 24, 6]);
        let total = detections.i((.., .., 1)).sum(Kind::Double).double_value(&[]);
        assert_abs_diff_eq!(total, 0.0);

        // a confident leaf is kept and clears its parent
        set_logits(&output, 10.0, 10.0);
        let detections = output.forward_inference(&xs)?;
        let animal = Vec::<f32>::from(&detections.i((0i64, 0..12, 1)));
        let dog = Vec::<f32>::from(&detections.i((0i64, 12..24, 1)));
        assert!(animal.iter().all(|&score| score == 0.0));
        assert!(dog.iter().all(|&score| score > 0.99));
        Ok(())
    }

    #[test]
    fn reset_class_copies_rows() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let mut output = layer(&vs, false)?;
        let old_weight = match &output.prediction {
            Prediction::Conv(conv) => conv.weight().copy(),
            _ => unreachable!(),
        };

        // new class 0 reuses old class 1, the second pair is out of range
        output.reset_class(3, &[(0, 1), (5, 0)], None)?;
        assert_eq!(output.num_classes(), 3);

        let weight = match &output.prediction {
            Prediction::Conv(conv) => conv.weight().shallow_clone(),
            _ => unreachable!(),
        };
        assert_eq!(weight.size(), vec![16, 4, 1, 1]);
        // anchor 1 class 0 row comes from old anchor 1 class 1 row
        assert!(weight.i(13i64).equal(&old_weight.i(13i64)));
        // box rows of anchor 1
        assert!(weight.i(10i64).equal(&old_weight.i(9i64)));
        Ok(())
    }
}
