use crate::common::*;

#[derive(Debug, Clone)]
pub struct NonMaxSuppressionInit {
    pub iou_threshold: R64,
    /// Detections scoring at or below are dropped before suppression.
    pub valid_threshold: R64,
    /// Candidates kept per image before suppression.
    pub topk: Option<usize>,
    /// Detections kept per image after suppression.
    pub post_nms: Option<usize>,
}

impl Default for NonMaxSuppressionInit {
    fn default() -> Self {
        Self {
            iou_threshold: r64(0.45),
            valid_threshold: r64(0.01),
            topk: Some(400),
            post_nms: Some(100),
        }
    }
}

impl NonMaxSuppressionInit {
    pub fn build(self) -> Result<NonMaxSuppression> {
        let Self {
            iou_threshold,
            valid_threshold,
            topk,
            post_nms,
        } = self;

        ensure!(
            valid_threshold >= 0.0,
            "valid_threshold must be non-negative"
        );
        ensure!(topk != Some(0), "topk must be positive");
        ensure!(post_nms != Some(0), "post_nms must be positive");

        Ok(NonMaxSuppression {
            iou_threshold: iou_threshold.raw(),
            valid_threshold: valid_threshold.raw(),
            topk,
            post_nms,
        })
    }
}

/// Detections padded with `-1` rows to a common length.
#[derive(Debug, TensorLike)]
pub struct NmsOutput {
    /// `[B, N, 1]` class ids.
    pub ids: Tensor,
    /// `[B, N, 1]` scores.
    pub scores: Tensor,
    /// `[B, N, 4]` `[x1, y1, x2, y2]` boxes.
    pub bboxes: Tensor,
}

impl NmsOutput {
    /// Valid `(class, score, [x1, y1, x2, y2])` rows of each image.
    pub fn to_vec(&self) -> Result<Vec<Vec<(i64, f64, [f64; 4])>>> {
        let (batch_size, num_rows, _) = self.ids.size3()?;
        let ids = Vec::<f64>::from(&self.ids.to_kind(Kind::Double).view([-1]));
        let scores = Vec::<f64>::from(&self.scores.to_kind(Kind::Double).view([-1]));
        let bboxes = Vec::<f64>::from(&self.bboxes.to_kind(Kind::Double).view([-1]));

        let rows = (0..batch_size as usize)
            .map(|batch| {
                (0..num_rows as usize)
                    .map(|row| batch * num_rows as usize + row)
                    .filter(|&index| ids[index] >= 0.0)
                    .map(|index| {
                        let bbox = &bboxes[index * 4..index * 4 + 4];
                        (
                            ids[index] as i64,
                            scores[index],
                            [bbox[0], bbox[1], bbox[2], bbox[3]],
                        )
                    })
                    .collect()
            })
            .collect();
        Ok(rows)
    }
}

/// Greedy per-class suppression over `[B, N, 6]` detections
/// `[class, score, x1, y1, x2, y2]`.
#[derive(Debug, Clone)]
pub struct NonMaxSuppression {
    iou_threshold: f64,
    valid_threshold: f64,
    topk: Option<usize>,
    post_nms: Option<usize>,
}

impl NonMaxSuppression {
    /// Suppression is skipped when the IoU threshold is outside `(0, 1)`.
    pub fn is_enabled(&self) -> bool {
        self.iou_threshold > 0.0 && self.iou_threshold < 1.0
    }

    pub fn forward(&self, detections: &Tensor) -> Result<NmsOutput> {
        let (batch_size, num_detections, entries) = detections.size3()?;
        ensure!(
            entries == 6,
            "expect [class, score, x1, y1, x2, y2] detections, but get {} entries",
            entries
        );
        let device = detections.device();
        let kind = detections.kind();

        if !self.is_enabled() {
            return Ok(NmsOutput {
                ids: detections.narrow(2, 0, 1),
                scores: detections.narrow(2, 1, 1),
                bboxes: detections.narrow(2, 2, 4),
            });
        }

        let values = tch::no_grad(|| {
            Vec::<f32>::from(&detections.to_device(Device::Cpu).to_kind(Kind::Float).view([-1]))
        });

        let kept: Vec<Vec<[f32; 6]>> = (0..batch_size as usize)
            .map(|batch| {
                let rows: Vec<[f32; 6]> = values
                    [batch * num_detections as usize * 6..(batch + 1) * num_detections as usize * 6]
                    .chunks_exact(6)
                    .map(|row| [row[0], row[1], row[2], row[3], row[4], row[5]])
                    .collect();
                self.suppress(rows)
            })
            .collect();

        let out_len = match self.post_nms {
            Some(post_nms) => post_nms,
            None => kept.iter().map(|rows| rows.len()).max().unwrap_or(0),
        };
        let mut padded = vec![-1f32; batch_size as usize * out_len * 6];
        for (batch, rows) in kept.iter().enumerate() {
            for (index, row) in rows.iter().take(out_len).enumerate() {
                let offset = (batch * out_len + index) * 6;
                padded[offset..offset + 6].copy_from_slice(row);
            }
        }

        let result = Tensor::of_slice(&padded)
            .view([batch_size, out_len as i64, 6])
            .to_kind(kind)
            .to_device(device);

        Ok(NmsOutput {
            ids: result.narrow(2, 0, 1),
            scores: result.narrow(2, 1, 1),
            bboxes: result.narrow(2, 2, 4),
        })
    }

    fn suppress(&self, rows: Vec<[f32; 6]>) -> Vec<[f32; 6]> {
        let mut candidates: Vec<[f32; 6]> = rows
            .into_iter()
            .filter(|row| row[0] >= 0.0 && row[1] as f64 > self.valid_threshold)
            .collect();
        candidates.sort_by(|lhs, rhs| rhs[1].partial_cmp(&lhs[1]).unwrap_or(Ordering::Equal));
        if let Some(topk) = self.topk {
            candidates.truncate(topk);
        }

        let mut kept: Vec<[f32; 6]> = vec![];
        for candidate in candidates {
            let suppressed = kept.iter().any(|other| {
                other[0] == candidate[0] && box_iou(&other[2..6], &candidate[2..6]) > self.iou_threshold
            });
            if !suppressed {
                kept.push(candidate);
            }
        }
        kept
    }
}

fn box_iou(lhs: &[f32], rhs: &[f32]) -> f64 {
    let [l1, t1, r1, b1] = [lhs[0], lhs[1], lhs[2], lhs[3]].map(|value| value as f64);
    let [l2, t2, r2, b2] = [rhs[0], rhs[1], rhs[2], rhs[3]].map(|value| value as f64);

    let inter_w = (r1.min(r2) - l1.max(l2)).max(0.0);
    let inter_h = (b1.min(b2) - t1.max(t2)).max(0.0);
    let inter = inter_w * inter_h;
    let union = (r1 - l1) * (b1 - t1) + (r2 - l2) * (b2 - t2) - inter;

    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suppress_same_class_overlaps() -> Result<()> {
        let nms = NonMaxSuppressionInit {
            post_nms: Some(4),
            ..Default::default()
        }
        .build()?;

        let detections = Tensor::of_slice(&[
            0f32, 0.9, 0.0, 0.0, 10.0, 10.0, // kept
            0.0, 0.8, 1.0, 1.0, 10.0, 10.0, // suppressed by the first
            1.0, 0.7, 1.0, 1.0, 10.0, 10.0, // another class
            0.0, 0.005, 20.0, 20.0, 30.0, 30.0, // below the valid threshold
            0.0, 0.6, 20.0, 20.0, 30.0, 30.0, // kept
        ])
        .view([1, 5, 6]);

        let output = nms.forward(&detections)?;
        assert_eq!(output.ids.size(), vec![1, 4, 1]);
        let rows = output.to_vec()?;
        let classes_scores: Vec<_> = rows[0].iter().map(|&(class, score, _)| (class, (score * 10.0).round())).collect();
        assert_eq!(classes_scores, vec![(0, 9.0), (1, 7.0), (0, 6.0)]);
        // the padding row
        assert_eq!(f64::from(&output.scores.i((0i64, 3i64, 0i64))), -1.0);
        Ok(())
    }

    #[test]
    fn scores_at_valid_threshold_are_dropped() -> Result<()> {
        let nms = NonMaxSuppressionInit {
            valid_threshold: r64(0.5),
            ..Default::default()
        }
        .build()?;

        let detections = Tensor::of_slice(&[
            0f32, 0.5, 0.0, 0.0, 10.0, 10.0, // at the threshold
            1.0, 0.5625, 0.0, 0.0, 10.0, 10.0, // kept
            2.0, 0.25, 0.0, 0.0, 10.0, 10.0, // below
        ])
        .view([1, 3, 6]);

        let rows = nms.forward(&detections)?.to_vec()?;
        assert_eq!(rows[0].len(), 1);
        assert_eq!(rows[0][0].0, 1);
        assert_eq!(rows[0][0].1, 0.5625);
        Ok(())
    }

    #[test]
    fn disabled_outside_unit_interval() -> Result<()> {
        let nms = NonMaxSuppressionInit {
            iou_threshold: r64(1.5),
            ..Default::default()
        }
        .build()?;
        assert!(!nms.is_enabled());

        let detections = Tensor::zeros(&[2, 7, 6], (Kind::Float, Device::Cpu));
        let output = nms.forward(&detections)?;
        assert_eq!(output.bboxes.size(), vec![2, 7, 4]);
        Ok(())
    }
}
