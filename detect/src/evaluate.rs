//! Scores saved predictions against the dataset ground truth.

use crate::{
    common::*,
    config::MetricKind,
    predictions::{Prediction, Predictions},
};
use det_metrics::{
    CocoMApMetric, Detection, DetectionMetric, EvalImage, VidMApMetric, VocMApMetric,
};
use vid_dataset::{DetectionDataset, LabelUnit};

/// Ground truth of a sample in pixels of the original image.
pub fn pixel_labels(dataset: &dyn DetectionDataset, index: usize) -> Result<Vec<ObjectLabel>> {
    let labels = dataset.labels(index)?;
    let labels = match dataset.label_unit(index) {
        LabelUnit::Pixel => labels.to_vec(),
        LabelUnit::Normalized => {
            let size: HW<f64> = dataset
                .image_size(index)?
                .try_cast()
                .ok_or_else(|| format_err!("invalid image size"))?;
            let transform = Transform::from_sizes_exact(&HW::try_from_hw([1.0, 1.0])?, &size);
            labels.iter().map(|label| &transform * label).collect()
        }
    };
    Ok(labels)
}

/// Scored detections in pixels of an image of `size`. Boxes that collapse
/// after un-normalizing are dropped.
pub fn to_detections(predictions: &[Prediction], size: &HW<usize>) -> Vec<Detection> {
    predictions
        .iter()
        .filter_map(|prediction| {
            Some(Detection {
                class: usize::try_from(prediction.class).ok()?,
                score: R64::try_new(prediction.score)?,
                bbox: prediction.pixel_rect(size).ok()?,
            })
        })
        .collect()
}

pub fn build_metric(
    kind: MetricKind,
    dataset: &dyn DetectionDataset,
    class_map: Option<&[i64]>,
) -> Result<Box<dyn DetectionMetric + Send>> {
    let class_names: Vec<String> = dataset.classes().names().iter().cloned().collect();
    let metric: Box<dyn DetectionMetric + Send> = match kind {
        MetricKind::Voc => Box::new(VocMApMetric::new(0.5, class_names, class_map, false)?),
        MetricKind::Coco => Box::new(CocoMApMetric::new(class_names, class_map)),
        MetricKind::Vid => {
            ensure!(
                dataset.motion_ious().is_some(),
                "the vid metric needs motion IoUs, enable 'motion_ious' on the dataset"
            );
            Box::new(VidMApMetric::new(0.5, class_names.len(), class_map)?)
        }
    };
    Ok(metric)
}

/// Runs every metric over the first `num_samples` samples. Returns the
/// metric names paired with their values.
pub fn evaluate(
    kinds: &[MetricKind],
    dataset: &dyn DetectionDataset,
    num_samples: usize,
    predictions: &Predictions,
    class_map: Option<&[i64]>,
) -> Result<Vec<(MetricKind, Vec<String>, Vec<f64>)>> {
    let mut metrics: Vec<_> = kinds
        .iter()
        .map(|&kind| -> Result<_> { Ok((kind, build_metric(kind, dataset, class_map)?)) })
        .try_collect()?;
    let motion_ious = dataset.motion_ious();

    for index in 0..num_samples.min(dataset.len()) {
        let size = dataset.image_size(index)?;
        let detections = predictions
            .get(dataset.sample_id(index)?)
            .map(|rows| to_detections(rows, &size))
            .unwrap_or_default();
        let image = EvalImage::new(detections, pixel_labels(dataset, index)?);
        let image_with_motion = match motion_ious {
            Some(ious) => Some(image.clone().with_motion_ious(ious[index].clone())?),
            None => None,
        };

        for (kind, metric) in &mut metrics {
            match (kind, &image_with_motion) {
                (MetricKind::Vid, Some(image)) => metric.update(image)?,
                _ => metric.update(&image)?,
            }
        }
    }

    let results = metrics
        .into_iter()
        .map(|(kind, metric)| {
            let (names, values) = metric.get();
            (kind, names, values)
        })
        .collect();
    Ok(results)
}

/// Writes `name value` lines.
pub fn write_scores(path: &Path, names: &[String], values: &[f64]) -> Result<()> {
    let text: String = izip!(names, values)
        .map(|(name, value)| format!("{} {}\n", name, value))
        .collect();
    fs::write(path, text).with_context(|| format!("failed to write '{}'", path.display()))?;
    Ok(())
}
