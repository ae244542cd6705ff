//! Runs the detector over the input samples.

use crate::{
    common::*,
    config::Config,
    predictions::{Prediction, Predictions},
};
use vid_dataset::{Batch, DataLoader, DetectionDataset, LoaderConfig};
use yolo_vid::{YoloVid, YoloVidInit};

/// Builds the detector for `classes` and loads the trained parameters.
pub fn load_model(config: &Config, classes: Vec<String>) -> Result<(nn::VarStore, YoloVid)> {
    let mut vs = nn::VarStore::new(config.device);
    let model = {
        let mut model_config = config.model.clone();
        model_config.num_classes = 0;
        YoloVidInit {
            config: model_config,
            classes,
        }
        .build(&vs.root())?
    };

    let model_file = config.model_file();
    info!("load model parameters {}", model_file.display());
    vs.load(&model_file)
        .with_context(|| format!("failed to load '{}'", model_file.display()))?;

    Ok((vs, model))
}

/// Detects on the first `num_samples` samples. A data task loads batches
/// while the model runs in a blocking worker.
pub async fn detect(
    config: Arc<Config>,
    classes: Vec<String>,
    dataset: Arc<dyn DetectionDataset>,
    num_samples: usize,
) -> Result<Predictions> {
    ensure!(num_samples > 0, "nothing to detect on");
    let batch_size = config.batch_size.get().min(num_samples);
    let loader = DataLoader::new(
        dataset.clone(),
        LoaderConfig {
            image_size: config.data_shape,
            temporal: config.model.is_temporal(),
            ..LoaderConfig::new(batch_size)
        },
    )?;
    let num_batches = loader.num_batches(Some(num_samples));
    let (data_tx, mut data_rx) = mpsc::channel::<Batch>(2);

    let data_future = tokio::task::spawn(
        async move {
            let mut batches = loader.epoch(0, Some(num_samples), false);
            while let Some(batch) = batches.next().await {
                data_tx
                    .send(batch?)
                    .await
                    .map_err(|_| format_err!("the detection worker stopped"))?;
            }
            Fallible::Ok(())
        }
        .instrument(info_span!("loader")),
    )
    .map(|result| Fallible::Ok(result??));

    let worker_future = tokio::task::spawn_blocking(move || -> Result<_> {
        let (vs, mut model) = load_model(&config, classes)?;
        let threshold = config.threshold.raw();
        let mut predictions = Predictions::new();
        let mut batch_index = 0;

        while let Some(batch) = data_rx.blocking_recv() {
            let images = batch.images.to_device(vs.device());
            let rows = model.detect(&images)?.to_vec()?;

            for (&index, rows) in izip!(&batch.indices, rows) {
                let sample_id = dataset.sample_id(index)?.to_owned();
                predictions.insert(sample_id, to_predictions(rows, batch.image_size, threshold));
            }

            batch_index += 1;
            if batch_index % 100 == 0 || batch_index == num_batches {
                info!("detected batch {}/{}", batch_index, num_batches);
            }
        }

        Ok(predictions)
    })
    .map(|result| Fallible::Ok(result??));

    let ((), predictions) = futures::try_join!(data_future, worker_future)?;
    Ok(predictions)
}

/// Keeps classified detections scoring above `threshold`, clipped to the
/// canvas and normalized by its size.
pub fn to_predictions(
    rows: Vec<(i64, f64, [f64; 4])>,
    image_size: usize,
    threshold: f64,
) -> Vec<Prediction> {
    let size = image_size as f64;
    let normalize = |value: f64| value.max(0.0).min(size) / size;

    rows.into_iter()
        .filter(|&(class, score, _)| class >= 0 && score > threshold)
        .map(|(class, score, [x1, y1, x2, y2])| Prediction {
            class,
            score,
            x1: normalize(x1),
            y1: normalize(y1),
            x2: normalize(x2),
            y2: normalize(y2),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predictions_are_normalized_and_thresholded() {
        let rows = vec![
            (2, 0.9, [-10.0, 100.0, 200.0, 500.0]),
            (1, 0.05, [0.0, 0.0, 10.0, 10.0]),
            (-1, 0.8, [0.0, 0.0, 10.0, 10.0]),
        ];
        let predictions = to_predictions(rows, 400, 0.1);

        assert_eq!(
            predictions,
            vec![Prediction {
                class: 2,
                score: 0.9,
                x1: 0.0,
                y1: 0.25,
                x2: 0.5,
                y2: 1.0,
            }]
        );
    }
}
