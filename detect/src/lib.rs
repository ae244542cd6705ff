//! The detection and evaluation program of the video detector.

mod common;
pub mod config;
pub mod detector;
pub mod evaluate;
pub mod input;
pub mod predictions;
pub mod visualize;

use crate::{common::*, config::Config, input::DetectInput, predictions::Predictions};
use det_metrics::get_class_map;
use vid_dataset::ClassList;

const COLOR_SEED: u64 = 233;

/// The entry of detection program.
pub async fn start(config: Arc<Config>) -> Result<()> {
    let model_file = config.model_file();
    if !model_file.is_file() {
        error!(
            "model doesn't appear where it's expected: {}",
            model_file.display()
        );
    }

    // load input
    let trained_on = match &config.trained_on {
        Some(files) => Some(ClassList::load(files).await?),
        None => None,
    };
    let input = DetectInput::load(&config, trained_on.as_ref()).await?;
    let DetectInput {
        ref dataset,
        by_video,
        ..
    } = input;
    let num_samples = config
        .max_do
        .map(|max_do| max_do.min(dataset.len()))
        .unwrap_or_else(|| dataset.len());
    info!("loaded {} samples, detecting on {}", dataset.len(), num_samples);

    let model_classes = trained_on.as_ref().unwrap_or_else(|| dataset.classes());
    let class_names: Vec<String> = model_classes.names().iter().cloned().collect();
    let class_map = trained_on
        .as_ref()
        .and_then(|trained_on| class_map(dataset.classes(), trained_on));

    let output_dir = config.output_dir();
    tokio::fs::create_dir_all(&output_dir).await?;
    let pred_dir = output_dir.join("pred");

    // load or compute predictions
    let predictions = match predictions::load_predictions(&pred_dir)? {
        Some(predictions) => {
            info!("reuse predictions in {}", pred_dir.display());
            predictions
        }
        None => {
            ensure!(
                model_file.is_file(),
                "cannot detect without model file {}",
                model_file.display()
            );
            let predictions = detector::detect(
                config.clone(),
                class_names.clone(),
                dataset.clone(),
                num_samples,
            )
            .instrument(info_span!("detect"))
            .await?;
            predictions::save_predictions(
                &pred_dir,
                &**dataset,
                num_samples,
                by_video,
                &predictions,
            )?;
            info!("saved predictions to {}", pred_dir.display());
            predictions
        }
    };
    let predictions = Arc::new(predictions);

    // draw
    if config.visualize {
        let vis_dir = output_dir.join("vis");
        visualize::visualize(
            vis_dir.clone(),
            dataset.clone(),
            num_samples,
            by_video,
            predictions.clone(),
            config.display_gt,
            Arc::new(visualize::class_colors(class_names.len(), COLOR_SEED)),
        )
        .instrument(info_span!("visualize"))
        .await?;
        info!("saved drawings to {}", vis_dir.display());
    }

    // score
    if !config.metrics.is_empty() {
        let results = {
            let config = config.clone();
            let dataset = dataset.clone();
            let predictions: Arc<Predictions> = predictions.clone();
            tokio::task::spawn_blocking(move || {
                evaluate::evaluate(
                    &config.metrics,
                    &*dataset,
                    num_samples,
                    &predictions,
                    class_map.as_deref(),
                )
            })
            .await??
        };

        for (kind, names, values) in results {
            for (name, value) in izip!(&names, &values) {
                info!("{} {}", name, value);
            }
            let path = output_dir.join(format!("{}.txt", kind.name()));
            evaluate::write_scores(&path, &names, &values)?;
        }
    }

    Ok(())
}

/// Maps evaluated classes to the model classes by WordNet id, or by name when
/// either list lacks ids. `None` when the lists are identical.
fn class_map(eval_classes: &ClassList, trained_classes: &ClassList) -> Option<Vec<i64>> {
    if eval_classes.names() == trained_classes.names() {
        return None;
    }

    let class_map = match (eval_classes.wn_ids(), trained_classes.wn_ids()) {
        (Some(eval_wn_ids), Some(trained_wn_ids)) => {
            let eval_wn_ids: Vec<_> = eval_wn_ids.iter().collect();
            let trained_wn_ids: Vec<_> = trained_wn_ids.iter().collect();
            get_class_map(&eval_wn_ids, &trained_wn_ids)
        }
        _ => {
            let eval_names: Vec<_> = eval_classes.names().iter().collect();
            let trained_names: Vec<_> = trained_classes.names().iter().collect();
            get_class_map(&eval_names, &trained_names)
        }
    };
    Some(class_map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_map_falls_back_to_names() -> Result<()> {
        let names = |names: &[&str]| -> IndexSet<String> {
            names.iter().map(|name| name.to_string()).collect()
        };
        let trained = ClassList::new(names(&["person", "car", "dog"]), None, None)?;
        let eval = ClassList::new(names(&["dog", "horse"]), None, None)?;
        assert_eq!(class_map(&eval, &trained), Some(vec![2, -1]));
        assert_eq!(class_map(&trained, &trained), None);
        Ok(())
    }
}
