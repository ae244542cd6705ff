//! The training program of the video detector.

pub mod common;
pub mod config;
pub mod logging;
pub mod train;
pub mod training_stream;
pub mod utils;

use crate::{
    common::*,
    config::{Config, DatasetsConfig},
    train::{ValidationSetup, WorkerSetup},
    training_stream::{EpochCutoff, TrainingStream},
};
use det_metrics::get_class_map;
use vid_dataset::{load_datasets, ClassList, ClassTree, DatasetConfig};
use yolo_vid::Hierarchy;

/// The entry of training program.
pub async fn start(config: Arc<Config>) -> Result<()> {
    let experiment_dir = config.experiment_dir();
    let file_prefix = config.file_prefix();

    // refuse to overwrite a finished or running experiment
    if experiment_dir.exists() && config.training.resume.is_none() {
        bail!(
            "{} exists so won't overwrite and restart training, set 'resume' to continue it",
            experiment_dir.display()
        );
    }

    // create dirs and save config
    {
        tokio::fs::create_dir_all(&experiment_dir).await?;
        let path = experiment_dir.join("config.json5");
        let text = serde_json::to_string_pretty(&*config)?;
        tokio::fs::write(&path, text).await?;
    }

    // load datasets
    info!("loading datasets");
    let DatasetsConfig {
        train: ref train_configs,
        val: ref val_configs,
        ref class_tree,
    } = config.datasets;
    check_window_size(train_configs, config.model.k)?;
    check_window_size(val_configs, config.model.k)?;

    let train_dataset = load_datasets(train_configs).await?;
    let val_dataset = if val_configs.is_empty() {
        warn!("no validation dataset is configured, validation is skipped");
        None
    } else {
        Some(load_datasets(val_configs).await?)
    };
    info!(
        "loaded {} training samples of {} classes",
        train_dataset.len(),
        train_dataset.classes().len()
    );

    // resolve classes
    let train_classes: Vec<String> = train_dataset.classes().names().iter().cloned().collect();
    let hierarchy = match class_tree {
        Some(path) => {
            let tree = ClassTree::load(path, train_dataset.classes()).await?;
            Some(Hierarchy::new(tree.levels, tree.leafs)?)
        }
        None => config.model.hierarchical.clone(),
    };
    let trained_on_classes = match &config.training.trained_on {
        Some(trained_on) => {
            let classes = ClassList::load(&trained_on.classes).await?;
            Some(classes.names().iter().cloned().collect())
        }
        None => None,
    };
    let validation = val_dataset.as_ref().map(|dataset| ValidationSetup {
        class_names: dataset.classes().names().iter().cloned().collect(),
        class_map: class_map(dataset.classes(), train_dataset.classes()),
        coco: val_configs
            .iter()
            .all(|config| matches!(config, DatasetConfig::Coco { .. })),
    });

    // pick the checkpoint to resume from
    let (resume_file, start_epoch) = resume_point(&config)?;
    ensure!(
        start_epoch < config.training.epochs,
        "training already reached epoch {}",
        start_epoch
    );

    // create channels
    let (logging_tx, logging_rx) = broadcast::channel(64);
    let (data_tx, data_rx) = mpsc::channel(2);
    let cutoff = EpochCutoff::default();

    let training_stream = TrainingStream::new(
        config.clone(),
        train_dataset,
        val_dataset,
        start_epoch,
        cutoff.clone(),
    )?;
    let setup = WorkerSetup {
        train_classes,
        trained_on_classes,
        hierarchy,
        validation,
        resume_file,
        start_epoch,
        num_batches: training_stream.num_batches(),
        file_prefix: file_prefix.clone(),
    };

    // start logger
    let logging_future = logging::logging_worker(
        experiment_dir.join("tb").join(config.net_name()),
        utils::train_log_path(&file_prefix),
        logging_rx,
    );

    // feeding worker
    let training_data_future =
        tokio::task::spawn(training_stream.feed(data_tx).instrument(info_span!("feeder")))
            .map(|result| Fallible::Ok(result??));

    // training worker
    let training_worker_future = tokio::task::spawn_blocking(move || {
        train::single_gpu_training_worker(config, setup, data_rx, logging_tx, cutoff)
    })
    .map(|result| Fallible::Ok(result??));

    futures::try_join!(training_data_future, training_worker_future, logging_future)?;

    Ok(())
}

fn check_window_size(configs: &[DatasetConfig], k: usize) -> Result<()> {
    for config in configs {
        let window_size = config.window_size();
        ensure!(
            window_size == k,
            "the {} dataset yields windows of {} frames, but the model takes {}",
            config.name(),
            window_size,
            k
        );
    }
    Ok(())
}

/// Maps evaluated classes to trained classes by WordNet id, or by name when
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

fn resume_point(config: &Config) -> Result<(Option<PathBuf>, usize)> {
    let start_epoch = config.training.start_epoch;

    let point = match &config.training.resume {
        None => (None, start_epoch.unwrap_or(0)),
        Some(path) if path.is_dir() => match utils::find_latest_checkpoint(path)? {
            Some((file, epoch)) => (Some(file), start_epoch.unwrap_or(epoch + 1)),
            None => (None, start_epoch.unwrap_or(0)),
        },
        Some(path) => {
            ensure!(
                path.is_file(),
                "resume checkpoint '{}' does not exist",
                path.display()
            );
            (Some(path.clone()), start_epoch.unwrap_or(0))
        }
    };
    Ok(point)
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexSet;

    fn class_list(names: &[&str], wn_ids: Option<&[&str]>) -> Result<ClassList> {
        let names: IndexSet<String> = names.iter().map(|name| name.to_string()).collect();
        let wn_ids = wn_ids.map(|ids| ids.iter().map(|id| id.to_string()).collect());
        ClassList::new(names, wn_ids, None)
    }

    #[test]
    fn class_map_by_wn_id_or_name() -> Result<()> {
        let trained = class_list(&["dog", "car"], Some(&["n1", "n2"]))?;

        let same = class_list(&["dog", "car"], Some(&["n1", "n2"]))?;
        assert_eq!(class_map(&same, &trained), None);

        let eval = class_list(&["automobile", "cat"], Some(&["n2", "n3"]))?;
        assert_eq!(class_map(&eval, &trained), Some(vec![1, -1]));

        let eval = class_list(&["car", "bird"], None)?;
        assert_eq!(class_map(&eval, &trained), Some(vec![1, -1]));
        Ok(())
    }

    #[test]
    fn window_sizes_match_the_model() -> Result<()> {
        let configs: Vec<DatasetConfig> = serde_json::from_str(
            r#"[{
                "type": "vid",
                "root": "datasets/ImageNetVID",
                "split": "train",
                "classes": {"names_file": "names/vid.names"},
                "video": {"window_size": 3}
            }]"#,
        )?;
        assert!(check_window_size(&configs, 3).is_ok());
        assert!(check_window_size(&configs, 1).is_err());
        Ok(())
    }
}
