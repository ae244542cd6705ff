//! Training program configuration format.

use crate::common::*;
use vid_dataset::{ClassFiles, DatasetConfig};
use yolo_vid::{ClassReuse, ModelConfig};

pub use datasets::*;
pub use training::*;

pub static CONFIG_VERSION: Lazy<VersionReq> = Lazy::new(|| VersionReq::parse("0.1.0").unwrap());

/// The main training configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(deserialize_with = "deserialize_version")]
    pub version: Version,
    /// Name of the experiment directory.
    pub save_prefix: String,
    /// Parent directory of experiments.
    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,
    pub datasets: DatasetsConfig,
    pub model: ModelConfig,
    pub training: TrainingConfig,
}

impl Config {
    pub fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let text = fs::read_to_string(path)?;
        let config: Self = json5::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.save_prefix.is_empty(), "save_prefix must not be empty");
        ensure!(
            !self.datasets.train.is_empty(),
            "at least one training dataset is required"
        );
        self.training.validate()?;
        Ok(())
    }

    /// The experiment directory, `<models_dir>/<save_prefix>`.
    pub fn experiment_dir(&self) -> PathBuf {
        self.models_dir.join(&self.save_prefix)
    }

    /// The network name, `yolo3_darknet53_<datasets>`.
    pub fn net_name(&self) -> String {
        let datasets = self
            .datasets
            .train
            .iter()
            .map(|dataset| dataset.name())
            .join("-");
        format!("yolo3_darknet53_{}", datasets)
    }

    /// Path prefix of every file the experiment writes.
    pub fn file_prefix(&self) -> PathBuf {
        self.experiment_dir().join(self.net_name())
    }
}

mod datasets {
    use super::*;

    /// Training and validation datasets.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct DatasetsConfig {
        pub train: Vec<DatasetConfig>,
        /// Validation is skipped when empty.
        #[serde(default)]
        pub val: Vec<DatasetConfig>,
        /// `child parent` lines enabling hierarchical class masking.
        #[serde(default)]
        pub class_tree: Option<PathBuf>,
    }
}

mod training {
    use super::*;

    /// The training options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct TrainingConfig {
        pub batch_size: NonZeroUsize,
        pub epochs: usize,
        /// The first epoch. When resuming from a directory it defaults to the
        /// epoch after the latest checkpoint.
        #[serde(default)]
        pub start_epoch: Option<usize>,
        /// Canvas size of validation and of fixed shape training.
        #[serde(default = "default_data_shape")]
        pub data_shape: usize,
        /// Draw the training canvas size from 320 to 608 every 10 batches.
        #[serde(default = "default_true")]
        pub random_shape: bool,
        #[serde(default = "default_flip_prob")]
        pub flip_prob: R64,
        pub lr: R64,
        pub lr_mode: LearningRateSchedule,
        #[serde(default = "default_zero")]
        pub warmup_lr: R64,
        #[serde(default)]
        pub warmup_epochs: usize,
        #[serde(default = "default_momentum")]
        pub momentum: R64,
        #[serde(default = "default_weight_decay")]
        pub wd: R64,
        #[serde(default)]
        pub mixup: bool,
        /// Mixup is off in the last epochs.
        #[serde(default = "default_no_mixup_epochs")]
        pub no_mixup_epochs: usize,
        #[serde(default)]
        pub label_smooth: bool,
        #[serde(default = "default_one")]
        pub val_interval: NonZeroUsize,
        /// Save every `save_interval` epochs. A negative value saves every
        /// epoch and prunes all but each `-save_interval`th one.
        #[serde(default = "default_save_interval")]
        pub save_interval: i64,
        /// Samples per epoch, the whole dataset when absent.
        #[serde(default)]
        pub num_samples: Option<usize>,
        /// Minutes an epoch may run before it is cut off.
        #[serde(default)]
        pub max_epoch_time: Option<R64>,
        /// Weights loaded partially before the class reset, e.g. a backbone.
        #[serde(default)]
        pub pretrained: Option<PathBuf>,
        /// A checkpoint file, or an experiment directory to take the latest
        /// checkpoint from.
        #[serde(default)]
        pub resume: Option<PathBuf>,
        #[serde(default)]
        pub trained_on: Option<TrainedOn>,
        /// Keep the backbone weights fixed.
        #[serde(default)]
        pub freeze_base: bool,
        #[serde(default = "default_log_interval")]
        pub log_interval: NonZeroUsize,
        #[serde(with = "tch_serde::serde_device")]
        pub device: Device,
        #[serde(default = "default_seed")]
        pub seed: u64,
    }

    impl TrainingConfig {
        pub fn validate(&self) -> Result<()> {
            ensure!(self.epochs > 0, "epochs must be positive");
            if let Some(start_epoch) = self.start_epoch {
                ensure!(
                    start_epoch < self.epochs,
                    "start_epoch {} must be less than epochs {}",
                    start_epoch,
                    self.epochs
                );
            }
            ensure!(self.lr > 0.0, "lr must be positive");
            ensure!(self.warmup_lr >= 0.0, "warmup_lr must be non-negative");
            ensure!(
                self.warmup_epochs < self.epochs,
                "warmup_epochs must be less than epochs"
            );
            ensure!(
                (0.0..=1.0).contains(&self.flip_prob.raw()),
                "flip_prob must be in range [0, 1]"
            );
            ensure!(self.save_interval != 0, "save_interval must not be zero");
            ensure!(self.num_samples != Some(0), "num_samples must be positive");
            if let Some(minutes) = self.max_epoch_time {
                ensure!(minutes > 0.0, "max_epoch_time must be positive");
            }
            self.lr_mode.validate()?;
            Ok(())
        }

        pub fn mixup_enabled(&self, epoch: usize) -> bool {
            self.mixup && epoch + self.no_mixup_epochs < self.epochs
        }

        pub fn max_epoch_duration(&self) -> Option<Duration> {
            self.max_epoch_time
                .map(|minutes| Duration::from_secs_f64(minutes.raw() * 60.0))
        }
    }

    /// The learning rate scheduling strategy after the warmup.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    pub enum LearningRateSchedule {
        /// Multiply the lr by `lr_decay` at each decay epoch.
        Step {
            #[serde(default = "default_lr_decay")]
            lr_decay: R64,
            /// If positive, decay every this many epochs instead of at
            /// `lr_decay_epoch`.
            #[serde(default)]
            lr_decay_period: usize,
            #[serde(default = "default_lr_decay_epoch")]
            lr_decay_epoch: Vec<usize>,
        },
        /// Polynomial decay of power 2 to zero.
        Poly,
        /// Cosine decay to zero.
        Cosine,
    }

    impl LearningRateSchedule {
        fn validate(&self) -> Result<()> {
            if let Self::Step { lr_decay, .. } = self {
                ensure!(
                    *lr_decay > 0.0 && *lr_decay <= 1.0,
                    "lr_decay must be in range (0, 1]"
                );
            }
            Ok(())
        }

        /// Epochs where the step schedule decays.
        pub fn decay_epochs(&self, epochs: usize) -> Vec<usize> {
            match self {
                Self::Step {
                    lr_decay_period,
                    lr_decay_epoch,
                    ..
                } => {
                    if *lr_decay_period > 0 {
                        (*lr_decay_period..epochs).step_by(*lr_decay_period).collect()
                    } else {
                        lr_decay_epoch.iter().copied().sorted().collect()
                    }
                }
                _ => vec![],
            }
        }
    }

    /// Start from a detector trained on other classes.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct TrainedOn {
        /// Classes the pretrained detector predicts.
        pub classes: ClassFiles,
        /// Output rows copied into the new classes.
        #[serde(default)]
        pub reuse: Option<ClassReuse>,
    }
}

fn default_models_dir() -> PathBuf {
    PathBuf::from("models")
}

fn default_zero() -> R64 {
    r64(0.0)
}

fn default_data_shape() -> usize {
    416
}

fn default_true() -> bool {
    true
}

fn default_flip_prob() -> R64 {
    r64(0.5)
}

fn default_momentum() -> R64 {
    r64(0.9)
}

fn default_weight_decay() -> R64 {
    r64(0.0005)
}

fn default_no_mixup_epochs() -> usize {
    20
}

fn default_one() -> NonZeroUsize {
    NonZeroUsize::new(1).unwrap()
}

fn default_save_interval() -> i64 {
    -10
}

fn default_log_interval() -> NonZeroUsize {
    NonZeroUsize::new(100).unwrap()
}

fn default_seed() -> u64 {
    233
}

fn default_lr_decay() -> R64 {
    r64(0.1)
}

fn default_lr_decay_epoch() -> Vec<usize> {
    vec![160, 180]
}

pub fn deserialize_version<'de, D>(deserializer: D) -> Result<Version, D::Error>
where
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    let version = Version::parse(&text).map_err(|err| {
        D::Error::custom(format!(
            "failed to parse version number '{}': {:?}",
            text, err
        ))
    })?;

    if !CONFIG_VERSION.matches(&version) {
        return Err(D::Error::custom(format!(
            "incompatible version: get '{}', but it is incompatible with requirement '{}'",
            version, &*CONFIG_VERSION,
        )));
    }

    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"{
        version: "0.1.0",
        save_prefix: "0001",
        datasets: {
            train: [
                {
                    type: "voc",
                    root: "datasets/PascalVOC/VOCdevkit",
                    splits: [{year: "2007", split: "trainval"}],
                    classes: {names_file: "names/voc.names"},
                },
                {
                    type: "det",
                    root: "datasets/ImageNetDET",
                    split: "train",
                    classes: {names_file: "names/det.names", wn_ids_file: "names/det_wn.names"},
                },
            ],
        },
        model: {},
        training: {
            batch_size: 8,
            epochs: 200,
            lr: 0.001,
            lr_mode: {type: "step", lr_decay_period: 60},
            device: "cpu",
        },
    }"#;

    #[test]
    fn parse_training_config() -> Result<()> {
        let config: Config = json5::from_str(CONFIG)?;
        config.validate()?;

        assert_eq!(config.net_name(), "yolo3_darknet53_voc-det");
        assert_eq!(
            config.file_prefix(),
            Path::new("models/0001/yolo3_darknet53_voc-det")
        );
        assert_eq!(config.training.save_interval, -10);
        assert_eq!(
            config.training.lr_mode.decay_epochs(config.training.epochs),
            vec![60, 120, 180]
        );
        assert!(!config.training.mixup_enabled(0));
        assert!(!config.training.freeze_base);
        Ok(())
    }

    #[test]
    fn mixup_stops_before_the_last_epochs() -> Result<()> {
        let mut config: Config = json5::from_str(CONFIG)?;
        config.training.mixup = true;
        assert!(config.training.mixup_enabled(179));
        assert!(!config.training.mixup_enabled(180));
        Ok(())
    }

    #[test]
    fn reject_incompatible_version() {
        let text = CONFIG.replace("\"0.1.0\"", "\"0.2.0\"");
        assert!(json5::from_str::<Config>(&text).is_err());
    }
}
