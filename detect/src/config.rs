//! Detection program configuration format.

use crate::common::*;
use vid_dataset::{ClassFiles, DatasetConfig};
use yolo_vid::ModelConfig;

pub use input::*;
pub use metric::*;

pub static CONFIG_VERSION: Lazy<VersionReq> = Lazy::new(|| VersionReq::parse("0.1.0").unwrap());

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(deserialize_with = "deserialize_version")]
    pub version: Version,
    /// A dataset, or a path to a `.jpg` image, a `.mp4` video or a `.txt`
    /// list of either.
    pub dataset: InputConfig,
    /// Parameter file name inside the experiment directory.
    pub model_path: PathBuf,
    /// Name of the experiment directory.
    pub save_prefix: String,
    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,
    /// Output directory inside the experiment directory.
    #[serde(default = "default_save_dir")]
    pub save_dir: PathBuf,
    #[serde(default = "default_batch_size")]
    pub batch_size: NonZeroUsize,
    #[serde(default = "default_data_shape")]
    pub data_shape: usize,
    /// Detections scoring at or below are dropped.
    #[serde(default = "default_threshold")]
    pub threshold: R64,
    /// Limits the number of detected samples.
    #[serde(default)]
    pub max_do: Option<usize>,
    #[serde(default = "default_metrics")]
    pub metrics: Vec<MetricKind>,
    #[serde(default = "default_true")]
    pub visualize: bool,
    /// Draw ground truth boxes along with the predictions.
    #[serde(default = "default_true")]
    pub display_gt: bool,
    /// Classes the model was trained on when they differ from the dataset.
    #[serde(default)]
    pub trained_on: Option<ClassFiles>,
    #[serde(with = "tch_serde::serde_device")]
    pub device: Device,
    #[serde(default)]
    pub model: ModelConfig,
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
            self.data_shape > 0 && self.data_shape % 32 == 0,
            "data_shape must be a positive multiple of 32"
        );
        ensure!(
            self.threshold >= 0.0 && self.threshold <= 1.0,
            "threshold must be in range [0, 1]"
        );
        if let InputConfig::Path(path) = &self.dataset {
            InputFileKind::from_path(path)?;
            ensure!(
                self.trained_on.is_some(),
                "trained_on classes are required to detect on '{}'",
                path.display()
            );
            ensure!(
                self.metrics.is_empty(),
                "metrics need a dataset with ground truth"
            );
        }
        Ok(())
    }

    /// The experiment directory, `<models_dir>/<save_prefix>`.
    pub fn experiment_dir(&self) -> PathBuf {
        self.models_dir.join(&self.save_prefix)
    }

    /// The parameter file inside the experiment directory.
    pub fn model_file(&self) -> PathBuf {
        self.experiment_dir().join(&self.model_path)
    }

    /// Where predictions, drawings and scores go. Datasets get a
    /// sub-directory named after their kind.
    pub fn output_dir(&self) -> PathBuf {
        let dir = self.experiment_dir().join(&self.save_dir);
        match &self.dataset {
            InputConfig::Dataset(dataset) => dir.join(dataset.name()),
            InputConfig::Path(_) => dir,
        }
    }
}

mod input {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(untagged)]
    pub enum InputConfig {
        Dataset(DatasetConfig),
        Path(PathBuf),
    }

    /// Input files told apart by extension.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum InputFileKind {
        Image,
        Video,
        List,
    }

    impl InputFileKind {
        pub fn from_path(path: &Path) -> Result<Self> {
            let extension = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| ext.to_ascii_lowercase());
            let kind = match extension.as_deref() {
                Some("jpg") | Some("jpeg") | Some("png") => Self::Image,
                Some("mp4") => Self::Video,
                Some("txt") => Self::List,
                _ => bail!(
                    "'{}' is not a .jpg image, a .mp4 video or a .txt list",
                    path.display()
                ),
            };
            Ok(kind)
        }
    }
}

mod metric {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum MetricKind {
        /// VOC mAP at IoU 0.5.
        Voc,
        /// COCO mAP over IoU 0.5:0.95.
        Coco,
        /// VOC mAP binned by motion speed.
        Vid,
    }

    impl MetricKind {
        pub fn name(&self) -> &'static str {
            match self {
                Self::Voc => "voc",
                Self::Coco => "coco",
                Self::Vid => "vid",
            }
        }
    }
}

fn default_models_dir() -> PathBuf {
    "models".into()
}

fn default_save_dir() -> PathBuf {
    "eval".into()
}

fn default_batch_size() -> NonZeroUsize {
    NonZeroUsize::new(1).unwrap()
}

fn default_data_shape() -> usize {
    416
}

fn default_threshold() -> R64 {
    r64(0.0)
}

fn default_metrics() -> Vec<MetricKind> {
    vec![MetricKind::Voc]
}

fn default_true() -> bool {
    true
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

    #[test]
    fn parse_dataset_input() -> Result<()> {
        let config: Config = json5::from_str(
            r#"{
                version: "0.1.0",
                dataset: {
                    type: "vid",
                    root: "datasets/ImageNetVID",
                    split: "val",
                    classes: {names_file: "names/vid.names"},
                },
                model_path: "yolo3_darknet53_vid_best.params",
                save_prefix: "0001",
                metrics: ["voc", "vid"],
                device: "cpu",
            }"#,
        )?;
        config.validate()?;

        assert!(matches!(config.dataset, InputConfig::Dataset(_)));
        assert_eq!(config.batch_size.get(), 1);
        assert_eq!(config.metrics, vec![MetricKind::Voc, MetricKind::Vid]);
        assert_eq!(
            config.model_file(),
            Path::new("models/0001/yolo3_darknet53_vid_best.params")
        );
        assert_eq!(config.output_dir(), Path::new("models/0001/eval/vid"));
        Ok(())
    }

    #[test]
    fn parse_file_input() -> Result<()> {
        let text = r#"{
            version: "0.1.0",
            dataset: "videos/street.mp4",
            model_path: "yolo3_darknet53_voc_best.params",
            save_prefix: "0001",
            trained_on: {names_file: "names/voc.names"},
            metrics: [],
            device: "cpu",
        }"#;
        let config: Config = json5::from_str(text)?;
        config.validate()?;

        assert_eq!(
            config.dataset,
            InputConfig::Path("videos/street.mp4".into())
        );
        assert_eq!(config.output_dir(), Path::new("models/0001/eval"));

        // file inputs have no ground truth to score
        let config: Config = json5::from_str(&text.replace("metrics: [],", ""))?;
        assert!(config.validate().is_err());
        Ok(())
    }

    #[test]
    fn input_kind_by_extension() -> Result<()> {
        assert_eq!(
            InputFileKind::from_path(Path::new("a/b.JPG"))?,
            InputFileKind::Image
        );
        assert_eq!(
            InputFileKind::from_path(Path::new("list.txt"))?,
            InputFileKind::List
        );
        assert!(InputFileKind::from_path(Path::new("clip.avi")).is_err());
        Ok(())
    }
}
