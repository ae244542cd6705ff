use crate::{
    coco::CocoDataset,
    common::*,
    dataset::DetectionDataset,
    imagenet::{ImagenetDetDataset, ImagenetVidDataset},
    names::{ClassFiles, ClassList},
    voc::{VocDataset, VocSplit},
    window::VideoOptions,
    youtube_bb::{YoutubeBbDataset, YoutubeBbOptions},
    CombinedDataset,
};

/// Selects and parameterizes a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DatasetConfig {
    Voc {
        root: PathBuf,
        splits: Vec<VocSplit>,
        classes: ClassFiles,
    },
    Coco {
        root: PathBuf,
        split: String,
        #[serde(default)]
        classes: Option<ClassFiles>,
    },
    Det {
        root: PathBuf,
        split: String,
        classes: ClassFiles,
    },
    Vid {
        root: PathBuf,
        split: String,
        classes: ClassFiles,
        #[serde(default)]
        video: VideoOptions,
        /// Load motion IoUs for the motion-binned metric.
        #[serde(default)]
        motion_ious: bool,
    },
    Ytbb {
        root: PathBuf,
        split: String,
        classes: ClassFiles,
        #[serde(default)]
        options: YoutubeBbOptions,
        #[serde(default)]
        motion_ious: bool,
    },
}

impl DatasetConfig {
    /// The short name used in experiment names.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Voc { .. } => "voc",
            Self::Coco { .. } => "coco",
            Self::Det { .. } => "det",
            Self::Vid { .. } => "vid",
            Self::Ytbb { .. } => "ytbb",
        }
    }

    /// Whether samples carry a temporal window.
    pub fn window_size(&self) -> usize {
        match self {
            Self::Vid { video, .. } => video.window_size,
            Self::Ytbb { options, .. } => options.video.window_size,
            _ => 1,
        }
    }

    pub async fn load(&self) -> Result<Arc<dyn DetectionDataset>> {
        let dataset: Arc<dyn DetectionDataset> = match self {
            Self::Voc {
                root,
                splits,
                classes,
            } => {
                let classes = ClassList::load(classes).await?;
                Arc::new(VocDataset::load(root, splits, classes).await?)
            }
            Self::Coco {
                root,
                split,
                classes,
            } => {
                let classes = match classes {
                    Some(classes) => Some(ClassList::load(classes).await?),
                    None => None,
                };
                Arc::new(CocoDataset::load(root, split, classes).await?)
            }
            Self::Det {
                root,
                split,
                classes,
            } => {
                let classes = ClassList::load(classes).await?;
                Arc::new(ImagenetDetDataset::load(root, split, classes).await?)
            }
            Self::Vid {
                root,
                split,
                classes,
                video,
                motion_ious,
            } => {
                let classes = ClassList::load(classes).await?;
                let dataset = ImagenetVidDataset::load(root, split, classes, video.clone()).await?;
                let dataset = if *motion_ious {
                    dataset.load_motion_ious().await?
                } else {
                    dataset
                };
                Arc::new(dataset)
            }
            Self::Ytbb {
                root,
                split,
                classes,
                options,
                motion_ious,
            } => {
                let classes = ClassList::load(classes).await?;
                let dataset = YoutubeBbDataset::load(root, split, classes, options.clone()).await?;
                let dataset = if *motion_ious {
                    dataset.load_motion_ious().await?
                } else {
                    dataset
                };
                Arc::new(dataset)
            }
        };
        Ok(dataset)
    }
}

/// Loads a list of datasets. A single dataset is returned as is, several are
/// merged by WordNet id.
pub async fn load_datasets(configs: &[DatasetConfig]) -> Result<Arc<dyn DetectionDataset>> {
    ensure!(!configs.is_empty(), "no dataset is configured");
    let windows: HashSet<_> = configs.iter().map(|config| config.window_size()).collect();
    ensure!(
        windows.len() == 1,
        "datasets have different window sizes {:?}",
        windows
    );

    let mut datasets = vec![];
    for config in configs {
        datasets.push(config.load().await?);
    }

    if datasets.len() == 1 {
        return Ok(datasets.remove(0));
    }
    Ok(Arc::new(CombinedDataset::new(datasets)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tagged_dataset_configs() -> Result<()> {
        let configs: Vec<DatasetConfig> = serde_json::from_str(
            r#"[
                {
                    "type": "voc",
                    "root": "datasets/PascalVOC/VOCdevkit",
                    "splits": [{"year": "2007", "split": "trainval"}],
                    "classes": {"names_file": "names/voc.names", "wn_ids_file": "names/voc_wn.names"}
                },
                {
                    "type": "ytbb",
                    "root": "datasets/YouTubeBB",
                    "split": "train",
                    "classes": {"names_file": "names/ytbb.names", "ids_file": "names/ytbb_ids.names"},
                    "options": {"frames": 0.5, "window_size": 3}
                }
            ]"#,
        )?;

        assert_eq!(configs[0].name(), "voc");
        assert_eq!(configs[1].window_size(), 3);
        match &configs[1] {
            DatasetConfig::Ytbb { options, .. } => {
                assert!(options.clips);
                assert_eq!(options.video.frames, 0.5);
            }
            _ => unreachable!(),
        }
        Ok(())
    }
}
