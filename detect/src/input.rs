//! The samples to detect on: a dataset, or bare images and videos.

use crate::{
    common::*,
    config::{Config, InputConfig, InputFileKind},
};
use tempfile::TempDir;
use tokio::process::Command;
use vid_dataset::{window_indices, ClassList, DatasetConfig, DetectionDataset, Sample};

/// The loaded input. Frames split from videos live in a temporary
/// directory that is removed on drop.
#[derive(Debug)]
pub struct DetectInput {
    pub dataset: Arc<dyn DetectionDataset>,
    /// Samples are video frames, grouped by their parent directory.
    pub by_video: bool,
    _frames_dir: Option<TempDir>,
}

impl DetectInput {
    /// Loads the configured input. `classes` names the model outputs and is
    /// required for file inputs.
    pub async fn load(config: &Config, classes: Option<&ClassList>) -> Result<Self> {
        let window_size = config.model.k;

        let input = match &config.dataset {
            InputConfig::Dataset(dataset_config) => {
                ensure!(
                    dataset_config.window_size() == window_size,
                    "the {} dataset yields windows of {} frames, but the model takes {}",
                    dataset_config.name(),
                    dataset_config.window_size(),
                    window_size
                );
                Self {
                    dataset: dataset_config.load().await?,
                    by_video: matches!(
                        dataset_config,
                        DatasetConfig::Vid { .. } | DatasetConfig::Ytbb { .. }
                    ),
                    _frames_dir: None,
                }
            }
            InputConfig::Path(path) => {
                let classes = classes
                    .ok_or_else(|| format_err!("classes are required to detect on files"))?
                    .clone();
                Self::load_files(path, classes, window_size).await?
            }
        };

        ensure!(!input.dataset.is_empty(), "nothing to detect on");
        Ok(input)
    }

    async fn load_files(path: &Path, classes: ClassList, window_size: usize) -> Result<Self> {
        let files = match InputFileKind::from_path(path)? {
            InputFileKind::List => read_file_list(path).await?,
            _ => vec![path.to_owned()],
        };
        let kinds: Vec<_> = files
            .iter()
            .map(|file| InputFileKind::from_path(file))
            .try_collect()?;

        let input = match kinds.first() {
            Some(InputFileKind::Image) => {
                ensure!(
                    kinds.iter().all(|&kind| kind == InputFileKind::Image),
                    "'{}' mixes images with other files",
                    path.display()
                );
                Self {
                    dataset: Arc::new(FileDataset::from_images(classes, files, window_size)),
                    by_video: false,
                    _frames_dir: None,
                }
            }
            Some(InputFileKind::Video) => {
                ensure!(
                    kinds.iter().all(|&kind| kind == InputFileKind::Video),
                    "'{}' mixes videos with other files",
                    path.display()
                );
                let frames_dir = tempfile::Builder::new().prefix("detect-frames").tempdir()?;
                let mut videos = vec![];
                for file in &files {
                    videos.push(split_video(file, frames_dir.path()).await?);
                }
                Self {
                    dataset: Arc::new(FileDataset::from_videos(classes, videos, window_size)),
                    by_video: true,
                    _frames_dir: Some(frames_dir),
                }
            }
            Some(InputFileKind::List) => bail!("nested list files are not supported"),
            None => bail!("'{}' lists no files", path.display()),
        };
        Ok(input)
    }
}

/// Images and video frames without ground truth.
#[derive(Debug)]
pub struct FileDataset {
    classes: ClassList,
    samples: Vec<Sample>,
}

impl FileDataset {
    /// Still images. A temporal model sees the image repeated.
    pub fn from_images(classes: ClassList, images: Vec<PathBuf>, window_size: usize) -> Self {
        let samples = images
            .into_iter()
            .map(|path| {
                let frames = vec![path.clone(); window_size];
                Sample::new(path.display().to_string(), path, vec![]).with_frames(frames)
            })
            .collect();
        Self { classes, samples }
    }

    /// Sorted frames of each video. Every frame is a sample whose window is
    /// centred at it.
    pub fn from_videos(classes: ClassList, videos: Vec<Vec<PathBuf>>, window_size: usize) -> Self {
        let samples = videos
            .into_iter()
            .flat_map(|frames| {
                let len = frames.len();
                (0..len)
                    .map(|index| {
                        let path = frames[index].clone();
                        let window: Vec<_> = window_indices(index, len, window_size, 1)
                            .into_iter()
                            .map(|index| frames[index].clone())
                            .collect();
                        Sample::new(path.display().to_string(), path, vec![]).with_frames(window)
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        Self { classes, samples }
    }
}

impl DetectionDataset for FileDataset {
    fn classes(&self) -> &ClassList {
        &self.classes
    }

    fn samples(&self) -> &[Sample] {
        &self.samples
    }
}

/// Reads one path per line. Blank lines are skipped.
async fn read_file_list(path: &Path) -> Result<Vec<PathBuf>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read '{}'", path.display()))?;
    let files = text
        .lines()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty())
        .map(PathBuf::from)
        .collect();
    Ok(files)
}

/// Splits a video into `<frames_dir>/<video stem>/%06d.jpg` with `ffmpeg`
/// and returns the sorted frame paths.
pub async fn split_video(video: &Path, frames_dir: &Path) -> Result<Vec<PathBuf>> {
    let stem = video
        .file_stem()
        .ok_or_else(|| format_err!("invalid video path '{}'", video.display()))?;
    let output_dir = frames_dir.join(stem);
    ensure!(
        !output_dir.exists(),
        "another video is also named '{}'",
        stem.to_string_lossy()
    );
    tokio::fs::create_dir_all(&output_dir).await?;

    info!("splitting {} into frames", video.display());
    let status = Command::new("ffmpeg")
        .args(&["-loglevel", "error", "-i"])
        .arg(video)
        .args(&["-q:v", "2"])
        .arg(output_dir.join("%06d.jpg"))
        .kill_on_drop(true)
        .status()
        .await
        .context("failed to run ffmpeg")?;
    ensure!(
        status.success(),
        "ffmpeg failed to split {}",
        video.display()
    );

    let pattern = format!(
        "{}/*.jpg",
        glob::Pattern::escape(&output_dir.to_string_lossy())
    );
    let mut frames: Vec<PathBuf> = glob::glob(&pattern)?.try_collect()?;
    frames.sort();
    ensure!(!frames.is_empty(), "no frames in {}", video.display());
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classes() -> Result<ClassList> {
        let names: IndexSet<String> = ["car", "dog"].iter().map(|name| name.to_string()).collect();
        ClassList::new(names, None, None)
    }

    #[test]
    fn video_frames_get_clamped_windows() -> Result<()> {
        let frames: Vec<PathBuf> = (1..=4)
            .map(|index| PathBuf::from(format!("tmp/clip/{:06}.jpg", index)))
            .collect();
        let dataset = FileDataset::from_videos(classes()?, vec![frames.clone()], 3);

        assert_eq!(dataset.len(), 4);
        assert_eq!(
            dataset.window_paths(0)?,
            &[frames[0].clone(), frames[0].clone(), frames[1].clone()]
        );
        assert_eq!(
            dataset.window_paths(3)?,
            &[frames[2].clone(), frames[3].clone(), frames[3].clone()]
        );
        assert!(dataset.labels(2)?.is_empty());
        Ok(())
    }

    #[test]
    fn images_repeat_for_temporal_models() -> Result<()> {
        let dataset = FileDataset::from_images(classes()?, vec!["a.jpg".into(), "b.jpg".into()], 2);
        assert_eq!(dataset.sample_id(1)?, "b.jpg");
        assert_eq!(
            dataset.window_paths(0)?,
            &[PathBuf::from("a.jpg"), PathBuf::from("a.jpg")]
        );
        Ok(())
    }

    #[tokio::test]
    async fn list_files_skip_blank_lines() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("detect-input-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await?;
        let list = dir.join("images.txt");
        tokio::fs::write(&list, "a.jpg\n\n  b.jpg  \n").await?;

        let files = read_file_list(&list).await?;
        assert_eq!(files, vec![PathBuf::from("a.jpg"), PathBuf::from("b.jpg")]);
        Ok(())
    }
}
