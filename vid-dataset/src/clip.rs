use crate::{
    common::*,
    dataset::Sample,
    motion::{MotionIouTable, VideoFrames},
    stats::DatasetStats,
    window::{subsample_frames, window_indices, VideoOptions},
    ClassList,
};

/// An annotated frame of a video clip.
#[derive(Debug, Clone, PartialEq)]
pub struct ClipFrame {
    pub sample_id: String,
    pub image_path: PathBuf,
    pub labels: Vec<ObjectLabel>,
    pub size: Option<HW<usize>>,
}

/// The frames of one clip in temporal order.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoClip {
    pub id: String,
    pub frames: Vec<ClipFrame>,
}

impl VideoClip {
    pub fn subsample(self, ratio: f64) -> Self {
        Self {
            frames: subsample_frames(self.frames, ratio),
            ..self
        }
    }

    pub fn to_video_frames(&self) -> VideoFrames {
        self.frames
            .iter()
            .map(|frame| (frame.sample_id.clone(), frame.labels.clone()))
            .collect()
    }
}

/// The clips of a video dataset and the samples built from them.
#[derive(Debug, Clone)]
pub struct VideoIndex {
    pub options: VideoOptions,
    /// All clips before frame subsampling.
    pub clips: Vec<VideoClip>,
    /// Clips after frame subsampling, from which samples are built.
    pub selected_clips: Vec<VideoClip>,
    pub samples: Vec<Sample>,
    pub motion_ious: Option<Vec<Vec<f64>>>,
}

impl VideoIndex {
    pub fn new(clips: Vec<VideoClip>, options: VideoOptions) -> Self {
        let selected_clips: Vec<_> = clips
            .iter()
            .cloned()
            .map(|clip| clip.subsample(options.frames))
            .collect();
        let samples = clip_samples(&selected_clips, &options);

        Self {
            options,
            clips,
            selected_clips,
            samples,
            motion_ious: None,
        }
    }

    fn all_video_frames(&self) -> Vec<VideoFrames> {
        self.clips.iter().map(|clip| clip.to_video_frames()).collect()
    }

    /// Fills the motion IoUs of each sample from the cache at `path`,
    /// generating the cache first if it is missing.
    pub async fn load_motion_ious(&mut self, path: impl AsRef<Path>) -> Result<()> {
        ensure!(
            !self.options.videos,
            "motion IoUs are defined per frame, not in video mode"
        );
        let table = MotionIouTable::load_or_generate(path, &self.all_video_frames()).await?;
        let motion_ious: Vec<_> = self
            .samples
            .iter()
            .map(|sample| table.aligned(&sample.id, sample.labels.len()))
            .try_collect()?;
        self.motion_ious = Some(motion_ious);
        Ok(())
    }

    /// Regenerates the motion IoU cache at `path`.
    pub async fn generate_motion_ious(&self, path: impl AsRef<Path>) -> Result<()> {
        let videos = self.all_video_frames();
        let table = tokio::task::spawn_blocking(move || MotionIouTable::generate(&videos)).await?;
        table.save(path).await
    }

    pub fn stats(&self, split: &str, classes: &ClassList) -> DatasetStats {
        let videos: Vec<_> = self
            .selected_clips
            .iter()
            .map(|clip| clip.to_video_frames())
            .collect();
        DatasetStats::from_videos(split, classes, &videos, self.options.videos)
    }

    /// Labels of each frame of a clip in video mode.
    pub fn clip_labels(&self, index: usize) -> Result<Vec<&[ObjectLabel]>> {
        ensure!(self.options.videos, "the dataset is not in video mode");
        let clip = self
            .selected_clips
            .iter()
            .filter(|clip| !clip.frames.is_empty())
            .nth(index)
            .ok_or_else(|| format_err!("clip index {} is out of range", index))?;
        Ok(clip
            .frames
            .iter()
            .map(|frame| frame.labels.as_slice())
            .collect())
    }
}

/// Turns clips into samples. Video mode yields one sample per clip,
/// otherwise one sample per frame with its temporal window.
pub fn clip_samples(clips: &[VideoClip], options: &VideoOptions) -> Vec<Sample> {
    if options.videos {
        return clips
            .iter()
            .filter_map(|clip| {
                let first = clip.frames.first()?;
                let frames: Vec<_> = clip
                    .frames
                    .iter()
                    .map(|frame| frame.image_path.clone())
                    .collect();
                let sample = Sample::new(clip.id.clone(), first.image_path.clone(), first.labels.clone())
                    .with_frames(frames)
                    .with_size(first.size.clone());
                Some(sample)
            })
            .collect();
    }

    clips
        .iter()
        .flat_map(|clip| {
            let len = clip.frames.len();
            clip.frames.iter().enumerate().map(move |(index, frame)| {
                let window: Vec<_> =
                    window_indices(index, len, options.window_size, options.window_step)
                        .into_iter()
                        .map(|other| clip.frames[other].image_path.clone())
                        .collect();
                Sample::new(
                    frame.sample_id.clone(),
                    frame.image_path.clone(),
                    frame.labels.clone(),
                )
                .with_frames(window)
                .with_size(frame.size.clone())
            })
        })
        .collect()
}
