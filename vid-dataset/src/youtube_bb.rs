//! The YouTube-BoundingBoxes dataset.
//!
//! Annotations are CSV rows of
//! `youtube_id, timestamp_ms, class_id, class_name, object_id, presence,
//! xmin, xmax, ymin, ymax` with coordinates relative to the frame size.
//! Frames are expected at `<root>/frames/<youtube_id>/<timestamp_ms>.jpg`.

use crate::{
    clip::{ClipFrame, VideoClip, VideoIndex},
    coco::CocoJson,
    common::*,
    dataset::{DetectionDataset, LabelUnit, Sample},
    stats::DatasetStats,
    window::VideoOptions,
    ClassList,
};
use std::collections::BTreeSet;
use tokio::{io::AsyncWriteExt as _, process::Command};

const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "mp4.webm"];
const ERRORS_FILE: &str = "errors.txt";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct YoutubeBbRow {
    pub youtube_id: String,
    pub timestamp_ms: String,
    pub class_id: i64,
    pub class_name: String,
    pub object_id: i64,
    pub presence: String,
    pub xmin: f64,
    pub xmax: f64,
    pub ymin: f64,
    pub ymax: f64,
}

impl YoutubeBbRow {
    pub fn is_absent(&self) -> bool {
        self.presence == "absent"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YoutubeBbOptions {
    /// Keep frames whose object is absent.
    #[serde(default)]
    pub allow_empty: bool,
    /// Split videos into clips of one object instance each.
    #[serde(default = "default_clips")]
    pub clips: bool,
    #[serde(flatten)]
    pub video: VideoOptions,
}

fn default_clips() -> bool {
    true
}

impl Default for YoutubeBbOptions {
    fn default() -> Self {
        Self {
            allow_empty: false,
            clips: default_clips(),
            video: VideoOptions::default(),
        }
    }
}

/// The YouTube-BB detection dataset.
#[derive(Debug, Clone)]
pub struct YoutubeBbDataset {
    pub root: PathBuf,
    pub split: String,
    pub options: YoutubeBbOptions,
    pub classes: ClassList,
    pub index: VideoIndex,
}

impl DetectionDataset for YoutubeBbDataset {
    fn classes(&self) -> &ClassList {
        &self.classes
    }

    fn samples(&self) -> &[Sample] {
        &self.index.samples
    }

    fn label_unit(&self, _index: usize) -> LabelUnit {
        LabelUnit::Normalized
    }

    fn motion_ious(&self) -> Option<&[Vec<f64>]> {
        self.index.motion_ious.as_deref()
    }
}

/// The annotation file of a split. `val` maps to `validation`.
pub fn annotation_path(root: impl AsRef<Path>, split: &str) -> PathBuf {
    let split = match split {
        "val" => "validation",
        split => split,
    };
    root.as_ref()
        .join(format!("yt_bb_detection_{}.csv", split))
}

pub fn read_rows(path: impl AsRef<Path>) -> Result<Vec<YoutubeBbRow>> {
    let path = path.as_ref();
    let rows: Vec<YoutubeBbRow> = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_path(path)
        .with_context(|| format!("failed to open '{}'", path.display()))?
        .deserialize()
        .try_collect()
        .with_context(|| format!("failed to parse '{}'", path.display()))?;
    Ok(rows)
}

async fn read_rows_async(path: PathBuf) -> Result<Vec<YoutubeBbRow>> {
    tokio::task::spawn_blocking(move || read_rows(path))
        .map(|result| Fallible::Ok(result??))
        .await
}

impl YoutubeBbDataset {
    pub async fn load(
        root: impl AsRef<Path>,
        split: &str,
        classes: ClassList,
        options: YoutubeBbOptions,
    ) -> Result<Self> {
        options.video.validate()?;
        ensure!(
            classes.ids().is_some(),
            "YouTube-BB classes require a class ids file"
        );

        let root = root.as_ref().to_owned();
        let csv_path = annotation_path(&root, split);
        info!("loading data from '{}'", csv_path.display());
        let rows = read_rows_async(csv_path).await?;

        let allow_empty =
            options.allow_empty || options.video.videos || options.video.window_size > 1;

        // group rows by clip and frame
        let mut grouped: BTreeMap<String, BTreeMap<String, Vec<YoutubeBbRow>>> = BTreeMap::new();
        let mut num_empty = 0;

        for row in rows {
            if !allow_empty && row.is_absent() {
                num_empty += 1;
                continue;
            }
            let clip_id = if options.clips {
                format!("{},{},{}", row.youtube_id, row.class_id, row.object_id)
            } else {
                row.youtube_id.clone()
            };
            grouped
                .entry(clip_id)
                .or_default()
                .entry(row.timestamp_ms.clone())
                .or_default()
                .push(row);
        }

        if num_empty > 0 {
            info!("removed {} empty annotations", num_empty);
        }

        let frames_dir = root.join("frames");
        let clips: Vec<_> = grouped
            .into_iter()
            .map(|(clip_id, frames)| {
                let frames: Vec<_> = frames
                    .into_iter()
                    .map(|(timestamp, rows)| {
                        let youtube_id = &rows[0].youtube_id;
                        let sample_id = format!("{},{}", clip_id, timestamp);
                        let image_path = frames_dir
                            .join(youtube_id)
                            .join(format!("{}.jpg", timestamp));
                        let labels = frame_labels(&rows, &classes, &sample_id);
                        ClipFrame {
                            sample_id,
                            image_path,
                            labels,
                            size: None,
                        }
                    })
                    .collect();
                VideoClip {
                    id: clip_id,
                    frames,
                }
            })
            .collect();

        let index = VideoIndex::new(clips, options.video.clone());

        info!(
            "loaded {} samples from {} clips of YouTube-BB {}",
            index.samples.len(),
            index.selected_clips.len(),
            split
        );

        Ok(Self {
            root,
            split: split.to_owned(),
            options,
            classes,
            index,
        })
    }

    pub fn motion_ious_path(&self) -> PathBuf {
        self.root.join(format!("{}_motion_ious.json", self.split))
    }

    /// Loads the cached motion IoUs of each sample, generating them first if
    /// the cache is missing.
    pub async fn load_motion_ious(mut self) -> Result<Self> {
        let path = self.motion_ious_path();
        self.index.load_motion_ious(path).await?;
        Ok(self)
    }

    /// Writes the motion IoU cache from scratch.
    pub async fn generate_motion_ious(&self) -> Result<PathBuf> {
        let path = self.motion_ious_path();
        self.index.generate_motion_ious(&path).await?;
        Ok(path)
    }

    pub fn stats(&self) -> DatasetStats {
        self.index.stats(&self.split, &self.classes)
    }

    /// Writes `<root>/jsons/<split>.json` in COCO format.
    pub async fn build_coco_json(&self) -> Result<PathBuf> {
        let path = self
            .root
            .join("jsons")
            .join(format!("{}.json", self.split));
        CocoJson::from_dataset(self).save(&path).await?;
        Ok(path)
    }

    /// Per frame labels of a clip in video mode, each padded to `maxlen`
    /// rows.
    pub fn video_label_rows(&self, index: usize, maxlen: usize) -> Result<Vec<Vec<[f64; 6]>>> {
        self.index
            .clip_labels(index)?
            .into_iter()
            .map(|labels| pad_to_dense(labels, maxlen))
            .try_collect()
    }
}

/// Converts the rows of a frame into labels. Unknown classes, absent
/// objects and negative coordinates are skipped.
fn frame_labels(rows: &[YoutubeBbRow], classes: &ClassList, sample_id: &str) -> Vec<ObjectLabel> {
    rows.iter()
        .filter_map(|row| {
            let class = classes.index_of_id(row.class_id)?;
            let YoutubeBbRow {
                xmin,
                xmax,
                ymin,
                ymax,
                ..
            } = *row;

            if row.is_absent() || [xmin, ymin, xmax, ymax].iter().any(|&v| v < 0.0) {
                return None;
            }

            let xyxy = match validate_box([xmin, ymin, xmax, ymax], sample_id) {
                Ok(xyxy) => xyxy,
                Err(err) => {
                    error!("invalid label at {}, {:#}", sample_id, err);
                    return None;
                }
            };
            let rect = TLBR::from_xyxy(xyxy).ok()?;
            Some(ObjectLabel::new(rect, class).with_track(Some(row.object_id)))
        })
        .collect()
}

/// Checks a relative `[xmin, ymin, xmax, ymax]` box, clamping it into the
/// unit square first if it is out of range.
pub fn validate_box(xyxy: [f64; 4], sample_id: &str) -> Result<[f64; 4]> {
    let [mut xmin, mut ymin, mut xmax, mut ymax] = xyxy;
    let in_range = |min: f64, max: f64| (0.0..1.0).contains(&min) && min < max && max <= 1.0;

    if !in_range(xmin, xmax) || !in_range(ymin, ymax) {
        warn!(
            "box: {} {} {} {} incompatible for {}",
            xmin, ymin, xmax, ymax, sample_id
        );

        xmin = xmin.clamp(0.0, 1.0);
        ymin = ymin.clamp(0.0, 1.0);
        xmax = (xmin + 1.0).max(xmax).min(1.0);
        ymax = (ymin + 1.0).max(ymax).min(1.0);

        info!("new box: {} {} {} {}", xmin, ymin, xmax, ymax);
    }

    ensure!((0.0..1.0).contains(&xmin), "xmin must in [0, 1), given {}", xmin);
    ensure!((0.0..1.0).contains(&ymin), "ymin must in [0, 1), given {}", ymin);
    ensure!(xmin < xmax && xmax <= 1.0, "xmax must in (xmin, 1], given {}", xmax);
    ensure!(ymin < ymax && ymax <= 1.0, "ymax must in (ymin, 1], given {}", ymax);

    Ok([xmin, ymin, xmax, ymax])
}

/// Packs labels into exactly `maxlen` rows, padding with `-1`.
pub fn pad_to_dense(labels: &[ObjectLabel], maxlen: usize) -> Result<Vec<[f64; 6]>> {
    ensure!(
        labels.len() <= maxlen,
        "{} labels do not fit in {} rows",
        labels.len(),
        maxlen
    );
    let mut rows: Vec<[f64; 6]> = labels
        .iter()
        .map(|label| {
            label
                .to_row()
                .ok_or_else(|| format_err!("label is not representable as a row"))
        })
        .try_collect()?;
    rows.resize(maxlen, [-1.0; 6]);
    Ok(rows)
}

/// Distinct YouTube ids in the annotation files, in order of appearance.
pub async fn read_video_ids(annotation_paths: &[PathBuf]) -> Result<IndexSet<String>> {
    let mut ids = IndexSet::new();
    for path in annotation_paths {
        ensure!(path.is_file(), "{} does not exist", path.display());
        info!("loading data from '{}'", path.display());
        let rows = read_rows_async(path.clone()).await?;
        ids.extend(rows.into_iter().map(|row| row.youtube_id));
    }
    Ok(ids)
}

/// Approximate download size in gigabytes.
pub fn expected_download_gb(num_videos: usize) -> f64 {
    const GB_PER_VIDEO: f64 = 0.029620394;
    GB_PER_VIDEO * num_videos as f64
}

fn find_video(dir: &Path, name: &str) -> Option<PathBuf> {
    VIDEO_EXTENSIONS
        .iter()
        .map(|ext| dir.join(format!("{}.{}", name, ext)))
        .find(|path| path.is_file())
}

async fn read_error_list(path: &Path) -> Result<HashSet<String>> {
    if !path.is_file() {
        return Ok(HashSet::new());
    }
    let text = tokio::fs::read_to_string(path).await?;
    Ok(text
        .lines()
        .map(|line| line.trim().to_owned())
        .filter(|line| !line.is_empty())
        .collect())
}

async fn append_error_list(path: &Path, names: impl IntoIterator<Item = String>) -> Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("failed to open '{}'", path.display()))?;
    for name in names {
        file.write_all(format!("{}\n", name).as_bytes()).await?;
    }
    file.flush().await?;
    Ok(())
}

/// Downloads a video with `youtube-dl`, reusing an existing download.
pub async fn download_video(youtube_id: &str, save_dir: &Path) -> Result<PathBuf> {
    if let Some(path) = find_video(save_dir, youtube_id) {
        return Ok(path);
    }

    let url = format!("http://youtu.be/{}", youtube_id);
    let output = save_dir.join(format!("{}.mp4", youtube_id));
    let status = Command::new("youtube-dl")
        .arg("-o")
        .arg(&output)
        .arg(&url)
        .kill_on_drop(true)
        .status()
        .await
        .context("failed to run youtube-dl")?;

    if !status.success() {
        warn!("youtube-dl exited with {} for {}", status, url);
    }

    find_video(save_dir, youtube_id).ok_or_else(|| format_err!("failed to download {}", url))
}

/// Downloads every video in the annotation files. Failures are appended to
/// `errors.txt` in the save directory. Returns the number of failures.
pub async fn download_videos(
    annotation_paths: &[PathBuf],
    save_dir: impl AsRef<Path>,
    jobs: usize,
) -> Result<usize> {
    let save_dir = save_dir.as_ref().to_owned();
    let ids = read_video_ids(annotation_paths).await?;
    tokio::fs::create_dir_all(&save_dir).await?;

    let num_videos = ids.len();
    let errors: Vec<String> = stream::iter(ids)
        .map(|youtube_id| {
            let save_dir = save_dir.clone();
            async move {
                match download_video(&youtube_id, &save_dir).await {
                    Ok(_) => None,
                    Err(err) => {
                        warn!("{:#}", err);
                        Some(youtube_id)
                    }
                }
            }
        })
        .buffer_unordered(jobs.max(1))
        .filter_map(|error| async move { error })
        .collect()
        .await;

    info!(
        "successfully downloaded {} / {} videos",
        num_videos - errors.len(),
        num_videos
    );

    if !errors.is_empty() {
        let errors_path = save_dir.join(ERRORS_FILE);
        info!("saving error file: {}", errors_path.display());
        append_error_list(&errors_path, errors.iter().cloned()).await?;
    }

    Ok(errors.len())
}

/// Grabs one frame at `timestamp_ms` with `ffmpeg`.
pub async fn extract_frame(video: &Path, timestamp_ms: &str, output: &Path) -> Result<()> {
    let millis: u64 = timestamp_ms
        .parse()
        .with_context(|| format!("invalid timestamp '{}'", timestamp_ms))?;
    let seconds = format!("{}.{:03}", millis / 1000, millis % 1000);

    let status = Command::new("ffmpeg")
        .args(&["-loglevel", "error", "-y", "-ss", &seconds, "-i"])
        .arg(video)
        .args(&["-frames:v", "1", "-q:v", "2"])
        .arg(output)
        .kill_on_drop(true)
        .status()
        .await
        .context("failed to run ffmpeg")?;

    ensure!(
        status.success() && output.is_file(),
        "ffmpeg failed to extract {} at {} ms",
        video.display(),
        timestamp_ms
    );
    Ok(())
}

/// Extracts the annotated frames of every downloaded video into
/// `<frames_dir>/<youtube_id>/<timestamp_ms>.jpg`. Videos listed in the
/// download error file are skipped. Returns the number of failed videos.
pub async fn extract_frames(
    annotation_paths: &[PathBuf],
    videos_dir: impl AsRef<Path>,
    frames_dir: impl AsRef<Path>,
    jobs: usize,
) -> Result<usize> {
    let videos_dir = videos_dir.as_ref().to_owned();
    let frames_dir = frames_dir.as_ref().to_owned();
    let skipped = read_error_list(&videos_dir.join(ERRORS_FILE)).await?;

    let mut timestamps: IndexMap<String, BTreeSet<String>> = IndexMap::new();
    for path in annotation_paths {
        ensure!(path.is_file(), "{} does not exist", path.display());
        for row in read_rows_async(path.clone()).await? {
            if skipped.contains(&row.youtube_id) {
                continue;
            }
            timestamps
                .entry(row.youtube_id)
                .or_default()
                .insert(row.timestamp_ms);
        }
    }

    let num_videos = timestamps.len();
    let errors: Vec<String> = stream::iter(timestamps)
        .map(|(youtube_id, timestamps)| {
            let videos_dir = videos_dir.clone();
            let frames_dir = frames_dir.clone();

            async move {
                let result = async {
                    let video = find_video(&videos_dir, &youtube_id)
                        .ok_or_else(|| format_err!("video {} is not downloaded", youtube_id))?;
                    let out_dir = frames_dir.join(&youtube_id);
                    tokio::fs::create_dir_all(&out_dir).await?;

                    for timestamp in &timestamps {
                        let output = out_dir.join(format!("{}.jpg", timestamp));
                        if output.is_file() {
                            continue;
                        }
                        extract_frame(&video, timestamp, &output).await?;
                    }
                    Fallible::Ok(())
                }
                .await;

                match result {
                    Ok(()) => None,
                    Err(err) => {
                        warn!("{:#}", err);
                        Some(youtube_id)
                    }
                }
            }
        })
        .buffer_unordered(jobs.max(1))
        .filter_map(|error| async move { error })
        .collect()
        .await;

    info!(
        "successfully extracted frames for {} / {} videos",
        num_videos - errors.len(),
        num_videos
    );

    if !errors.is_empty() {
        tokio::fs::create_dir_all(&frames_dir).await?;
        let errors_path = frames_dir.join(ERRORS_FILE);
        info!("saving error file: {}", errors_path.display());
        append_error_list(&errors_path, errors.iter().cloned()).await?;
    }

    Ok(errors.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    const CSV: &str = "\
AAB6lO-XiKE,0,0,person,0,present,0.1,0.5,0.2,0.6
AAB6lO-XiKE,1000,0,person,0,present,0.15,0.55,0.2,0.6
AAB6lO-XiKE,2000,0,person,0,absent,-1,-1,-1,-1
AAB6lO-XiKE,0,5,dog,1,present,0.3,0.2,0.1,0.4
AAB6lO-XiKE,3000,0,person,0,present,0.2,0.6,0.2,0.6
BBB6lO-XiKE,0,9,zebra,0,present,0.1,0.2,0.1,0.2
";

    async fn write_fixture(name: &str) -> Result<(PathBuf, ClassList)> {
        let root = std::env::temp_dir().join(name);
        tokio::fs::create_dir_all(&root).await?;
        tokio::fs::write(annotation_path(&root, "val"), CSV).await?;

        let names: IndexSet<_> = ["person", "dog"].iter().map(|s| s.to_string()).collect();
        let ids: IndexSet<_> = [0, 5].into_iter().collect();
        let classes = ClassList::new(names, None, Some(ids))?;
        Ok((root, classes))
    }

    #[test]
    fn validate_clamps_out_of_range_boxes() -> Result<()> {
        assert_eq!(validate_box([0.1, 0.2, 0.5, 0.6], "s")?, [0.1, 0.2, 0.5, 0.6]);
        assert_eq!(validate_box([0.3, 0.1, 0.2, 0.4], "s")?, [0.3, 0.1, 1.0, 1.0]);
        assert_eq!(validate_box([0.1, 0.1, 1.2, 0.4], "s")?, [0.1, 0.1, 1.0, 1.0]);
        assert!(validate_box([1.0, 0.1, 1.0, 0.4], "s").is_err());
        Ok(())
    }

    #[test]
    fn pad_labels_to_fixed_rows() -> Result<()> {
        let label = ObjectLabel::new(TLBR::from_xyxy([0.1, 0.2, 0.3, 0.4])?, 1).with_track(Some(7));
        let rows = pad_to_dense(&[label.clone()], 3)?;

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], [0.1, 0.2, 0.3, 0.4, 1.0, 7.0]);
        assert_eq!(rows[2], [-1.0; 6]);
        assert!(pad_to_dense(&[label.clone(), label], 1).is_err());
        Ok(())
    }

    #[tokio::test]
    async fn load_clips_and_frames() -> Result<()> {
        let (root, classes) = write_fixture("vid-dataset-ytbb-test").await?;
        let dataset =
            YoutubeBbDataset::load(&root, "val", classes, YoutubeBbOptions::default()).await?;

        // the absent row is dropped, the zebra clip has no known class
        assert_eq!(dataset.len(), 5);
        assert_eq!(dataset.sample_id(0)?, "AAB6lO-XiKE,0,0,0");
        assert_eq!(
            dataset.image_path(0)?,
            root.join("frames").join("AAB6lO-XiKE").join("0.jpg")
        );
        assert_eq!(dataset.label_unit(0), LabelUnit::Normalized);

        let labels = dataset.labels(0)?;
        assert_eq!(labels.len(), 1);
        assert_eq!(labels[0].track, Some(0));
        let [x1, y1, x2, y2] = labels[0].rect.xyxy();
        assert_abs_diff_eq!(x1, 0.1);
        assert_abs_diff_eq!(y1, 0.2);
        assert_abs_diff_eq!(x2, 0.5);
        assert_abs_diff_eq!(y2, 0.6);

        // the dog box has xmax < xmin and is clamped
        let dog = dataset
            .samples()
            .iter()
            .position(|sample| sample.id == "AAB6lO-XiKE,5,1,0")
            .unwrap();
        assert_eq!(dataset.labels(dog)?[0].class, 1);
        assert!(dataset.labels(4)?.is_empty());

        let stats = dataset.stats();
        assert_eq!(stats.videos, 3);
        assert_eq!(stats.boxes(), 4);
        Ok(())
    }

    #[tokio::test]
    async fn windows_force_empty_frames() -> Result<()> {
        let (root, classes) = write_fixture("vid-dataset-ytbb-window-test").await?;
        let options = YoutubeBbOptions {
            video: VideoOptions {
                window_size: 3,
                ..Default::default()
            },
            ..Default::default()
        };
        let dataset = YoutubeBbDataset::load(&root, "val", classes, options).await?;

        assert_eq!(dataset.len(), 6);
        let frames = dataset.window_paths(0)?;
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0], frames[1]);

        let motion = dataset.load_motion_ious().await?;
        assert_eq!(motion.motion_ious().unwrap().len(), 6);
        assert!(motion.motion_ious_path().is_file());
        Ok(())
    }

    #[tokio::test]
    async fn export_coco_json() -> Result<()> {
        let (root, classes) = write_fixture("vid-dataset-ytbb-coco-test").await?;
        let dataset =
            YoutubeBbDataset::load(&root, "val", classes, YoutubeBbOptions::default()).await?;
        let path = dataset.build_coco_json().await?;

        assert_eq!(path, root.join("jsons/val.json"));
        let json = CocoJson::load(&path).await?;
        assert_eq!(json.images.len(), 5);
        assert_eq!(json.annotations.len(), 4);
        assert_eq!(json.categories.len(), 2);
        Ok(())
    }
}
