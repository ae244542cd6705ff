//! Motion IoU: how far a tracked object moves between nearby frames.

use crate::common::*;

/// Frames on each side compared against the centre frame.
pub const MOTION_RANGE: usize = 10;

/// The annotated frames of one video in temporal order, keyed by sample id.
pub type VideoFrames = Vec<(String, Vec<ObjectLabel>)>;

/// Mean pixel IoU of each box with the boxes of the same track within
/// [MOTION_RANGE] frames. Boxes without a track, or whose track appears in
/// no nearby frame, get NaN.
pub fn video_motion_ious(frames: &[Vec<ObjectLabel>]) -> Vec<Vec<f64>> {
    (0..frames.len())
        .map(|index| {
            let begin = index.saturating_sub(MOTION_RANGE);
            let end = (index + MOTION_RANGE + 1).min(frames.len());

            frames[index]
                .iter()
                .map(|label| {
                    let track = match label.track {
                        Some(track) => track,
                        None => return f64::NAN,
                    };

                    let ious: Vec<_> = (begin..end)
                        .filter(|&other| other != index)
                        .filter_map(|other| {
                            frames[other]
                                .iter()
                                .find(|other_label| other_label.track == Some(track))
                        })
                        .map(|other_label| label.rect.pixel_iou_with(&other_label.rect))
                        .collect();

                    if ious.is_empty() {
                        f64::NAN
                    } else {
                        ious.iter().sum::<f64>() / ious.len() as f64
                    }
                })
                .collect()
        })
        .collect()
}

/// Motion IoUs of every frame keyed by sample id, as cached on disk.
///
/// Frames without boxes store `[0.0]`. NaN values are stored as `null`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MotionIouTable(pub BTreeMap<String, Vec<Option<f64>>>);

impl MotionIouTable {
    pub fn generate<'a>(videos: impl IntoIterator<Item = &'a VideoFrames>) -> Self {
        let table = videos
            .into_iter()
            .flat_map(|video| {
                let labels: Vec<_> = video.iter().map(|(_, labels)| labels.clone()).collect();
                let ious = video_motion_ious(&labels);
                izip!(video, ious)
                    .map(|((sample_id, _), ious)| {
                        let ious: Vec<_> = if ious.is_empty() {
                            vec![Some(0.0)]
                        } else {
                            ious.into_iter()
                                .map(|iou| (!iou.is_nan()).then(|| iou))
                                .collect()
                        };
                        (sample_id.clone(), ious)
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        Self(table)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read '{}'", path.display()))?;
        let table = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse '{}'", path.display()))?;
        Ok(table)
    }

    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let text = serde_json::to_string(self)?;
        tokio::fs::write(path, text)
            .await
            .with_context(|| format!("failed to write '{}'", path.display()))?;
        Ok(())
    }

    /// Motion IoUs aligned with the labels of a sample.
    pub fn aligned(&self, sample_id: &str, num_labels: usize) -> Result<Vec<f64>> {
        let ious = self
            .0
            .get(sample_id)
            .ok_or_else(|| format_err!("no motion IoUs for sample '{}'", sample_id))?;
        if num_labels == 0 {
            return Ok(vec![]);
        }
        ensure!(
            ious.len() == num_labels,
            "sample '{}' has {} labels but {} motion IoUs",
            sample_id,
            num_labels,
            ious.len()
        );
        Ok(ious.iter().map(|iou| iou.unwrap_or(f64::NAN)).collect())
    }

    /// Loads the table at `path`, generating and saving it first if missing.
    pub async fn load_or_generate(path: impl AsRef<Path>, videos: &[VideoFrames]) -> Result<Self> {
        let path = path.as_ref();
        if path.is_file() {
            return Self::load(path).await;
        }

        info!("generating motion IoUs to '{}'", path.display());
        let table = {
            let videos = videos.to_vec();
            tokio::task::spawn_blocking(move || Self::generate(&videos)).await?
        };
        table.save(path).await?;
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn label(x: f64, track: Option<i64>) -> ObjectLabel {
        ObjectLabel::new(TLBR::from_xyxy([x, 0.0, x + 9.0, 9.0]).unwrap(), 0).with_track(track)
    }

    #[test]
    fn motion_iou_averages_track_overlaps() {
        let frames = vec![
            vec![label(0.0, Some(1))],
            vec![label(0.0, Some(1)), label(50.0, None)],
            vec![label(5.0, Some(1))],
        ];
        let ious = video_motion_ious(&frames);

        assert_abs_diff_eq!(ious[0][0], (1.0 + 5.0 * 10.0 / 150.0) / 2.0, epsilon = 1e-9);
        assert!(ious[1][1].is_nan());
        assert_eq!(ious[2].len(), 1);
    }

    #[test]
    fn table_marks_empty_frames() -> Result<()> {
        let video: VideoFrames = vec![
            ("a,0".into(), vec![label(0.0, Some(3))]),
            ("a,1".into(), vec![]),
        ];
        let table = MotionIouTable::generate(&[video]);

        assert_eq!(table.0["a,1"], vec![Some(0.0)]);
        assert_eq!(table.0["a,0"], vec![None]);
        assert_eq!(table.aligned("a,1", 0)?, Vec::<f64>::new());
        assert!(table.aligned("a,0", 1)?[0].is_nan());
        assert!(table.aligned("missing", 0).is_err());
        Ok(())
    }
}
