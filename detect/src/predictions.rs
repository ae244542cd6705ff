//! Prediction files: one `<source>.txt` per video or image, holding
//! `sid,cls,score,x1,y1,x2,y2` rows with coordinates relative to the image
//! size.

use crate::common::*;
use vid_dataset::DetectionDataset;

/// A detection with coordinates in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub class: i64,
    pub score: f64,
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl Prediction {
    /// The box in pixels of an image of `size`.
    pub fn pixel_rect(&self, size: &HW<usize>) -> Result<TLBR<f64>> {
        let (h, w) = (size.h() as f64, size.w() as f64);
        TLBR::from_xyxy([self.x1 * w, self.y1 * h, self.x2 * w, self.y2 * h])
    }
}

/// A file row, `(sid, cls, score, x1, y1, x2, y2)`.
type PredictionRecord = (String, i64, f64, f64, f64, f64, f64);

/// Predictions by sample id.
pub type Predictions = HashMap<String, Vec<Prediction>>;

/// The file a sample's predictions go to: the frame's parent directory for
/// videos, the image stem otherwise.
pub fn source_name(image_path: &Path, by_video: bool) -> Result<String> {
    let name = if by_video {
        image_path.parent().and_then(|dir| dir.file_name())
    } else {
        image_path.file_stem()
    };
    let name = name
        .and_then(|name| name.to_str())
        .ok_or_else(|| format_err!("cannot name the source of '{}'", image_path.display()))?;
    Ok(name.to_owned())
}

/// Reads every prediction file in `dir`, or `None` when the directory does
/// not exist.
pub fn load_predictions(dir: &Path) -> Result<Option<Predictions>> {
    if !dir.is_dir() {
        return Ok(None);
    }

    let pattern = format!("{}/*.txt", glob::Pattern::escape(&dir.to_string_lossy()));
    let paths: Vec<PathBuf> = glob::glob(&pattern)?.try_collect()?;
    let mut predictions = Predictions::new();

    for path in paths {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_path(&path)
            .with_context(|| format!("failed to open '{}'", path.display()))?;

        for record in reader.deserialize() {
            let (sid, class, score, x1, y1, x2, y2): PredictionRecord =
                record.with_context(|| format!("invalid prediction in '{}'", path.display()))?;
            predictions.entry(sid).or_default().push(Prediction {
                class,
                score,
                x1,
                y1,
                x2,
                y2,
            });
        }
    }

    info!("loaded predictions of {} samples", predictions.len());
    Ok(Some(predictions))
}

/// Writes the predictions of the first `num_samples` samples. Every source
/// gets a file even when nothing was detected in it.
pub fn save_predictions(
    dir: &Path,
    dataset: &dyn DetectionDataset,
    num_samples: usize,
    by_video: bool,
    predictions: &Predictions,
) -> Result<()> {
    fs::create_dir_all(dir)?;

    let mut sources: IndexMap<String, Vec<&str>> = IndexMap::new();
    for index in 0..num_samples.min(dataset.len()) {
        let name = source_name(dataset.image_path(index)?, by_video)?;
        sources
            .entry(name)
            .or_default()
            .push(dataset.sample_id(index)?);
    }

    for (name, sample_ids) in sources {
        let path = dir.join(format!("{}.txt", name));
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_path(&path)
            .with_context(|| format!("failed to create '{}'", path.display()))?;

        for sid in sample_ids {
            let rows = match predictions.get(sid) {
                Some(rows) => rows,
                None => continue,
            };
            for prediction in rows {
                let Prediction {
                    class,
                    score,
                    x1,
                    y1,
                    x2,
                    y2,
                } = *prediction;
                let record: PredictionRecord = (sid.to_owned(), class, score, x1, y1, x2, y2);
                writer.serialize(record)?;
            }
        }
        writer.flush()?;
    }

    Ok(())
}
