use crate::{common::*, ClassList};

/// A frame, or a whole clip in video mode, with its annotations.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Unique id within the dataset.
    pub id: String,
    /// The annotated image. For clips this is the first frame.
    pub image_path: PathBuf,
    /// The frames fed to the model, oldest first. A single frame when no
    /// window is used, every frame of the clip in video mode.
    pub frames: Vec<PathBuf>,
    pub labels: Vec<ObjectLabel>,
    /// Pixel size of the image if known in advance.
    pub size: Option<HW<usize>>,
}

impl Sample {
    pub fn new(id: String, image_path: PathBuf, labels: Vec<ObjectLabel>) -> Self {
        Self {
            id,
            frames: vec![image_path.clone()],
            image_path,
            labels,
            size: None,
        }
    }

    pub fn with_frames(self, frames: Vec<PathBuf>) -> Self {
        Self { frames, ..self }
    }

    pub fn with_size(self, size: Option<HW<usize>>) -> Self {
        Self { size, ..self }
    }
}

/// How label coordinates relate to the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LabelUnit {
    /// Pixel coordinates of the original image.
    Pixel,
    /// Coordinates relative to the image size, in `[0, 1]`.
    Normalized,
}

/// The random accessible detection dataset.
pub trait DetectionDataset
where
    Self: Debug + Send + Sync,
{
    fn classes(&self) -> &ClassList;

    fn samples(&self) -> &[Sample];

    /// The coordinate unit of the labels of a sample.
    fn label_unit(&self, _index: usize) -> LabelUnit {
        LabelUnit::Pixel
    }

    /// Mean motion IoU of every box, per sample, when the dataset has tracks.
    fn motion_ious(&self) -> Option<&[Vec<f64>]> {
        None
    }

    fn len(&self) -> usize {
        self.samples().len()
    }

    fn is_empty(&self) -> bool {
        self.samples().is_empty()
    }

    fn wn_classes(&self) -> Option<&IndexSet<String>> {
        self.classes().wn_ids()
    }

    fn sample(&self, index: usize) -> Result<&Sample> {
        self.samples()
            .get(index)
            .ok_or_else(|| format_err!("sample index {} is out of range", index))
    }

    fn sample_id(&self, index: usize) -> Result<&str> {
        Ok(&self.sample(index)?.id)
    }

    fn image_path(&self, index: usize) -> Result<&Path> {
        Ok(&self.sample(index)?.image_path)
    }

    fn window_paths(&self, index: usize) -> Result<&[PathBuf]> {
        Ok(&self.sample(index)?.frames)
    }

    fn labels(&self, index: usize) -> Result<&[ObjectLabel]> {
        Ok(&self.sample(index)?.labels)
    }

    /// The image size, reading the image header when the loader did not
    /// record it.
    fn image_size(&self, index: usize) -> Result<HW<usize>> {
        let sample = self.sample(index)?;
        match &sample.size {
            Some(size) => Ok(size.clone()),
            None => read_image_size(&sample.image_path),
        }
    }
}

pub fn read_image_size(path: impl AsRef<Path>) -> Result<HW<usize>> {
    let path = path.as_ref();
    let imagesize::ImageSize { height, width } = imagesize::size(path)
        .with_context(|| format!("failed to read size of '{}'", path.display()))?;
    HW::try_from_hw([height, width])
}
