//! ImageNet VID and DET in the ILSVRC directory layout.

use crate::{
    clip::{ClipFrame, VideoClip, VideoIndex},
    common::*,
    dataset::{DetectionDataset, Sample},
    pascal_xml::{glob_files, load_annotations, Annotation},
    stats::DatasetStats,
    window::VideoOptions,
    ClassList,
};

/// Builds labels from an ILSVRC annotation. Object names are WordNet ids.
fn ilsvrc_labels(annotation: &Annotation, classes: &ClassList, path: &Path) -> Vec<ObjectLabel> {
    annotation
        .object
        .iter()
        .filter_map(|obj| {
            let class = classes.index_of_key(obj.name.trim())?;
            let rect = match obj.rect(0.0) {
                Ok(rect) => rect,
                Err(_) => {
                    warn!("invalid bbox {:?} in '{}'", obj.bndbox, path.display());
                    return None;
                }
            };
            let rect = match annotation.image_size().and_then(|size| size.try_cast::<f64>()) {
                Some(size) => rect.clip(&size),
                None => rect,
            };
            Some(ObjectLabel::new(rect, class).with_track(obj.trackid))
        })
        .collect()
}

/// Path of `file` under `from_dir` re-rooted at `to_dir` with a new
/// extension.
fn rebase(file: &Path, from_dir: &Path, to_dir: &Path, extension: &str) -> Result<PathBuf> {
    let suffix = file
        .strip_prefix(from_dir)
        .with_context(|| format!("'{}' is not under '{}'", file.display(), from_dir.display()))?;
    Ok(to_dir.join(suffix).with_extension(extension))
}

fn relative_id(file: &Path, from_dir: &Path) -> Result<String> {
    let suffix = file.strip_prefix(from_dir)?.with_extension("");
    suffix
        .to_str()
        .map(|id| id.to_owned())
        .ok_or_else(|| format_err!("non UTF-8 path '{}'", file.display()))
}

/// The ImageNet VID dataset.
#[derive(Debug, Clone)]
pub struct ImagenetVidDataset {
    pub root: PathBuf,
    pub split: String,
    pub classes: ClassList,
    pub index: VideoIndex,
}

impl DetectionDataset for ImagenetVidDataset {
    fn classes(&self) -> &ClassList {
        &self.classes
    }

    fn samples(&self) -> &[Sample] {
        &self.index.samples
    }

    fn motion_ious(&self) -> Option<&[Vec<f64>]> {
        self.index.motion_ious.as_deref()
    }
}

impl ImagenetVidDataset {
    /// Loads `Annotations/VID/<split>/**/<frame>.xml`. Each directory
    /// holding frames is one video.
    pub async fn load(
        root: impl AsRef<Path>,
        split: &str,
        classes: ClassList,
        options: VideoOptions,
    ) -> Result<Self> {
        options.validate()?;
        ensure!(
            classes.wn_ids().is_some(),
            "ImageNet classes require a WordNet ids file"
        );

        let root = root.as_ref().to_owned();
        let annotation_dir = root.join("Annotations").join("VID").join(split);
        let image_dir = root.join("Data").join("VID").join(split);

        let files = glob_files(format!("{}/**/*.xml", annotation_dir.display())).await?;
        let annotations = load_annotations(files).await?;

        let mut videos: BTreeMap<String, Vec<ClipFrame>> = BTreeMap::new();
        for (path, annotation) in annotations {
            let sample_id = relative_id(&path, &annotation_dir)?;
            let video_id = match sample_id.rsplit_once('/') {
                Some((video_id, _)) => video_id.to_owned(),
                None => String::new(),
            };
            let frame = ClipFrame {
                image_path: rebase(&path, &annotation_dir, &image_dir, "JPEG")?,
                labels: ilsvrc_labels(&annotation, &classes, &path),
                size: annotation.image_size(),
                sample_id,
            };
            videos.entry(video_id).or_default().push(frame);
        }

        let clips: Vec<_> = videos
            .into_iter()
            .map(|(id, mut frames)| {
                frames.sort_by(|lhs, rhs| lhs.sample_id.cmp(&rhs.sample_id));
                VideoClip { id, frames }
            })
            .collect();
        let index = VideoIndex::new(clips, options);

        info!(
            "loaded {} samples from {} videos of ImageNet VID {}",
            index.samples.len(),
            index.selected_clips.len(),
            split
        );

        Ok(Self {
            root,
            split: split.to_owned(),
            classes,
            index,
        })
    }

    pub fn motion_ious_path(&self) -> PathBuf {
        self.root.join(format!("{}_motion_ious.json", self.split))
    }

    pub async fn load_motion_ious(mut self) -> Result<Self> {
        let path = self.motion_ious_path();
        self.index.load_motion_ious(path).await?;
        Ok(self)
    }

    pub async fn generate_motion_ious(&self) -> Result<PathBuf> {
        let path = self.motion_ious_path();
        self.index.generate_motion_ious(&path).await?;
        Ok(path)
    }

    pub fn stats(&self) -> DatasetStats {
        self.index.stats(&self.split, &self.classes)
    }
}

/// The ImageNet DET dataset.
#[derive(Debug, Clone)]
pub struct ImagenetDetDataset {
    pub root: PathBuf,
    pub split: String,
    pub classes: ClassList,
    pub samples: Vec<Sample>,
}

impl DetectionDataset for ImagenetDetDataset {
    fn classes(&self) -> &ClassList {
        &self.classes
    }

    fn samples(&self) -> &[Sample] {
        &self.samples
    }
}

impl ImagenetDetDataset {
    /// Loads `Annotations/DET/<split>/**/*.xml` with images under
    /// `Data/DET/<split>`. Images without any known object are dropped.
    pub async fn load(root: impl AsRef<Path>, split: &str, classes: ClassList) -> Result<Self> {
        ensure!(
            classes.wn_ids().is_some(),
            "ImageNet classes require a WordNet ids file"
        );

        let root = root.as_ref().to_owned();
        let annotation_dir = root.join("Annotations").join("DET").join(split);
        let image_dir = root.join("Data").join("DET").join(split);

        let mut files = glob_files(format!("{}/**/*.xml", annotation_dir.display())).await?;
        files.sort();
        let annotations = load_annotations(files).await?;

        let samples: Vec<_> = annotations
            .into_iter()
            .map(|(path, annotation)| -> Result<_> {
                let sample_id = relative_id(&path, &annotation_dir)?;
                let image_path = rebase(&path, &annotation_dir, &image_dir, "JPEG")?;
                let labels = ilsvrc_labels(&annotation, &classes, &path);
                Ok(Sample::new(sample_id, image_path, labels).with_size(annotation.image_size()))
            })
            .filter_ok(|sample| !sample.labels.is_empty())
            .try_collect()?;

        info!("loaded {} samples from ImageNet DET {}", samples.len(), split);

        Ok(Self {
            root,
            split: split.to_owned(),
            classes,
            samples,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_xml(track: i64, xmin: u32) -> String {
        format!(
            r#"<annotation>
                <filename>f</filename>
                <size><width>100</width><height>50</height></size>
                <object>
                    <trackid>{}</trackid><name>n02084071</name>
                    <bndbox><xmin>{}</xmin><ymin>5</ymin><xmax>{}</xmax><ymax>60</ymax></bndbox>
                </object>
            </annotation>"#,
            track,
            xmin,
            xmin + 10
        )
    }

    fn classes() -> Result<ClassList> {
        let names: IndexSet<_> = ["dog"].iter().map(|s| s.to_string()).collect();
        let wn_ids: IndexSet<_> = ["n02084071"].iter().map(|s| s.to_string()).collect();
        ClassList::new(names, Some(wn_ids), None)
    }

    #[tokio::test]
    async fn load_vid_videos() -> Result<()> {
        let root = std::env::temp_dir().join("vid-dataset-imagenet-vid-test");
        let video_dir = root.join("Annotations/VID/val/ILSVRC2015_val_00000000");
        tokio::fs::create_dir_all(&video_dir).await?;
        for index in 0..3 {
            tokio::fs::write(
                video_dir.join(format!("{:06}.xml", index)),
                frame_xml(0, 10 * index),
            )
            .await?;
        }

        let options = VideoOptions {
            window_size: 3,
            window_step: 2,
            ..Default::default()
        };
        let dataset = ImagenetVidDataset::load(&root, "val", classes()?, options).await?;

        assert_eq!(dataset.len(), 3);
        assert_eq!(dataset.sample_id(1)?, "ILSVRC2015_val_00000000/000001");
        assert_eq!(
            dataset.image_path(1)?,
            root.join("Data/VID/val/ILSVRC2015_val_00000000/000001.JPEG")
        );
        assert_eq!(dataset.image_size(0)?, HW::try_from_hw([50, 100])?);

        let labels = dataset.labels(2)?;
        assert_eq!(labels[0].track, Some(0));
        assert_eq!(labels[0].rect.xyxy(), [20.0, 5.0, 30.0, 50.0]);

        let frames = dataset.window_paths(1)?;
        assert_eq!(frames[0], frames[1].with_file_name("000000.JPEG"));
        assert_eq!(frames[2], frames[1].with_file_name("000002.JPEG"));

        let dataset = dataset.load_motion_ious().await?;
        assert_eq!(dataset.motion_ious().unwrap()[0].len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn load_det_images() -> Result<()> {
        let root = std::env::temp_dir().join("vid-dataset-imagenet-det-test");
        let dir = root.join("Annotations/DET/train/n02084071");
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join("n02084071_1.xml"), frame_xml(0, 0)).await?;
        tokio::fs::write(
            dir.join("n02084071_2.xml"),
            "<annotation><filename>f</filename></annotation>",
        )
        .await?;

        let dataset = ImagenetDetDataset::load(&root, "train", classes()?).await?;

        assert_eq!(dataset.len(), 1);
        assert_eq!(dataset.sample_id(0)?, "n02084071/n02084071_1");
        assert_eq!(dataset.labels(0)?[0].track, Some(0));
        Ok(())
    }
}
