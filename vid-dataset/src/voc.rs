use crate::{
    common::*,
    dataset::{DetectionDataset, Sample},
    pascal_xml::{self, Annotation},
    ClassList,
};

/// A `(year, split)` pair such as `("2007", "test")`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VocSplit {
    pub year: String,
    pub split: String,
}

/// The Pascal VOC dataset.
#[derive(Debug, Clone)]
pub struct VocDataset {
    pub root: PathBuf,
    pub classes: ClassList,
    pub samples: Vec<Sample>,
}

impl DetectionDataset for VocDataset {
    fn classes(&self) -> &ClassList {
        &self.classes
    }

    fn samples(&self) -> &[Sample] {
        &self.samples
    }
}

impl VocDataset {
    pub async fn load(
        root: impl AsRef<Path>,
        splits: &[VocSplit],
        classes: ClassList,
    ) -> Result<Self> {
        let root = root.as_ref().to_owned();
        let classes = Arc::new(classes);

        let mut samples = vec![];

        for VocSplit { year, split } in splits {
            let year_dir = root.join(format!("VOC{}", year));
            let list_file = year_dir
                .join("ImageSets")
                .join("Main")
                .join(format!("{}.txt", split));
            let ids: Vec<String> = tokio::fs::read_to_string(&list_file)
                .await
                .with_context(|| format!("failed to read '{}'", list_file.display()))?
                .lines()
                .map(|line| line.trim())
                .filter(|line| !line.is_empty())
                .map(|line| line.to_owned())
                .collect();

            let split_samples: Vec<Sample> = {
                let year_dir = Arc::new(year_dir);
                let year = Arc::new(year.clone());
                let classes = classes.clone();

                stream::iter(ids)
                    .par_then(None, move |id| {
                        let year_dir = year_dir.clone();
                        let year = year.clone();
                        let classes = classes.clone();

                        async move {
                            let annotation_file =
                                year_dir.join("Annotations").join(format!("{}.xml", id));
                            let image_file =
                                year_dir.join("JPEGImages").join(format!("{}.jpg", id));
                            let annotation = pascal_xml::load_annotation(&annotation_file).await?;
                            let sample_id = format!("{}/{}", year, id);
                            let labels = voc_labels(&annotation, &classes, &annotation_file);
                            Fallible::Ok(
                                Sample::new(sample_id, image_file, labels)
                                    .with_size(annotation.image_size()),
                            )
                        }
                    })
                    .try_collect()
                    .await?
            };

            info!(
                "loaded {} samples from VOC{} {}",
                split_samples.len(),
                year,
                split
            );
            samples.extend(split_samples);
        }

        let classes = Arc::try_unwrap(classes).unwrap_or_else(|classes| (*classes).clone());

        Ok(Self {
            root,
            classes,
            samples,
        })
    }
}

/// Builds labels from a VOC annotation, shifting pixel coordinates to be
/// zero based. Unknown classes and invalid boxes are dropped with a
/// warning.
fn voc_labels(annotation: &Annotation, classes: &ClassList, path: &Path) -> Vec<ObjectLabel> {
    annotation
        .object
        .iter()
        .filter_map(|obj| {
            let class = match classes.index_of_name(obj.name.trim()) {
                Some(class) => class,
                None => {
                    warn!(
                        "unknown class '{}' in '{}'",
                        obj.name,
                        path.display()
                    );
                    return None;
                }
            };
            let rect = match obj.rect(-1.0) {
                Ok(rect) => rect,
                Err(_) => {
                    warn!(
                        "invalid bbox {:?} in '{}'",
                        obj.bndbox,
                        path.display()
                    );
                    return None;
                }
            };
            Some(ObjectLabel::new(rect, class).with_difficult(obj.is_difficult()))
        })
        .collect()
}
