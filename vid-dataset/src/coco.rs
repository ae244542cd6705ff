//! MS COCO instance annotations, reading and writing.

use crate::{
    common::*,
    dataset::{DetectionDataset, Sample},
    ClassList,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CocoJson {
    pub images: Vec<CocoImage>,
    pub annotations: Vec<CocoAnnotation>,
    pub categories: Vec<CocoCategory>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CocoImage {
    pub id: i64,
    pub file_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CocoAnnotation {
    pub id: i64,
    pub image_id: i64,
    pub category_id: i64,
    /// `[x, y, w, h]`
    pub bbox: [f64; 4],
    #[serde(default)]
    pub area: f64,
    #[serde(default)]
    pub iscrowd: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CocoCategory {
    pub id: i64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wnid: Option<String>,
}

impl CocoJson {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_owned();
        let text = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read '{}'", path.display()))?;
        let json = tokio::task::spawn_blocking(move || serde_json::from_str(&text))
            .map(|result| Fallible::Ok(result??))
            .await
            .with_context(|| format!("failed to parse '{}'", path.display()))?;
        Ok(json)
    }

    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let text = serde_json::to_string(self)?;
        tokio::fs::write(path, text)
            .await
            .with_context(|| format!("failed to write '{}'", path.display()))?;
        Ok(())
    }

    /// Converts the labels of a dataset into COCO format. Image ids are
    /// sample indices and file names are sample ids.
    pub fn from_dataset(dataset: &dyn DetectionDataset) -> Self {
        let classes = dataset.classes();
        let categories: Vec<_> = classes
            .names()
            .iter()
            .enumerate()
            .map(|(index, name)| CocoCategory {
                id: index as i64,
                name: name.clone(),
                wnid: classes.wn_id(index).map(|id| id.to_owned()),
            })
            .collect();

        let images: Vec<_> = dataset
            .samples()
            .iter()
            .enumerate()
            .map(|(index, sample)| {
                let (height, width) = match &sample.size {
                    Some(size) => (Some(size.h()), Some(size.w())),
                    None => (None, None),
                };
                CocoImage {
                    id: index as i64,
                    file_name: sample.id.clone(),
                    width,
                    height,
                }
            })
            .collect();

        let annotations: Vec<_> = dataset
            .samples()
            .iter()
            .enumerate()
            .flat_map(|(index, sample)| {
                sample
                    .labels
                    .iter()
                    .map(move |label| (index, label))
            })
            .enumerate()
            .map(|(id, (image_index, label))| {
                let [x1, y1, x2, y2] = label.rect.xyxy();
                let (w, h) = (x2 - x1, y2 - y1);
                CocoAnnotation {
                    id: id as i64,
                    image_id: image_index as i64,
                    category_id: label.class as i64,
                    bbox: [x1, y1, w, h],
                    area: w * h,
                    iscrowd: 0,
                }
            })
            .collect();

        Self {
            images,
            annotations,
            categories,
        }
    }
}

/// The MS COCO detection dataset.
#[derive(Debug, Clone)]
pub struct CocoDataset {
    pub root: PathBuf,
    pub split: String,
    pub classes: ClassList,
    pub samples: Vec<Sample>,
}

impl DetectionDataset for CocoDataset {
    fn classes(&self) -> &ClassList {
        &self.classes
    }

    fn samples(&self) -> &[Sample] {
        &self.samples
    }
}

impl CocoDataset {
    /// Loads `annotations/instances_<split>.json` with images under
    /// `<split>/`. Without a class list the classes are the categories
    /// ordered by id, otherwise categories are matched by name.
    pub async fn load(
        root: impl AsRef<Path>,
        split: &str,
        classes: Option<ClassList>,
    ) -> Result<Self> {
        let root = root.as_ref().to_owned();
        let json_path = root
            .join("annotations")
            .join(format!("instances_{}.json", split));
        let CocoJson {
            images,
            annotations,
            categories,
        } = CocoJson::load(&json_path).await?;

        let categories: Vec<_> = categories
            .into_iter()
            .sorted_by_key(|category| category.id)
            .collect();
        let classes = match classes {
            Some(classes) => classes,
            None => {
                let names: IndexSet<_> = categories.iter().map(|cat| cat.name.clone()).collect();
                ensure!(
                    names.len() == categories.len(),
                    "duplicated category names in '{}'",
                    json_path.display()
                );
                let ids: IndexSet<_> = categories.iter().map(|cat| cat.id).collect();
                ClassList::new(names, None, Some(ids))?
            }
        };

        // category id to class index
        let category_map: HashMap<i64, usize> = categories
            .iter()
            .filter_map(|category| {
                let index = classes.index_of_name(&category.name);
                if index.is_none() {
                    warn!("category '{}' is not in the class list", category.name);
                }
                Some((category.id, index?))
            })
            .collect();

        let image_sizes: HashMap<i64, HW<f64>> = images
            .iter()
            .filter_map(|image| {
                let size = HW::try_from_hw([image.height? as f64, image.width? as f64]).ok()?;
                Some((image.id, size))
            })
            .collect();
        let mut image_labels: HashMap<i64, Vec<ObjectLabel>> = HashMap::new();

        for ann in annotations {
            if ann.iscrowd != 0 {
                continue;
            }
            let class = match category_map.get(&ann.category_id) {
                Some(&class) => class,
                None => continue,
            };
            let rect = match coco_box_to_tlbr(ann.bbox, ann.area) {
                Some(rect) => rect,
                None => continue,
            };
            let rect = match image_sizes.get(&ann.image_id) {
                Some(size) => rect.clip(size),
                None => rect,
            };
            image_labels
                .entry(ann.image_id)
                .or_default()
                .push(ObjectLabel::new(rect, class));
        }

        let image_dir = root.join(split);
        let samples: Vec<_> = images
            .into_iter()
            .map(|image| {
                let labels = image_labels.remove(&image.id).unwrap_or_default();
                let size = match (image.height, image.width) {
                    (Some(h), Some(w)) => HW::try_from_hw([h, w]).ok(),
                    _ => None,
                };
                Sample::new(image.id.to_string(), image_dir.join(&image.file_name), labels)
                    .with_size(size)
            })
            .collect();

        info!(
            "loaded {} COCO images from '{}'",
            samples.len(),
            json_path.display()
        );

        Ok(Self {
            root,
            split: split.to_owned(),
            classes,
            samples,
        })
    }
}

/// Converts `[x, y, w, h]` into an inclusive pixel box. Degenerate boxes
/// give `None`.
fn coco_box_to_tlbr(bbox: [f64; 4], area: f64) -> Option<TLBR<f64>> {
    let [x1, y1, w, h] = bbox;
    let x2 = x1 + (w - 1.0).max(0.0);
    let y2 = y1 + (h - 1.0).max(0.0);
    if area <= 0.0 || x2 <= x1 || y2 <= y1 {
        return None;
    }
    TLBR::from_xyxy([x1, y1, x2, y2]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const INSTANCES: &str = r#"{
        "images": [
            {"id": 7, "file_name": "000007.jpg", "width": 640, "height": 480},
            {"id": 9, "file_name": "000009.jpg", "width": 100, "height": 100}
        ],
        "annotations": [
            {"id": 1, "image_id": 7, "category_id": 18, "bbox": [10, 20, 30, 40], "area": 1200, "iscrowd": 0},
            {"id": 2, "image_id": 7, "category_id": 1, "bbox": [0, 0, 5, 5], "area": 25, "iscrowd": 1},
            {"id": 3, "image_id": 9, "category_id": 1, "bbox": [90, 90, 30, 30], "area": 900, "iscrowd": 0},
            {"id": 4, "image_id": 9, "category_id": 1, "bbox": [5, 5, 1, 1], "area": 1, "iscrowd": 0}
        ],
        "categories": [
            {"id": 18, "name": "dog"},
            {"id": 1, "name": "person"}
        ]
    }"#;

    #[tokio::test]
    async fn load_coco_instances() -> Result<()> {
        let root = std::env::temp_dir().join("vid-dataset-coco-test");
        tokio::fs::create_dir_all(root.join("annotations")).await?;
        tokio::fs::write(root.join("annotations/instances_val2017.json"), INSTANCES).await?;

        let dataset = CocoDataset::load(&root, "val2017", None).await?;

        assert_eq!(dataset.classes.names().get_index(0).unwrap(), "person");
        assert_eq!(dataset.len(), 2);

        let labels = dataset.labels(0)?;
        assert_eq!(labels.len(), 1);
        assert_eq!(labels[0].class, 1);
        assert_eq!(labels[0].rect.xyxy(), [10.0, 20.0, 39.0, 59.0]);

        let labels = dataset.labels(1)?;
        assert_eq!(labels.len(), 1);
        assert_eq!(labels[0].rect.xyxy(), [90.0, 90.0, 100.0, 100.0]);
        assert_eq!(dataset.image_path(1)?, root.join("val2017/000009.jpg"));
        Ok(())
    }

    #[tokio::test]
    async fn export_round_trips_through_json() -> Result<()> {
        let root = std::env::temp_dir().join("vid-dataset-coco-export-test");
        tokio::fs::create_dir_all(root.join("annotations")).await?;
        tokio::fs::write(root.join("annotations/instances_val.json"), INSTANCES).await?;
        let dataset = CocoDataset::load(&root, "val", None).await?;

        let json = CocoJson::from_dataset(&dataset);
        assert_eq!(json.images.len(), 2);
        assert_eq!(json.annotations.len(), 2);
        assert_eq!(json.annotations[0].bbox, [10.0, 20.0, 29.0, 39.0]);
        assert_eq!(json.categories[1].name, "dog");

        let path = root.join("jsons/val.json");
        json.save(&path).await?;
        assert_eq!(CocoJson::load(&path).await?, json);
        Ok(())
    }
}
