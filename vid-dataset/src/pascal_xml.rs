//! PascalVOC style XML annotations, shared by VOC and ImageNet VID/DET.

use crate::common::*;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Annotation {
    #[serde(default)]
    pub folder: Option<String>,
    pub filename: String,
    #[serde(default)]
    pub size: Option<Size>,
    #[serde(default)]
    pub object: Vec<Object>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Size {
    pub width: usize,
    pub height: usize,
    #[serde(default)]
    pub depth: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Object {
    pub name: String,
    pub bndbox: BndBox,
    #[serde(default)]
    pub difficult: Option<u8>,
    #[serde(default)]
    pub trackid: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BndBox {
    pub xmin: f64,
    pub ymin: f64,
    pub xmax: f64,
    pub ymax: f64,
}

impl Annotation {
    pub fn image_size(&self) -> Option<HW<usize>> {
        let Size { width, height, .. } = *self.size.as_ref()?;
        HW::try_from_hw([height, width]).ok()
    }
}

impl Object {
    pub fn is_difficult(&self) -> bool {
        self.difficult.unwrap_or(0) != 0
    }

    /// The box in pixel coordinates, shifted by `offset` on every edge.
    pub fn rect(&self, offset: f64) -> Result<TLBR<f64>> {
        let BndBox {
            xmin,
            ymin,
            xmax,
            ymax,
        } = self.bndbox;
        TLBR::from_xyxy([xmin + offset, ymin + offset, xmax + offset, ymax + offset])
    }
}

/// Reads and parses an annotation file.
pub async fn load_annotation(path: impl AsRef<Path>) -> Result<Annotation> {
    let path = path.as_ref().to_owned();
    let xml_content = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("failed to read annotation file {}", path.display()))?;

    let annotation: Annotation = tokio::task::spawn_blocking(move || serde_xml_rs::from_str(&xml_content))
        .map(|result| Fallible::Ok(result??))
        .await
        .with_context(|| format!("failed to parse annotation file {}", path.display()))?;

    Ok(annotation)
}

/// Parses annotation files concurrently, keeping their order.
pub async fn load_annotations(files: Vec<PathBuf>) -> Result<Vec<(PathBuf, Annotation)>> {
    stream::iter(files)
        .par_then(None, |path| async move {
            let annotation = load_annotation(&path).await?;
            Fallible::Ok((path, annotation))
        })
        .try_collect()
        .await
}

/// Lists files matching a glob pattern on a blocking thread.
pub async fn glob_files(pattern: String) -> Result<Vec<PathBuf>> {
    tokio::task::spawn_blocking(move || -> Result<_> {
        let files: Vec<_> = glob::glob(&pattern)?.try_collect()?;
        Ok(files)
    })
    .map(|result| Fallible::Ok(result??))
    .await
}
