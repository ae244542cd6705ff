use crate::common::*;

/// Reads one class name per line. Blank lines are skipped.
pub async fn load_classes_file(path: impl AsRef<Path>) -> Result<IndexSet<String>> {
    let path = path.as_ref();
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read classes file '{}'", path.display()))?;
    parse_classes(&content).with_context(|| format!("invalid classes file '{}'", path.display()))
}

fn parse_classes(content: &str) -> Result<IndexSet<String>> {
    let lines: Vec<_> = content
        .lines()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty())
        .collect();
    let classes: IndexSet<_> = lines.iter().map(|&line| line.to_owned()).collect();
    ensure!(lines.len() == classes.len(), "duplicated class names found");
    ensure!(!classes.is_empty(), "no classes found");
    Ok(classes)
}

/// Paths to the class description files of a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassFiles {
    /// Human readable names, one per line.
    pub names_file: PathBuf,
    /// WordNet ids in the same order as the names.
    #[serde(default)]
    pub wn_ids_file: Option<PathBuf>,
    /// Numeric ids used by the annotation files, in the same order.
    #[serde(default)]
    pub ids_file: Option<PathBuf>,
}

/// The class list of a dataset with optional WordNet and numeric ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassList {
    names: IndexSet<String>,
    wn_ids: Option<IndexSet<String>>,
    ids: Option<IndexSet<i64>>,
}

impl ClassList {
    pub fn new(
        names: IndexSet<String>,
        wn_ids: Option<IndexSet<String>>,
        ids: Option<IndexSet<i64>>,
    ) -> Result<Self> {
        ensure!(!names.is_empty(), "the class list must not be empty");
        if let Some(wn_ids) = &wn_ids {
            ensure!(
                wn_ids.len() == names.len(),
                "expect {} WordNet ids, but found {}",
                names.len(),
                wn_ids.len()
            );
        }
        if let Some(ids) = &ids {
            ensure!(
                ids.len() == names.len(),
                "expect {} class ids, but found {}",
                names.len(),
                ids.len()
            );
        }
        Ok(Self { names, wn_ids, ids })
    }

    pub async fn load(files: &ClassFiles) -> Result<Self> {
        let ClassFiles {
            names_file,
            wn_ids_file,
            ids_file,
        } = files;

        let names = load_classes_file(names_file).await?;
        let wn_ids = match wn_ids_file {
            Some(path) => Some(load_classes_file(path).await?),
            None => None,
        };
        let ids = match ids_file {
            Some(path) => {
                let ids: IndexSet<i64> = load_classes_file(path)
                    .await?
                    .iter()
                    .map(|id| {
                        id.parse()
                            .with_context(|| format!("invalid class id '{}' in '{}'", id, path.display()))
                    })
                    .try_collect()?;
                Some(ids)
            }
            None => None,
        };

        Self::new(names, wn_ids, ids)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &IndexSet<String> {
        &self.names
    }

    pub fn wn_ids(&self) -> Option<&IndexSet<String>> {
        self.wn_ids.as_ref()
    }

    pub fn ids(&self) -> Option<&IndexSet<i64>> {
        self.ids.as_ref()
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.names.get_index(index).map(|name| name.as_str())
    }

    pub fn wn_id(&self, index: usize) -> Option<&str> {
        self.wn_ids.as_ref()?.get_index(index).map(|id| id.as_str())
    }

    pub fn index_of_name(&self, name: &str) -> Option<usize> {
        self.names.get_index_of(name)
    }

    pub fn index_of_wn_id(&self, wn_id: &str) -> Option<usize> {
        self.wn_ids.as_ref()?.get_index_of(wn_id)
    }

    pub fn index_of_id(&self, id: i64) -> Option<usize> {
        self.ids.as_ref()?.get_index_of(&id)
    }

    /// Looks up a class by WordNet id, falling back to the name.
    pub fn index_of_key(&self, key: &str) -> Option<usize> {
        self.index_of_wn_id(key)
            .or_else(|| self.index_of_name(key))
    }
}
