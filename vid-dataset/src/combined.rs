use crate::{
    common::*,
    dataset::{DetectionDataset, LabelUnit, Sample},
    ClassList,
};

/// Several datasets merged by WordNet id into one class list.
#[derive(Debug, Clone)]
pub struct CombinedDataset {
    pub datasets: Vec<Arc<dyn DetectionDataset>>,
    pub classes: ClassList,
    /// Merged class index of each class of each dataset.
    pub class_maps: Vec<Vec<usize>>,
    pub samples: Vec<Sample>,
    /// `(dataset, sample)` origin of each merged sample.
    pub origins: Vec<(usize, usize)>,
}

impl DetectionDataset for CombinedDataset {
    fn classes(&self) -> &ClassList {
        &self.classes
    }

    fn samples(&self) -> &[Sample] {
        &self.samples
    }

    fn label_unit(&self, index: usize) -> LabelUnit {
        match self.origins.get(index) {
            Some(&(dataset, sample)) => self.datasets[dataset].label_unit(sample),
            None => LabelUnit::Pixel,
        }
    }
}

impl CombinedDataset {
    pub fn new(datasets: Vec<Arc<dyn DetectionDataset>>) -> Result<Self> {
        ensure!(!datasets.is_empty(), "no datasets to combine");

        let mut names = IndexSet::new();
        let mut wn_ids: IndexSet<String> = IndexSet::new();

        let class_maps: Vec<Vec<usize>> = datasets
            .iter()
            .enumerate()
            .map(|(dataset_index, dataset)| -> Result<_> {
                let classes = dataset.classes();
                let dataset_wn_ids = classes.wn_ids().ok_or_else(|| {
                    format_err!("dataset {} has no WordNet ids to merge by", dataset_index)
                })?;

                let class_map = izip!(classes.names(), dataset_wn_ids)
                    .map(|(name, wn_id)| {
                        let (index, inserted) = wn_ids.insert_full(wn_id.clone());
                        if inserted {
                            let mut name = name.clone();
                            if names.contains(&name) {
                                name = format!("{}_{}", name, wn_id);
                            }
                            names.insert(name);
                        }
                        index
                    })
                    .collect();
                Ok(class_map)
            })
            .try_collect()?;

        let classes = ClassList::new(names, Some(wn_ids), None)?;

        let (samples, origins): (Vec<_>, Vec<_>) = datasets
            .iter()
            .zip(&class_maps)
            .enumerate()
            .flat_map(|(dataset_index, (dataset, class_map))| {
                dataset
                    .samples()
                    .iter()
                    .enumerate()
                    .map(move |(sample_index, sample)| {
                        let labels = sample
                            .labels
                            .iter()
                            .cloned()
                            .map(|label| label.map_class(|class| class_map[class]))
                            .collect();
                        let sample = Sample {
                            labels,
                            ..sample.clone()
                        };
                        (sample, (dataset_index, sample_index))
                    })
            })
            .unzip();

        info!(
            "combined {} datasets into {} samples of {} classes",
            datasets.len(),
            samples.len(),
            classes.len()
        );

        Ok(Self {
            datasets,
            classes,
            class_maps,
            samples,
            origins,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Fixed {
        classes: ClassList,
        samples: Vec<Sample>,
        unit: LabelUnit,
    }

    impl DetectionDataset for Fixed {
        fn classes(&self) -> &ClassList {
            &self.classes
        }

        fn samples(&self) -> &[Sample] {
            &self.samples
        }

        fn label_unit(&self, _index: usize) -> LabelUnit {
            self.unit
        }
    }

    fn fixed(names: &[&str], wn_ids: &[&str], class: usize, unit: LabelUnit) -> Result<Arc<dyn DetectionDataset>> {
        let classes = ClassList::new(
            names.iter().map(|s| s.to_string()).collect(),
            Some(wn_ids.iter().map(|s| s.to_string()).collect()),
            None,
        )?;
        let label = ObjectLabel::new(TLBR::from_xyxy([0.0, 0.0, 1.0, 1.0])?, class);
        let sample = Sample::new("s".into(), PathBuf::from("s.jpg"), vec![label]);
        Ok(Arc::new(Fixed {
            classes,
            samples: vec![sample],
            unit,
        }))
    }

    #[test]
    fn merge_by_wordnet_id() -> Result<()> {
        let voc = fixed(&["dog", "person"], &["n02084071", "n00007846"], 1, LabelUnit::Pixel)?;
        let ytbb = fixed(&["person", "zebra"], &["n00007846", "n02391049"], 1, LabelUnit::Normalized)?;
        let combined = CombinedDataset::new(vec![voc, ytbb])?;

        assert_eq!(combined.classes.len(), 3);
        assert_eq!(combined.class_maps, vec![vec![0, 1], vec![1, 2]]);
        assert_eq!(combined.labels(0)?[0].class, 1);
        assert_eq!(combined.labels(1)?[0].class, 2);
        assert_eq!(combined.label_unit(1), LabelUnit::Normalized);
        assert_eq!(combined.classes.index_of_wn_id("n02391049"), Some(2));
        Ok(())
    }
}
