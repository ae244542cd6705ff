use crate::common::*;

/// Score a class must reach before a deeper level is trusted.
pub const HIERARCHY_THRESH: f64 = 0.3;

/// Depth and leaf flag of every class of a class tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hierarchy {
    pub levels: Vec<usize>,
    pub leafs: Vec<bool>,
}

impl Hierarchy {
    pub fn new(levels: Vec<usize>, leafs: Vec<bool>) -> Result<Self> {
        let hierarchy = Self { levels, leafs };
        hierarchy.validate(hierarchy.levels.len())?;
        Ok(hierarchy)
    }

    pub fn validate(&self, num_classes: usize) -> Result<()> {
        ensure!(
            self.levels.len() == num_classes && self.leafs.len() == num_classes,
            "the hierarchy has {} levels and {} leaf flags, but the model has {} classes",
            self.levels.len(),
            self.leafs.len(),
            num_classes
        );
        Ok(())
    }

    pub fn max_level(&self) -> usize {
        self.levels.iter().copied().max().unwrap_or(0)
    }

    /// Keeps a single class per row of `scores`, `[N, C]`, zeroing the rest.
    ///
    /// Levels are scanned from the deepest down to level 1. At level `L` the
    /// candidates are the classes at `L` and the leaves above it, so root
    /// leaves compete from level 1 while inner roots are never kept. The
    /// first level whose best candidate scores above [HIERARCHY_THRESH]
    /// decides the kept class. Rows where no level qualifies are zeroed.
    pub fn mask_scores(&self, scores: &Tensor) -> Result<Tensor> {
        let (num_rows, num_classes) = scores.size2()?;
        ensure!(
            num_classes as usize == self.levels.len(),
            "expect {} class scores, but get {}",
            self.levels.len(),
            num_classes
        );
        let device = scores.device();

        tch::no_grad(|| {
            let levels: Vec<i64> = self.levels.iter().map(|&level| level as i64).collect();
            let levels = Tensor::of_slice(&levels).to_device(device);
            let leafs: Vec<bool> = self.leafs.clone();
            let leafs = Tensor::of_slice(&leafs).to_device(device);

            let mut decided = Tensor::zeros(&[num_rows], (Kind::Bool, device));
            let mut choice = Tensor::zeros(&[num_rows], (Kind::Int64, device));

            for level in (1..=self.max_level() as i64).rev() {
                let candidates = levels
                    .lt(level)
                    .logical_and(&leafs)
                    .logical_or(&levels.eq(level))
                    .to_kind(scores.kind());
                let (max_score, argmax) = (scores * candidates.view([1, num_classes])).max_dim(1, false);
                let newly = max_score.gt(HIERARCHY_THRESH).logical_and(&decided.logical_not());
                choice = argmax.where_self(&newly, &choice);
                decided = decided.logical_or(&newly);
            }

            let mask = choice.one_hot(num_classes).to_kind(scores.kind())
                * decided.to_kind(scores.kind()).view([num_rows, 1]);
            Ok(scores * mask)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scores(rows: &[[f32; 4]]) -> Tensor {
        let flat: Vec<f32> = rows.iter().flatten().copied().collect();
        Tensor::of_slice(&flat).view([rows.len() as i64, 4])
    }

    #[test]
    fn deepest_confident_class_wins() -> Result<()> {
        // animal(0) -> dog(1) -> puppy(2), car(3) is a root leaf
        let hierarchy = Hierarchy::new(vec![0, 1, 2, 0], vec![false, false, true, true])?;

        let masked = hierarchy.mask_scores(&scores(&[
            [0.9, 0.8, 0.5, 0.1],
            [0.9, 0.8, 0.2, 0.1],
            [0.9, 0.1, 0.2, 0.4],
            [0.2, 0.1, 0.1, 0.1],
        ]))?;
        let rows: Vec<Vec<f32>> = (0..4i64).map(|row| Vec::<f32>::from(&masked.i(row))).collect();

        assert_eq!(rows[0], vec![0.0, 0.0, 0.5, 0.0]);
        assert_eq!(rows[1], vec![0.0, 0.8, 0.0, 0.0]);
        // the leaf car competes with the level 1 and 2 classes
        assert_eq!(rows[2], vec![0.0, 0.0, 0.0, 0.4]);
        assert_eq!(rows[3], vec![0.0; 4]);
        Ok(())
    }

    #[test]
    fn inner_roots_are_never_kept() -> Result<()> {
        // animal(0) -> dog(1)
        let hierarchy = Hierarchy::new(vec![0, 1], vec![false, true])?;
        let scores = Tensor::of_slice(&[0.9f32, 0.1, 0.2, 0.7]).view([2, 2]);
        let masked = hierarchy.mask_scores(&scores)?;

        assert_eq!(Vec::<f32>::from(&masked.i(0)), vec![0.0, 0.0]);
        assert_eq!(Vec::<f32>::from(&masked.i(1)), vec![0.0, 0.7]);
        Ok(())
    }

    #[test]
    fn length_mismatch_is_rejected() {
        assert!(Hierarchy {
            levels: vec![0, 1],
            leafs: vec![true],
        }
        .validate(2)
        .is_err());
    }
}
