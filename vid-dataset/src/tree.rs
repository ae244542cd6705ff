use crate::{common::*, ClassList};

/// A class hierarchy over a class list, read from `child_wnid parent_wnid`
/// lines. Classes without a parent line are roots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassTree {
    pub parents: Vec<Option<usize>>,
    /// Depth of each class, roots are at level 0.
    pub levels: Vec<usize>,
    /// Whether a class has no children.
    pub leafs: Vec<bool>,
}

impl ClassTree {
    pub fn from_parents(parents: Vec<Option<usize>>) -> Result<Self> {
        let num_classes = parents.len();

        let levels: Vec<usize> = (0..num_classes)
            .map(|class| -> Result<_> {
                let mut level = 0;
                let mut current = class;
                while let Some(parent) = parents[current] {
                    ensure!(parent < num_classes, "parent index {} is out of range", parent);
                    level += 1;
                    ensure!(
                        level <= num_classes,
                        "the class hierarchy has a cycle through class {}",
                        class
                    );
                    current = parent;
                }
                Ok(level)
            })
            .try_collect()?;

        let mut leafs = vec![true; num_classes];
        parents
            .iter()
            .flatten()
            .for_each(|&parent| leafs[parent] = false);

        Ok(Self {
            parents,
            levels,
            leafs,
        })
    }

    pub fn parse(text: &str, classes: &ClassList) -> Result<Self> {
        let mut parents = vec![None; classes.len()];

        for (line_no, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (child, parent) = line
                .split_whitespace()
                .collect_tuple()
                .ok_or_else(|| format_err!("line {}: expect 'child parent', get '{}'", line_no + 1, line))?;

            let child = match classes.index_of_key(child) {
                Some(child) => child,
                None => {
                    warn!("line {}: unknown class '{}' is ignored", line_no + 1, child);
                    continue;
                }
            };
            let parent = classes
                .index_of_key(parent)
                .ok_or_else(|| format_err!("line {}: unknown parent class '{}'", line_no + 1, parent))?;
            ensure!(
                parents[child].is_none(),
                "line {}: class '{}' has more than one parent",
                line_no + 1,
                line
            );
            parents[child] = Some(parent);
        }

        Self::from_parents(parents)
    }

    pub async fn load(path: impl AsRef<Path>, classes: &ClassList) -> Result<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read '{}'", path.display()))?;
        Self::parse(&text, classes).with_context(|| format!("invalid hierarchy file '{}'", path.display()))
    }

    pub fn num_classes(&self) -> usize {
        self.parents.len()
    }

    /// Ancestors of a class from its parent up to the root.
    pub fn ancestors(&self, class: usize) -> impl Iterator<Item = usize> + '_ {
        std::iter::successors(self.parents.get(class).copied().flatten(), move |&current| {
            self.parents[current]
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classes() -> Result<ClassList> {
        let names: IndexSet<_> = ["animal", "dog", "puppy", "car"].iter().map(|s| s.to_string()).collect();
        let wn_ids: IndexSet<_> = ["n0", "n1", "n2", "n3"].iter().map(|s| s.to_string()).collect();
        ClassList::new(names, Some(wn_ids), None)
    }

    #[test]
    fn levels_and_leafs() -> Result<()> {
        let tree = ClassTree::parse("n1 n0\nn2 n1\n\nn9 n0\n", &classes()?)?;

        assert_eq!(tree.levels, vec![0, 1, 2, 0]);
        assert_eq!(tree.leafs, vec![false, false, true, true]);
        assert_eq!(tree.ancestors(2).collect::<Vec<_>>(), vec![1, 0]);
        assert_eq!(tree.ancestors(3).count(), 0);
        Ok(())
    }

    #[test]
    fn cycles_are_rejected() -> Result<()> {
        assert!(ClassTree::parse("n1 n0\nn0 n1\n", &classes()?).is_err());
        assert!(ClassTree::parse("n1\n", &classes()?).is_err());
        Ok(())
    }
}
