use crate::common::*;

/// Maps each evaluated class to the index of the same WordNet id among the
/// classes a model was trained on, or `-1` when the model lacks it.
pub fn get_class_map<S1, S2>(eval_wn_ids: &[S1], trained_wn_ids: &[S2]) -> Vec<i64>
where
    S1: AsRef<str>,
    S2: AsRef<str>,
{
    let trained: HashMap<&str, usize> = trained_wn_ids
        .iter()
        .enumerate()
        .map(|(index, wn_id)| (wn_id.as_ref(), index))
        .collect();

    eval_wn_ids
        .iter()
        .map(|wn_id| {
            trained
                .get(wn_id.as_ref())
                .map(|&index| index as i64)
                .unwrap_or(-1)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_classes_map_to_negative() {
        let class_map = get_class_map(&["n02", "n09", "n01"], &["n01", "n02"]);
        assert_eq!(class_map, vec![1, -1, 0]);
    }
}
