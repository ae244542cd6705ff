use crate::{common::*, matching::MatchKind};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrecRec {
    pub precision: f64,
    pub recall: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegralMethod {
    /// Area under the monotone precision envelope.
    Continuous,
    /// Mean of the envelope sampled at `n` evenly spaced recall points.
    Interpolation(usize),
}

#[derive(Debug, Clone)]
pub struct ApCalculator {
    integral_method: IntegralMethod,
}

impl ApCalculator {
    /// The 11-point metric of VOC2007.
    pub fn new_voc07() -> Self {
        Self {
            integral_method: IntegralMethod::Interpolation(11),
        }
    }

    /// The area metric of VOC2010 and later.
    pub fn new_voc() -> Self {
        Self {
            integral_method: IntegralMethod::Continuous,
        }
    }

    pub fn new_coco() -> Self {
        Self {
            integral_method: IntegralMethod::Interpolation(101),
        }
    }

    pub fn new(integral_method: IntegralMethod) -> Result<Self> {
        if let IntegralMethod::Interpolation(n_points) = integral_method {
            ensure!(
                n_points >= 2,
                "invalid number of interpolated points {}",
                n_points
            );
        }

        Ok(Self { integral_method })
    }

    /// Compute average precision from a precision/recall curve.
    ///
    /// The input must be ordered by non-decreasing recall.
    pub fn compute_by_prec_rec(&self, sorted_prec_rec: &[PrecRec]) -> f64 {
        match self.integral_method {
            IntegralMethod::Interpolation(n_points) => {
                let sum: f64 = (0..n_points)
                    .map(|index| index as f64 / (n_points - 1) as f64)
                    .map(|point| {
                        sorted_prec_rec
                            .iter()
                            .filter(|prec_rec| prec_rec.recall >= point)
                            .map(|prec_rec| prec_rec.precision)
                            .fold(0.0, f64::max)
                    })
                    .sum();
                sum / n_points as f64
            }
            IntegralMethod::Continuous => {
                // append/prepend sentinel values
                let recalls: Vec<_> = iter::once(0.0)
                    .chain(sorted_prec_rec.iter().map(|prec_rec| prec_rec.recall))
                    .chain(iter::once(1.0))
                    .collect();
                let mut precisions: Vec<_> = iter::once(0.0)
                    .chain(sorted_prec_rec.iter().map(|prec_rec| prec_rec.precision))
                    .chain(iter::once(0.0))
                    .collect();

                // precision envelope
                for index in (1..precisions.len()).rev() {
                    precisions[index - 1] = precisions[index - 1].max(precisions[index]);
                }

                izip!(recalls.iter(), recalls.iter().skip(1), precisions.iter().skip(1))
                    .filter(|(prev, next, _)| prev != next)
                    .map(|(prev, next, precision)| (next - prev) * precision)
                    .sum()
            }
        }
    }

    /// Computes AP from scored match outcomes. Returns NaN when there is no
    /// ground truth to recall.
    pub fn compute_by_matches(&self, matches: &[(R64, MatchKind)], num_ground_truth: usize) -> f64 {
        if num_ground_truth == 0 {
            return f64::NAN;
        }

        let mut sorted: Vec<_> = matches
            .iter()
            .filter(|(_, kind)| *kind != MatchKind::Ignored)
            .collect();
        sorted.sort_by_key(|(score, _)| -*score);

        let prec_rec: Vec<_> = sorted
            .into_iter()
            .scan((0usize, 0usize), |(acc_tp, acc_fp), (_, kind)| {
                match kind {
                    MatchKind::TruePositive => *acc_tp += 1,
                    _ => *acc_fp += 1,
                }
                let tp = *acc_tp as f64;
                let fp = *acc_fp as f64;
                Some(PrecRec {
                    precision: tp / (tp + fp),
                    recall: tp / num_ground_truth as f64,
                })
            })
            .collect();

        self.compute_by_prec_rec(&prec_rec)
    }
}

/// Mean over the non-NaN values, NaN if there is none.
pub fn nan_mean(values: &[f64]) -> f64 {
    let (sum, count) = values
        .iter()
        .filter(|value| !value.is_nan())
        .fold((0.0, 0usize), |(sum, count), value| (sum + value, count + 1));
    if count == 0 {
        f64::NAN
    } else {
        sum / count as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn curve() -> Vec<PrecRec> {
        [
            (1.0, 0.125),
            (1.0, 0.250),
            (1.0, 0.375),
            (0.750, 0.375),
            (0.800, 0.500),
            (0.833, 0.625),
            (0.714, 0.625),
            (0.625, 0.625),
            (0.556, 0.625),
            (0.5, 0.625),
        ]
        .into_iter()
        .map(|(precision, recall)| PrecRec { precision, recall })
        .collect()
    }

    #[test]
    fn eleven_point_interpolation() {
        let ap = ApCalculator::new_voc07().compute_by_prec_rec(&curve());
        assert_abs_diff_eq!(ap, 0.5908181818181819, epsilon = 1e-9);
    }

    #[test]
    fn area_under_envelope() {
        let ap = ApCalculator::new_voc().compute_by_prec_rec(&curve());
        assert_abs_diff_eq!(ap, 0.375 * 1.0 + 0.125 * 0.833 + 0.125 * 0.833, epsilon = 1e-9);

        let perfect = [PrecRec {
            precision: 1.0,
            recall: 1.0,
        }];
        assert_abs_diff_eq!(ApCalculator::new_voc().compute_by_prec_rec(&perfect), 1.0);
        assert_abs_diff_eq!(ApCalculator::new_coco().compute_by_prec_rec(&perfect), 1.0);
    }

    #[test]
    fn ap_from_matches() {
        use MatchKind::*;
        let matches = [
            (r64(0.9), TruePositive),
            (r64(0.8), FalsePositive),
            (r64(0.7), Ignored),
            (r64(0.6), TruePositive),
        ];
        // precision 1.0 up to recall 0.5, then 2/3 up to recall 1.0
        let ap = ApCalculator::new_voc().compute_by_matches(&matches, 2);
        assert_abs_diff_eq!(ap, 0.5 + 0.5 * 2.0 / 3.0, epsilon = 1e-9);
        assert!(ApCalculator::new_voc().compute_by_matches(&matches, 0).is_nan());
    }

    #[test]
    fn nan_mean_skips_missing_classes() {
        assert_abs_diff_eq!(nan_mean(&[1.0, f64::NAN, 0.5]), 0.75);
        assert!(nan_mean(&[f64::NAN]).is_nan());
    }
}
