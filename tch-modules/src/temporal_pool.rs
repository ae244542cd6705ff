use crate::common::*;

/// Reduction applied across the frame axis of `[B, K, C, H, W]` features.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TemporalPool {
    Max,
    Mean,
}

impl nn::Module for TemporalPool {
    fn forward(&self, xs: &Tensor) -> Tensor {
        match self {
            Self::Max => xs.amax(&[1], false),
            Self::Mean => xs.mean_dim(&[1], false, xs.kind()),
        }
    }
}

/// Folds the frame axis into channels, `[B, K, C, H, W]` to `[B, K * C, H, W]`.
pub fn temporal_concat(xs: &Tensor) -> Result<Tensor> {
    let (b, k, c, h, w) = xs.size5()?;
    Ok(xs.reshape(&[b, k * c, h, w]))
}
