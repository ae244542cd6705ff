use crate::{
    common::*,
    conv_nd::{Conv2DInit, Conv3DInit, ConvND},
    dark_batch_norm::{DarkBatchNorm, DarkBatchNormInit},
};

/// Convolution dimensionality of a conv-BN-activation unit.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
pub enum ConvKind {
    /// Per-frame spatial convolution on `[B, C, H, W]`.
    #[serde(rename = "2")]
    #[strum(serialize = "2")]
    D2,
    /// Spatio-temporal convolution on `[B, C, K, H, W]`.
    #[serde(rename = "3")]
    #[strum(serialize = "3")]
    D3,
    /// Factorized spatial then temporal convolution on `[B, C, K, H, W]`.
    #[serde(rename = "21")]
    #[strum(serialize = "21")]
    D21,
}

impl Default for ConvKind {
    fn default() -> Self {
        Self::D2
    }
}

impl ConvKind {
    pub fn is_temporal(&self) -> bool {
        !matches!(self, Self::D2)
    }
}

#[derive(Debug, Clone)]
pub struct ConvBnInit {
    pub kind: ConvKind,
    pub in_c: usize,
    pub out_c: usize,
    pub k: usize,
    pub s: usize,
    pub activation: Activation,
    pub batch_norm: Option<DarkBatchNormInit>,
}

impl ConvBnInit {
    pub fn new(in_c: usize, out_c: usize, k: usize) -> Self {
        Self {
            kind: ConvKind::D2,
            in_c,
            out_c,
            k,
            s: 1,
            activation: Activation::Leaky,
            batch_norm: Some(Default::default()),
        }
    }

    pub fn build<'p, P>(self, path: P) -> Result<ConvBn>
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();

        let Self {
            kind,
            in_c,
            out_c,
            k,
            s,
            activation,
            batch_norm,
        } = self;
        let bias = batch_norm.is_none();

        let units = match kind {
            ConvKind::D2 => {
                let conv = Conv2DInit {
                    stride: [s, s],
                    bias,
                    ..Conv2DInit::new(k)
                }
                .build(path / "conv", in_c, out_c)?;
                vec![conv]
            }
            ConvKind::D3 => {
                let conv = Conv3DInit {
                    stride: [1, s, s],
                    bias,
                    ..Conv3DInit::new(k)
                }
                .build(path / "conv", in_c, out_c)?;
                vec![conv]
            }
            ConvKind::D21 => {
                let spatial = Conv3DInit {
                    stride: [1, s, s],
                    bias,
                    ..Conv3DInit::with_ksize([1, k, k])
                }
                .build(path / "spatial", in_c, out_c)?;
                let temporal = Conv3DInit {
                    bias,
                    ..Conv3DInit::with_ksize([k, 1, 1])
                }
                .build(path / "temporal", out_c, out_c)?;
                vec![spatial, temporal]
            }
        };

        let bns = match batch_norm {
            Some(init) => units
                .iter()
                .enumerate()
                .map(|(index, _)| {
                    Some(init.clone().build(path / format!("bn_{}", index), out_c as i64))
                })
                .collect(),
            None => units.iter().map(|_| None).collect(),
        };

        Ok(ConvBn {
            kind,
            units,
            bns,
            activation,
        })
    }
}

/// Convolution followed by batch norm and activation. The factorized kind
/// applies the triple twice, spatially then temporally.
#[derive(Debug)]
pub struct ConvBn {
    kind: ConvKind,
    units: Vec<ConvND>,
    bns: Vec<Option<DarkBatchNorm>>,
    activation: Activation,
}

impl ConvBn {
    pub fn kind(&self) -> ConvKind {
        self.kind
    }
}

impl nn::ModuleT for ConvBn {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let Self {
            ref units,
            ref bns,
            activation,
            ..
        } = *self;

        units
            .iter()
            .zip(bns)
            .fold(xs.shallow_clone(), |xs, (conv, bn)| {
                let xs = xs.apply(conv);
                let xs = match bn {
                    Some(bn) => bn.forward_t(&xs, train),
                    None => xs,
                };
                xs.activation(activation)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conv_kind_names() -> Result<()> {
        assert_eq!(ConvKind::D21.to_string(), "21");
        assert_eq!("3".parse::<ConvKind>()?, ConvKind::D3);
        assert!("4".parse::<ConvKind>().is_err());
        Ok(())
    }

    #[test]
    fn conv_bn_shapes() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let opts = (Kind::Float, Device::Cpu);

        let conv = ConvBnInit {
            s: 2,
            ..ConvBnInit::new(3, 8, 3)
        }
        .build(&root / "d2")?;
        let ys = conv.forward_t(&Tensor::randn(&[2, 3, 16, 16], opts), true);
        assert_eq!(ys.size(), vec![2, 8, 8, 8]);

        for kind in [ConvKind::D3, ConvKind::D21] {
            let conv = ConvBnInit {
                kind,
                ..ConvBnInit::new(4, 6, 3)
            }
            .build(&root / kind.as_ref())?;
            let ys = conv.forward_t(&Tensor::randn(&[2, 4, 3, 8, 8], opts), false);
            assert_eq!(ys.size(), vec![2, 6, 3, 8, 8]);
        }
        Ok(())
    }
}
