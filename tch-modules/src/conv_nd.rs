use crate::common::*;

pub use conv_init::*;
pub use conv_nd_::*;

mod conv_init {
    use super::*;

    /// Initializer of an N-dimensional convolution, `DIM` counting spatial
    /// and temporal axes.
    #[derive(Debug, Clone)]
    pub struct ConvNDInit<const DIM: usize> {
        pub ksize: [usize; DIM],
        pub stride: [usize; DIM],
        pub padding: [usize; DIM],
        pub bias: bool,
        pub ws_init: nn::Init,
    }

    pub type Conv2DInit = ConvNDInit<2>;
    pub type Conv3DInit = ConvNDInit<3>;

    impl<const DIM: usize> ConvNDInit<DIM> {
        /// Cubic kernel with "same" padding.
        pub fn new(ksize: usize) -> Self {
            Self {
                ksize: [ksize; DIM],
                stride: [1; DIM],
                padding: [ksize / 2; DIM],
                bias: true,
                ws_init: nn::Init::KaimingUniform,
            }
        }

        /// Anisotropic kernel with "same" padding per axis.
        pub fn with_ksize(ksize: [usize; DIM]) -> Self {
            let mut padding = [0; DIM];
            padding
                .iter_mut()
                .zip(ksize.iter())
                .for_each(|(pad, &k)| *pad = k / 2);

            Self {
                ksize,
                stride: [1; DIM],
                padding,
                bias: true,
                ws_init: nn::Init::KaimingUniform,
            }
        }

        pub fn build<'a>(
            self,
            path: impl Borrow<nn::Path<'a>>,
            in_dim: usize,
            out_dim: usize,
        ) -> Result<ConvND> {
            let Self {
                ksize,
                stride,
                padding,
                bias,
                ws_init,
            } = self;

            ensure!(in_dim > 0 && out_dim > 0, "channel numbers must be positive");
            ensure!(
                ksize.iter().all(|&k| k > 0) && stride.iter().all(|&s| s > 0),
                "kernel size and stride must be positive"
            );

            let path = path.borrow();
            let to_i64 = |values: [usize; DIM]| -> Vec<i64> {
                values.iter().map(|&v| v as i64).collect()
            };

            let weight = {
                let size: Vec<i64> = [out_dim as i64, in_dim as i64]
                    .into_iter()
                    .chain(to_i64(ksize))
                    .collect();
                path.var("weight", &size, ws_init)
            };
            let bias = bias.then(|| path.zeros("bias", &[out_dim as i64]));

            Ok(ConvND {
                stride: to_i64(stride),
                padding: to_i64(padding),
                weight,
                bias,
            })
        }
    }
}

mod conv_nd_ {
    use super::*;

    #[derive(Debug)]
    pub struct ConvND {
        pub(super) stride: Vec<i64>,
        pub(super) padding: Vec<i64>,
        pub(super) weight: Tensor,
        pub(super) bias: Option<Tensor>,
    }

    impl ConvND {
        pub fn out_channels(&self) -> i64 {
            self.weight.size()[0]
        }

        /// The learned kernel, `[out, in, k...]`.
        pub fn weight(&self) -> &Tensor {
            &self.weight
        }

        pub fn bias(&self) -> Option<&Tensor> {
            self.bias.as_ref()
        }

        /// Replaces the kernel and bias in place. The variables stay
        /// registered in their var store, so the output width may change.
        pub fn set_parameters(&mut self, weight: &Tensor, bias: Option<&Tensor>) -> Result<()> {
            let old_size = self.weight.size();
            let new_size = weight.size();
            ensure!(
                old_size.len() == new_size.len() && old_size[1..] == new_size[1..],
                "expect a kernel of shape [_, {:?}], but get {:?}",
                &old_size[1..],
                new_size
            );

            tch::no_grad(|| -> Result<()> {
                self.weight.set_data(weight);
                match (&mut self.bias, bias) {
                    (Some(old), Some(new)) => {
                        ensure!(
                            new.size() == [new_size[0]],
                            "the bias must have {} entries",
                            new_size[0]
                        );
                        old.set_data(new);
                    }
                    (None, None) => {}
                    _ => bail!("bias presence must not change"),
                }
                Ok(())
            })
        }
    }

    impl nn::Module for ConvND {
        fn forward(&self, input: &Tensor) -> Tensor {
            let Self {
                ref stride,
                ref padding,
                ref weight,
                ref bias,
            } = *self;
            let ndims = stride.len();

            input.convolution(
                weight,
                bias.as_ref(),
                stride,
                padding,
                &vec![1; ndims],
                false,
                &vec![0; ndims],
                1,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conv_output_shapes() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();

        let conv2d = Conv2DInit {
            stride: [2, 2],
            ..Conv2DInit::new(3)
        }
        .build(&root / "conv2d", 4, 8)?;
        let xs = Tensor::zeros(&[2, 4, 16, 16], (Kind::Float, Device::Cpu));
        assert_eq!(xs.apply(&conv2d).size(), vec![2, 8, 8, 8]);

        let temporal = Conv3DInit::with_ksize([3, 1, 1]).build(&root / "conv3d", 4, 6)?;
        let xs = Tensor::zeros(&[2, 4, 5, 7, 7], (Kind::Float, Device::Cpu));
        assert_eq!(xs.apply(&temporal).size(), vec![2, 6, 5, 7, 7]);
        assert_eq!(temporal.out_channels(), 6);
        Ok(())
    }

    #[test]
    fn replace_parameters_in_place() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let mut conv = Conv2DInit::new(1).build(&vs.root() / "pred", 4, 6)?;

        let weight = Tensor::ones(&[3, 4, 1, 1], (Kind::Float, Device::Cpu));
        let bias = Tensor::zeros(&[3], (Kind::Float, Device::Cpu));
        conv.set_parameters(&weight, Some(&bias))?;
        assert_eq!(conv.out_channels(), 3);

        // the var store sees the new shape
        let stored = &vs.variables()["pred.weight"];
        assert_eq!(stored.size(), vec![3, 4, 1, 1]);

        let wrong = Tensor::ones(&[3, 5, 1, 1], (Kind::Float, Device::Cpu));
        assert!(conv.set_parameters(&wrong, Some(&bias)).is_err());
        Ok(())
    }
}
