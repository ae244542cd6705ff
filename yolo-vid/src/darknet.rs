//! Darknet-53 feature extractor split into three pyramid stages.

use crate::common::*;
use tch_modules::{time_distributed, ConvBn, ConvBnInit};

/// Residual blocks per downsampling step.
const DARKNET53_LAYERS: [usize; 5] = [1, 2, 8, 8, 4];

/// 1×1 bottleneck to half width, 3×3 back to full width, plus identity.
#[derive(Debug)]
pub struct ResidualBlock {
    reduce: ConvBn,
    expand: ConvBn,
}

impl ResidualBlock {
    pub fn new<'p>(path: impl Borrow<nn::Path<'p>>, channels: usize) -> Result<Self> {
        let path = path.borrow();
        ensure!(channels % 2 == 0, "channel {} cannot be divided by 2", channels);
        Ok(Self {
            reduce: ConvBnInit::new(channels, channels / 2, 1).build(path / "reduce")?,
            expand: ConvBnInit::new(channels / 2, channels, 3).build(path / "expand")?,
        })
    }
}

impl nn::ModuleT for ResidualBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let ys = self
            .expand
            .forward_t(&self.reduce.forward_t(xs, train), train);
        xs + ys
    }
}

#[derive(Debug)]
enum DarknetLayer {
    Conv(ConvBn),
    Residual(ResidualBlock),
}

impl nn::ModuleT for DarknetLayer {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        match self {
            Self::Conv(conv) => conv.forward_t(xs, train),
            Self::Residual(block) => block.forward_t(xs, train),
        }
    }
}

/// A run of backbone layers ending at one pyramid level.
#[derive(Debug)]
pub struct DarknetStage {
    layers: Vec<DarknetLayer>,
    out_channels: usize,
}

impl DarknetStage {
    pub fn out_channels(&self) -> usize {
        self.out_channels
    }
}

impl nn::ModuleT for DarknetStage {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        self.layers
            .iter()
            .fold(xs.shallow_clone(), |xs, layer| layer.forward_t(&xs, train))
    }
}

/// Darknet-53 returning the stride 8, 16 and 32 feature maps.
#[derive(Debug)]
pub struct Darknet53 {
    stages: Vec<DarknetStage>,
}

impl Darknet53 {
    /// Builds the backbone with a first convolution of `base` channels. The
    /// three stages output `8 · base`, `16 · base` and `32 · base` channels.
    pub fn new<'p>(path: impl Borrow<nn::Path<'p>>, in_channels: usize, base: usize) -> Result<Self> {
        let path = path.borrow();
        ensure!(base > 0, "the backbone width must be positive");

        let mut layers = vec![DarknetLayer::Conv(
            ConvBnInit::new(in_channels, base, 3).build(path / "conv_0")?,
        )];
        let mut stages = vec![];
        let mut channels = base;

        for (step, &num_blocks) in DARKNET53_LAYERS.iter().enumerate() {
            let down = ConvBnInit {
                s: 2,
                ..ConvBnInit::new(channels, channels * 2, 3)
            }
            .build(path / format!("down_{}", step + 1))?;
            channels *= 2;
            layers.push(DarknetLayer::Conv(down));

            for index in 0..num_blocks {
                let block =
                    ResidualBlock::new(path / format!("res_{}_{}", step + 1, index), channels)?;
                layers.push(DarknetLayer::Residual(block));
            }

            // stages end after the 3rd, 4th and 5th downsampling
            if step >= 2 {
                stages.push(DarknetStage {
                    layers: std::mem::take(&mut layers),
                    out_channels: channels,
                });
            }
        }

        Ok(Self { stages })
    }

    pub fn stage_channels(&self) -> Vec<usize> {
        self.stages.iter().map(|stage| stage.out_channels).collect()
    }

    /// Runs the backbone on `[B, 3, H, W]`, or frame by frame on
    /// `[B, K, 3, H, W]` when `temporal`. Routes are ordered from the finest
    /// level to the coarsest.
    pub fn forward_t(&self, xs: &Tensor, train: bool, temporal: bool) -> Result<Vec<Tensor>> {
        let mut routes = Vec::with_capacity(self.stages.len());
        let mut xs = xs.shallow_clone();

        for stage in &self.stages {
            xs = if temporal {
                time_distributed(&xs, |xs| stage.forward_t(xs, train))?
            } else {
                stage.forward_t(&xs, train)
            };
            routes.push(xs.shallow_clone());
        }

        Ok(routes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_strides_and_widths() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let darknet = Darknet53::new(&vs.root() / "darknet", 3, 2)?;
        assert_eq!(darknet.stage_channels(), vec![16, 32, 64]);

        let xs = Tensor::randn(&[1, 3, 64, 64], (Kind::Float, Device::Cpu));
        let routes = darknet.forward_t(&xs, false, false)?;
        let sizes: Vec<_> = routes.iter().map(|route| route.size()).collect();
        assert_eq!(
            sizes,
            vec![vec![1, 16, 8, 8], vec![1, 32, 4, 4], vec![1, 64, 2, 2]]
        );

        let frames = Tensor::randn(&[1, 2, 3, 32, 32], (Kind::Float, Device::Cpu));
        let routes = darknet.forward_t(&frames, false, true)?;
        assert_eq!(routes[2].size(), vec![1, 2, 64, 1, 1]);
        Ok(())
    }
}
