//! Detection blocks and the transitions between pyramid levels.

use crate::common::*;
use tch_modules::{time_distributed, ConvBn, ConvBnInit, ConvGru, ConvGruInit, ConvKind};

/// Swaps `[B, K, C, H, W]` and `[B, C, K, H, W]`.
fn swap_frames_channels(xs: &Tensor) -> Tensor {
    xs.transpose(1, 2).contiguous()
}

#[derive(Debug)]
enum Tip {
    Conv(ConvBn),
    Gru(ConvGru),
}

#[derive(Debug, Clone)]
pub struct DetectionBlockInit {
    pub in_c: usize,
    /// Width of the 1×1 convolutions. The 3×3 ones have twice as many.
    pub channels: usize,
    pub conv_kind: ConvKind,
    /// The input has a frame axis, `[B, K, C, H, W]`.
    pub temporal: bool,
    /// Replace the tip with a 3×3 conv-GRU over the frames.
    pub rnn_tip: bool,
}

impl DetectionBlockInit {
    pub fn build<'p, P>(self, path: P) -> Result<DetectionBlock>
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        let Self {
            in_c,
            channels,
            conv_kind,
            temporal,
            rnn_tip,
        } = self;

        ensure!(
            channels % 2 == 0,
            "channel {} cannot be divided by 2",
            channels
        );
        ensure!(
            !conv_kind.is_temporal() || temporal,
            "3D or 2+1D blocks need a frame axis"
        );
        ensure!(!rnn_tip || temporal, "a recurrent tip needs a frame axis");

        // 1×1 convs stay plain 3D convs in temporal blocks
        let reduce_kind = if conv_kind.is_temporal() {
            ConvKind::D3
        } else {
            ConvKind::D2
        };

        let mut body = vec![];
        let mut last_c = in_c;
        for index in 0..2 {
            body.push(
                ConvBnInit {
                    kind: reduce_kind,
                    ..ConvBnInit::new(last_c, channels, 1)
                }
                .build(path / format!("body_{}", index * 2))?,
            );
            body.push(
                ConvBnInit {
                    kind: conv_kind,
                    ..ConvBnInit::new(channels, channels * 2, 3)
                }
                .build(path / format!("body_{}", index * 2 + 1))?,
            );
            last_c = channels * 2;
        }
        body.push(
            ConvBnInit {
                kind: reduce_kind,
                ..ConvBnInit::new(last_c, channels, 1)
            }
            .build(path / "body_4")?,
        );

        let tip = if rnn_tip {
            Tip::Gru(
                ConvGruInit {
                    in_c: channels,
                    hidden_c: channels * 2,
                    k: 3,
                }
                .build(path / "tip")?,
            )
        } else {
            Tip::Conv(
                ConvBnInit {
                    kind: conv_kind,
                    ..ConvBnInit::new(channels, channels * 2, 3)
                }
                .build(path / "tip")?,
            )
        };

        Ok(DetectionBlock {
            body,
            tip,
            conv_kind,
            temporal,
            channels,
        })
    }
}

/// Five convolutions producing the route passed to the next level, and a
/// tip feeding the output layer.
#[derive(Debug)]
pub struct DetectionBlock {
    body: Vec<ConvBn>,
    tip: Tip,
    conv_kind: ConvKind,
    temporal: bool,
    channels: usize,
}

impl DetectionBlock {
    pub fn route_channels(&self) -> usize {
        self.channels
    }

    pub fn tip_channels(&self) -> usize {
        self.channels * 2
    }

    fn forward_body(&self, xs: &Tensor, train: bool) -> Tensor {
        self.body
            .iter()
            .fold(xs.shallow_clone(), |xs, conv| conv.forward_t(&xs, train))
    }

    /// Returns `(route, tip)`. Temporal blocks take and return
    /// `[B, K, C, H, W]` features.
    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<(Tensor, Tensor)> {
        let Self {
            conv_kind,
            temporal,
            ref tip,
            ..
        } = *self;

        let route = match (temporal, conv_kind.is_temporal()) {
            (false, _) => self.forward_body(xs, train),
            (true, false) => time_distributed(xs, |xs| self.forward_body(xs, train))?,
            (true, true) => swap_frames_channels(&self.forward_body(&swap_frames_channels(xs), train)),
        };

        let tip = match tip {
            Tip::Gru(gru) => gru.forward(&route)?,
            Tip::Conv(conv) => match (temporal, conv_kind.is_temporal()) {
                (false, _) => conv.forward_t(&route, train),
                (true, false) => time_distributed(&route, |xs| conv.forward_t(xs, train))?,
                (true, true) => swap_frames_channels(&conv.forward_t(&swap_frames_channels(&route), train)),
            },
        };

        Ok((route, tip))
    }
}

/// 1×1 convolution then nearest ×2 upsampling, concatenated with the next
/// finer route.
#[derive(Debug)]
pub struct Transition {
    conv: ConvBn,
    temporal: bool,
}

impl Transition {
    pub fn new<'p>(
        path: impl Borrow<nn::Path<'p>>,
        in_c: usize,
        out_c: usize,
        temporal: bool,
    ) -> Result<Self> {
        let conv = ConvBnInit::new(in_c, out_c, 1).build(path)?;
        Ok(Self { conv, temporal })
    }

    pub fn forward_t(&self, xs: &Tensor, route: &Tensor, train: bool) -> Result<Tensor> {
        let Self { ref conv, temporal } = *self;

        let upsample = |xs: &Tensor| -> Result<Tensor> {
            let (_b, _c, in_h, in_w) = xs.size4()?;
            Ok(xs.upsample_nearest2d(&[in_h * 2, in_w * 2], None, None))
        };

        if temporal {
            let (_b, _k, _c, route_h, route_w) = route.size5()?;
            let xs = time_distributed(xs, |xs| conv.forward_t(xs, train))?;
            let (b, k, c, h, w) = xs.size5()?;
            let up = upsample(&xs.reshape(&[b * k, c, h, w]))?;
            let up = up
                .reshape(&[b, k, c, h * 2, w * 2])
                .narrow(3, 0, route_h)
                .narrow(4, 0, route_w);
            Ok(Tensor::cat(&[&up, route], 2))
        } else {
            let (_b, _c, route_h, route_w) = route.size4()?;
            let up = upsample(&conv.forward_t(xs, train))?
                .narrow(2, 0, route_h)
                .narrow(3, 0, route_w);
            Ok(Tensor::cat(&[&up, route], 1))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_layouts() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let opts = (Kind::Float, Device::Cpu);

        let plain = DetectionBlockInit {
            in_c: 8,
            channels: 4,
            conv_kind: ConvKind::D2,
            temporal: false,
            rnn_tip: false,
        }
        .build(&root / "plain")?;
        let (route, tip) = plain.forward_t(&Tensor::randn(&[2, 8, 5, 5], opts), false)?;
        assert_eq!(route.size(), vec![2, 4, 5, 5]);
        assert_eq!(tip.size(), vec![2, 8, 5, 5]);

        for (name, kind, rnn_tip) in [
            ("td", ConvKind::D2, false),
            ("conv3", ConvKind::D3, false),
            ("conv21", ConvKind::D21, true),
        ] {
            let block = DetectionBlockInit {
                in_c: 8,
                channels: 4,
                conv_kind: kind,
                temporal: true,
                rnn_tip,
            }
            .build(&root / name)?;
            let (route, tip) = block.forward_t(&Tensor::randn(&[2, 3, 8, 5, 5], opts), false)?;
            assert_eq!(route.size(), vec![2, 3, 4, 5, 5]);
            assert_eq!(tip.size(), vec![2, 3, 8, 5, 5]);
        }

        assert!(DetectionBlockInit {
            in_c: 8,
            channels: 4,
            conv_kind: ConvKind::D3,
            temporal: false,
            rnn_tip: false,
        }
        .build(&root / "invalid")
        .is_err());
        Ok(())
    }

    #[test]
    fn transition_concatenates_upsampled() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let opts = (Kind::Float, Device::Cpu);

        let transition = Transition::new(&vs.root() / "plain", 8, 4, false)?;
        let ys = transition.forward_t(
            &Tensor::randn(&[1, 8, 3, 3], opts),
            &Tensor::randn(&[1, 6, 5, 5], opts),
            false,
        )?;
        assert_eq!(ys.size(), vec![1, 10, 5, 5]);

        let transition = Transition::new(&vs.root() / "temporal", 8, 4, true)?;
        let ys = transition.forward_t(
            &Tensor::randn(&[1, 2, 8, 3, 3], opts),
            &Tensor::randn(&[1, 2, 6, 6, 6], opts),
            false,
        )?;
        assert_eq!(ys.size(), vec![1, 2, 10, 6, 6]);
        Ok(())
    }
}
