//! Motion stream gating the appearance routes with features of the whole window.

use crate::{
    common::*,
    config::{MotionStream, StreamGating},
};
use tch_modules::{ConvBn, ConvBnInit, ConvKind};

/// Stride-2 stages of the stream. The last three line up with the routes.
const NUM_STAGES: usize = 5;

#[derive(Debug, Clone)]
pub struct MotionStreamInit {
    pub kind: MotionStream,
    pub gating: StreamGating,
    /// Frames per window.
    pub k: usize,
    /// Width of the first stage.
    pub base: usize,
    /// Channels of the gated routes, ordered from the coarsest level.
    pub route_channels: Vec<usize>,
}

impl MotionStreamInit {
    pub fn build<'p>(self, path: impl Borrow<nn::Path<'p>>) -> Result<MotionStreamNet> {
        let path = path.borrow();
        let Self {
            kind,
            gating,
            k,
            base,
            route_channels,
        } = self;
        ensure!(k > 1, "a motion stream needs more than one frame");
        ensure!(base > 0, "the motion stream width must be positive");
        ensure!(
            route_channels.len() <= NUM_STAGES,
            "the motion stream has {} stages, but {} routes are gated",
            NUM_STAGES,
            route_channels.len()
        );

        let (conv_kind, mut in_c) = match kind {
            MotionStream::Flownet => (ConvKind::D2, 3 * k),
            MotionStream::R21d => (ConvKind::D21, 3),
        };
        let stages: Vec<ConvBn> = (0..NUM_STAGES)
            .map(|index| {
                let out_c = base << index;
                let stage = ConvBnInit {
                    kind: conv_kind,
                    s: 2,
                    ..ConvBnInit::new(in_c, out_c, 3)
                }
                .build(path / format!("stage_{}", index));
                in_c = out_c;
                stage
            })
            .try_collect()?;

        // coarsest stage first
        let projections: Vec<ConvBn> = route_channels
            .iter()
            .enumerate()
            .map(|(level, &route_c)| {
                let stage_c = base << (NUM_STAGES - 1 - level);
                ConvBnInit::new(stage_c, route_c, 1).build(path / format!("project_{}", level))
            })
            .try_collect()?;

        info!("build {} motion stream with {} gating", kind, gating);

        Ok(MotionStreamNet {
            kind,
            gating,
            stages,
            projections,
        })
    }
}

#[derive(Debug)]
pub struct MotionStreamNet {
    kind: MotionStream,
    gating: StreamGating,
    stages: Vec<ConvBn>,
    projections: Vec<ConvBn>,
}

impl MotionStreamNet {
    /// Gates, `[B, C, H, W]` per route, computed from the `[B, K, 3, H, W]`
    /// window and ordered from the coarsest level.
    pub fn forward_t(&self, window: &Tensor, train: bool) -> Result<Vec<Tensor>> {
        let (batch_size, k, channels, height, width) = window.size5()?;
        ensure!(channels == 3, "expect RGB frames, but get {} channels", channels);

        let mut xs = match self.kind {
            MotionStream::Flownet => window.reshape(&[batch_size, k * 3, height, width]),
            MotionStream::R21d => window.transpose(1, 2),
        };
        let num_routes = self.projections.len();
        let mut features = Vec::with_capacity(num_routes);

        for (index, stage) in self.stages.iter().enumerate() {
            xs = stage.forward_t(&xs, train);
            if index + num_routes >= NUM_STAGES {
                let feature = match self.kind {
                    MotionStream::Flownet => xs.shallow_clone(),
                    MotionStream::R21d => xs.mean_dim(&[2], false, xs.kind()),
                };
                features.push(feature);
            }
        }
        features.reverse();

        let gates = features
            .iter()
            .zip(&self.projections)
            .map(|(feature, projection)| projection.forward_t(feature, train))
            .collect();
        Ok(gates)
    }

    /// Merges the gates into `[B, C, H, W]` or `[B, K, C, H, W]` routes.
    pub fn gate(&self, window: &Tensor, routes: &[Tensor], train: bool) -> Result<Vec<Tensor>> {
        let gates = self.forward_t(window, train)?;
        ensure!(
            gates.len() == routes.len(),
            "expect {} routes, but get {}",
            gates.len(),
            routes.len()
        );

        routes
            .iter()
            .zip(gates)
            .map(|(route, gate)| {
                let gate = match route.dim() {
                    4 => gate,
                    5 => gate.unsqueeze(1),
                    dim => bail!("expect a 4-D or 5-D route, but get {} dimensions", dim),
                };
                let route_size = route.size();
                let gate_size = gate.size();
                ensure!(
                    route_size[route_size.len() - 3..] == gate_size[gate_size.len() - 3..],
                    "the motion gate of shape {:?} does not match the route of shape {:?}",
                    gate_size,
                    route_size
                );

                Ok(match self.gating {
                    StreamGating::Add => route + gate,
                    StreamGating::Mul => route * gate.sigmoid(),
                })
            })
            .collect()
    }
}
