//! The temporal YOLOv3 detector.

use crate::{
    block::{DetectionBlock, DetectionBlockInit, Transition},
    common::*,
    config::{JoinType, ModelConfig, RnnPos},
    darknet::Darknet53,
    hierarchy::Hierarchy,
    loss::YoloLossInit,
    motion::{MotionStreamInit, MotionStreamNet},
    nms::{NmsOutput, NonMaxSuppression, NonMaxSuppressionInit},
    output::{YoloOutputLayer, YoloOutputLayerInit, YoloTrainOutput},
};
use tch_modules::{temporal_concat, Correlation, TemporalPool};

/// Variable scope of the Darknet-53 backbone under the model path.
pub const BACKBONE_SCOPE: &str = "backbone";

/// A class given by its position or by its name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClassRef {
    Index(usize),
    Name(String),
}

impl ClassRef {
    fn resolve(&self, classes: &[String], which: &str) -> Result<usize> {
        match self {
            Self::Index(index) => {
                ensure!(
                    *index < classes.len(),
                    "index {} out of bounds for {} class names",
                    index,
                    which
                );
                Ok(*index)
            }
            Self::Name(name) => classes
                .iter()
                .position(|class| class == name)
                .ok_or_else(|| format_err!("{} not found in {} class names {:?}", name, which, classes)),
        }
    }
}

/// Which trained class rows are kept when the class list changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClassReuse {
    /// Classes present in both lists under the same name.
    Names(Vec<String>),
    /// Explicit `(new, old)` pairs.
    Map(Vec<(ClassRef, ClassRef)>),
}

impl ClassReuse {
    /// Resolves to `(new_index, old_index)` pairs.
    pub fn resolve(&self, old_classes: &[String], new_classes: &[String]) -> Result<Vec<(usize, usize)>> {
        match self {
            Self::Names(names) => {
                let pairs = names
                    .iter()
                    .filter_map(|name| {
                        let new_index = new_classes.iter().position(|class| class == name);
                        let old_index = old_classes.iter().position(|class| class == name);
                        match (new_index, old_index) {
                            (Some(new_index), Some(old_index)) => Some((new_index, old_index)),
                            _ => {
                                warn!("{} not found in old or new class names", name);
                                None
                            }
                        }
                    })
                    .collect();
                Ok(pairs)
            }
            Self::Map(pairs) => pairs
                .iter()
                .map(|(new, old)| Ok((new.resolve(new_classes, "new")?, old.resolve(old_classes, "old")?)))
                .collect(),
        }
    }
}

/// Merges the frame axis of `[B, K, C, H, W]` features.
#[derive(Debug, Clone, Copy)]
enum Fusion {
    Pool(TemporalPool),
    Concat,
    Corr(Correlation),
}

impl Fusion {
    fn new(join: Option<JoinType>, corr: Option<Correlation>) -> Option<Self> {
        match (join, corr) {
            (Some(JoinType::Cat), _) => Some(Self::Concat),
            (Some(join), _) => join.pool().map(Self::Pool),
            (None, Some(corr)) => Some(Self::Corr(corr)),
            (None, None) => None,
        }
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Self::Pool(pool) => Ok(xs.apply(pool)),
            Self::Concat => temporal_concat(xs),
            Self::Corr(corr) => corr.forward(xs),
        }
    }
}

#[derive(Debug, Clone)]
pub struct YoloVidInit {
    pub config: ModelConfig,
    pub classes: Vec<String>,
}

impl YoloVidInit {
    pub fn build<'p, P>(self, path: P) -> Result<YoloVid>
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        let Self { mut config, classes } = self;

        ensure!(!classes.is_empty(), "the detector needs at least one class");
        ensure!(
            config.num_classes == 0 || config.num_classes == classes.len(),
            "num_classes is {}, but {} class names are given",
            config.num_classes,
            classes.len()
        );
        config.num_classes = classes.len();
        config.validate()?;

        let backbone = Darknet53::new(path / BACKBONE_SCOPE, 3, config.backbone_channels)?;
        let temporal_blocks = config.temporal_blocks();
        let early = Fusion::new(config.early_join(), config.early_corr());
        let late = Fusion::new(config.late_join(), config.late_corr());
        let rnn_pool = match config.rnn_pos {
            Some(RnnPos::Out) => config.k_join_type.and_then(|join| join.pool()),
            _ => None,
        };

        let route_channels: Vec<usize> = config
            .backbone_route_channels()
            .iter()
            .map(|&channels| config.route_channels(channels))
            .collect();
        let num_levels = config.num_levels();

        let motion = config
            .motion_stream
            .map(|kind| {
                MotionStreamInit {
                    kind,
                    gating: config.stream_gating.unwrap_or_default(),
                    k: config.k,
                    base: config.backbone_channels,
                    route_channels: route_channels.clone(),
                }
                .build(path / "motion")
            })
            .transpose()?;

        let mut blocks = vec![];
        let mut outputs = vec![];
        let mut transitions = vec![];

        for level in 0..num_levels {
            let channels = config.channels[level];
            let in_c = if level == 0 {
                route_channels[0]
            } else {
                config.channels[level - 1] / 2 + route_channels[level]
            };

            let block = DetectionBlockInit {
                in_c,
                channels,
                conv_kind: config.block_conv_type,
                temporal: temporal_blocks,
                rnn_tip: config.rnn_pos == Some(RnnPos::Late),
            }
            .build(path / format!("block_{}", level))?;

            // anchors and strides are listed from the finest level
            let config_level = num_levels - 1 - level;
            let output = YoloOutputLayerInit {
                in_c: config.output_in_channels(block.tip_channels()),
                num_classes: config.num_classes,
                anchors: config.anchors[config_level].clone(),
                stride: config.strides[config_level],
                agnostic: config.agnostic,
                hierarchy: config.hierarchical.clone(),
                rnn_pool,
            }
            .build(path / format!("output_{}", level))?;

            if level + 1 < num_levels {
                transitions.push(Transition::new(
                    path / format!("transition_{}", level),
                    block.route_channels(),
                    channels / 2,
                    temporal_blocks,
                )?);
            }

            blocks.push(block);
            outputs.push(output);
        }

        let nms = NonMaxSuppressionInit {
            iou_threshold: config.nms_thresh,
            topk: Some(config.nms_topk).filter(|&topk| topk > 0),
            post_nms: Some(config.post_nms).filter(|&post_nms| post_nms > 0),
            ..Default::default()
        }
        .build()?;

        info!(
            "build detector with {} classes, k = {}, block conv {}",
            config.num_classes, config.k, config.block_conv_type
        );

        Ok(YoloVid {
            config,
            classes,
            backbone,
            early,
            motion,
            late,
            blocks,
            transitions,
            outputs,
            nms,
        })
    }
}

/// Darknet-53 with three detection levels, ordered from the coarsest to the
/// finest, and optional fusion of the frame axis.
#[derive(Debug)]
pub struct YoloVid {
    config: ModelConfig,
    classes: Vec<String>,
    backbone: Darknet53,
    early: Option<Fusion>,
    motion: Option<MotionStreamNet>,
    late: Option<Fusion>,
    blocks: Vec<DetectionBlock>,
    transitions: Vec<Transition>,
    outputs: Vec<YoloOutputLayer>,
    nms: NonMaxSuppression,
}

impl YoloVid {
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    /// Loss options matching this detector.
    pub fn loss_init(&self, label_smooth: bool) -> YoloLossInit {
        YoloLossInit {
            num_classes: self.num_classes(),
            ignore_iou_thresh: self.config.ignore_iou_thresh.raw(),
            label_smooth,
        }
    }

    fn check_input(&self, xs: &Tensor) -> Result<()> {
        let size = xs.size();
        if self.config.is_temporal() {
            ensure!(
                size.len() == 5 && size[1] == self.config.k as i64 && size[2] == 3,
                "expect [B, {}, 3, H, W] input, but get {:?}",
                self.config.k,
                size
            );
        } else {
            ensure!(
                size.len() == 4 && size[1] == 3,
                "expect [B, 3, H, W] input, but get {:?}",
                size
            );
        }
        Ok(())
    }

    /// Features entering the output layers, from the coarsest level.
    fn features(&self, xs: &Tensor, train: bool) -> Result<Vec<Tensor>> {
        self.check_input(xs)?;

        let mut routes = self.backbone.forward_t(xs, train, self.config.is_temporal())?;
        routes.reverse();
        let routes: Vec<Tensor> = routes
            .iter()
            .map(|route| match &self.early {
                Some(fusion) => fusion.forward(route),
                None => Ok(route.shallow_clone()),
            })
            .collect::<Result<_>>()?;
        let routes = match &self.motion {
            Some(motion) => motion.gate(xs, &routes, train)?,
            None => routes,
        };

        let mut tips = Vec::with_capacity(self.blocks.len());
        let mut xs = routes[0].shallow_clone();

        for (level, block) in self.blocks.iter().enumerate() {
            let (route, tip) = block.forward_t(&xs, train)?;
            let tip = match &self.late {
                Some(fusion) => fusion.forward(&tip)?,
                None => tip,
            };
            tips.push(tip);

            if let Some(transition) = self.transitions.get(level) {
                xs = transition.forward_t(&route, &routes[level + 1], train)?;
            }
        }

        Ok(tips)
    }

    /// Raw predictions of all levels for the loss.
    pub fn forward_train(&mut self, xs: &Tensor) -> Result<YoloTrainOutput> {
        let tips = self.features(xs, true)?;
        let outputs = self
            .outputs
            .iter_mut()
            .zip(tips.iter())
            .map(|(output, tip)| output.forward_train(tip))
            .collect::<Result<Vec<_>>>()?;
        YoloTrainOutput::cat(outputs)
    }

    /// `[B, N, 6]` detections `[class, score, x1, y1, x2, y2]` before
    /// suppression.
    pub fn forward_inference(&mut self, xs: &Tensor) -> Result<Tensor> {
        let tips = self.features(xs, false)?;
        let detections = self
            .outputs
            .iter_mut()
            .zip(tips.iter())
            .map(|(output, tip)| output.forward_inference(tip))
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::cat(&detections, 1))
    }

    /// Suppressed detections padded with `-1`.
    pub fn detect(&mut self, xs: &Tensor) -> Result<NmsOutput> {
        let detections = tch::no_grad(|| self.forward_inference(xs))?;
        self.nms.forward(&detections)
    }

    /// Switches to a new class list, keeping the trained rows selected by
    /// `reuse`. The class tree, if any, must describe the new classes.
    pub fn reset_class(
        &mut self,
        classes: Vec<String>,
        reuse: Option<&ClassReuse>,
        hierarchy: Option<Hierarchy>,
    ) -> Result<()> {
        ensure!(!classes.is_empty(), "the detector needs at least one class");
        let mapping = match reuse {
            Some(reuse) => reuse.resolve(&self.classes, &classes)?,
            None => vec![],
        };

        for output in &mut self.outputs {
            output.reset_class(classes.len(), &mapping, hierarchy.clone())?;
        }

        info!(
            "reset {} classes to {}, reusing {} of them",
            self.classes.len(),
            classes.len(),
            mapping.len()
        );
        self.config.num_classes = classes.len();
        self.config.hierarchical = hierarchy;
        self.classes = classes;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FusionPos, MotionStream, StreamGating};
    use tch_modules::ConvKind;

    fn small_config(k: usize) -> ModelConfig {
        ModelConfig {
            k,
            channels: vec![16, 8, 4],
            backbone_channels: 2,
            ..Default::default()
        }
    }

    fn classes(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    // levels of 2×2, 4×4 and 8×8 cells with 3 anchors each
    const NUM_PREDICTIONS: i64 = (4 + 16 + 64) * 3;

    #[test]
    fn single_frame_detector() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let mut model = YoloVidInit {
            config: small_config(1),
            classes: classes(&["car", "dog", "cat"]),
        }
        .build(&vs.root())?;

        let xs = Tensor::rand(&[2, 3, 64, 64], (Kind::Float, Device::Cpu));
        let output = model.forward_train(&xs)?;
        assert_eq!(output.bbox.size(), vec![2, NUM_PREDICTIONS, 4]);
        assert_eq!(output.class_pred.size(), vec![2, NUM_PREDICTIONS, 3]);
        let strides: Vec<_> = output.levels.iter().map(|level| level.stride).collect();
        assert_eq!(strides, vec![32.0, 16.0, 8.0]);
        assert_eq!(output.levels[2].start, (4 + 16) * 3);

        let detections = model.forward_inference(&xs)?;
        assert_eq!(detections.size(), vec![2, NUM_PREDICTIONS * 3, 6]);

        let nms = model.detect(&xs)?;
        assert_eq!(nms.bboxes.size(), vec![2, 100, 4]);

        // frames are rejected by a single frame detector
        let frames = Tensor::rand(&[1, 3, 3, 64, 64], (Kind::Float, Device::Cpu));
        assert!(model.forward_inference(&frames).is_err());
        Ok(())
    }

    #[test]
    fn temporal_detectors() -> Result<()> {
        let configs = [
            // 2+1D blocks with recurrent tips and a late max pool
            ModelConfig {
                k_join_type: Some(JoinType::Max),
                k_join_pos: Some(FusionPos::Late),
                block_conv_type: ConvKind::D21,
                rnn_pos: Some(RnnPos::Late),
                ..small_config(3)
            },
            // frames concatenated on the backbone routes
            ModelConfig {
                k_join_type: Some(JoinType::Cat),
                k_join_pos: Some(FusionPos::Early),
                ..small_config(3)
            },
            // correlation of the backbone routes
            ModelConfig {
                corr_pos: Some(FusionPos::Early),
                ..small_config(3)
            },
            // correlation of the tips
            ModelConfig {
                corr_pos: Some(FusionPos::Late),
                ..small_config(3)
            },
            // recurrent prediction pooled by the mean
            ModelConfig {
                k_join_type: Some(JoinType::Mean),
                rnn_pos: Some(RnnPos::Out),
                ..small_config(3)
            },
            // 2+1D motion stream multiplied into routes that keep the frames
            ModelConfig {
                k_join_type: Some(JoinType::Max),
                k_join_pos: Some(FusionPos::Late),
                block_conv_type: ConvKind::D21,
                motion_stream: Some(MotionStream::R21d),
                stream_gating: Some(StreamGating::Mul),
                ..small_config(3)
            },
            // stacked frame motion stream added to concatenated routes
            ModelConfig {
                k_join_type: Some(JoinType::Cat),
                k_join_pos: Some(FusionPos::Early),
                motion_stream: Some(MotionStream::Flownet),
                ..small_config(3)
            },
        ];

        for config in configs {
            let vs = nn::VarStore::new(Device::Cpu);
            let mut model = YoloVidInit {
                config: config.clone(),
                classes: classes(&["car", "dog"]),
            }
            .build(&vs.root())?;

            let xs = Tensor::rand(&[1, 3, 3, 64, 64], (Kind::Float, Device::Cpu));
            let output = model.forward_train(&xs)?;
            assert_eq!(
                output.objectness.size(),
                vec![1, NUM_PREDICTIONS, 1],
                "config {:?}",
                config
            );
            let detections = model.forward_inference(&xs)?;
            assert_eq!(detections.size(), vec![1, NUM_PREDICTIONS * 2, 6]);
        }
        Ok(())
    }

    #[test]
    fn motion_stream_receives_gradients() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let mut model = YoloVidInit {
            config: ModelConfig {
                k_join_type: Some(JoinType::Mean),
                k_join_pos: Some(FusionPos::Early),
                motion_stream: Some(MotionStream::R21d),
                ..small_config(3)
            },
            classes: classes(&["car"]),
        }
        .build(&vs.root())?;

        let xs = Tensor::rand(&[2, 3, 3, 64, 64], (Kind::Float, Device::Cpu));
        let output = model.forward_train(&xs)?;
        output.objectness.sum(Kind::Float).backward();

        let variables = vs.variables();
        let motion: Vec<_> = variables
            .iter()
            .filter(|(name, var)| name.starts_with("motion.") && var.requires_grad())
            .collect();
        assert!(!motion.is_empty());
        assert!(motion.iter().all(|(_, var)| var.grad().defined()));
        Ok(())
    }

    #[test]
    fn reset_class_by_name() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let mut model = YoloVidInit {
            config: small_config(1),
            classes: classes(&["car", "dog", "cat"]),
        }
        .build(&vs.root())?;

        let unknown = ClassReuse::Map(vec![(ClassRef::Name("cat".into()), ClassRef::Name("bird".into()))]);
        assert!(model
            .reset_class(classes(&["cat", "car"]), Some(&unknown), None)
            .is_err());
        assert_eq!(model.num_classes(), 3);

        let reuse = ClassReuse::Names(classes(&["cat", "car", "bird"]));
        model.reset_class(classes(&["cat", "car"]), Some(&reuse), None)?;
        assert_eq!(model.classes(), &classes(&["cat", "car"])[..]);

        let xs = Tensor::rand(&[1, 3, 64, 64], (Kind::Float, Device::Cpu));
        let output = model.forward_train(&xs)?;
        assert_eq!(output.class_pred.size(), vec![1, NUM_PREDICTIONS, 2]);
        Ok(())
    }

    #[test]
    fn resolve_class_reuse() -> Result<()> {
        let old = classes(&["person", "car", "dog"]);
        let new = classes(&["dog", "person"]);

        let reuse: ClassReuse = serde_json::from_str(r#"[["person", 0], [0, "dog"]]"#)?;
        assert_eq!(reuse.resolve(&old, &new)?, vec![(1, 0), (0, 2)]);

        let reuse: ClassReuse = serde_json::from_str(r#"["dog", "car"]"#)?;
        assert_eq!(reuse.resolve(&old, &new)?, vec![(0, 2)]);

        let out_of_bounds = ClassReuse::Map(vec![(ClassRef::Index(0), ClassRef::Index(3))]);
        assert!(out_of_bounds.resolve(&old, &new).is_err());
        Ok(())
    }
}
