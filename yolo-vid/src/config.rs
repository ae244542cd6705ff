//! Architecture options of the temporal detector.

use crate::{common::*, hierarchy::Hierarchy};
use tch_modules::{ConvKind, Correlation, TemporalPool};

/// How frame features are merged.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JoinType {
    Max,
    Mean,
    /// Stack frames on the channel axis.
    Cat,
}

impl JoinType {
    pub fn pool(&self) -> Option<TemporalPool> {
        match self {
            Self::Max => Some(TemporalPool::Max),
            Self::Mean => Some(TemporalPool::Mean),
            Self::Cat => None,
        }
    }
}

/// Where a temporal operation is placed in the network.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FusionPos {
    /// On the backbone routes, before the detection blocks.
    Early,
    /// On the block tips, before the output layers.
    Late,
}

/// Where the recurrent unit is placed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RnnPos {
    /// A 3×3 conv-GRU replaces the block tips.
    Late,
    /// A 1×1 conv-GRU produces the predictions.
    Out,
}

/// Network run on the whole window to gate the appearance routes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
pub enum MotionStream {
    /// 2D convolutions over the frames stacked on the channel axis.
    #[serde(rename = "flownet")]
    #[strum(serialize = "flownet")]
    Flownet,
    /// 2+1D convolutions averaged over time.
    #[serde(rename = "r21d")]
    #[strum(serialize = "r21d")]
    R21d,
}

/// How the motion stream is merged into the appearance routes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StreamGating {
    Add,
    /// Multiply by the sigmoid of the motion features.
    Mul,
}

impl Default for StreamGating {
    fn default() -> Self {
        Self::Add
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub num_classes: usize,
    /// Frames per window.
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default)]
    pub k_join_type: Option<JoinType>,
    #[serde(default)]
    pub k_join_pos: Option<FusionPos>,
    #[serde(default)]
    pub block_conv_type: ConvKind,
    #[serde(default)]
    pub rnn_pos: Option<RnnPos>,
    #[serde(default)]
    pub corr_pos: Option<FusionPos>,
    /// Maximum displacement of the correlation layer.
    #[serde(default = "default_corr_d")]
    pub corr_d: usize,
    #[serde(default)]
    pub motion_stream: Option<MotionStream>,
    /// Gating of the motion stream, `add` when absent.
    #[serde(default)]
    pub stream_gating: Option<StreamGating>,
    #[serde(default)]
    pub hierarchical: Option<Hierarchy>,
    /// Predict one class-free box per anchor.
    #[serde(default)]
    pub agnostic: bool,
    #[serde(default = "default_nms_thresh")]
    pub nms_thresh: R64,
    #[serde(default = "default_nms_topk")]
    pub nms_topk: usize,
    #[serde(default = "default_post_nms")]
    pub post_nms: usize,
    #[serde(default = "default_ignore_iou_thresh")]
    pub ignore_iou_thresh: R64,
    /// `(w, h)` anchors in pixels per output level, ordered from the finest
    /// stride to the coarsest.
    #[serde(default = "default_anchors")]
    pub anchors: Vec<Vec<[R64; 2]>>,
    #[serde(default = "default_strides")]
    pub strides: Vec<usize>,
    /// Detection block channels, ordered from the coarsest level to the finest.
    #[serde(default = "default_channels")]
    pub channels: Vec<usize>,
    /// Width of the first backbone convolution.
    #[serde(default = "default_backbone_channels")]
    pub backbone_channels: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            num_classes: 0,
            k: default_k(),
            k_join_type: None,
            k_join_pos: None,
            block_conv_type: ConvKind::D2,
            rnn_pos: None,
            corr_pos: None,
            corr_d: default_corr_d(),
            motion_stream: None,
            stream_gating: None,
            hierarchical: None,
            agnostic: false,
            nms_thresh: default_nms_thresh(),
            nms_topk: default_nms_topk(),
            post_nms: default_post_nms(),
            ignore_iou_thresh: default_ignore_iou_thresh(),
            anchors: default_anchors(),
            strides: default_strides(),
            channels: default_channels(),
            backbone_channels: default_backbone_channels(),
        }
    }
}

impl ModelConfig {
    pub fn validate(&self) -> Result<()> {
        let Self {
            num_classes,
            k,
            k_join_type,
            k_join_pos,
            block_conv_type,
            rnn_pos,
            corr_pos,
            motion_stream,
            stream_gating,
            ref hierarchical,
            ignore_iou_thresh,
            ref anchors,
            ref strides,
            ref channels,
            backbone_channels,
            ..
        } = *self;

        ensure!(num_classes > 0, "num_classes must be positive");
        ensure!(k >= 1, "k must be at least 1");
        ensure!(backbone_channels > 0, "backbone_channels must be positive");
        ensure!(
            (0.0..=1.0).contains(&ignore_iou_thresh.raw()),
            "ignore_iou_thresh must be in range [0, 1]"
        );

        // feature pyramid
        ensure!(
            anchors.len() == 3 && strides.len() == 3 && channels.len() == 3,
            "expect 3 levels of anchors, strides and channels"
        );
        ensure!(
            strides == &[8, 16, 32],
            "the Darknet-53 backbone yields strides [8, 16, 32], but get {:?}",
            strides
        );
        ensure!(
            anchors.iter().all(|level| !level.is_empty()
                && level.len() == anchors[0].len()
                && level.iter().flatten().all(|&v| v > 0.0)),
            "every level must have the same positive number of anchors"
        );
        if let Some(&channel) = channels.iter().find(|&&c| c == 0 || c % 2 != 0) {
            bail!("channel {} cannot be divided by 2", channel);
        }

        // temporal options
        if block_conv_type.is_temporal() {
            ensure!(
                k > 1,
                "k must be greater than 1 to use 3D or 2+1D convolutions"
            );
            ensure!(
                k_join_pos == Some(FusionPos::Late),
                "only late joins can be used with 3D or 2+1D convolutions"
            );
            ensure!(
                k_join_type.is_some(),
                "3D or 2+1D convolutions need a k_join_type: max, mean or cat"
            );
        }

        match rnn_pos {
            Some(RnnPos::Late) => {
                ensure!(
                    k_join_pos == Some(FusionPos::Late),
                    "a late rnn_pos needs a late k_join_pos"
                );
            }
            Some(RnnPos::Out) => {
                ensure!(
                    matches!(k_join_type, Some(JoinType::Max | JoinType::Mean)),
                    "an out rnn_pos pools its predictions and needs a max or mean k_join_type"
                );
            }
            None => {}
        }

        if k > 1 {
            // an out rnn_pos only takes the pooling type
            ensure!(
                rnn_pos == Some(RnnPos::Out) || k_join_type.is_some() == k_join_pos.is_some(),
                "k_join_type and k_join_pos must be given together, but get {:?} and {:?}",
                k_join_type,
                k_join_pos
            );
            if let (Some(corr_pos), Some(join_pos)) = (corr_pos, k_join_pos) {
                ensure!(
                    corr_pos != join_pos || rnn_pos == Some(RnnPos::Out),
                    "correlation and join cannot be both placed {}",
                    corr_pos
                );
            }
            ensure!(
                k_join_type.is_some() || corr_pos.is_some() || rnn_pos == Some(RnnPos::Out),
                "k = {} frames need a temporal join, a correlation or an out rnn_pos",
                k
            );
            ensure!(
                !(self.temporal_blocks() && (self.early_join().is_some() || self.early_corr().is_some())),
                "frames merged before the detection blocks cannot feed late temporal layers"
            );
            ensure!(
                !(rnn_pos == Some(RnnPos::Out) && corr_pos == Some(FusionPos::Late)),
                "an out rnn_pos needs the frames that a late correlation merges"
            );
        }

        if let Some(motion_stream) = motion_stream {
            ensure!(
                k > 1,
                "the {} motion stream needs k greater than 1",
                motion_stream
            );
        }
        ensure!(
            stream_gating.is_none() || motion_stream.is_some(),
            "stream_gating needs a motion_stream"
        );

        if let Some(hierarchy) = hierarchical {
            hierarchy.validate(num_classes)?;
        }

        Ok(())
    }

    pub fn num_levels(&self) -> usize {
        self.channels.len()
    }

    pub fn num_anchors(&self) -> usize {
        self.anchors.first().map(|level| level.len()).unwrap_or(0)
    }

    /// Whether the input has a frame axis.
    pub fn is_temporal(&self) -> bool {
        self.k > 1
    }

    /// Whether the detection blocks run on `[B, K, C, H, W]` features.
    pub fn temporal_blocks(&self) -> bool {
        self.k > 1
            && (self.k_join_pos == Some(FusionPos::Late)
                || self.corr_pos == Some(FusionPos::Late)
                || self.rnn_pos.is_some())
    }

    /// Join applied to the backbone routes.
    pub fn early_join(&self) -> Option<JoinType> {
        (self.k > 1 && self.k_join_pos == Some(FusionPos::Early) && self.rnn_pos != Some(RnnPos::Out))
            .then(|| self.k_join_type)
            .flatten()
    }

    pub fn early_corr(&self) -> Option<Correlation> {
        (self.k > 1 && self.early_join().is_none() && self.corr_pos == Some(FusionPos::Early))
            .then(|| Correlation::new(self.corr_d, self.k))
    }

    /// Join applied to the block tips.
    pub fn late_join(&self) -> Option<JoinType> {
        (self.k > 1 && self.k_join_pos == Some(FusionPos::Late) && self.rnn_pos != Some(RnnPos::Out))
            .then(|| self.k_join_type)
            .flatten()
    }

    pub fn late_corr(&self) -> Option<Correlation> {
        (self.k > 1 && self.late_join().is_none() && self.corr_pos == Some(FusionPos::Late))
            .then(|| Correlation::new(self.corr_d, self.k))
    }

    /// Channels of a backbone route after the early fusion.
    pub fn route_channels(&self, channels: usize) -> usize {
        if let Some(join) = self.early_join() {
            match join {
                JoinType::Cat => channels * self.k,
                JoinType::Max | JoinType::Mean => channels,
            }
        } else if let Some(corr) = self.early_corr() {
            corr.out_channels(channels)
        } else {
            channels
        }
    }

    /// Channels entering an output layer from a tip of `channels` channels.
    pub fn output_in_channels(&self, channels: usize) -> usize {
        if let Some(join) = self.late_join() {
            match join {
                JoinType::Cat => channels * self.k,
                JoinType::Max | JoinType::Mean => channels,
            }
        } else if let Some(corr) = self.late_corr() {
            corr.out_channels(channels)
        } else {
            channels
        }
    }

    /// Backbone route channels, ordered from the coarsest level to the finest.
    pub fn backbone_route_channels(&self) -> [usize; 3] {
        let base = self.backbone_channels;
        [base * 32, base * 16, base * 8]
    }
}

fn default_k() -> usize {
    1
}

fn default_corr_d() -> usize {
    1
}

fn default_nms_thresh() -> R64 {
    r64(0.45)
}

fn default_nms_topk() -> usize {
    400
}

fn default_post_nms() -> usize {
    100
}

fn default_ignore_iou_thresh() -> R64 {
    r64(0.7)
}

fn default_anchors() -> Vec<Vec<[R64; 2]>> {
    [
        [[10.0, 13.0], [16.0, 30.0], [33.0, 23.0]],
        [[30.0, 61.0], [62.0, 45.0], [59.0, 119.0]],
        [[116.0, 90.0], [156.0, 198.0], [373.0, 326.0]],
    ]
    .iter()
    .map(|level| level.iter().map(|&[w, h]| [r64(w), r64(h)]).collect())
    .collect()
}

fn default_strides() -> Vec<usize> {
    vec![8, 16, 32]
}

fn default_channels() -> Vec<usize> {
    vec![512, 256, 128]
}

fn default_backbone_channels() -> usize {
    32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(k: usize) -> ModelConfig {
        ModelConfig {
            num_classes: 4,
            k,
            ..Default::default()
        }
    }

    #[test]
    fn parse_with_defaults() -> Result<()> {
        let config: ModelConfig = serde_json::from_str(
            r#"{
                "num_classes": 30,
                "k": 3,
                "k_join_type": "max",
                "k_join_pos": "late",
                "block_conv_type": "21",
                "rnn_pos": "late"
            }"#,
        )?;
        config.validate()?;
        assert_eq!(config.block_conv_type, ConvKind::D21);
        assert_eq!(config.nms_topk, 400);
        assert_eq!(config.anchors[2][2], [r64(373.0), r64(326.0)]);
        assert!(config.temporal_blocks());
        assert_eq!(config.late_join(), Some(JoinType::Max));
        assert_eq!(config.early_join(), None);
        Ok(())
    }

    #[test]
    fn reject_invalid_temporal_options() {
        // 3D convs need frames, a late join and a join type
        let conv3 = ModelConfig {
            block_conv_type: ConvKind::D3,
            ..config(1)
        };
        assert!(conv3.validate().is_err());
        let conv3 = ModelConfig {
            block_conv_type: ConvKind::D3,
            k_join_type: Some(JoinType::Max),
            k_join_pos: Some(FusionPos::Early),
            ..config(3)
        };
        assert!(conv3.validate().is_err());

        // a late rnn needs a late join
        let rnn = ModelConfig {
            rnn_pos: Some(RnnPos::Late),
            k_join_type: Some(JoinType::Max),
            k_join_pos: Some(FusionPos::Early),
            ..config(3)
        };
        assert!(rnn.validate().is_err());

        // an out rnn cannot concatenate
        let rnn = ModelConfig {
            rnn_pos: Some(RnnPos::Out),
            k_join_type: Some(JoinType::Cat),
            k_join_pos: Some(FusionPos::Late),
            ..config(3)
        };
        assert!(rnn.validate().is_err());

        // frames without aggregation
        assert!(config(3).validate().is_err());

        // correlation and join at the same place
        let corr = ModelConfig {
            corr_pos: Some(FusionPos::Early),
            k_join_type: Some(JoinType::Cat),
            k_join_pos: Some(FusionPos::Early),
            ..config(3)
        };
        assert!(corr.validate().is_err());

        // early join with a late correlation
        let mixed = ModelConfig {
            k_join_type: Some(JoinType::Max),
            k_join_pos: Some(FusionPos::Early),
            corr_pos: Some(FusionPos::Late),
            ..config(3)
        };
        assert!(mixed.validate().is_err());

        let odd = ModelConfig {
            channels: vec![512, 255, 128],
            ..config(1)
        };
        assert!(odd.validate().is_err());
    }

    #[test]
    fn motion_stream_options() -> Result<()> {
        let config: ModelConfig = serde_json::from_str(
            r#"{
                "num_classes": 30,
                "k": 3,
                "k_join_type": "mean",
                "k_join_pos": "early",
                "motion_stream": "r21d",
                "stream_gating": "mul"
            }"#,
        )?;
        config.validate()?;
        assert_eq!(config.motion_stream, Some(MotionStream::R21d));
        assert_eq!(config.stream_gating, Some(StreamGating::Mul));
        assert_eq!("flownet".parse::<MotionStream>()?, MotionStream::Flownet);
        assert!(serde_json::from_str::<MotionStream>(r#""r2d""#).is_err());

        // a single frame has no motion
        let single = ModelConfig {
            motion_stream: Some(MotionStream::Flownet),
            ..config(1)
        };
        assert!(single.validate().is_err());

        // gating without a stream
        let gating = ModelConfig {
            stream_gating: Some(StreamGating::Add),
            k_join_type: Some(JoinType::Max),
            k_join_pos: Some(FusionPos::Early),
            ..config(3)
        };
        assert!(gating.validate().is_err());
        Ok(())
    }

    #[test]
    fn channel_accounting() -> Result<()> {
        let cat = ModelConfig {
            k_join_type: Some(JoinType::Cat),
            k_join_pos: Some(FusionPos::Early),
            ..config(3)
        };
        cat.validate()?;
        assert_eq!(cat.route_channels(256), 768);
        assert_eq!(cat.output_in_channels(256), 256);
        assert!(!cat.temporal_blocks());

        let corr = ModelConfig {
            corr_pos: Some(FusionPos::Late),
            corr_d: 1,
            ..config(3)
        };
        corr.validate()?;
        assert_eq!(corr.route_channels(256), 256);
        assert_eq!(corr.output_in_channels(256), 256 + 2 * 9);
        assert!(corr.temporal_blocks());
        Ok(())
    }
}
