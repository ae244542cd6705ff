use crate::common::*;

/// Stops the gradients of the trainable variables under the top level
/// `scope` and returns how many were frozen. The optimizer skips variables
/// without gradients, while running statistics of batch norms keep updating.
pub fn freeze_scope(vs: &nn::VarStore, scope: &str) -> usize {
    let prefix = format!("{}.", scope);
    vs.variables()
        .into_iter()
        .filter(|(name, var)| name.starts_with(&prefix) && var.requires_grad())
        .map(|(_, var)| {
            let _ = var.set_requires_grad(false);
        })
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use yolo_vid::{ModelConfig, YoloVidInit, BACKBONE_SCOPE};

    #[test]
    fn frozen_backbone_survives_a_step() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let mut model = YoloVidInit {
            config: ModelConfig {
                k: 1,
                channels: vec![16, 8, 4],
                backbone_channels: 2,
                ..Default::default()
            },
            classes: vec!["car".into(), "dog".into()],
        }
        .build(&vs.root())?;

        let trainable: HashMap<String, Tensor> = vs
            .variables()
            .into_iter()
            .filter(|(_, var)| var.requires_grad())
            .map(|(name, var)| (name, var.copy()))
            .collect();
        let num_backbone = trainable
            .keys()
            .filter(|name| name.starts_with("backbone."))
            .count();
        assert!(num_backbone > 0);
        assert_eq!(freeze_scope(&vs, BACKBONE_SCOPE), num_backbone);

        let mut optimizer = nn::Sgd::default().build(&vs, 0.1)?;
        let xs = Tensor::rand(&[2, 3, 64, 64], (tch::Kind::Float, Device::Cpu));
        let output = model.forward_train(&xs)?;
        let loss = output.class_pred.sum(tch::Kind::Float) + output.bbox.sum(tch::Kind::Float);
        optimizer.backward_step(&loss);

        let variables = vs.variables();
        let changed = |name: &str| -> bool {
            let diff = (&variables[name] - &trainable[name]).abs().max();
            f64::from(&diff) > 0.0
        };
        trainable
            .keys()
            .filter(|name| name.starts_with("backbone."))
            .for_each(|name| assert!(!changed(name), "{} is updated", name));
        assert!(trainable
            .keys()
            .filter(|name| !name.starts_with("backbone."))
            .any(|name| changed(name)));
        Ok(())
    }
}
