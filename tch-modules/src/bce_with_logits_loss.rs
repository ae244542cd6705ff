use crate::common::*;

#[derive(Debug)]
pub struct BceWithLogitsLossInit {
    pub pos_weight: Option<Tensor>,
    pub reduction: Reduction,
}

impl BceWithLogitsLossInit {
    pub fn default(reduction: Reduction) -> Self {
        Self {
            pos_weight: None,
            reduction,
        }
    }

    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>) -> BceWithLogitsLoss {
        let Self {
            pos_weight,
            reduction,
        } = self;

        let path = path.borrow();
        let pos_weight = pos_weight.map(|from| {
            tch::no_grad(|| {
                let mut weight = path.zeros_no_train("pos_weight", &from.size());
                weight.copy_(&from);
                weight
            })
        });

        BceWithLogitsLoss {
            pos_weight,
            reduction,
        }
    }
}

/// Sigmoid binary cross entropy with an optional per-element weight mask.
#[derive(Debug)]
pub struct BceWithLogitsLoss {
    pos_weight: Option<Tensor>,
    reduction: Reduction,
}

impl BceWithLogitsLoss {
    pub fn forward(&self, input: &Tensor, target: &Tensor, weight: Option<&Tensor>) -> Tensor {
        debug_assert_eq!(
            input.size(),
            target.size(),
            "input and target tensors must have equal shape"
        );

        // a mean over nothing is zero rather than nan
        if input.numel() == 0 && self.reduction == Reduction::Mean {
            return Tensor::zeros(&[], (Kind::Float, input.device()));
        }

        input.binary_cross_entropy_with_logits(
            target,
            weight,
            self.pos_weight.as_ref(),
            self.reduction,
        )
    }
}
