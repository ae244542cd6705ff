use crate::common::*;

/// Batch normalization over the channel axis of 2D or 3D feature maps.
#[derive(Debug, Clone)]
pub struct DarkBatchNormInit {
    pub cudnn_enabled: bool,
    pub eps: R64,
    pub momentum: R64,
    pub ws_init: nn::Init,
    pub bs_init: nn::Init,
}

#[derive(Debug)]
pub struct DarkBatchNorm {
    running_mean: Tensor,
    running_var: Tensor,
    ws: Tensor,
    bs: Tensor,
    cudnn_enabled: bool,
    eps: f64,
    momentum: f64,
}

impl Default for DarkBatchNormInit {
    fn default() -> Self {
        Self {
            cudnn_enabled: true,
            eps: r64(1e-5),
            momentum: r64(0.1),
            ws_init: nn::Init::Const(1.0),
            bs_init: nn::Init::Const(0.0),
        }
    }
}

impl DarkBatchNormInit {
    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>, out_dim: i64) -> DarkBatchNorm {
        let path = path.borrow();
        let Self {
            cudnn_enabled,
            eps,
            momentum,
            ws_init,
            bs_init,
        } = self;

        DarkBatchNorm {
            running_mean: path.zeros_no_train("running_mean", &[out_dim]),
            running_var: path.ones_no_train("running_var", &[out_dim]),
            ws: path.var("weight", &[out_dim], ws_init),
            bs: path.var("bias", &[out_dim], bs_init),
            cudnn_enabled,
            eps: eps.raw(),
            momentum: momentum.raw(),
        }
    }
}

impl nn::ModuleT for DarkBatchNorm {
    fn forward_t(&self, input: &Tensor, train: bool) -> Tensor {
        let Self {
            ref running_mean,
            ref running_var,
            ref ws,
            ref bs,
            momentum,
            eps,
            cudnn_enabled,
        } = *self;

        Tensor::batch_norm(
            input,
            Some(ws),
            Some(bs),
            Some(running_mean),
            Some(running_var),
            train,
            momentum,
            eps,
            cudnn_enabled,
        )
    }
}

impl DarkBatchNorm {
    pub fn has_nan(&self) -> bool {
        let Self {
            ws,
            bs,
            running_mean,
            running_var,
            ..
        } = self;

        [ws, bs, running_mean, running_var]
            .into_iter()
            .any(|tensor| bool::from(tensor.isnan().any()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn normalizes_5d_input() {
        let vs = nn::VarStore::new(Device::Cpu);
        let bn = DarkBatchNormInit::default().build(&vs.root() / "bn", 3);

        let xs = Tensor::randn(&[4, 3, 2, 5, 5], (Kind::Float, Device::Cpu)) * 4.0 + 2.0;
        let ys = bn.forward_t(&xs, true);
        assert_eq!(ys.size(), xs.size());
        assert_abs_diff_eq!(f64::from(ys.mean(Kind::Double)), 0.0, epsilon = 1e-4);
        assert!(!bn.has_nan());
    }
}
