use crate::{
    common::*,
    conv_nd::{Conv2DInit, ConvND},
};

#[derive(Debug, Clone)]
pub struct ConvGruInit {
    pub in_c: usize,
    pub hidden_c: usize,
    pub k: usize,
}

impl ConvGruInit {
    pub fn build<'p, P>(self, path: P) -> Result<ConvGru>
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        let Self { in_c, hidden_c, k } = self;
        ensure!(k % 2 == 1, "kernel size must be odd, but get {}", k);

        let gates = Conv2DInit::new(k).build(path / "gates", in_c + hidden_c, hidden_c * 2)?;
        let candidate = Conv2DInit::new(k).build(path / "candidate", in_c + hidden_c, hidden_c)?;

        Ok(ConvGru {
            hidden_c: hidden_c as i64,
            gates,
            candidate,
        })
    }
}

/// Convolutional GRU unrolled over the frame axis.
#[derive(Debug)]
pub struct ConvGru {
    hidden_c: i64,
    gates: ConvND,
    candidate: ConvND,
}

impl ConvGru {
    pub fn hidden_channels(&self) -> i64 {
        self.hidden_c
    }

    /// Maps `[B, K, C, H, W]` to the hidden states `[B, K, hidden, H, W]`.
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, k, _c, h, w) = xs.size5()?;
        let Self {
            hidden_c,
            ref gates,
            ref candidate,
        } = *self;

        let mut state = Tensor::zeros(&[b, hidden_c, h, w], (xs.kind(), xs.device()));
        let mut states = Vec::with_capacity(k as usize);

        for index in 0..k {
            let input = xs.select(1, index);
            let gate_values = Tensor::cat(&[&input, &state], 1)
                .apply(gates)
                .activation(Activation::Logistic);
            let reset = gate_values.narrow(1, 0, hidden_c);
            let update = gate_values.narrow(1, hidden_c, hidden_c);

            let proposal = Tensor::cat(&[&input, &(&reset * &state)], 1)
                .apply(candidate)
                .activation(Activation::Tanh);
            state = (-&update + 1.0) * &state + &update * proposal;
            states.push(state.shallow_clone());
        }

        Ok(Tensor::stack(&states, 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gru_keeps_frames() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let gru = ConvGruInit {
            in_c: 3,
            hidden_c: 5,
            k: 3,
        }
        .build(&vs.root() / "gru")?;

        let xs = Tensor::randn(&[2, 4, 3, 6, 6], (Kind::Float, Device::Cpu));
        let ys = gru.forward(&xs)?;
        assert_eq!(ys.size(), vec![2, 4, 5, 6, 6]);
        assert!(bool::from(ys.abs().le(1.0).all()));

        assert!(ConvGruInit {
            in_c: 3,
            hidden_c: 5,
            k: 2
        }
        .build(&vs.root() / "even")
        .is_err());
        Ok(())
    }
}
