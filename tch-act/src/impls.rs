use crate::Activation;
use tch::{nn, Tensor};

impl nn::Module for Activation {
    fn forward(&self, xs: &Tensor) -> Tensor {
        use Activation::*;

        match *self {
            Linear => xs.shallow_clone(),
            Leaky => leaky(xs),
            Relu => xs.relu(),
            Logistic => xs.sigmoid(),
            Tanh => xs.tanh(),
            Mish => xs.mish(),
            Swish => swish(xs),
        }
    }
}

pub fn leaky(xs: &Tensor) -> Tensor {
    xs.clamp_min(0.0) + xs.clamp_max(0.0) * 0.1
}

pub fn swish(xs: &Tensor) -> Tensor {
    xs * xs.sigmoid()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::nn::Module;

    #[test]
    fn leaky_slope() {
        let xs = Tensor::of_slice(&[-2.0f32, 0.0, 3.0]);
        let ys = Activation::Leaky.forward(&xs);
        assert_eq!(Vec::<f32>::from(&ys), vec![-0.2, 0.0, 3.0]);
        assert_eq!(Vec::<f32>::from(&Activation::Relu.forward(&xs)), vec![0.0, 0.0, 3.0]);
    }
}
