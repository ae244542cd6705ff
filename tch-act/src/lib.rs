//! Activation functions used by the detector layers.

#[cfg(feature = "tch")]
pub use impls::*;
#[cfg(feature = "tch")]
mod impls;

#[cfg(feature = "tch")]
pub use r#trait::*;
#[cfg(feature = "tch")]
mod r#trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Activation {
    Linear,
    /// Leaky ReLU with a 0.1 negative slope.
    Leaky,
    Relu,
    Logistic,
    Tanh,
    Mish,
    Swish,
}

impl Default for Activation {
    fn default() -> Self {
        Self::Leaky
    }
}
