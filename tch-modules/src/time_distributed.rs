use crate::common::*;

/// Runs a per-frame function over a `[B, K, ...]` tensor by folding the
/// frame axis into the batch.
pub fn time_distributed<F>(xs: &Tensor, f: F) -> Result<Tensor>
where
    F: FnOnce(&Tensor) -> Tensor,
{
    let size = xs.size();
    ensure!(
        size.len() >= 3,
        "expect a [batch, frames, ...] tensor, but get shape {:?}",
        size
    );
    let (b, k) = (size[0], size[1]);

    let folded: Vec<i64> = [b * k].into_iter().chain(size[2..].iter().copied()).collect();
    let ys = f(&xs.reshape(&folded));

    let ys_size = ys.size();
    ensure!(
        ys_size.first() == Some(&(b * k)),
        "the wrapped function must keep the folded batch size"
    );
    let unfolded: Vec<i64> = [b, k].into_iter().chain(ys_size[1..].iter().copied()).collect();
    Ok(ys.reshape(&unfolded))
}

/// A module applied frame by frame when `enabled`, otherwise directly.
#[derive(Debug)]
pub struct TimeDistributed<M> {
    pub inner: M,
    pub enabled: bool,
}

impl<M> TimeDistributed<M>
where
    M: ModuleT,
{
    pub fn new(inner: M, enabled: bool) -> Self {
        Self { inner, enabled }
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        if self.enabled {
            time_distributed(xs, |xs| self.inner.forward_t(xs, train))
        } else {
            Ok(self.inner.forward_t(xs, train))
        }
    }
}
