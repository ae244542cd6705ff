use crate::common::*;

/// Cost volume between the centre frame of a window and every other frame.
///
/// For displacements `(dy, dx)` in `[-d, d]^2` it computes the channel mean of
/// `centre[y, x] * other[y + dy, x + dx]`, with zeros outside the map. The
/// volumes of all non-centre frames are appended to the centre-frame
/// features, mapping `[B, K, C, H, W]` to `[B, C + (K - 1) * (2d + 1)^2, H, W]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Correlation {
    pub max_displacement: usize,
    pub frames: usize,
}

impl Correlation {
    pub fn new(max_displacement: usize, frames: usize) -> Self {
        Self {
            max_displacement,
            frames,
        }
    }

    /// Index of the reference frame in a window.
    pub fn centre_index(&self) -> usize {
        self.frames / 2
    }

    pub fn out_channels(&self, in_channels: usize) -> usize {
        let side = 2 * self.max_displacement + 1;
        in_channels + (self.frames.saturating_sub(1)) * side * side
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (_b, k, c, h, w) = xs.size5()?;
        ensure!(
            k == self.frames as i64,
            "expect {} frames, but get {}",
            self.frames,
            k
        );

        let d = self.max_displacement as i64;
        let centre_index = self.centre_index() as i64;
        let centre = xs.select(1, centre_index);

        let mut features = vec![centre.shallow_clone()];
        for index in (0..k).filter(|&index| index != centre_index) {
            let padded = xs.select(1, index).constant_pad_nd(&[d, d, d, d]);

            for dy in -d..=d {
                for dx in -d..=d {
                    let shifted = padded.narrow(2, d + dy, h).narrow(3, d + dx, w);
                    let cost = (&centre * &shifted).sum_dim_intlist(&[1], true, centre.kind())
                        / c as f64;
                    features.push(cost);
                }
            }
        }

        Ok(Tensor::cat(&features, 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn correlation_shape_and_values() -> Result<()> {
        let corr = Correlation::new(1, 3);
        assert_eq!(corr.out_channels(4), 4 + 2 * 9);

        let xs = Tensor::ones(&[2, 3, 4, 5, 5], (Kind::Float, Device::Cpu));
        let ys = corr.forward(&xs)?;
        assert_eq!(ys.size(), vec![2, 22, 5, 5]);

        // zero displacement of the first non-centre frame in the interior
        let zero_shift = ys.i((0i64, 8i64, 2i64, 2i64));
        assert_abs_diff_eq!(f64::from(&zero_shift), 1.0);
        // a corner sees the zero padding for an up-left shift
        let corner = ys.i((0i64, 4i64, 0i64, 0i64));
        assert_abs_diff_eq!(f64::from(&corner), 0.0);

        let too_short = Tensor::ones(&[1, 2, 4, 5, 5], (Kind::Float, Device::Cpu));
        assert!(corr.forward(&too_short).is_err());
        Ok(())
    }
}
