use super::{Rect, TLBR};
use crate::{common::*, HW};

/// Axis-aligned affine transform `y' = sy * y + ty`, `x' = sx * x + tx`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Transform<T> {
    pub sy: T,
    pub sx: T,
    pub ty: T,
    pub tx: T,
}

impl<T> Transform<T>
where
    T: Copy + Num + PartialOrd,
{
    pub fn identity() -> Self {
        Self {
            sy: T::one(),
            sx: T::one(),
            ty: T::zero(),
            tx: T::zero(),
        }
    }

    pub fn from_rects<R>(src: &R, tgt: &R) -> Self
    where
        R: Rect<Type = T>,
    {
        let sy = tgt.h() / src.h();
        let sx = tgt.w() / src.w();
        let ty = tgt.t() - src.t() * sy;
        let tx = tgt.l() - src.l() * sx;

        Self { sy, sx, ty, tx }
    }

    /// Stretches the source canvas onto the target canvas.
    pub fn from_sizes_exact(src_size: &HW<T>, tgt_size: &HW<T>) -> Self {
        let zero = T::zero();
        let src = TLBR {
            t: zero,
            l: zero,
            b: src_size.h(),
            r: src_size.w(),
        };
        let tgt = TLBR {
            t: zero,
            l: zero,
            b: tgt_size.h(),
            r: tgt_size.w(),
        };
        Self::from_rects(&src, &tgt)
    }
}

impl<T> Transform<T>
where
    T: Copy + Num + Neg<Output = T>,
{
    /// Mirrors the x axis of a canvas of the given width.
    pub fn hflip(width: T) -> Self {
        Self {
            sy: T::one(),
            sx: -T::one(),
            ty: T::zero(),
            tx: width,
        }
    }

    pub fn inverse(&self) -> Self {
        let sy = T::one() / self.sy;
        let sx = T::one() / self.sx;
        let ty = -self.ty / self.sy;
        let tx = -self.tx / self.sx;

        Self { sy, sx, ty, tx }
    }
}

impl<T> Mul<&TLBR<T>> for &Transform<T>
where
    T: Copy + Num + PartialOrd,
{
    type Output = TLBR<T>;

    fn mul(self, rhs: &TLBR<T>) -> Self::Output {
        rhs.transform(self)
    }
}

impl<T> Mul<&Transform<T>> for &Transform<T>
where
    T: Copy + Num,
{
    type Output = Transform<T>;

    fn mul(self, rhs: &Transform<T>) -> Self::Output {
        Transform {
            sx: self.sx * rhs.sx,
            sy: self.sy * rhs.sy,
            tx: rhs.tx * self.sx + self.tx,
            ty: rhs.ty * self.sy + self.ty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transform_inverse() {
        let orig = Transform {
            sx: 2.0,
            sy: 2.0,
            tx: 1.0,
            ty: 1.0,
        };
        assert_eq!(orig.inverse().inverse(), orig);
        assert_eq!(&orig * &orig.inverse(), Transform::identity());
    }

    #[test]
    fn resize_exact() -> Result<()> {
        let transform = Transform::from_sizes_exact(
            &HW::try_from_hw([80.0, 80.0])?,
            &HW::try_from_hw([20.0, 40.0])?,
        );
        let expect = Transform {
            sx: 0.5,
            sy: 0.25,
            tx: 0.0,
            ty: 0.0,
        };
        assert_eq!(transform, expect);
        Ok(())
    }

    #[test]
    fn resize_then_flip() -> Result<()> {
        let resize = Transform::from_sizes_exact(
            &HW::try_from_hw([100.0, 200.0])?,
            &HW::try_from_hw([50.0, 50.0])?,
        );
        let flip = Transform::hflip(50.0);
        let bbox = TLBR::from_xyxy([0.0, 0.0, 40.0, 20.0])?;
        let out = &(&flip * &resize) * &bbox;
        assert_eq!(out.xyxy(), [40.0, 0.0, 50.0, 10.0]);
        Ok(())
    }
}
