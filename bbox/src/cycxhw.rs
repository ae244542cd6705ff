use super::{Rect, TLBR};
use crate::common::*;

/// Bounding box in CyCxHW format.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CyCxHW<T> {
    pub(crate) cy: T,
    pub(crate) cx: T,
    pub(crate) h: T,
    pub(crate) w: T,
}

impl<T> CyCxHW<T>
where
    T: Copy + Num + PartialOrd,
{
    /// A box of the given shape centred at the origin.
    pub fn try_from_hw_at_origin(h: T, w: T) -> Result<Self> {
        Self::try_from_cycxhw([T::zero(), T::zero(), h, w])
    }
}

impl<T> Rect for CyCxHW<T>
where
    T: Copy + Num + PartialOrd,
{
    type Type = T;

    fn t(&self) -> Self::Type {
        let two = T::one() + T::one();
        self.cy - self.h / two
    }

    fn l(&self) -> Self::Type {
        let two = T::one() + T::one();
        self.cx - self.w / two
    }

    fn b(&self) -> Self::Type {
        let two = T::one() + T::one();
        self.cy + self.h / two
    }

    fn r(&self) -> Self::Type {
        let two = T::one() + T::one();
        self.cx + self.w / two
    }

    fn cy(&self) -> Self::Type {
        self.cy
    }

    fn cx(&self) -> Self::Type {
        self.cx
    }

    fn h(&self) -> Self::Type {
        self.h
    }

    fn w(&self) -> Self::Type {
        self.w
    }

    fn try_from_tlbr(tlbr: [T; 4]) -> Result<Self> {
        let [t, l, b, r] = tlbr;
        ensure!(b >= t && r >= l, "b >= t and r >= l must hold");
        Ok(Self::from(&TLBR { t, l, b, r }))
    }

    fn try_from_tlhw(tlhw: [T; 4]) -> Result<Self> {
        let [t, l, h, w] = tlhw;
        let zero = T::zero();
        ensure!(
            h >= zero && w >= zero,
            "box height and width must be non-negative"
        );

        let two = T::one() + T::one();
        Ok(Self {
            cy: t + h / two,
            cx: l + w / two,
            h,
            w,
        })
    }

    fn try_from_cycxhw(cycxhw: [T; 4]) -> Result<Self> {
        let [cy, cx, h, w] = cycxhw;
        let zero = T::zero();
        ensure!(
            h >= zero && w >= zero,
            "box height and width must be non-negative"
        );
        Ok(Self { cy, cx, h, w })
    }
}

impl<T> From<&TLBR<T>> for CyCxHW<T>
where
    T: Copy + Num,
{
    fn from(from: &TLBR<T>) -> Self {
        let two = T::one() + T::one();
        let TLBR { t, l, b, r } = *from;
        let h = b - t;
        let w = r - l;
        Self {
            cy: t + h / two,
            cx: l + w / two,
            h,
            w,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RectFloat, RectNum};
    use approx::assert_abs_diff_eq;

    #[test]
    fn shape_iou_at_origin() -> Result<()> {
        let anchor = CyCxHW::try_from_hw_at_origin(10.0, 20.0)?;
        let gt = CyCxHW::try_from_hw_at_origin(10.0, 10.0)?;
        assert_abs_diff_eq!(anchor.iou_with(&gt, 0.0), 0.5);
        assert_eq!(TLBR::from(&gt).tlbr(), [-5.0, -5.0, 5.0, 5.0]);
        Ok(())
    }
}
