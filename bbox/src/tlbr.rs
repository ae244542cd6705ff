use super::{CyCxHW, Rect};
use crate::{common::*, Transform, HW};

/// Bounding box in TLBR format.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TLBR<T> {
    pub(crate) t: T,
    pub(crate) l: T,
    pub(crate) b: T,
    pub(crate) r: T,
}

impl<T> TLBR<T> {
    pub fn try_cast<V>(self) -> Option<TLBR<V>>
    where
        T: ToPrimitive,
        V: NumCast,
    {
        Some(TLBR {
            t: V::from(self.t)?,
            l: V::from(self.l)?,
            b: V::from(self.b)?,
            r: V::from(self.r)?,
        })
    }
}

impl<T> TLBR<T>
where
    T: Copy + Num + PartialOrd,
{
    /// Builds a box from `[x1, y1, x2, y2]` corners.
    pub fn from_xyxy(xyxy: [T; 4]) -> Result<Self> {
        let [x1, y1, x2, y2] = xyxy;
        Self::try_from_tlbr([y1, x1, y2, x2])
    }

    /// Corners in `[x1, y1, x2, y2]` order.
    pub fn xyxy(&self) -> [T; 4] {
        [self.l, self.t, self.r, self.b]
    }

    /// Applies an affine transform. Edges are re-sorted so that a negative
    /// scale (a flip) still yields a valid box.
    pub fn transform(&self, transform: &Transform<T>) -> Self {
        let t = self.t * transform.sy + transform.ty;
        let b = self.b * transform.sy + transform.ty;
        let l = self.l * transform.sx + transform.tx;
        let r = self.r * transform.sx + transform.tx;
        let (t, b) = if t <= b { (t, b) } else { (b, t) };
        let (l, r) = if l <= r { (l, r) } else { (r, l) };
        TLBR { t, l, b, r }
    }

    /// Clamps the box into the `[0, w] x [0, h]` canvas.
    pub fn clip(&self, size: &HW<T>) -> Self {
        let clamp = |value: T, max: T| {
            if value < T::zero() {
                T::zero()
            } else if value > max {
                max
            } else {
                value
            }
        };
        let (h, w) = (size.h(), size.w());
        TLBR {
            t: clamp(self.t, h),
            l: clamp(self.l, w),
            b: clamp(self.b, h),
            r: clamp(self.r, w),
        }
    }
}

impl<T> Rect for TLBR<T>
where
    T: Copy + Num + PartialOrd,
{
    type Type = T;

    fn t(&self) -> Self::Type {
        self.t
    }

    fn l(&self) -> Self::Type {
        self.l
    }

    fn b(&self) -> Self::Type {
        self.b
    }

    fn r(&self) -> Self::Type {
        self.r
    }

    fn cy(&self) -> Self::Type {
        let two = T::one() + T::one();
        (self.t + self.b) / two
    }

    fn cx(&self) -> Self::Type {
        let two = T::one() + T::one();
        (self.l + self.r) / two
    }

    fn h(&self) -> Self::Type {
        self.b - self.t
    }

    fn w(&self) -> Self::Type {
        self.r - self.l
    }

    fn try_from_cycxhw(cycxhw: [Self::Type; 4]) -> Result<Self> {
        let [cy, cx, h, w] = cycxhw;
        let zero = T::zero();
        ensure!(h >= zero && w >= zero, "h and w must be non-negative");

        let two = T::one() + T::one();
        Ok(Self {
            t: cy - h / two,
            l: cx - w / two,
            b: cy + h / two,
            r: cx + w / two,
        })
    }

    fn try_from_tlbr(tlbr: [Self::Type; 4]) -> Result<Self> {
        let [t, l, b, r] = tlbr;
        ensure!(b >= t && r >= l, "b >= t and r >= l must hold");
        Ok(Self { t, l, b, r })
    }

    fn try_from_tlhw(tlhw: [Self::Type; 4]) -> Result<Self> {
        let [t, l, h, w] = tlhw;
        Self::try_from_tlbr([t, l, t + h, l + w])
    }
}

impl<T> From<&CyCxHW<T>> for TLBR<T>
where
    T: Copy + Num,
{
    fn from(from: &CyCxHW<T>) -> Self {
        let two = T::one() + T::one();
        let CyCxHW { cy, cx, h, w } = *from;
        Self {
            t: cy - h / two,
            l: cx - w / two,
            b: cy + h / two,
            r: cx + w / two,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RectNum;

    #[test]
    fn xyxy_is_x_first() -> Result<()> {
        let bbox = TLBR::from_xyxy([1.0, 2.0, 5.0, 8.0])?;
        assert_eq!(bbox.tlbr(), [2.0, 1.0, 8.0, 5.0]);
        assert_eq!(bbox.xyxy(), [1.0, 2.0, 5.0, 8.0]);
        assert!(TLBR::from_xyxy([5.0, 2.0, 1.0, 8.0]).is_err());
        assert!(TLBR::from_xyxy([f64::NAN, 2.0, 1.0, 8.0]).is_err());
        Ok(())
    }

    #[test]
    fn clip_to_canvas() -> Result<()> {
        let bbox = TLBR::from_xyxy([-3.0, 2.0, 50.0, 8.0])?;
        let size = HW::try_from_hw([6.0, 40.0])?;
        assert_eq!(bbox.clip(&size).xyxy(), [0.0, 2.0, 40.0, 6.0]);
        Ok(())
    }

    #[test]
    fn flip_keeps_box_valid() -> Result<()> {
        let bbox = TLBR::from_xyxy([1.0, 2.0, 3.0, 4.0])?;
        let flipped = bbox.transform(&Transform::hflip(10.0));
        assert_eq!(flipped.xyxy(), [7.0, 2.0, 9.0, 4.0]);
        Ok(())
    }
}
