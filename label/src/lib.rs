//! Object labels: a box, a class and optional tracking metadata.

use anyhow::{ensure, Result};
use bbox::{Rect, Transform, TLBR};
use num_traits::{Num, ToPrimitive};
use std::ops::Mul;

/// A labeled box in pixel coordinates with a class index.
pub type ObjectLabel = Label<TLBR<f64>, usize>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label<R, C>
where
    R: Rect,
{
    pub rect: R,
    pub class: C,
    /// Track id linking the same object across video frames.
    pub track: Option<i64>,
    /// Excluded from evaluation when set.
    pub difficult: bool,
}

impl<R, C> Label<R, C>
where
    R: Rect,
{
    pub fn new(rect: R, class: C) -> Self {
        Self {
            rect,
            class,
            track: None,
            difficult: false,
        }
    }

    pub fn with_track(self, track: Option<i64>) -> Self {
        Self { track, ..self }
    }

    pub fn with_difficult(self, difficult: bool) -> Self {
        Self { difficult, ..self }
    }

    pub fn map_class<D, F>(self, f: F) -> Label<R, D>
    where
        F: FnOnce(C) -> D,
    {
        let Self {
            rect,
            class,
            track,
            difficult,
        } = self;
        Label {
            rect,
            class: f(class),
            track,
            difficult,
        }
    }
}

impl<T, C> Label<TLBR<T>, C>
where
    T: Copy + Num + PartialOrd + ToPrimitive,
    C: Copy + ToPrimitive,
{
    /// Packs the label into `[xmin, ymin, xmax, ymax, cls, trk]`, where a
    /// missing track is `-1`.
    pub fn to_row(&self) -> Option<[f64; 6]> {
        let [x1, y1, x2, y2] = self.rect.xyxy();
        Some([
            x1.to_f64()?,
            y1.to_f64()?,
            x2.to_f64()?,
            y2.to_f64()?,
            self.class.to_f64()?,
            self.track.unwrap_or(-1) as f64,
        ])
    }
}

impl ObjectLabel {
    /// Unpacks a `[xmin, ymin, xmax, ymax, cls, trk]` row.
    pub fn from_row(row: [f64; 6]) -> Result<Self> {
        let [x1, y1, x2, y2, cls, trk] = row;
        ensure!(cls >= 0.0, "class index must be non-negative, got {}", cls);
        let rect = TLBR::from_xyxy([x1, y1, x2, y2])?;
        let track = (trk >= 0.0).then(|| trk as i64);
        Ok(Label::new(rect, cls as usize).with_track(track))
    }
}

impl<R, C> Rect for Label<R, C>
where
    R: Rect,
    C: Default,
{
    type Type = R::Type;

    fn t(&self) -> Self::Type {
        self.rect.t()
    }

    fn l(&self) -> Self::Type {
        self.rect.l()
    }

    fn b(&self) -> Self::Type {
        self.rect.b()
    }

    fn r(&self) -> Self::Type {
        self.rect.r()
    }

    fn cy(&self) -> Self::Type {
        self.rect.cy()
    }

    fn cx(&self) -> Self::Type {
        self.rect.cx()
    }

    fn h(&self) -> Self::Type {
        self.rect.h()
    }

    fn w(&self) -> Self::Type {
        self.rect.w()
    }

    fn try_from_tlbr(tlbr: [Self::Type; 4]) -> Result<Self> {
        Ok(Self::new(R::try_from_tlbr(tlbr)?, C::default()))
    }

    fn try_from_tlhw(tlhw: [Self::Type; 4]) -> Result<Self> {
        Ok(Self::new(R::try_from_tlhw(tlhw)?, C::default()))
    }

    fn try_from_cycxhw(cycxhw: [Self::Type; 4]) -> Result<Self> {
        Ok(Self::new(R::try_from_cycxhw(cycxhw)?, C::default()))
    }
}

impl<'a, T, C> Mul<&'a Label<TLBR<T>, C>> for &'a Transform<T>
where
    T: Copy + Num + PartialOrd,
    C: Copy,
{
    type Output = Label<TLBR<T>, C>;

    fn mul(self, rhs: &'a Label<TLBR<T>, C>) -> Self::Output {
        Label {
            rect: self * &rhs.rect,
            class: rhs.class,
            track: rhs.track,
            difficult: rhs.difficult,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bbox::RectFloat;

    #[test]
    fn row_conversion() -> Result<()> {
        let label = ObjectLabel::from_row([1.0, 2.0, 3.0, 4.0, 5.0, -1.0])?;
        assert_eq!(label.class, 5);
        assert_eq!(label.track, None);
        assert_eq!(label.to_row(), Some([1.0, 2.0, 3.0, 4.0, 5.0, -1.0]));

        let tracked = label.with_track(Some(7));
        assert_eq!(tracked.to_row().map(|row| row[5]), Some(7.0));
        assert!(ObjectLabel::from_row([3.0, 2.0, 1.0, 4.0, 5.0, -1.0]).is_err());
        Ok(())
    }

    #[test]
    fn transform_keeps_metadata() -> Result<()> {
        let label = ObjectLabel::from_row([0.0, 0.0, 10.0, 10.0, 1.0, 3.0])?.with_difficult(true);
        let out = &Transform::hflip(20.0) * &label;
        assert_eq!(out.rect.xyxy(), [10.0, 0.0, 20.0, 10.0]);
        assert_eq!(out.track, Some(3));
        assert!(out.difficult);
        assert!(out.pixel_iou_with(&label) < 0.1);
        Ok(())
    }
}
