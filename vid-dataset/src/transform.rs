//! Image loading and the geometric transform applied to a sample.

use crate::{
    common::*,
    dataset::{DetectionDataset, LabelUnit},
};
use bbox::Transform;

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Loads an image as a `[3, H, W]` uint8 tensor on CPU.
pub fn load_image(path: impl AsRef<Path>) -> Result<Tensor> {
    let path = path.as_ref();
    let image = vision::image::load(path)
        .with_context(|| format!("failed to load image '{}'", path.display()))?;
    let (channels, _, _) = image.size3()?;
    ensure!(
        channels == 3,
        "expect 3 channels in '{}', but get {}",
        path.display(),
        channels
    );
    Ok(image)
}

/// Converts a uint8 `[3, H, W]` image to float, scaled to `[0, 1]` and
/// normalized with the ImageNet mean and deviation.
pub fn normalize_image(image: &Tensor) -> Tensor {
    let mean = Tensor::of_slice(&IMAGENET_MEAN).view([3, 1, 1]);
    let std = Tensor::of_slice(&IMAGENET_STD).view([3, 1, 1]);
    (image.to_kind(Kind::Float) / 255.0 - mean) / std
}

/// Inverse of [normalize_image], back to a uint8 image.
pub fn denormalize_image(image: &Tensor) -> Tensor {
    let mean = Tensor::of_slice(&IMAGENET_MEAN).view([3, 1, 1]).to_device(image.device());
    let std = Tensor::of_slice(&IMAGENET_STD).view([3, 1, 1]).to_device(image.device());
    ((image * std + mean) * 255.0)
        .clamp(0.0, 255.0)
        .to_kind(Kind::Uint8)
}

/// The transform from label coordinates to a square canvas of `size`.
pub fn label_transform(
    unit: LabelUnit,
    orig_size: &HW<usize>,
    size: usize,
    flip: bool,
) -> Result<Transform<f64>> {
    let orig_size: HW<f64> = orig_size
        .clone()
        .try_cast()
        .ok_or_else(|| format_err!("invalid image size"))?;
    let target = HW::try_from_hw([size as f64, size as f64])?;

    let to_pixel = match unit {
        LabelUnit::Pixel => Transform::identity(),
        LabelUnit::Normalized => Transform::from_sizes_exact(&HW::try_from_hw([1.0, 1.0])?, &orig_size),
    };
    let resize = Transform::from_sizes_exact(&orig_size, &target);
    let transform = &resize * &to_pixel;

    Ok(if flip {
        &Transform::hflip(size as f64) * &transform
    } else {
        transform
    })
}

/// The tensors and labels of one sample, resized to a square canvas.
#[derive(Debug)]
pub struct LoadedSample {
    /// `[K, 3, S, S]` normalized frames.
    pub frames: Tensor,
    /// Labels in canvas pixel coordinates.
    pub labels: Vec<ObjectLabel>,
    pub orig_size: HW<usize>,
    pub flipped: bool,
}

/// Loads, resizes and normalizes the frames of a sample and moves its labels
/// onto the `size` × `size` canvas.
pub fn load_sample(
    dataset: &dyn DetectionDataset,
    index: usize,
    size: usize,
    flip: bool,
) -> Result<LoadedSample> {
    let paths = dataset.window_paths(index)?;
    ensure!(!paths.is_empty(), "sample {} has no frames", index);

    let (frames, orig_size) = tch::no_grad(|| -> Result<_> {
        let mut orig_size = None;
        let frames: Vec<_> = paths
            .iter()
            .map(|path| -> Result<_> {
                let image = load_image(path)?;
                let (_, height, width) = image.size3()?;
                if orig_size.is_none() {
                    orig_size = Some(HW::try_from_hw([height as usize, width as usize])?);
                }
                let image = vision::image::resize(&image, size as i64, size as i64)?;
                let image = normalize_image(&image);
                Ok(if flip { image.flip(&[2]) } else { image })
            })
            .try_collect()?;
        let orig_size = orig_size.ok_or_else(|| format_err!("sample {} has no frames", index))?;
        Ok((Tensor::stack(&frames, 0), orig_size))
    })?;

    let transform = label_transform(dataset.label_unit(index), &orig_size, size, flip)?;
    let canvas = HW::try_from_hw([size as f64, size as f64])?;
    let labels: Vec<_> = dataset
        .labels(index)?
        .iter()
        .map(|label| {
            let mut label = &transform * label;
            label.rect = label.rect.clip(&canvas);
            label
        })
        .filter(|label| label.rect.h() > 0.0 && label.rect.w() > 0.0)
        .collect();

    Ok(LoadedSample {
        frames,
        labels,
        orig_size,
        flipped: flip,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn normalized_labels_scale_to_canvas() -> Result<()> {
        let orig = HW::try_from_hw([200, 400])?;
        let transform = label_transform(LabelUnit::Normalized, &orig, 100, false)?;
        let rect = &transform * &TLBR::from_xyxy([0.5, 0.25, 1.0, 0.75])?;
        assert_eq!(rect.xyxy(), [50.0, 25.0, 100.0, 75.0]);

        let transform = label_transform(LabelUnit::Pixel, &orig, 100, true)?;
        let rect = &transform * &TLBR::from_xyxy([0.0, 0.0, 100.0, 100.0])?;
        let [x1, y1, x2, y2] = rect.xyxy();
        assert_abs_diff_eq!(x1, 75.0);
        assert_abs_diff_eq!(y1, 0.0);
        assert_abs_diff_eq!(x2, 100.0);
        assert_abs_diff_eq!(y2, 50.0);
        Ok(())
    }

    #[test]
    fn normalize_round_trip() {
        let image = Tensor::of_slice(&[0u8, 128, 255]).view([3, 1, 1]);
        let restored = denormalize_image(&normalize_image(&image));
        let diff = (restored.to_kind(Kind::Int64) - image.to_kind(Kind::Int64))
            .abs()
            .max()
            .int64_value(&[]);
        assert!(diff <= 1);
    }
}
