//! Draws predictions and ground truth onto the input images.

use crate::{
    common::*,
    evaluate::pixel_labels,
    predictions::{source_name, Predictions},
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use vid_dataset::{load_image, DetectionDataset};

const GT_COLOR: [u8; 3] = [0, 255, 0];
const STROKE: i64 = 2;

/// A random color per class, fixed by `seed`.
pub fn class_colors(num_classes: usize, seed: u64) -> Vec<[u8; 3]> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..num_classes).map(|_| rng.gen()).collect()
}

/// Draws the first `num_samples` samples into `dir`. Video frames go to a
/// sub-directory per video.
pub async fn visualize(
    dir: PathBuf,
    dataset: Arc<dyn DetectionDataset>,
    num_samples: usize,
    by_video: bool,
    predictions: Arc<Predictions>,
    display_gt: bool,
    colors: Arc<Vec<[u8; 3]>>,
) -> Result<()> {
    tokio::fs::create_dir_all(&dir).await?;
    let num_samples = num_samples.min(dataset.len());

    stream::iter((0..num_samples).map(Fallible::Ok))
        .try_par_map_unordered(None, move |index| {
            let dir = dir.clone();
            let dataset = dataset.clone();
            let predictions = predictions.clone();
            let colors = colors.clone();

            move || -> Result<_> {
                let image_path = dataset.image_path(index)?;
                let file_name = image_path
                    .file_name()
                    .ok_or_else(|| format_err!("invalid image path '{}'", image_path.display()))?;
                let output_dir = if by_video {
                    dir.join(source_name(image_path, true)?)
                } else {
                    dir
                };
                fs::create_dir_all(&output_dir)?;

                let mut image = load_image(image_path)?;
                if display_gt {
                    for label in pixel_labels(&*dataset, index)? {
                        draw_rect_(&mut image, &label.rect, STROKE, &GT_COLOR)?;
                    }
                }

                let (_, height, width) = image.size3()?;
                let size = HW::try_from_hw([height as usize, width as usize])?;
                let rows = predictions
                    .get(dataset.sample_id(index)?)
                    .map(|rows| rows.as_slice())
                    .unwrap_or(&[]);
                for prediction in rows {
                    let color = usize::try_from(prediction.class)
                        .ok()
                        .and_then(|class| colors.get(class))
                        .unwrap_or(&GT_COLOR);
                    draw_rect_(&mut image, &prediction.pixel_rect(&size)?, STROKE, color)?;
                }

                let output = output_dir.join(file_name);
                vision::image::save(&image, &output)
                    .with_context(|| format!("failed to save '{}'", output.display()))?;
                Ok(())
            }
        })
        .try_for_each(|()| future::ready(Ok(())))
        .await?;

    Ok(())
}

/// Fills `[top, bottom) x [left, right)` of a `[C, H, W]` uint8 image.
fn fill_rect_(image: &mut Tensor, t: i64, l: i64, b: i64, r: i64, color: &[u8; 3]) -> Result<()> {
    if t >= b || l >= r {
        return Ok(());
    }
    let color = Tensor::of_slice(color).to_device(image.device());
    let mut rect = image.i((.., t..b, l..r));
    let expanded_color = color.f_view([3, 1, 1])?.f_expand_as(&rect)?;
    rect.f_copy_(&expanded_color)?;
    Ok(())
}

/// Draws the outline of a box with `stroke` pixel wide edges, clamped into
/// the image.
pub fn draw_rect_(image: &mut Tensor, rect: &TLBR<f64>, stroke: i64, color: &[u8; 3]) -> Result<()> {
    let (channels, height, width) = image.size3()?;
    ensure!(channels == 3, "expect a 3 channel image");

    let [x1, y1, x2, y2] = rect.xyxy();
    let half = stroke / 2;
    let clamp_h = |value: i64| value.max(0).min(height);
    let clamp_w = |value: i64| value.max(0).min(width);

    let (outer_t, outer_l) = (y1.round() as i64 - half, x1.round() as i64 - half);
    let (outer_b, outer_r) = (y2.round() as i64 + half + 1, x2.round() as i64 + half + 1);
    let (inner_t, inner_l) = (outer_t + stroke, outer_l + stroke);
    let (inner_b, inner_r) = (outer_b - stroke, outer_r - stroke);

    let (outer_t, outer_b, inner_t, inner_b) = (
        clamp_h(outer_t),
        clamp_h(outer_b),
        clamp_h(inner_t),
        clamp_h(inner_b),
    );
    let (outer_l, outer_r, inner_l, inner_r) = (
        clamp_w(outer_l),
        clamp_w(outer_r),
        clamp_w(inner_l),
        clamp_w(inner_r),
    );

    tch::no_grad(|| -> Result<_> {
        fill_rect_(image, outer_t, outer_l, inner_t, outer_r, color)?;
        fill_rect_(image, outer_t, outer_l, outer_b, inner_l, color)?;
        fill_rect_(image, inner_b, outer_l, outer_b, outer_r, color)?;
        fill_rect_(image, outer_t, inner_r, outer_b, outer_r, color)?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outline_leaves_the_inside_untouched() -> Result<()> {
        let mut image = Tensor::zeros(&[3, 20, 20], (Kind::Uint8, Device::Cpu));
        let rect = TLBR::from_xyxy([5.0, 5.0, 14.0, 14.0])?;
        draw_rect_(&mut image, &rect, 2, &[255, 0, 0])?;

        let red = image.i((0, .., ..));
        assert_eq!(red.int64_value(&[5, 10]), 255);
        assert_eq!(red.int64_value(&[10, 14]), 255);
        assert_eq!(red.int64_value(&[10, 10]), 0);
        assert_eq!(red.int64_value(&[0, 0]), 0);
        assert_eq!(image.i((1, .., ..)).sum(Kind::Int64).int64_value(&[]), 0);
        Ok(())
    }

    #[test]
    fn boxes_past_the_border_are_clamped() -> Result<()> {
        let mut image = Tensor::zeros(&[3, 8, 8], (Kind::Uint8, Device::Cpu));
        let rect = TLBR::from_xyxy([-5.0, -5.0, 20.0, 20.0])?;
        draw_rect_(&mut image, &rect, 2, &GT_COLOR)?;
        assert_eq!(image.sum(Kind::Int64).int64_value(&[]), 0);
        Ok(())
    }

    #[test]
    fn colors_are_reproducible() {
        assert_eq!(class_colors(5, 7), class_colors(5, 7));
        assert_eq!(class_colors(5, 7).len(), 5);
    }
}
