//! Frame subsampling and temporal windows over the frames of one video.

use crate::common::*;

/// Frame selection and window parameters shared by the video datasets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoOptions {
    /// A ratio below 1 keeps every `1/frames`-th frame, a value above 1
    /// keeps about `frames` frames per video, 1 keeps everything.
    #[serde(default = "default_frames")]
    pub frames: f64,
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    #[serde(default = "default_window_step")]
    pub window_step: usize,
    /// Produce one sample per clip holding all of its frames.
    #[serde(default)]
    pub videos: bool,
}

fn default_frames() -> f64 {
    1.0
}

fn default_window_size() -> usize {
    1
}

fn default_window_step() -> usize {
    1
}

impl Default for VideoOptions {
    fn default() -> Self {
        Self {
            frames: default_frames(),
            window_size: default_window_size(),
            window_step: default_window_step(),
            videos: false,
        }
    }
}

impl VideoOptions {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.frames.is_finite() && self.frames > 0.0,
            "frames must be positive, but get {}",
            self.frames
        );
        ensure!(self.window_size >= 1, "window_size must be at least 1");
        ensure!(self.window_step >= 1, "window_step must be at least 1");
        Ok(())
    }
}

/// Keeps a subset of the sorted frames of one video.
pub fn subsample_frames<T>(frames: Vec<T>, ratio: f64) -> Vec<T> {
    let step = if ratio < 1.0 {
        (1.0 / ratio).floor() as usize
    } else if ratio > 1.0 {
        (frames.len() as f64 / ratio).ceil() as usize
    } else {
        1
    };
    let step = step.max(1);

    frames.into_iter().step_by(step).collect()
}

/// Frame indices of the window centred at `index` in a video of `len`
/// frames. Indices past either end repeat the first or last frame. With an
/// even `size` the last future frame is dropped.
pub fn window_indices(index: usize, len: usize, size: usize, step: usize) -> Vec<usize> {
    debug_assert!(index < len);
    let half = size / 2;
    let last = len.saturating_sub(1);
    let mut window = Vec::with_capacity(size);

    for back in (1..=half).rev() {
        window.push(index.saturating_sub(back * step));
    }

    window.push(index);

    for forward in 1..=half {
        if window.len() == size {
            break;
        }
        window.push((index + forward * step).min(last));
    }

    window
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subsample_by_ratio() {
        let frames: Vec<_> = (0..10).collect();
        assert_eq!(subsample_frames(frames.clone(), 1.0), frames);
        assert_eq!(subsample_frames(frames.clone(), 0.3), vec![0, 3, 6, 9]);
        assert_eq!(subsample_frames(frames.clone(), 4.0), vec![0, 3, 6, 9]);
        assert_eq!(subsample_frames(frames, 20.0).len(), 10);
    }

    #[test]
    fn window_pads_at_edges() {
        assert_eq!(window_indices(0, 5, 3, 1), vec![0, 0, 1]);
        assert_eq!(window_indices(4, 5, 3, 1), vec![3, 4, 4]);
        assert_eq!(window_indices(2, 5, 5, 2), vec![0, 0, 2, 4, 4]);
        assert_eq!(window_indices(1, 3, 1, 1), vec![1]);
    }

    #[test]
    fn even_window_drops_last_future_frame() {
        assert_eq!(window_indices(2, 6, 4, 1), vec![0, 1, 2, 3]);
    }
}
