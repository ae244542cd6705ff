//! Batching, random input shapes and mixup.

use crate::{
    common::*,
    dataset::DetectionDataset,
    transform::{load_sample, LoadedSample},
};
use futures::stream::BoxStream;
use rand_distr::Beta;

/// Both shape parameters of the mixup ratio distribution.
pub const MIXUP_ALPHA: f64 = 1.5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoaderConfig {
    pub batch_size: usize,
    /// Canvas size when the shape is not randomized.
    #[serde(default = "default_image_size")]
    pub image_size: usize,
    #[serde(default)]
    pub shuffle: bool,
    #[serde(default)]
    pub seed: u64,
    /// Redraw the canvas size every `shape_interval` batches.
    #[serde(default)]
    pub random_shape: bool,
    #[serde(default = "default_min_size")]
    pub min_size: usize,
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    #[serde(default = "default_shape_interval")]
    pub shape_interval: usize,
    /// Probability of a horizontal flip.
    #[serde(default)]
    pub flip_prob: f64,
    /// Keep the time axis: `[B, K, 3, S, S]` instead of `[B, 3, S, S]`.
    #[serde(default)]
    pub temporal: bool,
    /// Drop a trailing batch smaller than `batch_size`.
    #[serde(default)]
    pub drop_last: bool,
}

fn default_image_size() -> usize {
    416
}

fn default_min_size() -> usize {
    320
}

fn default_max_size() -> usize {
    608
}

fn default_shape_interval() -> usize {
    10
}

const SHAPE_STEP: usize = 32;

impl LoaderConfig {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            image_size: default_image_size(),
            shuffle: false,
            seed: 0,
            random_shape: false,
            min_size: default_min_size(),
            max_size: default_max_size(),
            shape_interval: default_shape_interval(),
            flip_prob: 0.0,
            temporal: false,
            drop_last: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.batch_size > 0, "batch_size must be positive");
        ensure!(self.shape_interval > 0, "shape_interval must be positive");
        ensure!(
            self.image_size % SHAPE_STEP == 0,
            "image_size must be a multiple of {}",
            SHAPE_STEP
        );
        ensure!(
            self.min_size % SHAPE_STEP == 0
                && self.max_size % SHAPE_STEP == 0
                && self.min_size <= self.max_size
                && self.min_size > 0,
            "invalid random shape range {}..={}",
            self.min_size,
            self.max_size
        );
        ensure!(
            (0.0..=1.0).contains(&self.flip_prob),
            "flip_prob must be in [0, 1]"
        );
        Ok(())
    }

    /// Candidate canvas sizes for random shapes.
    pub fn shape_choices(&self) -> Vec<usize> {
        (self.min_size..=self.max_size).step_by(SHAPE_STEP).collect()
    }
}

/// A batch of samples on CPU.
#[derive(Debug)]
pub struct Batch {
    /// `[B, 3, S, S]` or `[B, K, 3, S, S]`.
    pub images: Tensor,
    /// Labels in canvas pixel coordinates.
    pub labels: Vec<Vec<ObjectLabel>>,
    /// Loss weight of each label, below 1 for mixed up labels.
    pub label_weights: Vec<Vec<f64>>,
    pub indices: Vec<usize>,
    pub orig_sizes: Vec<HW<usize>>,
    pub image_size: usize,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

#[derive(Debug, Clone)]
struct BatchPlan {
    indices: Vec<usize>,
    image_size: usize,
    /// Partner sample and mix ratio for each index.
    mixup: Option<Vec<(usize, f64)>>,
    flips: Vec<bool>,
    partner_flips: Vec<bool>,
}

/// Produces batches from a dataset with a background pool of loaders.
#[derive(Debug, Clone)]
pub struct DataLoader {
    dataset: Arc<dyn DetectionDataset>,
    config: LoaderConfig,
    mixup_ratio: Beta<f64>,
}

impl DataLoader {
    pub fn new(dataset: Arc<dyn DetectionDataset>, config: LoaderConfig) -> Result<Self> {
        config.validate()?;
        ensure!(!dataset.is_empty(), "the dataset is empty");
        let mixup_ratio = mixup_distribution(MIXUP_ALPHA, MIXUP_ALPHA)?;
        Ok(Self {
            dataset,
            config,
            mixup_ratio,
        })
    }

    pub fn dataset(&self) -> &Arc<dyn DetectionDataset> {
        &self.dataset
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Number of batches, `num_samples` limits the samples per epoch.
    pub fn num_batches(&self, num_samples: Option<usize>) -> usize {
        let len = num_samples
            .map(|num| num.min(self.dataset.len()))
            .unwrap_or_else(|| self.dataset.len());
        if self.config.drop_last {
            len / self.config.batch_size
        } else {
            (len + self.config.batch_size - 1) / self.config.batch_size
        }
    }

    fn plan(&self, epoch: usize, num_samples: Option<usize>, mixup: bool) -> Vec<BatchPlan> {
        let LoaderConfig {
            batch_size,
            image_size,
            shuffle,
            seed,
            random_shape,
            shape_interval,
            flip_prob,
            drop_last,
            ..
        } = self.config;
        let mut rng = StdRng::seed_from_u64(seed.wrapping_add(epoch as u64));
        let len = self.dataset.len();
        let mixup_ratio = self.mixup_ratio;

        let mut order: Vec<usize> = (0..len).collect();
        if shuffle {
            order.shuffle(&mut rng);
        }
        if let Some(num_samples) = num_samples {
            order.truncate(num_samples);
        }

        let choices = self.config.shape_choices();
        let mut current_size = image_size;

        order
            .chunks(batch_size)
            .filter(|chunk| !drop_last || chunk.len() == batch_size)
            .enumerate()
            .map(|(batch_index, chunk)| {
                if random_shape && batch_index % shape_interval == 0 {
                    current_size = *choices.choose(&mut rng).unwrap_or(&image_size);
                }
                let mut flip = || flip_prob > 0.0 && rng.gen_bool(flip_prob);
                let flips: Vec<_> = chunk.iter().map(|_| flip()).collect();
                let partner_flips: Vec<_> = chunk.iter().map(|_| flip()).collect();
                let mixup = mixup.then(|| {
                    chunk
                        .iter()
                        .map(|_| (rng.gen_range(0..len), mixup_ratio.sample(&mut rng)))
                        .collect()
                });

                BatchPlan {
                    indices: chunk.to_vec(),
                    image_size: current_size,
                    mixup,
                    flips,
                    partner_flips,
                }
            })
            .collect()
    }

    /// Streams the batches of an epoch in order. The sample order, shapes,
    /// flips and mixup partners are fixed by the seed and the epoch.
    pub fn epoch(
        &self,
        epoch: usize,
        num_samples: Option<usize>,
        mixup: bool,
    ) -> BoxStream<'static, Result<Batch>> {
        let plans = self.plan(epoch, num_samples, mixup);
        let dataset = self.dataset.clone();
        let temporal = self.config.temporal;

        stream::iter(plans)
            .par_then(None, move |plan| {
                let dataset = dataset.clone();
                async move {
                    tokio::task::spawn_blocking(move || load_batch(&*dataset, plan, temporal))
                        .map(|result| Fallible::Ok(result??))
                        .await
                }
            })
            .boxed()
    }
}

fn load_batch(dataset: &dyn DetectionDataset, plan: BatchPlan, temporal: bool) -> Result<Batch> {
    let BatchPlan {
        indices,
        image_size,
        mixup,
        flips,
        partner_flips,
    } = plan;

    let samples: Vec<_> = izip!(0.., &indices, &flips)
        .map(|(slot, &index, &flip)| -> Result<_> {
            let sample = load_sample(dataset, index, image_size, flip)?;
            let num_labels = sample.labels.len();

            match &mixup {
                Some(mixup) => {
                    let (partner, ratio) = mixup[slot];
                    let other = load_sample(dataset, partner, image_size, partner_flips[slot])?;
                    mix_samples(sample, other, ratio)
                }
                None => Ok((sample, vec![1.0; num_labels])),
            }
        })
        .try_collect()?;

    let frame_counts: HashSet<_> = samples
        .iter()
        .map(|(sample, _)| sample.frames.size()[0])
        .collect();
    ensure!(
        frame_counts.len() == 1,
        "samples in a batch have different frame counts {:?}",
        frame_counts
    );

    let mut images = vec![];
    let mut labels = vec![];
    let mut label_weights = vec![];
    let mut orig_sizes = vec![];

    for (sample, weights) in samples {
        let LoadedSample {
            frames,
            labels: sample_labels,
            orig_size,
            ..
        } = sample;
        let frames = if temporal {
            frames
        } else {
            ensure!(
                frames.size()[0] == 1,
                "non-temporal batches require single frame samples"
            );
            frames.squeeze_dim(0)
        };
        images.push(frames);
        labels.push(sample_labels);
        label_weights.push(weights);
        orig_sizes.push(orig_size);
    }

    Ok(Batch {
        images: Tensor::stack(&images, 0),
        labels,
        label_weights,
        indices,
        orig_sizes,
        image_size,
    })
}

/// Blends two samples with `ratio` on the first one. Labels of both are
/// kept, weighted by their share.
fn mix_samples(
    lhs: LoadedSample,
    rhs: LoadedSample,
    ratio: f64,
) -> Result<(LoadedSample, Vec<f64>)> {
    ensure!(
        lhs.frames.size() == rhs.frames.size(),
        "mixup requires equal frame shapes"
    );
    let frames = tch::no_grad(|| &lhs.frames * ratio + &rhs.frames * (1.0 - ratio));
    let weights: Vec<_> = iter_weights(lhs.labels.len(), ratio)
        .chain(iter_weights(rhs.labels.len(), 1.0 - ratio))
        .collect();
    let labels: Vec<_> = lhs.labels.into_iter().chain(rhs.labels).collect();

    Ok((
        LoadedSample {
            frames,
            labels,
            orig_size: lhs.orig_size,
            flipped: lhs.flipped,
        },
        weights,
    ))
}

fn iter_weights(len: usize, weight: f64) -> impl Iterator<Item = f64> {
    std::iter::repeat(weight).take(len)
}

/// The `Beta(alpha, beta)` distribution of mixup ratios.
pub fn mixup_distribution(alpha: f64, beta: f64) -> Result<Beta<f64>> {
    Beta::new(alpha, beta)
        .with_context(|| format!("invalid mixup ratio distribution Beta({}, {})", alpha, beta))
}
