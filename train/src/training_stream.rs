//! Feeds training and validation batches to the training worker.

use crate::{common::*, config::Config};
use vid_dataset::{Batch, DataLoader, DetectionDataset, LoaderConfig};

/// A message from the data feeder to the training worker. Each epoch sends
/// its training batches, `TrainingDone`, the validation batches if the epoch
/// is validated, and `EpochDone`.
#[derive(Debug)]
pub enum TrainingMessage {
    Batch {
        epoch: usize,
        index: usize,
        num_batches: usize,
        batch: Batch,
    },
    TrainingDone {
        epoch: usize,
    },
    ValidationBatch {
        epoch: usize,
        batch: Batch,
    },
    EpochDone {
        epoch: usize,
        validated: bool,
    },
}

/// Marks the epoch whose remaining training batches are skipped.
#[derive(Debug, Clone, Default)]
pub struct EpochCutoff(Arc<AtomicUsize>);

impl EpochCutoff {
    pub fn cut(&self, epoch: usize) {
        self.0.store(epoch + 1, atomic::Ordering::SeqCst);
    }

    pub fn is_cut(&self, epoch: usize) -> bool {
        self.0.load(atomic::Ordering::SeqCst) == epoch + 1
    }
}

/// The epoch schedule of training and validation batches.
#[derive(Debug)]
pub struct TrainingStream {
    config: Arc<Config>,
    train: DataLoader,
    val: Option<DataLoader>,
    start_epoch: usize,
    cutoff: EpochCutoff,
}

impl TrainingStream {
    pub fn new(
        config: Arc<Config>,
        train_dataset: Arc<dyn DetectionDataset>,
        val_dataset: Option<Arc<dyn DetectionDataset>>,
        start_epoch: usize,
        cutoff: EpochCutoff,
    ) -> Result<Self> {
        let training = &config.training;
        let temporal = config.model.is_temporal();

        let train = DataLoader::new(
            train_dataset,
            LoaderConfig {
                image_size: training.data_shape,
                shuffle: true,
                seed: training.seed,
                random_shape: training.random_shape,
                flip_prob: training.flip_prob.raw(),
                temporal,
                drop_last: true,
                ..LoaderConfig::new(training.batch_size.get())
            },
        )?;
        let val = val_dataset
            .map(|dataset| {
                DataLoader::new(
                    dataset,
                    LoaderConfig {
                        image_size: training.data_shape,
                        temporal,
                        ..LoaderConfig::new(training.batch_size.get())
                    },
                )
            })
            .transpose()?;

        ensure!(
            train.num_batches(training.num_samples) > 0,
            "the training set has fewer samples than a batch"
        );

        Ok(Self {
            config,
            train,
            val,
            start_epoch,
            cutoff,
        })
    }

    /// Training batches per epoch.
    pub fn num_batches(&self) -> usize {
        self.train.num_batches(self.config.training.num_samples)
    }

    pub fn validates(&self, epoch: usize) -> bool {
        self.val.is_some() && (epoch + 1) % self.config.training.val_interval.get() == 0
    }

    /// Sends every remaining epoch to the training worker.
    pub async fn feed(self, tx: mpsc::Sender<TrainingMessage>) -> Result<()> {
        let training = &self.config.training;
        let num_batches = self.num_batches();

        for epoch in self.start_epoch..training.epochs {
            let mixup = training.mixup_enabled(epoch);
            let mut batches = self.train.epoch(epoch, training.num_samples, mixup);
            let mut index = 0;

            while let Some(batch) = batches
                .next()
                .instrument(trace_span!("recv_next_batch"))
                .await
            {
                if self.cutoff.is_cut(epoch) {
                    break;
                }
                let msg = TrainingMessage::Batch {
                    epoch,
                    index,
                    num_batches,
                    batch: batch?,
                };
                send(&tx, msg).await?;
                index += 1;
            }
            send(&tx, TrainingMessage::TrainingDone { epoch }).await?;

            let validated = self.validates(epoch);
            if let (true, Some(val)) = (validated, &self.val) {
                let mut batches = val.epoch(0, None, false);
                while let Some(batch) = batches.next().await {
                    let msg = TrainingMessage::ValidationBatch {
                        epoch,
                        batch: batch?,
                    };
                    send(&tx, msg).await?;
                }
            }
            send(&tx, TrainingMessage::EpochDone { epoch, validated }).await?;
        }

        Ok(())
    }
}

async fn send(tx: &mpsc::Sender<TrainingMessage>, msg: TrainingMessage) -> Result<()> {
    tx.send(msg)
        .instrument(trace_span!("send_batch_to_training_loop"))
        .await
        .map_err(|_| format_err!("failed to send message to training worker"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cutoff_applies_to_a_single_epoch() {
        let cutoff = EpochCutoff::default();
        assert!(!cutoff.is_cut(0));

        let shared = cutoff.clone();
        shared.cut(3);
        assert!(cutoff.is_cut(3));
        assert!(!cutoff.is_cut(4));
    }
}
