use crate::{
    common::*,
    config::{Config, TrainingConfig},
    logging::LoggingMessage,
    training_stream::{EpochCutoff, TrainingMessage},
    utils::{freeze_scope, CheckpointSaver, LossMeans, LossMeter, LrScheduler, RateCounter},
};
use det_metrics::{CocoMApMetric, Detection, DetectionMetric, EvalImage, VocMApMetric};
use vid_dataset::Batch;
use yolo_vid::{Hierarchy, NmsOutput, YoloLoss, YoloVid, YoloVidInit, BACKBONE_SCOPE};

/// Inputs of the training worker resolved from datasets and files.
#[derive(Debug, Clone)]
pub struct WorkerSetup {
    pub train_classes: Vec<String>,
    /// Classes of the pretrained detector when they differ.
    pub trained_on_classes: Option<Vec<String>>,
    pub hierarchy: Option<Hierarchy>,
    pub validation: Option<ValidationSetup>,
    pub resume_file: Option<PathBuf>,
    pub start_epoch: usize,
    pub num_batches: usize,
    pub file_prefix: PathBuf,
}

/// The metric computed on the validation set.
#[derive(Debug, Clone)]
pub struct ValidationSetup {
    pub class_names: Vec<String>,
    /// For each evaluated class, the trained class index or `-1`.
    pub class_map: Option<Vec<i64>>,
    pub coco: bool,
}

impl ValidationSetup {
    pub fn build_metric(&self) -> Result<Box<dyn DetectionMetric + Send>> {
        let class_map = self.class_map.as_deref();
        let metric: Box<dyn DetectionMetric + Send> = if self.coco {
            Box::new(CocoMApMetric::new(self.class_names.clone(), class_map))
        } else {
            Box::new(VocMApMetric::new(
                0.5,
                self.class_names.clone(),
                class_map,
                false,
            )?)
        };
        Ok(metric)
    }
}

/// Start the single-GPU training worker. It consumes messages until the
/// data feeder closes the channel.
pub fn single_gpu_training_worker(
    config: Arc<Config>,
    setup: WorkerSetup,
    mut data_rx: mpsc::Receiver<TrainingMessage>,
    logging_tx: broadcast::Sender<LoggingMessage>,
    cutoff: EpochCutoff,
) -> Result<()> {
    let TrainingConfig {
        device,
        seed,
        label_smooth,
        freeze_base,
        ref pretrained,
        ref trained_on,
        ..
    } = config.training;
    info!("use single device {:?}", device);
    tch::manual_seed(seed as i64);

    // init model
    info!("initializing model");
    let mut vs = nn::VarStore::new(device);
    let mut model = {
        let mut model_config = config.model.clone();
        model_config.num_classes = 0;
        model_config.hierarchical = match setup.trained_on_classes {
            Some(_) => None,
            None => setup.hierarchy.clone(),
        };
        let classes = setup
            .trained_on_classes
            .clone()
            .unwrap_or_else(|| setup.train_classes.clone());

        YoloVidInit {
            config: model_config,
            classes,
        }
        .build(&vs.root())?
    };

    if let Some(path) = pretrained {
        info!("load pretrained weights {}", path.display());
        let missing = vs.load_partial(path)?;
        if !missing.is_empty() {
            warn!("{} variables are not in the pretrained weights", missing.len());
        }
    }
    if let Some(trained_on) = trained_on {
        model.reset_class(
            setup.train_classes.clone(),
            trained_on.reuse.as_ref(),
            setup.hierarchy.clone(),
        )?;
    }
    if let Some(path) = &setup.resume_file {
        info!("resume from checkpoint file {}", path.display());
        vs.load(path)?;
    }
    if freeze_base {
        let count = freeze_scope(&vs, BACKBONE_SCOPE);
        info!("froze {} backbone variables", count);
    }

    let yolo_loss = model.loss_init(label_smooth).build(&vs.root() / "loss")?;
    let saver = CheckpointSaver::new(
        &setup.file_prefix,
        config.training.save_interval,
        setup.resume_file.is_some(),
    )?;
    let metric = setup
        .validation
        .as_ref()
        .map(|validation| validation.build_metric())
        .transpose()?;

    let mut worker = TrainingWorker {
        lr_scheduler: LrScheduler::new(
            &config.training.lr_mode,
            config.training.lr.raw(),
            config.training.warmup_lr.raw(),
            config.training.warmup_epochs,
            config.training.epochs,
            setup.num_batches,
            setup.start_epoch * setup.num_batches,
        )?,
        optimizer: nn::Sgd {
            momentum: config.training.momentum.raw(),
            dampening: 0.0,
            wd: config.training.wd.raw(),
            nesterov: false,
        }
        .build(&vs, 0.0)?,
        config,
        vs,
        model,
        yolo_loss,
        saver,
        metric,
        logging_tx,
        cutoff,
        num_batches: setup.num_batches,
        loss_meter: LossMeter::default(),
        rate_counter: RateCounter::new(),
        epoch_start: Instant::now(),
        current_epoch: None,
        validation_start: None,
    };

    worker.log_line(format!("Start training from [Epoch {}]", setup.start_epoch))?;
    while let Some(msg) = data_rx.blocking_recv() {
        worker.handle(msg)?;
    }
    info!("training finished");

    Ok(())
}

struct TrainingWorker {
    config: Arc<Config>,
    vs: nn::VarStore,
    model: YoloVid,
    yolo_loss: YoloLoss,
    optimizer: nn::Optimizer<nn::Sgd>,
    lr_scheduler: LrScheduler,
    saver: CheckpointSaver,
    metric: Option<Box<dyn DetectionMetric + Send>>,
    logging_tx: broadcast::Sender<LoggingMessage>,
    cutoff: EpochCutoff,
    num_batches: usize,
    loss_meter: LossMeter,
    rate_counter: RateCounter,
    epoch_start: Instant,
    current_epoch: Option<usize>,
    validation_start: Option<Instant>,
}

impl TrainingWorker {
    fn handle(&mut self, msg: TrainingMessage) -> Result<()> {
        match msg {
            TrainingMessage::Batch {
                epoch,
                index,
                num_batches,
                batch,
            } => {
                self.begin_epoch(epoch, num_batches);
                if self.cutoff.is_cut(epoch) {
                    return Ok(());
                }
                if let Some(max_duration) = self.config.training.max_epoch_duration() {
                    if self.epoch_start.elapsed() > max_duration {
                        self.cutoff.cut(epoch);
                        let minutes = max_duration.as_secs_f64() / 60.0;
                        self.log_line(format!(
                            "Max epoch time of {} minutes reached after completing {}% of epoch. Moving on to next epoch",
                            minutes,
                            100 * index / num_batches
                        ))?;
                        return Ok(());
                    }
                }
                self.train_step(epoch, index, num_batches, batch)?;
            }
            TrainingMessage::TrainingDone { epoch } => {
                let means = self.loss_meter.means();
                self.log_line(format!(
                    "[Epoch {}] Training cost: {:.3}, {}",
                    epoch,
                    self.epoch_start.elapsed().as_secs_f64(),
                    means.to_log_string()
                ))?;
            }
            TrainingMessage::ValidationBatch { batch, .. } => {
                self.validation_step(batch)?;
            }
            TrainingMessage::EpochDone { epoch, validated } => {
                let current_map = if validated {
                    self.finish_validation(epoch)?
                } else {
                    0.0
                };
                self.saver.save(&self.vs, epoch, current_map)?;
                self.current_epoch = None;
            }
        }
        Ok(())
    }

    fn begin_epoch(&mut self, epoch: usize, num_batches: usize) {
        if self.current_epoch == Some(epoch) {
            return;
        }
        self.current_epoch = Some(epoch);
        self.epoch_start = Instant::now();
        self.loss_meter.reset();
        self.rate_counter = RateCounter::new();
        self.lr_scheduler.set_step(epoch * num_batches);
    }

    fn train_step(&mut self, epoch: usize, index: usize, num_batches: usize, batch: Batch) -> Result<()> {
        let device = self.vs.device();
        let Batch {
            images,
            labels,
            label_weights,
            image_size,
            ..
        } = batch;
        let batch_size = labels.len();

        let lr = self.lr_scheduler.next();
        self.optimizer.set_lr(lr);

        let images = images.to_device(device);
        let output = self.model.forward_train(&images)?;
        let losses = self.yolo_loss.forward(
            &output,
            &labels,
            &label_weights,
            [image_size as i64, image_size as i64],
        )?;
        self.optimizer.backward_step(&losses.total_loss);

        self.loss_meter.update(&losses);
        self.rate_counter.add(batch_size as f64);

        if (index + 1) % self.config.training.log_interval.get() == 0 {
            let means = self.loss_meter.means();
            self.log_line(format!(
                "[Epoch {}][Batch {}/{}], LR: {:.2E}, Speed: {:.3} samples/sec, {}",
                epoch,
                index,
                num_batches,
                lr,
                self.rate_counter.take_rate(),
                means.to_log_string()
            ))?;

            let step = epoch * num_batches + index;
            for (name, value) in izip!(LossMeans::NAMES, means.values()) {
                self.send(LoggingMessage::new_scalar(
                    format!("Training_{}", name),
                    step,
                    value,
                ))?;
            }
        }

        Ok(())
    }

    fn validation_step(&mut self, batch: Batch) -> Result<()> {
        let metric = match &mut self.metric {
            Some(metric) => metric,
            None => return Ok(()),
        };
        if self.validation_start.is_none() {
            metric.reset();
            self.validation_start = Some(Instant::now());
        }

        let Batch {
            images,
            labels,
            image_size,
            ..
        } = batch;
        let canvas = HW::try_from_hw([image_size as f64, image_size as f64])?;

        let images = images.to_device(self.vs.device());
        let output = self.model.detect(&images)?;

        for (detections, ground_truth) in izip!(to_detections(&output)?, labels) {
            let mut image = EvalImage::new(detections, ground_truth);
            image.clip_detections(&canvas);
            metric.update(&image)?;
        }

        Ok(())
    }

    fn finish_validation(&mut self, epoch: usize) -> Result<f64> {
        let (names, values) = match &self.metric {
            Some(metric) => metric.get(),
            None => return Ok(0.0),
        };
        if let Some(start) = self.validation_start.take() {
            info!("End Val: seconds: {:.3}", start.elapsed().as_secs_f64());
        }

        let current_map = values.last().copied().unwrap_or(0.0);
        let current_map = if current_map.is_nan() { 0.0 } else { current_map };
        let message = izip!(&names, &values)
            .map(|(name, value)| format!("{}={}", name, value))
            .join("\n");
        self.log_line(format!("[Epoch {}] Validation: \n{}", epoch, message))?;

        self.send(LoggingMessage::new_scalar(
            "Validation_mAP",
            (epoch + 1) * self.num_batches - 1,
            current_map,
        ))?;

        Ok(current_map)
    }

    fn log_line(&self, line: String) -> Result<()> {
        info!("{}", line);
        self.send(LoggingMessage::new_text(line))
    }

    fn send(&self, msg: LoggingMessage) -> Result<()> {
        self.logging_tx
            .send(msg)
            .map_err(|_err| format_err!("cannot send message to logger"))?;
        Ok(())
    }
}

/// Valid suppressed detections of each image in canvas pixels.
fn to_detections(output: &NmsOutput) -> Result<Vec<Vec<Detection>>> {
    let detections = output
        .to_vec()?
        .into_iter()
        .map(|rows| {
            rows.into_iter()
                .filter_map(|(class, score, xyxy)| {
                    Some(Detection {
                        class: class as usize,
                        score: R64::try_new(score)?,
                        bbox: TLBR::from_xyxy(xyxy).ok()?,
                    })
                })
                .collect()
        })
        .collect();
    Ok(detections)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detections_skip_padding_and_invalid_boxes() -> Result<()> {
        let rows = Tensor::of_slice(&[
            1f32, 0.9, 10.0, 10.0, 20.0, 30.0, // valid
            0.0, 0.8, 20.0, 20.0, 10.0, 10.0, // inverted
            -1.0, -1.0, -1.0, -1.0, -1.0, -1.0, // padding
        ])
        .view([1, 3, 6]);
        let output = NmsOutput {
            ids: rows.narrow(2, 0, 1),
            scores: rows.narrow(2, 1, 1),
            bboxes: rows.narrow(2, 2, 4),
        };

        let detections = to_detections(&output)?;
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].len(), 1);
        let detection = &detections[0][0];
        assert_eq!(detection.class, 1);
        assert_eq!(detection.bbox, TLBR::from_xyxy([10.0, 10.0, 20.0, 30.0])?);
        Ok(())
    }

    #[test]
    fn voc_metric_for_non_coco_validation() -> Result<()> {
        let setup = ValidationSetup {
            class_names: vec!["car".into(), "dog".into()],
            class_map: Some(vec![1, -1]),
            coco: false,
        };
        let metric = setup.build_metric()?;
        let (names, _values) = metric.get();
        assert_eq!(names.last().map(String::as_str), Some("mAP"));
        Ok(())
    }
}
