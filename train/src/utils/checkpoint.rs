use crate::common::*;
use regex::Regex;

static CHECKPOINT_FILENAME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"_(\d{4,})_(\d+\.\d+)\.params$").unwrap());

/// Saves the best and periodic parameters under a file prefix and keeps the
/// best mAP log.
#[derive(Debug)]
pub struct CheckpointSaver {
    prefix: PathBuf,
    save_interval: i64,
    best_map: f64,
}

impl CheckpointSaver {
    /// Creates the saver. When resuming, the best mAP is read back from the
    /// last line of the best mAP log.
    pub fn new(prefix: impl Into<PathBuf>, save_interval: i64, resume: bool) -> Result<Self> {
        ensure!(save_interval != 0, "save_interval must not be zero");
        let prefix = prefix.into();

        let best_map = if resume {
            read_best_map(&best_map_log_path(&prefix))?.unwrap_or(0.0)
        } else {
            0.0
        };

        Ok(Self {
            prefix,
            save_interval,
            best_map,
        })
    }

    pub fn best_map(&self) -> f64 {
        self.best_map
    }

    pub fn best_path(&self) -> PathBuf {
        suffixed(&self.prefix, "_best.params")
    }

    pub fn epoch_path(&self, epoch: usize, map: f64) -> PathBuf {
        suffixed(&self.prefix, &format!("_{:04}_{:.4}.params", epoch, map))
    }

    /// Saves after an epoch. `current_map` is zero on epochs without
    /// validation.
    pub fn save(&mut self, vs: &nn::VarStore, epoch: usize, current_map: f64) -> Result<()> {
        if current_map > self.best_map {
            self.best_map = current_map;
            vs.save(self.best_path())?;

            let log_path = best_map_log_path(&self.prefix);
            let mut text = match fs::read_to_string(&log_path) {
                Ok(text) => text,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
                Err(err) => return Err(err.into()),
            };
            text.push_str(&format!("{:04}:\t{:.4}\n", epoch, current_map));
            fs::write(&log_path, text)
                .with_context(|| format!("failed to write '{}'", log_path.display()))?;
            info!("new best mAP {:.4} at epoch {}", current_map, epoch);
        }

        if self.save_interval > 0 {
            if epoch % self.save_interval as usize == 0 {
                vs.save(self.epoch_path(epoch, current_map))?;
            }
        } else {
            vs.save(self.epoch_path(epoch, current_map))?;

            let interval = (-self.save_interval) as usize;
            if epoch % interval == 0 {
                let first = (epoch + 1).saturating_sub(interval);
                for stale in first..epoch {
                    for path in self.find_epoch_checkpoints(stale)? {
                        fs::remove_file(&path)
                            .with_context(|| format!("failed to remove '{}'", path.display()))?;
                    }
                }
            }
        }

        Ok(())
    }

    fn find_epoch_checkpoints(&self, epoch: usize) -> Result<Vec<PathBuf>> {
        let pattern = format!(
            "{}_{:04}_*.params",
            glob::Pattern::escape(&self.prefix.to_string_lossy()),
            epoch
        );
        let paths: Vec<_> = glob::glob(&pattern)?.try_collect()?;
        Ok(paths)
    }
}

pub fn best_map_log_path(prefix: &Path) -> PathBuf {
    suffixed(prefix, "_best_map.log")
}

pub fn train_log_path(prefix: &Path) -> PathBuf {
    suffixed(prefix, "_train.log")
}

/// Reads the mAP from the last `epoch:\tmap` line.
pub fn read_best_map(path: &Path) -> Result<Option<f64>> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    let line = match text.lines().rev().find(|line| !line.trim().is_empty()) {
        Some(line) => line,
        None => return Ok(None),
    };
    let value = line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| format_err!("invalid best mAP line '{}' in '{}'", line, path.display()))?;
    let map: f64 = value
        .parse()
        .with_context(|| format!("invalid best mAP line '{}' in '{}'", line, path.display()))?;
    Ok(Some(map))
}

/// The checkpoint with the largest epoch in a directory.
pub fn find_latest_checkpoint(dir: &Path) -> Result<Option<(PathBuf, usize)>> {
    let pattern = format!("{}/*.params", glob::Pattern::escape(&dir.to_string_lossy()));
    let paths: Vec<PathBuf> = glob::glob(&pattern)?.try_collect()?;

    let latest = paths
        .into_iter()
        .filter_map(|path| {
            let file_name = path.file_name()?.to_str()?;
            let captures = CHECKPOINT_FILENAME_REGEX.captures(file_name)?;
            let epoch: usize = captures.get(1)?.as_str().parse().ok()?;
            Some((path, epoch))
        })
        .max_by_key(|(_path, epoch)| *epoch);

    if latest.is_none() {
        warn!("no checkpoint file found in '{}'", dir.display());
    }
    Ok(latest)
}

fn suffixed(prefix: &Path, suffix: &str) -> PathBuf {
    let mut path = prefix.as_os_str().to_owned();
    path.push(suffix);
    path.into()
}
