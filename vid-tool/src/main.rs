use anyhow::{bail, ensure, Result};
use clap::{ArgEnum, Args, Parser};
use prettytable::{cell, row, Table};
use std::{env, path::PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;
use tracing_subscriber::{filter::LevelFilter, prelude::*, EnvFilter};
use vid_dataset::{
    annotation_path, download_videos, expected_download_gb, extract_frames, read_video_ids,
    ClassFiles, ClassList, CocoJson, DatasetStats, ImagenetVidDataset, VideoOptions,
    YoutubeBbDataset, YoutubeBbOptions,
};

#[derive(Debug, Clone, Parser)]
/// Maintenance of the video detection datasets
enum Opts {
    /// Print box and instance counts per class
    Stats {
        #[clap(flatten)]
        dataset: DatasetArgs,
    },
    /// Write the split in COCO json format under <root>/jsons
    BuildCocoJson {
        #[clap(flatten)]
        dataset: DatasetArgs,
    },
    /// Compute the motion IoU of every sample for the VID metric
    MotionIous {
        #[clap(flatten)]
        dataset: DatasetArgs,
    },
    /// Download the YouTube-BB videos with youtube-dl
    DownloadVideos {
        /// YouTube-BB annotation csv files
        #[clap(required = true)]
        annotation_files: Vec<PathBuf>,
        /// video directory
        #[clap(long, default_value = "videos")]
        save_dir: PathBuf,
        /// number of parallel downloads
        #[clap(long, default_value = "8")]
        jobs: usize,
        /// do not ask for confirmation
        #[clap(long)]
        yes: bool,
    },
    /// Extract the annotated frames of the downloaded videos with ffmpeg
    ExtractFrames {
        /// YouTube-BB annotation csv files
        #[clap(required = true)]
        annotation_files: Vec<PathBuf>,
        /// video directory
        #[clap(long, default_value = "videos")]
        videos_dir: PathBuf,
        /// frame directory
        #[clap(long, default_value = "frames")]
        frames_dir: PathBuf,
        /// number of parallel extractions
        #[clap(long, default_value = "8")]
        jobs: usize,
        /// do not ask for confirmation
        #[clap(long)]
        yes: bool,
    },
}

#[derive(Debug, Clone, Args)]
struct DatasetArgs {
    /// dataset root directory
    root: PathBuf,
    /// split name, e.g. train or val
    split: String,
    #[clap(long, arg_enum, default_value = "ytbb")]
    kind: DatasetKind,
    /// class names file
    #[clap(long)]
    names_file: PathBuf,
    /// WordNet ids file, required by ImageNet VID
    #[clap(long)]
    wn_ids_file: Option<PathBuf>,
    /// numeric class ids file, required by YouTube-BB
    #[clap(long)]
    ids_file: Option<PathBuf>,
    /// count whole videos instead of frames
    #[clap(long)]
    videos: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ArgEnum)]
enum DatasetKind {
    Vid,
    Ytbb,
}

#[derive(Debug)]
enum VideoDataset {
    Vid(ImagenetVidDataset),
    Ytbb(YoutubeBbDataset),
}

impl VideoDataset {
    async fn load(args: &DatasetArgs) -> Result<Self> {
        let DatasetArgs {
            root,
            split,
            kind,
            names_file,
            wn_ids_file,
            ids_file,
            videos,
        } = args;

        let classes = ClassList::load(&ClassFiles {
            names_file: names_file.clone(),
            wn_ids_file: wn_ids_file.clone(),
            ids_file: ids_file.clone(),
        })
        .await?;
        let video = VideoOptions {
            videos: *videos,
            ..Default::default()
        };

        let dataset = match kind {
            DatasetKind::Vid => {
                Self::Vid(ImagenetVidDataset::load(root, split, classes, video).await?)
            }
            DatasetKind::Ytbb => {
                ensure!(
                    annotation_path(root, split).is_file(),
                    "no annotation file for split '{}' in {}",
                    split,
                    root.display()
                );
                let options = YoutubeBbOptions {
                    video,
                    ..Default::default()
                };
                Self::Ytbb(YoutubeBbDataset::load(root, split, classes, options).await?)
            }
        };
        Ok(dataset)
    }

    fn stats(&self) -> DatasetStats {
        match self {
            Self::Vid(dataset) => dataset.stats(),
            Self::Ytbb(dataset) => dataset.stats(),
        }
    }

    async fn build_coco_json(&self) -> Result<PathBuf> {
        match self {
            Self::Vid(dataset) => {
                let path = dataset
                    .root
                    .join("jsons")
                    .join(format!("{}.json", dataset.split));
                CocoJson::from_dataset(dataset).save(&path).await?;
                Ok(path)
            }
            Self::Ytbb(dataset) => dataset.build_coco_json().await,
        }
    }

    async fn generate_motion_ious(&self) -> Result<PathBuf> {
        match self {
            Self::Vid(dataset) => dataset.generate_motion_ious().await,
            Self::Ytbb(dataset) => dataset.generate_motion_ious().await,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true).compact();
    let filter_layer = {
        let filter = EnvFilter::from_default_env();
        if env::var("RUST_LOG").is_err() {
            filter.add_directive(LevelFilter::INFO.into())
        } else {
            filter
        }
    };
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();

    match Opts::parse() {
        Opts::Stats { dataset } => {
            let stats = VideoDataset::load(&dataset).await?.stats();
            summary_table(&stats).printstd();
            class_table(&stats).printstd();
        }
        Opts::BuildCocoJson { dataset } => {
            let path = VideoDataset::load(&dataset).await?.build_coco_json().await?;
            info!("saved {}", path.display());
        }
        Opts::MotionIous { dataset } => {
            let path = VideoDataset::load(&dataset)
                .await?
                .generate_motion_ious()
                .await?;
            info!("saved {}", path.display());
        }
        Opts::DownloadVideos {
            annotation_files,
            save_dir,
            jobs,
            yes,
        } => {
            let num_videos = read_video_ids(&annotation_files).await?.len();
            let prompt = format!(
                "download {} videos ({:.1} GB) into {}?",
                num_videos,
                expected_download_gb(num_videos),
                save_dir.display()
            );
            if !yes && !confirm(&prompt).await? {
                return Ok(());
            }
            let failures = download_videos(&annotation_files, &save_dir, jobs).await?;
            if failures > 0 {
                bail!("{} of {} videos failed to download", failures, num_videos);
            }
        }
        Opts::ExtractFrames {
            annotation_files,
            videos_dir,
            frames_dir,
            jobs,
            yes,
        } => {
            let prompt = format!(
                "extract frames of {} into {}?",
                videos_dir.display(),
                frames_dir.display()
            );
            if !yes && !confirm(&prompt).await? {
                return Ok(());
            }
            let failures = extract_frames(&annotation_files, &videos_dir, &frames_dir, jobs).await?;
            if failures > 0 {
                bail!("failed to extract frames of {} videos", failures);
            }
        }
    }

    Ok(())
}

fn summary_table(stats: &DatasetStats) -> Table {
    let mut table = Table::new();
    table.add_row(row!["split", stats.split]);
    table.add_row(row!["videos", stats.videos]);
    if !stats.video_mode {
        table.add_row(row!["frames", stats.frames]);
    }
    table.add_row(row!["boxes", stats.boxes()]);
    table.add_row(row!["instances", stats.instances()]);
    table.add_row(row!["classes", stats.classes.len()]);
    table
}

fn class_table(stats: &DatasetStats) -> Table {
    let mut table = Table::new();
    table.add_row(row!["index", "wn_id", "name", "boxes", "instances"]);
    stats.classes.iter().for_each(|class| {
        table.add_row(row![
            class.index,
            class.wn_id.as_deref().unwrap_or("-"),
            class.name,
            class.boxes,
            class.instances,
        ]);
    });
    table
}

/// `Some(true)` for yes, `Some(false)` for no, `None` for anything else.
fn parse_answer(line: &str) -> Option<bool> {
    match line.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Some(true),
        "n" | "no" => Some(false),
        _ => None,
    }
}

/// Asks until the answer is y or n. A closed stdin counts as no.
async fn confirm(prompt: &str) -> Result<bool> {
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        stdout
            .write_all(format!("{} [y/n] ", prompt).as_bytes())
            .await?;
        stdout.flush().await?;

        let line = match lines.next_line().await? {
            Some(line) => line,
            None => return Ok(false),
        };
        if let Some(answer) = parse_answer(&line) {
            return Ok(answer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vid_dataset::ClassStats;

    fn stats(video_mode: bool) -> DatasetStats {
        DatasetStats {
            split: "val".into(),
            video_mode,
            videos: 2,
            frames: 10,
            classes: vec![
                ClassStats {
                    index: 0,
                    wn_id: Some("n02691156".into()),
                    name: "airplane".into(),
                    boxes: 4,
                    instances: 1,
                },
                ClassStats {
                    index: 1,
                    wn_id: None,
                    name: "bear".into(),
                    boxes: 3,
                    instances: 2,
                },
            ],
        }
    }

    #[test]
    fn answers() {
        assert_eq!(parse_answer("y\n"), Some(true));
        assert_eq!(parse_answer(" YES "), Some(true));
        assert_eq!(parse_answer("n"), Some(false));
        assert_eq!(parse_answer(""), None);
        assert_eq!(parse_answer("maybe"), None);
    }

    #[test]
    fn frames_are_hidden_in_video_mode() {
        assert_eq!(summary_table(&stats(false)).len(), 6);
        assert_eq!(summary_table(&stats(true)).len(), 5);
    }

    #[test]
    fn one_row_per_class() {
        let table = class_table(&stats(false));
        assert_eq!(table.len(), 3);
        assert_eq!(
            table.get_row(2).and_then(|row| row.get_cell(1)).map(|cell| cell.get_content()),
            Some("-".to_owned())
        );
    }

    #[test]
    fn parse_subcommands() -> Result<()> {
        let opts = Opts::try_parse_from(&[
            "vid-tool",
            "stats",
            "datasets/ILSVRC2015",
            "val",
            "--kind",
            "vid",
            "--names-file",
            "names.txt",
            "--wn-ids-file",
            "wn_ids.txt",
        ])?;
        match opts {
            Opts::Stats { dataset } => {
                assert_eq!(dataset.kind, DatasetKind::Vid);
                assert_eq!(dataset.split, "val");
                assert_eq!(dataset.ids_file, None);
            }
            _ => bail!("expect the stats command"),
        }

        let opts = Opts::try_parse_from(&["vid-tool", "download-videos", "a.csv", "b.csv", "--yes"])?;
        match opts {
            Opts::DownloadVideos {
                annotation_files,
                jobs,
                yes,
                ..
            } => {
                assert_eq!(annotation_files.len(), 2);
                assert_eq!(jobs, 8);
                assert!(yes);
            }
            _ => bail!("expect the download-videos command"),
        }

        assert!(Opts::try_parse_from(&["vid-tool", "extract-frames"]).is_err());
        Ok(())
    }
}
