use crate::{common::*, motion::VideoFrames, ClassList};

/// Box and instance counts of one class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassStats {
    pub index: usize,
    pub wn_id: Option<String>,
    pub name: String,
    pub boxes: usize,
    /// Distinct tracks per video, summed over videos.
    pub instances: usize,
}

/// Summary counts of a video dataset split.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatasetStats {
    pub split: String,
    pub video_mode: bool,
    pub videos: usize,
    pub frames: usize,
    pub classes: Vec<ClassStats>,
}

impl DatasetStats {
    pub fn from_videos(
        split: &str,
        classes: &ClassList,
        videos: &[VideoFrames],
        video_mode: bool,
    ) -> Self {
        let mut class_stats: Vec<_> = classes
            .names()
            .iter()
            .enumerate()
            .map(|(index, name)| ClassStats {
                index,
                wn_id: classes.wn_id(index).map(|id| id.to_owned()),
                name: name.clone(),
                boxes: 0,
                instances: 0,
            })
            .collect();

        for video in videos {
            let mut tracks = HashSet::new();

            video
                .iter()
                .flat_map(|(_, labels)| labels)
                .for_each(|label| {
                    let stats = match class_stats.get_mut(label.class) {
                        Some(stats) => stats,
                        None => return,
                    };
                    stats.boxes += 1;

                    let is_new = match label.track {
                        Some(track) => tracks.insert(track),
                        None => true,
                    };
                    if is_new {
                        stats.instances += 1;
                    }
                });
        }

        Self {
            split: split.to_owned(),
            video_mode,
            videos: videos.len(),
            frames: videos.iter().map(|video| video.len()).sum(),
            classes: class_stats,
        }
    }

    pub fn boxes(&self) -> usize {
        self.classes.iter().map(|stats| stats.boxes).sum()
    }

    pub fn instances(&self) -> usize {
        self.classes.iter().map(|stats| stats.instances).sum()
    }
}

impl fmt::Display for DatasetStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{: <10} {}", "Split:", self.split)?;
        writeln!(f, "{: <10} {}", "Videos:", self.videos)?;
        if !self.video_mode {
            writeln!(f, "{: <10} {}", "Frames:", self.frames)?;
        }
        writeln!(f, "{: <10} {}", "Boxes:", self.boxes())?;
        writeln!(f, "{: <10} {}", "Instances:", self.instances())?;
        writeln!(f, "{: <10} {}", "Classes:", self.classes.len())?;
        writeln!(f, "{}", "-".repeat(35))?;
        for stats in &self.classes {
            writeln!(
                f,
                "{: <3} {: <10} {: <15} {} {}",
                stats.index,
                stats.wn_id.as_deref().unwrap_or("-"),
                stats.name,
                stats.boxes,
                stats.instances
            )?;
        }
        writeln!(f, "{}", "-".repeat(35))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instances_count_tracks_per_video() -> Result<()> {
        let names: IndexSet<_> = ["person", "dog"].iter().map(|s| s.to_string()).collect();
        let classes = ClassList::new(names, None, None)?;
        let rect = TLBR::from_xyxy([0.0, 0.0, 1.0, 1.0])?;
        let person = |track| ObjectLabel::new(rect.clone(), 0).with_track(Some(track));

        let videos = vec![
            vec![
                ("v1,0".to_owned(), vec![person(0), person(1)]),
                ("v1,1".to_owned(), vec![person(0)]),
            ],
            vec![("v2,0".to_owned(), vec![person(0)])],
        ];
        let stats = DatasetStats::from_videos("val", &classes, &videos, false);

        assert_eq!(stats.videos, 2);
        assert_eq!(stats.frames, 3);
        assert_eq!(stats.boxes(), 4);
        assert_eq!(stats.instances(), 3);
        assert_eq!(stats.classes[1].boxes, 0);
        assert!(stats.to_string().contains("Instances: 3"));
        Ok(())
    }
}
