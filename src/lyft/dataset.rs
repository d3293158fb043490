//! Dataset adapter over a `CameraRGB` / `CameraSeg` directory pair.
//!
//! Samples are discovered by listing the image directory; the label raster of
//! a sample lives in the sibling label directory under the same filename.

use ndarray::Array3;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, trace};

use super::config::DatasetConfig;
use super::error::{SegError, SegResult};
use super::labels::process_labels;
use super::transforms::{image_to_ndarray, label_channel, resize_mask, resize_square};

pub const SOURCE: &str = "lyft_perception_challenge";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassInfo {
    pub id: i32,
    pub name: &'static str,
}

/// Classes in mask channel order. Id 0 is the implicit background.
pub const CLASSES: [ClassInfo; 2] = [
    ClassInfo { id: 1, name: "road" },
    ClassInfo { id: 2, name: "car" },
];

pub fn class_ids() -> Vec<i32> {
    CLASSES.iter().map(|c| c.id).collect()
}

pub fn class_name(id: i32) -> Option<&'static str> {
    CLASSES.iter().find(|c| c.id == id).map(|c| c.name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Val,
}

impl FromStr for Split {
    type Err = SegError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "train" => Ok(Split::Train),
            "val" => Ok(Split::Val),
            other => Err(SegError::InvalidSplit { split: other.to_string() }),
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Split::Train => write!(f, "train"),
            Split::Val => write!(f, "val"),
        }
    }
}

/// A sample is identified by its filename.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SampleId(String);

impl SampleId {
    pub fn new(name: impl Into<String>) -> Self {
        SampleId(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SampleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// First `train_count` names train, the rest val.
pub fn split_samples<T: Clone>(sorted: &[T], train_count: usize, split: Split) -> Vec<T> {
    let boundary = train_count.min(sorted.len());
    match split {
        Split::Train => sorted[..boundary].to_vec(),
        Split::Val => sorted[boundary..].to_vec(),
    }
}

pub trait Dataset {
    fn enumerate(&self, split: &str) -> SegResult<Vec<SampleId>>;

    /// HxWx3 image at the dataset's target resolution.
    fn load_image(&self, sample: &SampleId) -> SegResult<Array3<u8>>;

    /// HxWxC binary mask plus the class id of every channel.
    fn load_mask(&self, sample: &SampleId) -> SegResult<(Array3<u8>, Vec<i32>)>;

    fn image_reference(&self, sample: &SampleId) -> String {
        sample.as_str().to_string()
    }
}

pub struct LyftDataset {
    config: DatasetConfig,
    mask_loads: AtomicUsize,
}

impl LyftDataset {
    pub fn new(config: DatasetConfig) -> Self {
        Self {
            config,
            mask_loads: AtomicUsize::new(0),
        }
    }

    pub fn image_dir(&self) -> PathBuf {
        self.config.root.join(&self.config.image_dir)
    }

    pub fn label_dir(&self) -> PathBuf {
        self.config.root.join(&self.config.label_dir)
    }

    pub fn image_path(&self, sample: &SampleId) -> PathBuf {
        self.image_dir().join(sample.as_str())
    }

    pub fn label_path(&self, sample: &SampleId) -> PathBuf {
        self.label_dir().join(sample.as_str())
    }

    /// Number of `load_mask` calls so far.
    pub fn mask_loads(&self) -> usize {
        self.mask_loads.load(Ordering::Relaxed)
    }

    /// Every image filename, sorted so the split does not depend on the
    /// order the filesystem lists entries in.
    pub fn list_samples(&self) -> SegResult<Vec<SampleId>> {
        let dir = self.image_dir();
        let entries = fs::read_dir(&dir).map_err(|e| SegError::io(&dir, e))?;
        let mut samples = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| SegError::io(&dir, e))?;
            // metadata follows symlinks; a dangling link is listed and fails on load
            if fs::metadata(entry.path()).is_ok_and(|m| m.is_dir()) {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(name) => samples.push(SampleId(name)),
                Err(name) => debug!("skipping non utf-8 filename {:?}", name),
            }
        }
        samples.sort();

        Ok(samples)
    }
}

fn open_image(path: &Path) -> SegResult<image::DynamicImage> {
    image::open(path).map_err(|e| SegError::image(path, e))
}

impl Dataset for LyftDataset {
    fn enumerate(&self, split: &str) -> SegResult<Vec<SampleId>> {
        let split: Split = split.parse()?;
        let all = self.list_samples()?;
        let samples = split_samples(&all, self.config.train_count, split);
        debug!("{SOURCE} {split}: {} of {} samples", samples.len(), all.len());
        for sample in &samples {
            debug!("[image] {}", self.image_path(sample).display());
        }

        Ok(samples)
    }

    fn load_image(&self, sample: &SampleId) -> SegResult<Array3<u8>> {
        let path = self.image_path(sample);
        let img = open_image(&path)?;
        let resized = resize_square(&img, self.config.target_size);

        Ok(image_to_ndarray(&resized))
    }

    fn load_mask(&self, sample: &SampleId) -> SegResult<(Array3<u8>, Vec<i32>)> {
        let count = self.mask_loads.fetch_add(1, Ordering::Relaxed) + 1;
        trace!("load_mask #{count} {}", sample);

        let label_path = self.label_path(sample);
        let label_img = open_image(&label_path)?;
        let image_path = self.image_path(sample);
        let image_dims = image::image_dimensions(&image_path).map_err(|e| SegError::image(&image_path, e))?;
        let label_dims = (label_img.width(), label_img.height());
        if image_dims != label_dims {
            return Err(SegError::ShapeMismatch {
                path: label_path,
                image: image_dims,
                label: label_dims,
            });
        }

        let labels = label_channel(&label_img);
        let mask = process_labels(labels.view(), &self.config.codes, &self.config.hood);
        let mask = resize_mask(&mask, self.config.target_size);

        Ok((mask, class_ids()))
    }
}

/// One split of a dataset, enumerated up front.
pub struct SplitView<'a> {
    pub dataset: &'a dyn Dataset,
    pub split: Split,
    pub samples: Vec<SampleId>,
}

impl<'a> SplitView<'a> {
    pub fn new(dataset: &'a dyn Dataset, split: &str) -> SegResult<Self> {
        let parsed: Split = split.parse()?;
        let samples = dataset.enumerate(split)?;
        Ok(Self {
            dataset,
            split: parsed,
            samples,
        })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
