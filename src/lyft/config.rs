//! Hyperparameters for the road/car segmentation run.
//!
//! Every value has a default, so a config file only needs the fields it
//! overrides.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use super::augment::Augmenter;
use super::error::{SegError, SegResult};
use super::labels::{HoodExclusion, LabelCodes};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub dataset: DatasetConfig,
    pub model: ModelConfig,
    pub train: TrainConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    pub root: PathBuf,
    pub image_dir: String,
    pub label_dir: String,
    /// Samples (after sorting) that go to the training split.
    pub train_count: usize,
    /// Side length of the square images and masks handed to the model.
    pub target_size: u32,
    pub codes: LabelCodes,
    pub hood: HoodExclusion,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("Train"),
            image_dir: "CameraRGB".to_string(),
            label_dir: "CameraSeg".to_string(),
            train_count: 900,
            target_size: 256,
            codes: LabelCodes::default(),
            hood: HoodExclusion::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub name: String,
    pub gpu_count: usize,
    pub images_per_gpu: usize,
    /// Background included.
    pub num_classes: usize,
    pub image_min_dim: u32,
    pub image_max_dim: u32,
    pub rpn_anchor_scales: Vec<u32>,
    pub train_rois_per_image: usize,
    pub steps_per_epoch: usize,
    pub validation_steps: usize,
    pub learning_rate: f64,
    pub learning_momentum: f64,
    pub weight_decay: f64,
    pub detection_min_confidence: f32,
    pub gradient_clip_norm: f64,
    /// Subtracted from every RGB pixel before it reaches the network.
    pub mean_pixel: [f32; 3],
    pub intra_threads: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: "lyft_perception_challenge".to_string(),
            gpu_count: 1,
            images_per_gpu: 1,
            num_classes: 1 + 2,
            image_min_dim: 128,
            image_max_dim: 1024,
            rpn_anchor_scales: vec![8, 16, 32, 64, 128],
            train_rois_per_image: 32,
            steps_per_epoch: 100,
            validation_steps: 5,
            learning_rate: 0.001,
            learning_momentum: 0.9,
            weight_decay: 0.0001,
            detection_min_confidence: 0.7,
            gradient_clip_norm: 5.0,
            mean_pixel: [123.7, 116.8, 103.9],
            intra_threads: 4,
        }
    }
}

impl ModelConfig {
    pub fn batch_size(&self) -> usize {
        self.gpu_count * self.images_per_gpu
    }
}

/// Which variables a training stage updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layers {
    Heads,
    JustMrcnnMask,
    All,
}

impl Layers {
    /// Variable name prefixes that stay trainable. Empty means everything.
    pub fn prefixes(&self) -> &'static [&'static str] {
        match self {
            Layers::Heads => &["rpn_", "fpn_", "mrcnn_"],
            Layers::JustMrcnnMask => &["mrcnn_mask"],
            Layers::All => &[],
        }
    }

    pub fn is_trainable(&self, var_name: &str) -> bool {
        let prefixes = self.prefixes();
        prefixes.is_empty() || prefixes.iter().any(|p| var_name.starts_with(p))
    }
}

impl std::str::FromStr for Layers {
    type Err = SegError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "heads" => Ok(Layers::Heads),
            "just_mrcnn_mask" => Ok(Layers::JustMrcnnMask),
            "all" => Ok(Layers::All),
            other => Err(SegError::Config(format!("unknown layer selection {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainStage {
    /// Multiplied with `ModelConfig::learning_rate`.
    pub learning_rate_factor: f64,
    pub epochs: usize,
    pub layers: Layers,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub stages: Vec<TrainStage>,
    pub initial_weights: Option<PathBuf>,
    /// Variables skipped when loading the initial weights (e.g. the class
    /// specific heads of a COCO checkpoint).
    pub exclude: Vec<String>,
    pub output_weights: PathBuf,
    pub augment: bool,
    pub augmentation: Augmenter,
    pub seed: Option<u64>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            stages: vec![TrainStage {
                learning_rate_factor: 0.1,
                epochs: 30,
                layers: Layers::All,
            }],
            initial_weights: None,
            exclude: Vec::new(),
            output_weights: PathBuf::from("mask_rcnn_lyft.pt"),
            augment: true,
            augmentation: Augmenter::default(),
            seed: None,
        }
    }
}

impl Config {
    pub fn from_json_file(path: &Path) -> SegResult<Self> {
        let raw = fs::read(path).map_err(|e| SegError::io(path, e))?;
        let config: Config = serde_json::from_slice(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SegResult<()> {
        if self.dataset.target_size == 0 {
            return Err(SegError::Config("target_size must be > 0".to_string()));
        }
        if self.dataset.hood.reference_height == 0 {
            return Err(SegError::Config("hood.reference_height must be > 0".to_string()));
        }
        if self.model.batch_size() == 0 {
            return Err(SegError::Config("gpu_count * images_per_gpu must be > 0".to_string()));
        }
        if self.model.num_classes != 1 + 2 {
            return Err(SegError::Config(format!(
                "num_classes is {} but the dataset provides background + 2",
                self.model.num_classes
            )));
        }
        for (i, stage) in self.train.stages.iter().enumerate() {
            if stage.epochs == 0 {
                return Err(SegError::Config(format!("stages[{i}] has zero epochs")));
            }
            if !(stage.learning_rate_factor > 0.0) {
                return Err(SegError::Config(format!(
                    "stages[{i}] learning_rate_factor must be positive"
                )));
            }
        }
        self.train.augmentation.validate()
    }

    // Logs every value at startup.
    pub fn display(&self) {
        info!("Configurations:");
        info!("NAME                      {}", self.model.name);
        info!("GPU_COUNT                 {}", self.model.gpu_count);
        info!("IMAGES_PER_GPU            {}", self.model.images_per_gpu);
        info!("BATCH_SIZE                {}", self.model.batch_size());
        info!("NUM_CLASSES               {}", self.model.num_classes);
        info!("IMAGE_MIN_DIM             {}", self.model.image_min_dim);
        info!("IMAGE_MAX_DIM             {}", self.model.image_max_dim);
        info!("RPN_ANCHOR_SCALES         {:?}", self.model.rpn_anchor_scales);
        info!("TRAIN_ROIS_PER_IMAGE      {}", self.model.train_rois_per_image);
        info!("STEPS_PER_EPOCH           {}", self.model.steps_per_epoch);
        info!("VALIDATION_STEPS          {}", self.model.validation_steps);
        info!("LEARNING_RATE             {}", self.model.learning_rate);
        info!("LEARNING_MOMENTUM         {}", self.model.learning_momentum);
        info!("WEIGHT_DECAY              {}", self.model.weight_decay);
        info!("DETECTION_MIN_CONFIDENCE  {}", self.model.detection_min_confidence);
        info!("GRADIENT_CLIP_NORM        {}", self.model.gradient_clip_norm);
        info!("MEAN_PIXEL                {:?}", self.model.mean_pixel);
        info!("DATASET_ROOT              {}", self.dataset.root.display());
        info!("TRAIN_COUNT               {}", self.dataset.train_count);
        info!("TARGET_SIZE               {}", self.dataset.target_size);
        for (i, stage) in self.train.stages.iter().enumerate() {
            info!(
                "STAGE[{i}]                  lr={} epochs={} layers={:?}",
                self.model.learning_rate * stage.learning_rate_factor,
                stage.epochs,
                stage.layers
            );
        }
    }
}
