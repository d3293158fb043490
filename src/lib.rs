//! Road and car segmentation on the Lyft perception challenge data: label
//! remapping, the `CameraRGB`/`CameraSeg` dataset adapter, augmentation, and
//! the seams to the external Mask R-CNN used for training and inference.

pub mod lyft;

pub use lyft::augment::{AugSample, Augmenter};
pub use lyft::config::{Config, DatasetConfig, Layers, ModelConfig, TrainConfig, TrainStage};
pub use lyft::dataset::{class_ids, class_name, Dataset, LyftDataset, SampleId, Split, SplitView, CLASSES};
pub use lyft::error::{SegError, SegResult};
pub use lyft::labels::{process_labels, HoodExclusion, LabelCodes};
pub use lyft::model::{Detection, Detector, Mode, OnnxDetector, Trainer};
#[cfg(feature = "torch")]
pub use lyft::torch::TorchSegmenter;
