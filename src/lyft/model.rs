//! The segmentation network is an external collaborator: this module only
//! defines what the driver needs from it and the tensor layout it exchanges.
//!
//! Images go in molded: NHWC f32 with the mean pixel subtracted. Detections
//! come back as per-instance mask probabilities `[N, K, H, W]`, class ids
//! `[N, K]` and optional scores `[N, K]`.

use ndarray::Array3;
use ort::{inputs, GraphOptimizationLevel, Session, Tensor};
use rand::seq::SliceRandom;
use rand::Rng;
use std::path::Path;
use tracing::{debug, info};

use super::augment::{AugSample, Augmenter};
use super::config::{ModelConfig, TrainStage};
use super::dataset::{SampleId, SplitView};
use super::error::{SegError, SegResult};

pub const MASK_THRESHOLD: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Training,
    Inference,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// HxWxK binary masks, one channel per kept instance.
    pub masks: Array3<u8>,
    pub class_ids: Vec<i32>,
    pub scores: Vec<f32>,
}

pub trait Detector {
    fn detect(&mut self, images: &[Array3<u8>]) -> SegResult<Vec<Detection>>;
}

pub trait Trainer {
    /// With `by_name` only variables present in the file are loaded; names in
    /// `exclude` keep their current values either way.
    fn load_weights(&mut self, path: &Path, by_name: bool, exclude: &[String]) -> SegResult<()>;

    fn train(
        &mut self,
        train: &SplitView<'_>,
        val: &SplitView<'_>,
        stage: &TrainStage,
        augmentation: Option<&Augmenter>,
    ) -> SegResult<()>;

    fn save_weights(&self, path: &Path) -> SegResult<()>;
}

/// Flattens HxWx3 images into one NHWC buffer minus the mean pixel.
pub fn mold_images(images: &[Array3<u8>], mean_pixel: [f32; 3]) -> SegResult<(Vec<i64>, Vec<f32>)> {
    let Some(first) = images.first() else {
        return Err(SegError::Model("no images to mold".to_string()));
    };
    let (height, width, _) = first.dim();
    let mut data = Vec::with_capacity(images.len() * height * width * 3);
    for (i, img) in images.iter().enumerate() {
        if img.dim() != (height, width, 3) {
            return Err(SegError::Model(format!(
                "image {i} is {:?}, expected {:?}",
                img.dim(),
                (height, width, 3)
            )));
        }
        for ((_, _, c), v) in img.indexed_iter() {
            data.push(*v as f32 - mean_pixel[c]);
        }
    }
    let shape = vec![images.len() as i64, height as i64, width as i64, 3];

    Ok((shape, data))
}

/// Turns raw network outputs into per-image detections, dropping instances
/// scored below `min_confidence` and thresholding mask probabilities.
pub fn unmold_detections(
    mask_shape: &[i64],
    masks: &[f32],
    class_ids: &[i64],
    scores: Option<&[f32]>,
    min_confidence: f32,
) -> SegResult<Vec<Detection>> {
    let &[n, k, h, w] = mask_shape else {
        return Err(SegError::Model(format!("masks output has shape {mask_shape:?}, expected 4 dims")));
    };
    let (n, k, h, w) = (n as usize, k as usize, h as usize, w as usize);
    if masks.len() != n * k * h * w || class_ids.len() != n * k {
        return Err(SegError::Model(format!(
            "output sizes disagree: {} mask values, {} class ids for shape {mask_shape:?}",
            masks.len(),
            class_ids.len()
        )));
    }
    if scores.is_some_and(|s| s.len() != n * k) {
        return Err(SegError::Model("scores output does not match class ids".to_string()));
    }

    let mut detections = Vec::with_capacity(n);
    for b in 0..n {
        let keep: Vec<usize> = (0..k)
            .filter(|&i| class_ids[b * k + i] > 0)
            .filter(|&i| scores.map_or(true, |s| s[b * k + i] >= min_confidence))
            .collect();
        let mut out = Array3::<u8>::zeros((h, w, keep.len()));
        for (c, &i) in keep.iter().enumerate() {
            let offset = (b * k + i) * h * w;
            let plane = &masks[offset..offset + h * w];
            for (p, prob) in plane.iter().enumerate() {
                if *prob >= MASK_THRESHOLD {
                    out[[p / w, p % w, c]] = 1;
                }
            }
        }
        detections.push(Detection {
            masks: out,
            class_ids: keep.iter().map(|&i| class_ids[b * k + i] as i32).collect(),
            scores: keep.iter().map(|&i| scores.map_or(1.0, |s| s[b * k + i])).collect(),
        });
    }

    Ok(detections)
}

/// Molded inputs and targets for one optimisation step.
#[derive(Debug, Clone)]
pub struct Batch {
    pub ids: Vec<SampleId>,
    pub image_shape: Vec<i64>,
    pub images: Vec<f32>,
    /// NHWC, one channel per class.
    pub mask_shape: Vec<i64>,
    pub masks: Vec<f32>,
    /// `[N, C]`
    pub class_ids: Vec<i64>,
}

// Loads, optionally augments and molds the given samples.
pub fn load_batch<R: Rng + ?Sized>(
    view: &SplitView<'_>,
    ids: &[SampleId],
    augmentation: Option<&Augmenter>,
    mean_pixel: [f32; 3],
    rng: &mut R,
) -> SegResult<Batch> {
    let mut images = Vec::with_capacity(ids.len());
    let mut masks = Vec::with_capacity(ids.len());
    let mut class_ids = Vec::new();
    for id in ids {
        let image = view.dataset.load_image(id)?;
        let (mask, classes) = view.dataset.load_mask(id)?;
        let (image, mask) = match augmentation {
            Some(policy) => {
                let mut sample = AugSample::from_arrays(&image, &mask);
                policy.apply(&mut sample, rng);
                sample.into_arrays()
            }
            None => (image, mask),
        };
        if image.dim().0 != mask.dim().0 || image.dim().1 != mask.dim().1 {
            return Err(SegError::Model(format!(
                "{id}: image {:?} and mask {:?} disagree after augmentation",
                image.dim(),
                mask.dim()
            )));
        }
        class_ids.extend(classes.iter().map(|&c| c as i64));
        images.push(image);
        masks.push(mask);
    }

    let (image_shape, image_data) = mold_images(&images, mean_pixel)?;
    let (h, w, c) = masks.first().map(|m| m.dim()).unwrap_or((0, 0, 0));
    if masks.iter().any(|m| m.dim() != (h, w, c)) {
        return Err(SegError::Model("masks in a batch differ in shape".to_string()));
    }
    let mask_data: Vec<f32> = masks.iter().flat_map(|m| m.iter().map(|&v| v as f32)).collect();

    Ok(Batch {
        ids: ids.to_vec(),
        image_shape,
        images: image_data,
        mask_shape: vec![ids.len() as i64, h as i64, w as i64, c as i64],
        masks: mask_data,
        class_ids,
    })
}

/// Cycles through a shuffled copy of `samples`, reshuffling on every pass,
/// yielding `steps` batches of `batch_size`.
pub fn epoch_batches<R: Rng + ?Sized>(
    samples: &[SampleId],
    steps: usize,
    batch_size: usize,
    rng: &mut R,
) -> Vec<Vec<SampleId>> {
    if samples.is_empty() || batch_size == 0 {
        return Vec::new();
    }
    let mut order: Vec<SampleId> = samples.to_vec();
    order.shuffle(rng);
    let mut cursor = 0;
    let mut batches = Vec::with_capacity(steps);
    for _ in 0..steps {
        let mut batch = Vec::with_capacity(batch_size);
        while batch.len() < batch_size {
            if cursor == order.len() {
                order.shuffle(rng);
                cursor = 0;
            }
            batch.push(order[cursor].clone());
            cursor += 1;
        }
        batches.push(batch);
    }
    batches
}

fn load_model(model_path: &Path, intra_threads: usize) -> SegResult<Session> {
    let model = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(intra_threads)?
        .commit_from_file(model_path)?;

    Ok(model)
}

/// Inference through an exported ONNX graph.
pub struct OnnxDetector {
    session: Session,
    mean_pixel: [f32; 3],
    min_confidence: f32,
}

impl OnnxDetector {
    pub fn new(model_path: &Path, config: &ModelConfig) -> SegResult<Self> {
        info!("Loading ONNX model from {}", model_path.display());
        Ok(Self {
            session: load_model(model_path, config.intra_threads.max(1))?,
            mean_pixel: config.mean_pixel,
            min_confidence: config.detection_min_confidence,
        })
    }
}

impl Detector for OnnxDetector {
    fn detect(&mut self, images: &[Array3<u8>]) -> SegResult<Vec<Detection>> {
        let (shape, data) = mold_images(images, self.mean_pixel)?;
        let input_tensor = Tensor::from_array((shape, data))?;
        let outputs = self.session.run(inputs!["images" => input_tensor]?)?;

        let missing = |name: &str| SegError::Model(format!("model has no {name:?} output"));
        let (mask_shape, masks) = outputs
            .get("masks")
            .ok_or_else(|| missing("masks"))?
            .try_extract_raw_tensor::<f32>()?;
        let (_, class_ids) = outputs
            .get("class_ids")
            .ok_or_else(|| missing("class_ids"))?
            .try_extract_raw_tensor::<i64>()?;
        let scores = match outputs.get("scores") {
            Some(value) => Some(value.try_extract_raw_tensor::<f32>()?.1),
            None => None,
        };
        debug!("masks output shape {:?}", mask_shape);

        unmold_detections(&mask_shape, masks, class_ids, scores, self.min_confidence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn mold_subtracts_mean_in_nhwc_order() {
        let mut img = Array3::<u8>::zeros((2, 2, 3));
        img[[1, 0, 2]] = 200;
        let (shape, data) = mold_images(&[img.clone(), img], [10.0, 20.0, 30.0]).unwrap();
        assert_eq!(shape, vec![2, 2, 2, 3]);
        assert_eq!(data.len(), 24);
        assert_eq!(data[0], -10.0);
        assert_eq!(data[1], -20.0);
        // (y=1, x=0, c=2) of the first image
        assert_eq!(data[6 + 2], 170.0);
    }

    #[test]
    fn mold_rejects_mixed_shapes() {
        let a = Array3::<u8>::zeros((2, 2, 3));
        let b = Array3::<u8>::zeros((3, 2, 3));
        assert!(mold_images(&[a, b], [0.0; 3]).is_err());
        assert!(mold_images(&[], [0.0; 3]).is_err());
    }

    #[test]
    fn unmold_filters_background_and_low_scores() {
        // one image, three instances on a 2x2 grid
        let masks = vec![
            0.9, 0.1, 0.6, 0.0, //
            1.0, 1.0, 1.0, 1.0, //
            0.0, 0.0, 0.0, 0.7,
        ];
        let class_ids = vec![1, 0, 2];
        let scores = vec![0.95, 0.99, 0.4];
        let out = unmold_detections(&[1, 3, 2, 2], &masks, &class_ids, Some(&scores), 0.7).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].class_ids, vec![1]);
        assert_eq!(out[0].masks.dim(), (2, 2, 1));
        assert_eq!(out[0].masks[[0, 0, 0]], 1);
        assert_eq!(out[0].masks[[0, 1, 0]], 0);
        assert_eq!(out[0].masks[[1, 0, 0]], 1);

        let all = unmold_detections(&[1, 3, 2, 2], &masks, &class_ids, None, 0.7).unwrap();
        assert_eq!(all[0].class_ids, vec![1, 2]);
        assert_eq!(all[0].scores, vec![1.0, 1.0]);
    }

    #[test]
    fn unmold_rejects_bad_shapes() {
        assert!(unmold_detections(&[1, 1, 2], &[0.0; 4], &[1], None, 0.5).is_err());
        assert!(unmold_detections(&[1, 1, 2, 2], &[0.0; 3], &[1], None, 0.5).is_err());
    }

    #[test]
    fn epoch_batches_cycle_through_every_sample() {
        let samples: Vec<SampleId> = (0..5).map(|i| SampleId::new(format!("{i}.png"))).collect();
        let mut rng = StdRng::seed_from_u64(3);
        let batches = epoch_batches(&samples, 5, 2, &mut rng);
        assert_eq!(batches.len(), 5);
        assert!(batches.iter().all(|b| b.len() == 2));
        let first_pass: std::collections::BTreeSet<_> = batches.iter().flatten().take(5).cloned().collect();
        assert_eq!(first_pass.len(), 5);
        assert!(epoch_batches(&[], 5, 2, &mut rng).is_empty());
    }
}
