//! Training and inference through a scripted (TorchScript) Mask R-CNN.
//!
//! The scripted module owns the architecture and the losses. In train mode
//! `forward(images, masks, class_ids)` returns the summed scalar loss; in eval
//! mode `forward(images)` returns `(masks, class_ids[, scores])`.

use ndarray::Array3;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::Path;
use tch::nn::{self, OptimizerConfig};
use tch::{Device, IValue, Kind, Tensor, TrainableCModule};
use tracing::{debug, info, warn};

use super::augment::Augmenter;
use super::config::{Layers, ModelConfig, TrainStage};
use super::dataset::SplitView;
use super::error::{SegError, SegResult};
use super::model::{epoch_batches, load_batch, mold_images, unmold_detections, Batch, Detection, Detector, Mode, Trainer};

pub struct TorchSegmenter {
    vs: nn::VarStore,
    module: TrainableCModule,
    config: ModelConfig,
    mode: Mode,
    rng: StdRng,
}

impl TorchSegmenter {
    pub fn new(script_path: &Path, config: &ModelConfig, mode: Mode, seed: Option<u64>) -> SegResult<Self> {
        let device = Device::cuda_if_available();
        info!("Loading TorchScript model from {} on {:?}", script_path.display(), device);
        let vs = nn::VarStore::new(device);
        let mut module = TrainableCModule::load(script_path, vs.root())?;
        match mode {
            Mode::Training => module.set_train(),
            Mode::Inference => module.set_eval(),
        }
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Ok(Self {
            vs,
            module,
            config: config.clone(),
            mode,
            rng,
        })
    }

    fn to_tensor(&self, data: &[f32], shape: &[i64]) -> Tensor {
        Tensor::from_slice(data).view(shape).to_device(self.vs.device())
    }

    fn batch_loss(&self, batch: &Batch) -> SegResult<Tensor> {
        let images = self.to_tensor(&batch.images, &batch.image_shape);
        let masks = self.to_tensor(&batch.masks, &batch.mask_shape);
        let classes = Tensor::from_slice(&batch.class_ids)
            .view([batch.ids.len() as i64, -1])
            .to_device(self.vs.device());
        Ok(self.module.inner.forward_ts(&[images, masks, classes])?)
    }

    fn freeze(&mut self, layers: Layers) {
        let mut trainable = 0;
        for (name, var) in self.vs.variables() {
            let keep = layers.is_trainable(&name);
            let _ = var.set_requires_grad(keep);
            if keep {
                trainable += 1;
            }
        }
        info!("{:?}: {} trainable variables", layers, trainable);
    }

    fn clip_gradients(&self) {
        let max_norm = self.config.gradient_clip_norm;
        if max_norm <= 0.0 {
            return;
        }
        tch::no_grad(|| {
            let grads: Vec<Tensor> = self
                .vs
                .trainable_variables()
                .iter()
                .map(|v| v.grad())
                .filter(|g| g.defined())
                .collect();
            let total = grads
                .iter()
                .map(|g| {
                    let n = g.norm().double_value(&[]);
                    n * n
                })
                .sum::<f64>()
                .sqrt();
            if total > max_norm {
                let scale = max_norm / (total + 1e-6);
                for mut g in grads {
                    let _ = g.g_mul_scalar_(scale);
                }
            }
        });
    }
}

fn tensor_to_vec<T: tch::kind::Element>(t: &Tensor, kind: Kind) -> SegResult<Vec<T>> {
    let flat = t.to_kind(kind).to_device(Device::Cpu).flatten(0, -1);
    Ok(Vec::<T>::try_from(&flat)?)
}

impl Trainer for TorchSegmenter {
    fn load_weights(&mut self, path: &Path, by_name: bool, exclude: &[String]) -> SegResult<()> {
        info!("Loading weights from {}", path.display());
        let kept: Vec<(String, Tensor)> = self
            .vs
            .variables()
            .into_iter()
            .filter(|(name, _)| exclude.iter().any(|e| name.starts_with(e.as_str())))
            .map(|(name, var)| (name, var.detach().copy()))
            .collect();

        if by_name {
            let missing = self.vs.load_partial(path)?;
            if !missing.is_empty() {
                warn!("{} variables not found in {}", missing.len(), path.display());
                debug!("missing: {:?}", missing);
            }
        } else {
            self.vs.load(path)?;
        }

        let vars = self.vs.variables();
        tch::no_grad(|| {
            for (name, saved) in &kept {
                if let Some(var) = vars.get(name) {
                    let mut var = var.shallow_clone();
                    var.copy_(saved);
                }
            }
        });
        if !kept.is_empty() {
            info!("kept {} excluded variables at their initial values", kept.len());
        }
        Ok(())
    }

    fn train(
        &mut self,
        train: &SplitView<'_>,
        val: &SplitView<'_>,
        stage: &TrainStage,
        augmentation: Option<&Augmenter>,
    ) -> SegResult<()> {
        if self.mode != Mode::Training {
            return Err(SegError::Model("model was built for inference".to_string()));
        }
        if train.is_empty() {
            return Err(SegError::Config("training split is empty".to_string()));
        }
        let lr = self.config.learning_rate * stage.learning_rate_factor;
        let batch_size = self.config.batch_size();
        let mean_pixel = self.config.mean_pixel;
        info!(
            "Training {:?} for {} epochs at lr={} ({} train / {} val samples)",
            stage.layers,
            stage.epochs,
            lr,
            train.len(),
            val.len()
        );

        self.freeze(stage.layers);
        self.module.set_train();
        let mut opt = nn::Sgd {
            momentum: self.config.learning_momentum,
            dampening: 0.0,
            wd: self.config.weight_decay,
            nesterov: false,
        }
        .build(&self.vs, lr)?;

        for epoch in 1..=stage.epochs {
            let batches = epoch_batches(&train.samples, self.config.steps_per_epoch, batch_size, &mut self.rng);
            let mut total = 0.0;
            for ids in &batches {
                let batch = load_batch(train, ids, augmentation, mean_pixel, &mut self.rng)?;
                let loss = self.batch_loss(&batch)?;
                opt.zero_grad();
                loss.backward();
                self.clip_gradients();
                opt.step();
                total += loss.double_value(&[]);
            }
            let train_loss = total / batches.len().max(1) as f64;

            let val_batches = epoch_batches(&val.samples, self.config.validation_steps, batch_size, &mut self.rng);
            let mut val_total = 0.0;
            for ids in &val_batches {
                let batch = load_batch(val, ids, None, mean_pixel, &mut self.rng)?;
                let loss = tch::no_grad(|| self.batch_loss(&batch))?;
                val_total += loss.double_value(&[]);
            }
            if val_batches.is_empty() {
                info!("epoch {epoch}/{} loss={train_loss:.4}", stage.epochs);
            } else {
                let val_loss = val_total / val_batches.len() as f64;
                info!("epoch {epoch}/{} loss={train_loss:.4} val_loss={val_loss:.4}", stage.epochs);
            }
        }
        Ok(())
    }

    fn save_weights(&self, path: &Path) -> SegResult<()> {
        self.vs.save(path)?;
        info!("Saved weights to {}", path.display());
        Ok(())
    }
}

impl Detector for TorchSegmenter {
    fn detect(&mut self, images: &[Array3<u8>]) -> SegResult<Vec<Detection>> {
        self.module.set_eval();
        let (shape, data) = mold_images(images, self.config.mean_pixel)?;
        let input = self.to_tensor(&data, &shape);
        let output = tch::no_grad(|| self.module.inner.forward_is(&[IValue::Tensor(input)]))?;
        let IValue::Tuple(parts) = output else {
            return Err(SegError::Model("expected a (masks, class_ids[, scores]) tuple".to_string()));
        };
        let tensors: Vec<Tensor> = parts
            .into_iter()
            .filter_map(|v| match v {
                IValue::Tensor(t) => Some(t),
                _ => None,
            })
            .collect();
        if tensors.len() < 2 {
            return Err(SegError::Model(format!("expected at least 2 tensors, got {}", tensors.len())));
        }

        let mask_shape = tensors[0].size();
        let masks: Vec<f32> = tensor_to_vec(&tensors[0], Kind::Float)?;
        let class_ids: Vec<i64> = tensor_to_vec(&tensors[1], Kind::Int64)?;
        let scores: Option<Vec<f32>> = match tensors.get(2) {
            Some(t) => Some(tensor_to_vec(t, Kind::Float)?),
            None => None,
        };

        unmold_detections(
            &mask_shape,
            &masks,
            &class_ids,
            scores.as_deref(),
            self.config.detection_min_confidence,
        )
    }
}
