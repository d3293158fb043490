use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use lyft_seg::lyft::overlay::{channel_counts, overlay_on};
use lyft_seg::lyft::transforms::{image_to_ndarray, ndarray_to_image, resize_square};
use lyft_seg::{class_name, Config, Dataset, Detector, LyftDataset, OnnxDetector, Split};

#[derive(Parser, Debug)]
#[command(name = "lyft_seg", about = "Road and car segmentation for the Lyft perception challenge")]
struct Cli {
	/// JSON file overriding the built-in hyperparameters.
	#[arg(long, global = true)]
	config: Option<PathBuf>,
	/// Log at debug level (RUST_LOG takes precedence).
	#[arg(long, short, global = true)]
	verbose: bool,
	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Train on <root>/CameraRGB + <root>/CameraSeg.
	Train(TrainArgs),
	/// Run an exported model on images and write colorized overlays.
	Detect(DetectArgs),
	/// Write ground-truth overlays for a split.
	Inspect(InspectArgs),
}

#[derive(Args, Debug)]
#[cfg_attr(not(feature = "torch"), allow(dead_code))]
struct TrainArgs {
	#[arg(long)]
	root: Option<PathBuf>,
	/// Scripted model holding the architecture and losses.
	#[arg(long, default_value = "mask_rcnn.ts")]
	model: PathBuf,
	/// Initial weights, loaded by name.
	#[arg(long)]
	weights: Option<PathBuf>,
	#[arg(long)]
	output: Option<PathBuf>,
	#[arg(long)]
	seed: Option<u64>,
	#[arg(long)]
	no_augment: bool,
}

#[derive(Args, Debug)]
struct DetectArgs {
	/// ONNX export of the trained model.
	#[arg(long)]
	model: PathBuf,
	#[arg(long, default_value = "overlays")]
	output: PathBuf,
	#[arg(long, default_value_t = 0.5)]
	alpha: f32,
	#[arg(required = true)]
	images: Vec<PathBuf>,
}

#[derive(Args, Debug)]
struct InspectArgs {
	#[arg(long)]
	root: Option<PathBuf>,
	#[arg(long, default_value = "train")]
	split: String,
	#[arg(long)]
	limit: Option<usize>,
	/// Where to write overlays; only counts are logged when absent.
	#[arg(long)]
	output: Option<PathBuf>,
	#[arg(long, default_value_t = 0.5)]
	alpha: f32,
}

fn main() -> Result<()> {
	let cli = Cli::parse();
	let default_level = if cli.verbose { "debug" } else { "info" };
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
		.init();

	let config = match &cli.config {
		Some(path) => Config::from_json_file(path).with_context(|| format!("loading config {}", path.display()))?,
		None => Config::default(),
	};

	match cli.command {
		Command::Train(args) => run_train(config, args),
		Command::Detect(args) => run_detect(config, args),
		Command::Inspect(args) => run_inspect(config, args),
	}
}

fn overlay_path(output_dir: &Path, source: &Path) -> PathBuf {
	let stem = source.file_stem().and_then(|s| s.to_str()).unwrap_or("image");
	output_dir.join(format!("{stem}_overlay.png"))
}

#[cfg(feature = "torch")]
fn run_train(mut config: Config, args: TrainArgs) -> Result<()> {
	use lyft_seg::{Mode, SplitView, TorchSegmenter, Trainer};

	if let Some(root) = args.root {
		config.dataset.root = root;
	}
	if let Some(weights) = args.weights {
		config.train.initial_weights = Some(weights);
	}
	if let Some(output) = args.output {
		config.train.output_weights = output;
	}
	if args.seed.is_some() {
		config.train.seed = args.seed;
	}
	if args.no_augment {
		config.train.augment = false;
	}
	config.validate()?;
	config.display();

	let dataset = LyftDataset::new(config.dataset.clone());
	let train = SplitView::new(&dataset, "train")?;
	let val = SplitView::new(&dataset, "val")?;
	info!("{} train / {} val samples under {}", train.len(), val.len(), config.dataset.root.display());

	let mut model = TorchSegmenter::new(&args.model, &config.model, Mode::Training, config.train.seed)
		.with_context(|| format!("loading {}", args.model.display()))?;
	if let Some(weights) = &config.train.initial_weights {
		model.load_weights(weights, true, &config.train.exclude)?;
	}

	info!("Training ...");
	let augmentation = config.train.augment.then_some(&config.train.augmentation);
	for stage in &config.train.stages {
		model.train(&train, &val, stage, augmentation)?;
	}

	if let Some(parent) = config.train.output_weights.parent() {
		if !parent.as_os_str().is_empty() {
			fs::create_dir_all(parent)?;
		}
	}
	model.save_weights(&config.train.output_weights)?;
	info!("mask loads during training: {}", dataset.mask_loads());
	Ok(())
}

#[cfg(not(feature = "torch"))]
fn run_train(_config: Config, _args: TrainArgs) -> Result<()> {
	anyhow::bail!("training needs libtorch; rebuild with `--features torch`")
}

fn run_detect(config: Config, args: DetectArgs) -> Result<()> {
	config.validate()?;
	fs::create_dir_all(&args.output).with_context(|| format!("creating {}", args.output.display()))?;
	let mut detector = OnnxDetector::new(&args.model, &config.model)?;
	let size = config.dataset.target_size;

	for batch in args.images.chunks(config.model.batch_size()) {
		let mut originals = Vec::with_capacity(batch.len());
		let mut inputs = Vec::with_capacity(batch.len());
		for path in batch {
			let img = image::open(path).with_context(|| format!("reading {}", path.display()))?;
			inputs.push(image_to_ndarray(&resize_square(&img, size)));
			originals.push(img.to_rgb8());
		}

		let detections = detector.detect(&inputs)?;
		for ((path, original), detection) in batch.iter().zip(&originals).zip(&detections) {
			let names: Vec<&str> = detection.class_ids.iter().map(|&id| class_name(id).unwrap_or("?")).collect();
			info!("{}: {} instances {:?}", path.display(), detection.class_ids.len(), names);
			let out = overlay_on(original, &detection.masks, &detection.class_ids, args.alpha);
			let out_path = overlay_path(&args.output, path);
			out.save(&out_path).with_context(|| format!("writing {}", out_path.display()))?;
		}
	}
	Ok(())
}

fn run_inspect(mut config: Config, args: InspectArgs) -> Result<()> {
	if let Some(root) = args.root {
		config.dataset.root = root;
	}
	config.validate()?;
	let split: Split = args.split.parse()?;
	let dataset = LyftDataset::new(config.dataset.clone());
	let samples = dataset.enumerate(&args.split)?;
	info!("{split}: {} samples", samples.len());
	if let Some(dir) = &args.output {
		fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
	}

	for sample in samples.iter().take(args.limit.unwrap_or(usize::MAX)) {
		let (mask, class_ids) = match dataset.load_mask(sample) {
			Ok(loaded) => loaded,
			Err(e) => {
				warn!("{}: {e}", dataset.image_reference(sample));
				continue;
			}
		};
		let counts = channel_counts(&mask);
		info!("{sample}: road={} car={}", counts[0], counts[1]);

		if let Some(dir) = &args.output {
			let image = ndarray_to_image(&dataset.load_image(sample)?);
			let out = overlay_on(&image, &mask, &class_ids, args.alpha);
			let out_path = overlay_path(dir, Path::new(sample.as_str()));
			out.save(&out_path).with_context(|| format!("writing {}", out_path.display()))?;
		}
	}
	Ok(())
}
