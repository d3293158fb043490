//! Dataset adapter tests against synthetic CameraRGB / CameraSeg trees.

use image::{GrayImage, ImageBuffer, Luma, Rgb, RgbImage, Rgba, RgbaImage};
use lyft_seg::lyft::model::load_batch;
use lyft_seg::{Augmenter, Dataset, DatasetConfig, LyftDataset, SampleId, SegError, Split, SplitView};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fs;
use std::path::Path;

const WIDTH: u32 = 80;
const HEIGHT: u32 = 60;

// Road in the top-left block, a car in the middle, and the hood at the bottom.
fn label_raster(width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        let code = if y < 20 && x < 40 {
            7
        } else if y < 20 {
            6
        } else if (20..30).contains(&y) && x >= 40 {
            10
        } else if y >= 50 {
            10
        } else {
            0
        };
        Rgb([code, 0, 0])
    })
}

fn write_sample(root: &Path, name: &str, channels: u8) -> anyhow::Result<()> {
    let rgb_dir = root.join("CameraRGB");
    let seg_dir = root.join("CameraSeg");
    fs::create_dir_all(&rgb_dir)?;
    fs::create_dir_all(&seg_dir)?;
    match channels {
        1 => GrayImage::from_pixel(WIDTH, HEIGHT, Luma([90])).save(rgb_dir.join(name))?,
        4 => RgbaImage::from_pixel(WIDTH, HEIGHT, Rgba([10, 20, 30, 128])).save(rgb_dir.join(name))?,
        _ => RgbImage::from_pixel(WIDTH, HEIGHT, Rgb([10, 20, 30])).save(rgb_dir.join(name))?,
    }
    label_raster(WIDTH, HEIGHT).save(seg_dir.join(name))?;
    Ok(())
}

fn dataset(root: &Path, train_count: usize, target_size: u32) -> LyftDataset {
    LyftDataset::new(DatasetConfig {
        root: root.to_path_buf(),
        train_count,
        target_size,
        ..Default::default()
    })
}

#[test]
fn train_and_val_partition_the_sorted_listing() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    for name in ["e.png", "a.png", "d.png", "c.png", "b.png"] {
        write_sample(tmp.path(), name, 3)?;
    }
    fs::create_dir_all(tmp.path().join("CameraRGB").join("nested"))?;

    let ds = dataset(tmp.path(), 3, 256);
    let train = ds.enumerate("train")?;
    let val = ds.enumerate("val")?;
    let names = |v: &[SampleId]| v.iter().map(|s| s.as_str().to_string()).collect::<Vec<_>>();
    assert_eq!(names(&train), vec!["a.png", "b.png", "c.png"]);
    assert_eq!(names(&val), vec!["d.png", "e.png"]);

    // the default split keeps everything in train for small directories
    let ds = dataset(tmp.path(), 900, 256);
    assert_eq!(ds.enumerate("train")?.len(), 5);
    assert!(ds.enumerate("val")?.is_empty());
    Ok(())
}

#[test]
fn unknown_split_is_rejected() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    write_sample(tmp.path(), "a.png", 3)?;
    let ds = dataset(tmp.path(), 900, 256);
    let err = ds.enumerate("test").unwrap_err();
    assert!(matches!(err, SegError::InvalidSplit { ref split } if split == "test"));
    Ok(())
}

#[test]
fn missing_image_dir_is_an_io_error() {
    let tmp = tempfile::tempdir().unwrap();
    let ds = dataset(tmp.path(), 900, 256);
    assert!(matches!(ds.enumerate("train"), Err(SegError::Io { .. })));
}

#[test]
fn images_are_three_channel_at_target_size() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    write_sample(tmp.path(), "gray.png", 1)?;
    write_sample(tmp.path(), "rgb.png", 3)?;
    write_sample(tmp.path(), "rgba.png", 4)?;

    let ds = dataset(tmp.path(), 900, 256);
    for sample in ds.enumerate("train")? {
        let img = ds.load_image(&sample)?;
        assert_eq!(img.dim(), (256, 256, 3), "{sample}");
    }
    let gray = ds.load_image(&SampleId::new("gray.png"))?;
    assert_eq!(gray[[128, 128, 0]], 90);
    assert_eq!(gray[[128, 128, 2]], 90);
    Ok(())
}

#[test]
fn mask_has_road_and_car_without_hood() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    write_sample(tmp.path(), "a.png", 3)?;

    let ds = dataset(tmp.path(), 900, 256);
    let sample = SampleId::new("a.png");
    let (mask, class_ids) = ds.load_mask(&sample)?;
    assert_eq!(class_ids, vec![1, 2]);
    assert_eq!(mask.dim(), (256, 256, 2));
    assert!(mask.iter().all(|&v| v <= 1));
    // road block and lane lines
    assert_eq!(mask[[40, 40, 0]], 1);
    assert_eq!(mask[[40, 200, 0]], 1);
    assert_eq!(mask[[40, 40, 1]], 0);
    // car in the middle
    assert_eq!(mask[[106, 200, 1]], 1);
    assert_eq!(mask[[106, 200, 0]], 0);
    // hood rows (>= 49 of 60) never count as car
    assert_eq!(mask[[240, 200, 1]], 0);
    assert_eq!(mask[[240, 20, 1]], 0);
    assert_eq!(ds.mask_loads(), 1);
    Ok(())
}

#[test]
fn sixteen_bit_labels_keep_their_codes() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    write_sample(tmp.path(), "a.png", 3)?;
    let label = ImageBuffer::<Luma<u16>, Vec<u16>>::from_fn(WIDTH, HEIGHT, |_, y| Luma([if y < 30 { 7 } else { 263 }]));
    label.save(tmp.path().join("CameraSeg").join("a.png"))?;

    let ds = dataset(tmp.path(), 900, 64);
    let (mask, _) = ds.load_mask(&SampleId::new("a.png"))?;
    let road = mask.index_axis(ndarray::Axis(2), 0);
    assert_eq!(road.iter().filter(|&&v| v == 1).count(), 64 * 32);
    assert_eq!(road[[10, 10]], 1);
    assert_eq!(road[[50, 10]], 0);
    Ok(())
}

#[test]
fn mismatched_label_size_is_reported() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    write_sample(tmp.path(), "a.png", 3)?;
    label_raster(WIDTH / 2, HEIGHT).save(tmp.path().join("CameraSeg").join("a.png"))?;

    let ds = dataset(tmp.path(), 900, 256);
    let err = ds.load_mask(&SampleId::new("a.png")).unwrap_err();
    match err {
        SegError::ShapeMismatch { image, label, .. } => {
            assert_eq!(image, (WIDTH, HEIGHT));
            assert_eq!(label, (WIDTH / 2, HEIGHT));
        }
        other => panic!("unexpected error {other}"),
    }
    Ok(())
}

#[test]
fn missing_label_propagates() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    write_sample(tmp.path(), "a.png", 3)?;
    fs::remove_file(tmp.path().join("CameraSeg").join("a.png"))?;

    let ds = dataset(tmp.path(), 900, 256);
    assert!(matches!(ds.load_mask(&SampleId::new("a.png")), Err(SegError::Image { .. })));
    Ok(())
}

#[test]
fn split_view_loads_augmented_batches() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    for name in ["a.png", "b.png", "c.png"] {
        write_sample(tmp.path(), name, 3)?;
    }
    let ds = dataset(tmp.path(), 2, 64);
    let train = SplitView::new(&ds, "train")?;
    let val = SplitView::new(&ds, "val")?;
    assert_eq!(train.split, Split::Train);
    assert_eq!((train.len(), val.len()), (2, 1));
    assert!(SplitView::new(&ds, "holdout").is_err());

    let policy = Augmenter::default();
    let mut rng = StdRng::seed_from_u64(11);
    let batch = load_batch(&train, &train.samples, Some(&policy), [0.0; 3], &mut rng)?;
    assert_eq!(batch.image_shape, vec![2, 64, 64, 3]);
    assert_eq!(batch.mask_shape, vec![2, 64, 64, 2]);
    assert_eq!(batch.images.len(), 2 * 64 * 64 * 3);
    assert_eq!(batch.masks.len(), 2 * 64 * 64 * 2);
    assert_eq!(batch.class_ids, vec![1, 2, 1, 2]);
    assert!(batch.masks.iter().all(|&v| v == 0.0 || v == 1.0));
    Ok(())
}
