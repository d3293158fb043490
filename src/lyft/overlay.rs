use image::{imageops, Rgb, RgbImage};
use ndarray::Array3;

pub const ROAD_COLOR: Rgb<u8> = Rgb([128, 64, 128]);
pub const CAR_COLOR: Rgb<u8> = Rgb([0, 0, 142]);

pub fn class_color(class_id: i32) -> Rgb<u8> {
    match class_id {
        1 => ROAD_COLOR,
        2 => CAR_COLOR,
        _ => Rgb([255, 255, 0]),
    }
}

/// Paints every set mask pixel with its class colour. Later channels win where
/// masks overlap; unset pixels stay black.
pub fn colorize(mask: &Array3<u8>, class_ids: &[i32]) -> RgbImage {
    let (height, width, _) = mask.dim();
    let mut out = RgbImage::new(width as u32, height as u32);
    for ((y, x, c), value) in mask.indexed_iter() {
        if *value == 0 {
            continue;
        }
        let class_id = class_ids.get(c).copied().unwrap_or(-1);
        out.put_pixel(x as u32, y as u32, class_color(class_id));
    }

    out
}

/// Blends `colored` over `image` wherever `colored` is not black.
pub fn composite(image: &RgbImage, colored: &RgbImage, alpha: f32) -> RgbImage {
    let alpha = alpha.clamp(0.0, 1.0);
    let mut out = image.clone();
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        if x >= colored.width() || y >= colored.height() {
            continue;
        }
        let overlay = colored.get_pixel(x, y);
        if overlay.0 == [0, 0, 0] {
            continue;
        }
        for i in 0..3 {
            let blended = pixel.0[i] as f32 * (1.0 - alpha) + overlay.0[i] as f32 * alpha;
            pixel.0[i] = blended.round().clamp(0.0, 255.0) as u8;
        }
    }

    out
}

/// Colorizes a model-resolution mask, stretches it back to `original`'s size
/// and blends it in.
pub fn overlay_on(original: &RgbImage, mask: &Array3<u8>, class_ids: &[i32], alpha: f32) -> RgbImage {
    let colored = colorize(mask, class_ids);
    let (width, height) = original.dimensions();
    let colored = if colored.dimensions() == (width, height) {
        colored
    } else {
        imageops::resize(&colored, width, height, imageops::FilterType::Nearest)
    };
    composite(original, &colored, alpha)
}

// Set pixels per channel, used for logging.
pub fn channel_counts(mask: &Array3<u8>) -> Vec<usize> {
    let channels = mask.dim().2;
    let mut counts = vec![0; channels];
    for ((_, _, c), value) in mask.indexed_iter() {
        if *value != 0 {
            counts[c] += 1;
        }
    }
    counts
}
