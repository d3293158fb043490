//! Declarative augmentation policy applied to training samples.
//!
//! Geometric augmenters move the image and every mask channel together
//! (masks are sampled nearest-neighbour so they stay binary); photometric
//! ones only touch the image.

use image::{imageops, GrayImage, Luma, Rgb, RgbImage};
use itertools::iproduct;
use nalgebra::{Matrix3, Vector3};
use ndarray::Array3;
use rand::seq::index;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::error::{SegError, SegResult};
use super::transforms::{image_to_ndarray, images_to_mask, mask_channel_to_image, ndarray_to_image};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Augmenter {
    /// A random number in `[0, children.len()]` of the children, applied in
    /// list order.
    SomeOf { children: Vec<Augmenter> },
    /// Exactly one child, chosen uniformly.
    OneOf { children: Vec<Augmenter> },
    Fliplr { p: f32 },
    Flipud { p: f32 },
    Rotate { degrees: u32 },
    Multiply { min: f32, max: f32 },
    GaussianBlur { sigma_min: f32, sigma_max: f32 },
    Scale { min: f32, max: f32 },
    ScaleXY { x: (f32, f32), y: (f32, f32) },
}

impl Default for Augmenter {
    fn default() -> Self {
        Augmenter::SomeOf {
            children: vec![
                Augmenter::Fliplr { p: 0.5 },
                Augmenter::Flipud { p: 0.5 },
                Augmenter::OneOf {
                    children: vec![
                        Augmenter::Rotate { degrees: 90 },
                        Augmenter::Rotate { degrees: 180 },
                        Augmenter::Rotate { degrees: 270 },
                    ],
                },
                Augmenter::Multiply { min: 0.8, max: 1.5 },
                Augmenter::GaussianBlur { sigma_min: 0.0, sigma_max: 5.0 },
                Augmenter::Scale { min: 0.5, max: 1.5 },
                Augmenter::ScaleXY { x: (0.5, 1.5), y: (0.5, 1.5) },
            ],
        }
    }
}

/// An image and its mask channels, in `image` crate buffers while augmenting.
#[derive(Debug, Clone)]
pub struct AugSample {
    pub image: RgbImage,
    pub masks: Vec<GrayImage>,
}

impl AugSample {
    pub fn from_arrays(image: &Array3<u8>, mask: &Array3<u8>) -> Self {
        let channels = mask.dim().2;
        Self {
            image: ndarray_to_image(image),
            masks: (0..channels).map(|c| mask_channel_to_image(mask, c)).collect(),
        }
    }

    pub fn into_arrays(self) -> (Array3<u8>, Array3<u8>) {
        let mask = if self.masks.is_empty() {
            let (w, h) = self.image.dimensions();
            Array3::zeros((h as usize, w as usize, 0))
        } else {
            images_to_mask(&self.masks)
        };
        (image_to_ndarray(&self.image), mask)
    }
}

fn check_range(name: &str, min: f32, max: f32) -> SegResult<()> {
    if !(min.is_finite() && max.is_finite()) || min > max {
        return Err(SegError::Config(format!("{name} range [{min}, {max}] is invalid")));
    }
    Ok(())
}

fn check_probability(name: &str, p: f32) -> SegResult<()> {
    if !(0.0..=1.0).contains(&p) {
        return Err(SegError::Config(format!("{name} probability {p} outside [0, 1]")));
    }
    Ok(())
}

impl Augmenter {
    pub fn validate(&self) -> SegResult<()> {
        match self {
            Augmenter::SomeOf { children } => children.iter().try_for_each(|c| c.validate()),
            Augmenter::OneOf { children } => {
                if children.is_empty() {
                    return Err(SegError::Config("one_of needs at least one child".to_string()));
                }
                children.iter().try_for_each(|c| c.validate())
            }
            Augmenter::Fliplr { p } => check_probability("fliplr", *p),
            Augmenter::Flipud { p } => check_probability("flipud", *p),
            Augmenter::Rotate { degrees } => match degrees {
                90 | 180 | 270 => Ok(()),
                other => Err(SegError::Config(format!("rotate supports 90/180/270, got {other}"))),
            },
            Augmenter::Multiply { min, max } => {
                check_range("multiply", *min, *max)?;
                if *min < 0.0 {
                    return Err(SegError::Config("multiply factor must be >= 0".to_string()));
                }
                Ok(())
            }
            Augmenter::GaussianBlur { sigma_min, sigma_max } => {
                check_range("gaussian_blur", *sigma_min, *sigma_max)?;
                if *sigma_min < 0.0 {
                    return Err(SegError::Config("blur sigma must be >= 0".to_string()));
                }
                Ok(())
            }
            Augmenter::Scale { min, max } => check_scale("scale", *min, *max),
            Augmenter::ScaleXY { x, y } => {
                check_scale("scale_x", x.0, x.1)?;
                check_scale("scale_y", y.0, y.1)
            }
        }
    }

    pub fn apply<R: Rng + ?Sized>(&self, sample: &mut AugSample, rng: &mut R) {
        match self {
            Augmenter::SomeOf { children } => {
                let n = rng.gen_range(0..=children.len());
                let mut picked = index::sample(rng, children.len(), n).into_vec();
                picked.sort_unstable();
                for i in picked {
                    children[i].apply(sample, rng);
                }
            }
            Augmenter::OneOf { children } => {
                if children.is_empty() {
                    return;
                }
                let i = rng.gen_range(0..children.len());
                children[i].apply(sample, rng);
            }
            Augmenter::Fliplr { p } => {
                if rng.gen::<f32>() < *p {
                    imageops::flip_horizontal_in_place(&mut sample.image);
                    sample.masks.iter_mut().for_each(|m| imageops::flip_horizontal_in_place(m));
                }
            }
            Augmenter::Flipud { p } => {
                if rng.gen::<f32>() < *p {
                    imageops::flip_vertical_in_place(&mut sample.image);
                    sample.masks.iter_mut().for_each(|m| imageops::flip_vertical_in_place(m));
                }
            }
            Augmenter::Rotate { degrees } => rotate(sample, *degrees),
            Augmenter::Multiply { min, max } => {
                let factor = sample_uniform(rng, *min, *max);
                for pixel in sample.image.pixels_mut() {
                    for v in pixel.0.iter_mut() {
                        *v = (*v as f32 * factor).round().clamp(0.0, 255.0) as u8;
                    }
                }
            }
            Augmenter::GaussianBlur { sigma_min, sigma_max } => {
                let sigma = sample_uniform(rng, *sigma_min, *sigma_max);
                // imageops::blur does not accept sigma near 0 as identity
                if sigma > 0.01 {
                    sample.image = imageops::blur(&sample.image, sigma);
                }
            }
            Augmenter::Scale { min, max } => {
                let s = sample_uniform(rng, *min, *max);
                scale(sample, s, s);
            }
            Augmenter::ScaleXY { x, y } => {
                let sx = sample_uniform(rng, x.0, x.1);
                let sy = sample_uniform(rng, y.0, y.1);
                scale(sample, sx, sy);
            }
        }
    }
}

fn check_scale(name: &str, min: f32, max: f32) -> SegResult<()> {
    check_range(name, min, max)?;
    if min <= 0.0 {
        return Err(SegError::Config(format!("{name} must be > 0")));
    }
    Ok(())
}

fn sample_uniform<R: Rng + ?Sized>(rng: &mut R, min: f32, max: f32) -> f32 {
    if min >= max {
        return min;
    }
    rng.gen_range(min..max)
}

fn rotate(sample: &mut AugSample, degrees: u32) {
    let (image, masks): (RgbImage, Vec<GrayImage>) = match degrees {
        90 => (imageops::rotate90(&sample.image), sample.masks.iter().map(|m| imageops::rotate90(m)).collect()),
        180 => (imageops::rotate180(&sample.image), sample.masks.iter().map(|m| imageops::rotate180(m)).collect()),
        270 => (imageops::rotate270(&sample.image), sample.masks.iter().map(|m| imageops::rotate270(m)).collect()),
        _ => return,
    };
    sample.image = image;
    sample.masks = masks;
}

// Output-to-input mapping for a scale of (sx, sy) about the image centre.
pub fn scale_about_center(width: u32, height: u32, sx: f32, sy: f32) -> Option<Matrix3<f32>> {
    let (cx, cy) = (width as f32 / 2.0, height as f32 / 2.0);
    let to_origin = Matrix3::new(1.0, 0.0, -cx, 0.0, 1.0, -cy, 0.0, 0.0, 1.0);
    let scaling = Matrix3::new(sx, 0.0, 0.0, 0.0, sy, 0.0, 0.0, 0.0, 1.0);
    let back = Matrix3::new(1.0, 0.0, cx, 0.0, 1.0, cy, 0.0, 0.0, 1.0);
    (back * scaling * to_origin).try_inverse()
}

fn scale(sample: &mut AugSample, sx: f32, sy: f32) {
    let (width, height) = sample.image.dimensions();
    let Some(inverse) = scale_about_center(width, height, sx, sy) else {
        return;
    };
    let source = |x: u32, y: u32| -> (f32, f32) {
        let p = inverse * Vector3::new(x as f32 + 0.5, y as f32 + 0.5, 1.0);
        (p.x - 0.5, p.y - 0.5)
    };

    let mut image = RgbImage::new(width, height);
    let mut masks: Vec<GrayImage> = sample.masks.iter().map(|m| GrayImage::new(m.width(), m.height())).collect();
    for (y, x) in iproduct!(0..height, 0..width) {
        let (u, v) = source(x, y);
        image.put_pixel(x, y, bilinear(&sample.image, u, v));
        let (nx, ny) = (u.round(), v.round());
        if nx < 0.0 || ny < 0.0 || nx >= width as f32 || ny >= height as f32 {
            continue;
        }
        for (out, src) in masks.iter_mut().zip(&sample.masks) {
            if x < out.width() && y < out.height() && (nx as u32) < src.width() && (ny as u32) < src.height() {
                let value = src.get_pixel(nx as u32, ny as u32).0[0];
                out.put_pixel(x, y, Luma([value]));
            }
        }
    }
    sample.image = image;
    sample.masks = masks;
}

// Zero outside the image.
fn bilinear(img: &RgbImage, u: f32, v: f32) -> Rgb<u8> {
    let (width, height) = img.dimensions();
    let (x0, y0) = (u.floor(), v.floor());
    let (fx, fy) = (u - x0, v - y0);
    let fetch = |x: f32, y: f32| -> [f32; 3] {
        if x < 0.0 || y < 0.0 || x >= width as f32 || y >= height as f32 {
            return [0.0; 3];
        }
        let p = img.get_pixel(x as u32, y as u32).0;
        [p[0] as f32, p[1] as f32, p[2] as f32]
    };
    let (a, b) = (fetch(x0, y0), fetch(x0 + 1.0, y0));
    let (c, d) = (fetch(x0, y0 + 1.0), fetch(x0 + 1.0, y0 + 1.0));
    let mut out = [0u8; 3];
    for i in 0..3 {
        let top = a[i] * (1.0 - fx) + b[i] * fx;
        let bottom = c[i] * (1.0 - fx) + d[i] * fx;
        out[i] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}
