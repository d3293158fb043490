use image::{imageops, DynamicImage, GrayImage, ImageBuffer, Luma, Pixel, Rgb, RgbImage};
use itertools::iproduct;
use ndarray::{s, Array2, Array3};

// Converts image to ndarray with format HxWxC
pub fn image_to_ndarray(img: &RgbImage) -> Array3<u8> {
    let (width, height) = img.dimensions();
    let mut img_arr = Array3::<u8>::zeros((height as usize, width as usize, 3));
    for (x, y, pixel) in img.enumerate_pixels() {
        img_arr[[y as usize, x as usize, 0]] = pixel.0[0];
        img_arr[[y as usize, x as usize, 1]] = pixel.0[1];
        img_arr[[y as usize, x as usize, 2]] = pixel.0[2];
    }

    img_arr
}

// Converts 3d ndarray with format HxWxC to rgb image
pub fn ndarray_to_image(img_arr: &Array3<u8>) -> RgbImage {
    let (height, width, _) = img_arr.dim();
    let mut img = RgbImage::new(width as u32, height as u32);
    for (y, x) in iproduct!(0..height, 0..width) {
        let r = img_arr[[y, x, 0]];
        let g = img_arr[[y, x, 1]];
        let b = img_arr[[y, x, 2]];
        img.put_pixel(x as u32, y as u32, Rgb([r, g, b]));
    }

    img
}

/// First channel of a label raster as an HxW array of category codes, read at
/// the raster's native depth. Grayscale rasters are read as-is, colour ones by
/// their red channel.
pub fn label_channel(img: &DynamicImage) -> Array2<u16> {
    match img {
        DynamicImage::ImageLuma8(buf) => first_channel(buf, u16::from),
        DynamicImage::ImageLumaA8(buf) => first_channel(buf, u16::from),
        DynamicImage::ImageRgb8(buf) => first_channel(buf, u16::from),
        DynamicImage::ImageRgba8(buf) => first_channel(buf, u16::from),
        DynamicImage::ImageLuma16(buf) => first_channel(buf, |v| v),
        DynamicImage::ImageLumaA16(buf) => first_channel(buf, |v| v),
        DynamicImage::ImageRgb16(buf) => first_channel(buf, |v| v),
        DynamicImage::ImageRgba16(buf) => first_channel(buf, |v| v),
        // float casts saturate; codes are small integers
        DynamicImage::ImageRgb32F(buf) => first_channel(buf, |v| v.round() as u16),
        DynamicImage::ImageRgba32F(buf) => first_channel(buf, |v| v.round() as u16),
        other => first_channel(&other.to_rgba16(), |v| v),
    }
}

fn first_channel<P: Pixel>(buf: &ImageBuffer<P, Vec<P::Subpixel>>, to_code: impl Fn(P::Subpixel) -> u16) -> Array2<u16> {
    let (width, height) = buf.dimensions();
    let mut labels = Array2::<u16>::zeros((height as usize, width as usize));
    for (x, y, pixel) in buf.enumerate_pixels() {
        labels[[y as usize, x as usize]] = to_code(pixel.channels()[0]);
    }

    labels
}

/// Resizes to `size` x `size` with bilinear filtering. Grayscale is expanded
/// to RGB and alpha dropped, so the result is always 3 channel.
pub fn resize_square(img: &DynamicImage, size: u32) -> RgbImage {
    let rgb = img.to_rgb8();
    if rgb.dimensions() == (size, size) {
        return rgb;
    }
    imageops::resize(&rgb, size, size, imageops::FilterType::Triangle)
}

pub fn mask_channel_to_image(mask: &Array3<u8>, channel: usize) -> GrayImage {
    let (height, width, _) = mask.dim();
    let plane = mask.slice(s![.., .., channel]);
    GrayImage::from_fn(width as u32, height as u32, |x, y| Luma([plane[[y as usize, x as usize]]]))
}

pub fn images_to_mask(channels: &[GrayImage]) -> Array3<u8> {
    let (width, height) = channels.first().map(|c| c.dimensions()).unwrap_or((0, 0));
    let mut mask = Array3::<u8>::zeros((height as usize, width as usize, channels.len()));
    for (c, plane) in channels.iter().enumerate() {
        for (x, y, pixel) in plane.enumerate_pixels() {
            mask[[y as usize, x as usize, c]] = pixel.0[0];
        }
    }

    mask
}

/// Nearest-neighbour resize of every mask channel, so values stay 0/1.
pub fn resize_mask(mask: &Array3<u8>, size: u32) -> Array3<u8> {
    let (height, width, channels) = mask.dim();
    if (height, width) == (size as usize, size as usize) {
        return mask.clone();
    }
    let planes: Vec<GrayImage> = (0..channels)
        .map(|c| imageops::resize(&mask_channel_to_image(mask, c), size, size, imageops::FilterType::Nearest))
        .collect();
    if planes.is_empty() {
        return Array3::zeros((size as usize, size as usize, 0));
    }

    images_to_mask(&planes)
}
