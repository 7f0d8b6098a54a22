//! Pixel work: alpha flattening, fit-within resize, bilevel conversion, encode.

use std::io::Cursor;

use image::imageops::{self, BiLevel, FilterType};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};

use super::{Dithering, ImageError, ImageOptions, TargetFormat};

/// Largest size with the same aspect ratio that fits in `max_w` x `max_h`.
///
/// Images already inside the box are returned unchanged. Otherwise one
/// dimension equals its maximum exactly and the other is scaled with the
/// smaller of the two ratios, never below one pixel.
pub fn fit_within(width: u32, height: u32, max_w: u32, max_h: u32) -> (u32, u32) {
    if width == 0 || height == 0 || max_w == 0 || max_h == 0 {
        return (width, height);
    }
    if width <= max_w && height <= max_h {
        return (width, height);
    }
    let (w, h, mw, mh) = (
        u64::from(width),
        u64::from(height),
        u64::from(max_w),
        u64::from(max_h),
    );
    // Width ratio mw/w is the smaller one when mw*h <= mh*w.
    if mw * h <= mh * w {
        (max_w, clamp_dim(h * mw / w))
    } else {
        (clamp_dim(w * mh / h), max_h)
    }
}

fn clamp_dim(value: u64) -> u32 {
    u32::try_from(value.max(1)).unwrap_or(u32::MAX)
}

/// Composite onto white. Legacy displays have no transparency.
pub fn flatten_alpha(img: &DynamicImage) -> RgbImage {
    if !img.color().has_alpha() {
        return img.to_rgb8();
    }
    let rgba = img.to_rgba8();
    let mut out = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let [r, g, b, a] = pixel.0;
        let blend = |c: u8| -> u8 {
            let c = u32::from(c);
            let a = u32::from(a);
            // c*a + 255*(255-a), rounded, over 255
            u8::try_from((c * a + 255 * (255 - a) + 127) / 255).unwrap_or(u8::MAX)
        };
        out.put_pixel(x, y, Rgb([blend(r), blend(g), blend(b)]));
    }
    out
}

/// Reduce to pure black and white.
pub fn to_bilevel(img: &RgbImage, dithering: Dithering) -> RgbImage {
    let mut luma = DynamicImage::ImageRgb8(img.clone()).to_luma8();
    match dithering {
        Dithering::FloydSteinberg => imageops::dither(&mut luma, &BiLevel),
        Dithering::Threshold => {
            for pixel in luma.pixels_mut() {
                pixel.0[0] = if pixel.0[0] >= 128 { 255 } else { 0 };
            }
        }
    }
    DynamicImage::ImageLuma8(luma).to_rgb8()
}

/// Run the full re-encode on already decoded bytes.
///
/// Returns the new bytes and the format they are in. When `options.convert`
/// is off, the source container format is kept.
pub fn optimize(data: &[u8], options: &ImageOptions) -> Result<(Vec<u8>, ImageFormat), ImageError> {
    let source_format = image::guess_format(data).map_err(ImageError::Decode)?;
    let decoded = image::load_from_memory(data).map_err(ImageError::Decode)?;
    optimize_decoded(&decoded, source_format, options)
}

pub(crate) fn optimize_decoded(
    decoded: &DynamicImage,
    source_format: ImageFormat,
    options: &ImageOptions,
) -> Result<(Vec<u8>, ImageFormat), ImageError> {
    let mut rgb = flatten_alpha(decoded);

    if options.resize {
        let (w, h) = fit_within(rgb.width(), rgb.height(), options.max_width, options.max_height);
        if (w, h) != rgb.dimensions() {
            rgb = imageops::resize(&rgb, w, h, FilterType::Lanczos3);
        }
    }

    let format = if options.convert {
        if options.target_format == TargetFormat::Gif {
            rgb = to_bilevel(&rgb, options.dithering);
        }
        options.target_format.image_format()
    } else {
        source_format
    };

    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(rgb)
        .write_to(&mut out, format)
        .map_err(ImageError::Encode)?;
    Ok((out.into_inner(), format))
}
