// processor.rs
//
// Executes a parsed operation chain against decoded pixels and encodes
// the result. Everything here is CPU-bound; callers run it under
// spawn_blocking with the transform semaphore held.

use std::io::Cursor;

use anyhow::anyhow;
use image::codecs::avif::AvifEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType;
use image::{imageops, DynamicImage, GenericImageView, Rgba, RgbaImage};
use serde::Serialize;

use crate::image_operations::handler_utils::AppError;

use super::filters::{Filter, OutputFormat};
use super::params::{HAlign, Params, VAlign};

const AVIF_SPEED: u8 = 8;
const DEFAULT_QUALITY: u8 = 80;
const TRIM_TOLERANCE: u32 = 48;

#[derive(Debug, Clone, Copy)]
pub struct AcceptFormats {
    pub webp: bool,
    pub avif: bool,
}

pub struct TransformOutput {
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ImageMeta {
    pub format: &'static str,
    pub content_type: &'static str,
    pub width: u32,
    pub height: u32,
    pub orientation: u8,
}

/// Output format precedence: explicit format() filter, then Accept-driven
/// AVIF/WebP, then the source format.
pub fn decide_format(params: &Params, source: OutputFormat, accept: AcceptFormats) -> OutputFormat {
    for filter in &params.filters {
        if let Filter::Format(f) = filter {
            return *f;
        }
    }
    if accept.avif {
        return OutputFormat::Avif;
    }
    if accept.webp {
        return OutputFormat::Webp;
    }
    source
}

pub fn process(
    src: &[u8],
    params: &Params,
    accept: AcceptFormats,
) -> Result<TransformOutput, AppError> {
    let guessed = image::guess_format(src).map_err(|_| AppError::UnsupportedMediaType)?;
    let source_format =
        OutputFormat::from_image_format(guessed).ok_or(AppError::UnsupportedMediaType)?;
    let out_format = decide_format(params, source_format, accept);

    // Nothing to do: stream the stored bytes through untouched.
    if params.is_noop() && out_format == source_format {
        return Ok(TransformOutput {
            bytes: src.to_vec(),
            content_type: source_format.mime(),
        });
    }

    let img = image::load_from_memory_with_format(src, guessed)
        .map_err(|_| AppError::UnsupportedMediaType)?;
    let img = apply_ops(img, params)?;

    let quality = params.filters.iter().find_map(|f| match f {
        Filter::Quality(q) => Some(*q),
        _ => None,
    });
    let bytes = encode(&img, out_format, quality)?;
    Ok(TransformOutput {
        bytes,
        content_type: out_format.mime(),
    })
}

/// Metadata of the transformed image without encoding the pixels.
pub fn inspect(src: &[u8], params: &Params, accept: AcceptFormats) -> Result<ImageMeta, AppError> {
    let guessed = image::guess_format(src).map_err(|_| AppError::UnsupportedMediaType)?;
    let source_format =
        OutputFormat::from_image_format(guessed).ok_or(AppError::UnsupportedMediaType)?;
    let out_format = decide_format(params, source_format, accept);

    let img = image::load_from_memory_with_format(src, guessed)
        .map_err(|_| AppError::UnsupportedMediaType)?;
    let img = apply_ops(img, params)?;
    let (width, height) = img.dimensions();

    Ok(ImageMeta {
        format: out_format.name(),
        content_type: out_format.mime(),
        width,
        height,
        // Re-encoding strips EXIF, so output orientation is always normal.
        orientation: 1,
    })
}

fn apply_ops(mut img: DynamicImage, params: &Params) -> Result<DynamicImage, AppError> {
    if params.trim {
        img = trim_borders(img);
    }

    if let Some(crop) = &params.crop {
        let (w, h) = img.dimensions();
        let left = crop.left.resolve(w).min(w);
        let top = crop.top.resolve(h).min(h);
        let right = crop.right.resolve(w).clamp(left, w);
        let bottom = crop.bottom.resolve(h).clamp(top, h);
        if right > left && bottom > top {
            img = img.crop_imm(left, top, right - left, bottom - top);
        }
    }

    img = resize_stage(img, params);

    if params.h_flip {
        img = img.fliph();
    }
    if params.v_flip {
        img = img.flipv();
    }

    if let Some(padding) = &params.padding {
        let color = fill_color(params);
        let (w, h) = img.dimensions();
        let mut canvas = RgbaImage::from_pixel(
            w + padding.left + padding.right,
            h + padding.top + padding.bottom,
            color,
        );
        imageops::overlay(&mut canvas, &img.to_rgba8(), padding.left as i64, padding.top as i64);
        img = DynamicImage::ImageRgba8(canvas);
    }

    for filter in &params.filters {
        img = apply_pixel_filter(img, filter);
    }

    Ok(img)
}

fn resize_stage(img: DynamicImage, params: &Params) -> DynamicImage {
    let (sw, sh) = img.dimensions();
    if sw == 0 || sh == 0 {
        return img;
    }

    let (mut tw, mut th) = (params.width, params.height);
    if tw == 0 && th == 0 {
        return img;
    }
    // One missing dimension follows the source aspect ratio.
    if tw == 0 {
        tw = ((sw as u64 * th as u64) / sh as u64).max(1) as u32;
    }
    if th == 0 {
        th = ((sh as u64 * tw as u64) / sw as u64).max(1) as u32;
    }

    if params.stretch {
        return img.resize_exact(tw, th, FilterType::Lanczos3);
    }

    if params.fit_in {
        let upscale = params.filters.iter().any(|f| matches!(f, Filter::Upscale));
        let mut resized = if sw > tw || sh > th || upscale {
            img.resize(tw, th, FilterType::Lanczos3)
        } else {
            img
        };
        // fill() letterboxes fit-in output to the exact requested box.
        if params.filters.iter().any(|f| matches!(f, Filter::Fill(_))) {
            let color = fill_color(params);
            let (rw, rh) = resized.dimensions();
            let mut canvas = RgbaImage::from_pixel(tw, th, color);
            imageops::overlay(
                &mut canvas,
                &resized.to_rgba8(),
                ((tw - rw.min(tw)) / 2) as i64,
                ((th - rh.min(th)) / 2) as i64,
            );
            resized = DynamicImage::ImageRgba8(canvas);
        }
        return resized;
    }

    // Default mode: scale to cover the target box, then crop the window
    // anchored by alignment or the focal point.
    let scale = f64::max(tw as f64 / sw as f64, th as f64 / sh as f64);
    let rw = ((sw as f64 * scale).round() as u32).max(tw);
    let rh = ((sh as f64 * scale).round() as u32).max(th);
    let resized = img.resize_exact(rw, rh, FilterType::Lanczos3);

    let (fx, fy) = crop_focus(params, sw, sh);
    let max_x = rw - tw;
    let max_y = rh - th;
    let x = ((fx * rw as f64) - tw as f64 / 2.0)
        .round()
        .clamp(0.0, max_x as f64) as u32;
    let y = ((fy * rh as f64) - th as f64 / 2.0)
        .round()
        .clamp(0.0, max_y as f64) as u32;
    resized.crop_imm(x, y, tw, th)
}

/// Relative (0..1) center of the crop window. Alignment wins unless smart
/// mode has a focal region to aim at.
fn crop_focus(params: &Params, sw: u32, sh: u32) -> (f64, f64) {
    if params.smart {
        if let Some(region) = params.filters.iter().find_map(|f| match f {
            Filter::Focal(r) => Some(r),
            _ => None,
        }) {
            let fx = (region.left + region.right) as f64 / 2.0 / sw.max(1) as f64;
            let fy = (region.top + region.bottom) as f64 / 2.0 / sh.max(1) as f64;
            return (fx.clamp(0.0, 1.0), fy.clamp(0.0, 1.0));
        }
    }
    let fx = match params.h_align {
        Some(HAlign::Left) => 0.0,
        Some(HAlign::Right) => 1.0,
        _ => 0.5,
    };
    let fy = match params.v_align {
        Some(VAlign::Top) => 0.0,
        Some(VAlign::Bottom) => 1.0,
        _ => 0.5,
    };
    (fx, fy)
}

fn apply_pixel_filter(img: DynamicImage, filter: &Filter) -> DynamicImage {
    match filter {
        Filter::Brightness(pct) => img.brighten(pct * 255 / 100),
        Filter::Contrast(pct) => img.adjust_contrast(*pct as f32),
        Filter::Blur(sigma) if *sigma > 0.0 => img.blur(*sigma),
        Filter::Sharpen(sigma) if *sigma > 0.0 => img.unsharpen(*sigma, 1),
        Filter::Grayscale => DynamicImage::ImageLuma8(img.to_luma8()),
        Filter::Rotate(90) => img.rotate90(),
        Filter::Rotate(180) => img.rotate180(),
        Filter::Rotate(270) => img.rotate270(),
        Filter::Hue(deg) => img.huerotate(*deg),
        Filter::Rgb(r, g, b) => adjust_rgb(img, *r, *g, *b),
        Filter::Saturation(pct) => adjust_saturation(img, *pct),
        Filter::RoundCorner(rx, ry) => round_corners(img, *rx, ry.unwrap_or(*rx)),
        _ => img,
    }
}

fn adjust_rgb(img: DynamicImage, r: i32, g: i32, b: i32) -> DynamicImage {
    let mut rgba = img.to_rgba8();
    let deltas = [r * 255 / 100, g * 255 / 100, b * 255 / 100];
    for pixel in rgba.pixels_mut() {
        for (c, delta) in deltas.iter().enumerate() {
            pixel[c] = (pixel[c] as i32 + delta).clamp(0, 255) as u8;
        }
    }
    DynamicImage::ImageRgba8(rgba)
}

fn adjust_saturation(img: DynamicImage, pct: i32) -> DynamicImage {
    let mut rgba = img.to_rgba8();
    let factor = 1.0 + pct as f32 / 100.0;
    for pixel in rgba.pixels_mut() {
        let gray =
            0.299 * pixel[0] as f32 + 0.587 * pixel[1] as f32 + 0.114 * pixel[2] as f32;
        for c in 0..3 {
            let v = gray + (pixel[c] as f32 - gray) * factor;
            pixel[c] = v.clamp(0.0, 255.0) as u8;
        }
    }
    DynamicImage::ImageRgba8(rgba)
}

fn round_corners(img: DynamicImage, rx: u32, ry: u32) -> DynamicImage {
    let mut rgba = img.to_rgba8();
    let (w, h) = rgba.dimensions();
    let rx = rx.min(w / 2);
    let ry = ry.min(h / 2);
    if rx == 0 || ry == 0 {
        return DynamicImage::ImageRgba8(rgba);
    }
    for y in 0..h {
        for x in 0..w {
            let dx = if x < rx {
                (rx - x) as f64
            } else if x >= w - rx {
                (x - (w - rx - 1)) as f64
            } else {
                continue;
            };
            let dy = if y < ry {
                (ry - y) as f64
            } else if y >= h - ry {
                (y - (h - ry - 1)) as f64
            } else {
                continue;
            };
            let norm = (dx / rx as f64).powi(2) + (dy / ry as f64).powi(2);
            if norm > 1.0 {
                rgba.get_pixel_mut(x, y)[3] = 0;
            }
        }
    }
    DynamicImage::ImageRgba8(rgba)
}

/// Remove uniform border pixels, reference = top-left color.
fn trim_borders(img: DynamicImage) -> DynamicImage {
    let rgba = img.to_rgba8();
    let (w, h) = rgba.dimensions();
    if w == 0 || h == 0 {
        return img;
    }
    let reference = *rgba.get_pixel(0, 0);
    let differs = |p: &Rgba<u8>| {
        let diff: u32 = (0..3)
            .map(|c| (p[c] as i32 - reference[c] as i32).unsigned_abs())
            .sum();
        diff > TRIM_TOLERANCE
    };

    let (mut min_x, mut min_y, mut max_x, mut max_y) = (w, h, 0u32, 0u32);
    for (x, y, pixel) in rgba.enumerate_pixels() {
        if differs(pixel) {
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }
    }
    if min_x > max_x || min_y > max_y {
        // Uniform image, nothing to trim.
        return img;
    }
    img.crop_imm(min_x, min_y, max_x - min_x + 1, max_y - min_y + 1)
}

fn fill_color(params: &Params) -> Rgba<u8> {
    let named = params.filters.iter().find_map(|f| match f {
        Filter::Fill(color) => Some(color.as_str()),
        _ => None,
    });
    match named {
        Some("white") => Rgba([255, 255, 255, 255]),
        Some("black") => Rgba([0, 0, 0, 255]),
        Some("red") => Rgba([255, 0, 0, 255]),
        Some("green") => Rgba([0, 255, 0, 255]),
        Some("blue") => Rgba([0, 0, 255, 255]),
        Some("gray") | Some("grey") => Rgba([128, 128, 128, 255]),
        Some("transparent") | None => Rgba([0, 0, 0, 0]),
        Some(hex) => parse_hex_color(hex).unwrap_or(Rgba([0, 0, 0, 0])),
    }
}

fn parse_hex_color(raw: &str) -> Option<Rgba<u8>> {
    let raw = raw.strip_prefix('#').unwrap_or(raw);
    let expanded: String = match raw.len() {
        3 => raw.chars().flat_map(|c| [c, c]).collect(),
        6 => raw.to_string(),
        _ => return None,
    };
    let bytes = hex::decode(expanded).ok()?;
    Some(Rgba([bytes[0], bytes[1], bytes[2], 255]))
}

fn encode(
    img: &DynamicImage,
    format: OutputFormat,
    quality: Option<u8>,
) -> Result<Vec<u8>, AppError> {
    let mut buf = Cursor::new(Vec::new());
    let result = match format {
        OutputFormat::Jpeg => {
            // JPEG has no alpha channel.
            let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
            let encoder =
                JpegEncoder::new_with_quality(&mut buf, quality.unwrap_or(DEFAULT_QUALITY));
            rgb.write_with_encoder(encoder)
        }
        OutputFormat::Webp => {
            let rgba = DynamicImage::ImageRgba8(img.to_rgba8());
            rgba.write_with_encoder(WebPEncoder::new_lossless(&mut buf))
        }
        OutputFormat::Avif => {
            let rgba = DynamicImage::ImageRgba8(img.to_rgba8());
            rgba.write_with_encoder(AvifEncoder::new_with_speed_quality(
                &mut buf,
                AVIF_SPEED,
                quality.unwrap_or(DEFAULT_QUALITY),
            ))
        }
        OutputFormat::Png | OutputFormat::Gif | OutputFormat::Tiff | OutputFormat::Bmp => {
            img.write_to(&mut buf, format.to_image_format())
        }
    };
    result.map_err(|e| AppError::Internal(anyhow!("encode {}: {e}", format.name())))?;
    Ok(buf.into_inner())
}
