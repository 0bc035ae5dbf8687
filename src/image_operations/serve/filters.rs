// filters.rs
//
// Named filters of the operation path. One enum variant per filter with
// typed fields; parsing dispatches on the name, so adding a filter means
// adding a variant and two match arms.

use crate::image_operations::handler_utils::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Jpeg,
    Png,
    Webp,
    Gif,
    Avif,
    Tiff,
    Bmp,
}

impl OutputFormat {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "jpeg" | "jpg" => Some(OutputFormat::Jpeg),
            "png" => Some(OutputFormat::Png),
            "webp" => Some(OutputFormat::Webp),
            "gif" => Some(OutputFormat::Gif),
            "avif" => Some(OutputFormat::Avif),
            "tiff" => Some(OutputFormat::Tiff),
            "bmp" => Some(OutputFormat::Bmp),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "jpeg",
            OutputFormat::Png => "png",
            OutputFormat::Webp => "webp",
            OutputFormat::Gif => "gif",
            OutputFormat::Avif => "avif",
            OutputFormat::Tiff => "tiff",
            OutputFormat::Bmp => "bmp",
        }
    }

    pub fn mime(&self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "image/jpeg",
            OutputFormat::Png => "image/png",
            OutputFormat::Webp => "image/webp",
            OutputFormat::Gif => "image/gif",
            OutputFormat::Avif => "image/avif",
            OutputFormat::Tiff => "image/tiff",
            OutputFormat::Bmp => "image/bmp",
        }
    }

    pub fn from_image_format(format: image::ImageFormat) -> Option<Self> {
        match format {
            image::ImageFormat::Jpeg => Some(OutputFormat::Jpeg),
            image::ImageFormat::Png => Some(OutputFormat::Png),
            image::ImageFormat::WebP => Some(OutputFormat::Webp),
            image::ImageFormat::Gif => Some(OutputFormat::Gif),
            image::ImageFormat::Avif => Some(OutputFormat::Avif),
            image::ImageFormat::Tiff => Some(OutputFormat::Tiff),
            image::ImageFormat::Bmp => Some(OutputFormat::Bmp),
            _ => None,
        }
    }

    pub fn to_image_format(self) -> image::ImageFormat {
        match self {
            OutputFormat::Jpeg => image::ImageFormat::Jpeg,
            OutputFormat::Png => image::ImageFormat::Png,
            OutputFormat::Webp => image::ImageFormat::WebP,
            OutputFormat::Gif => image::ImageFormat::Gif,
            OutputFormat::Avif => image::ImageFormat::Avif,
            OutputFormat::Tiff => image::ImageFormat::Tiff,
            OutputFormat::Bmp => image::ImageFormat::Bmp,
        }
    }
}

/// Focal region in source pixels, `AxB:CxD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FocalRegion {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Quality(u8),
    Format(OutputFormat),
    Brightness(i32),
    Contrast(i32),
    Blur(f32),
    Sharpen(f32),
    Rgb(i32, i32, i32),
    RoundCorner(u32, Option<u32>),
    Grayscale,
    Rotate(u16),
    Hue(i32),
    Saturation(i32),
    Fill(String),
    Focal(FocalRegion),
    Upscale,
    // Metadata is always stripped by re-encoding; these parse as markers.
    StripExif,
    StripIcc,
    StripMetadata,
    MaxFrames(u32),
}

impl Filter {
    pub fn parse(name: &str, args: &str) -> Result<Filter, AppError> {
        let bad = || AppError::BadRequest(format!("invalid filter {name}({args})"));
        match name {
            "quality" => {
                let q: u8 = args.parse().map_err(|_| bad())?;
                if q == 0 || q > 100 {
                    return Err(bad());
                }
                Ok(Filter::Quality(q))
            }
            "format" => OutputFormat::from_name(args)
                .map(Filter::Format)
                .ok_or_else(bad),
            "brightness" => args.parse().map(Filter::Brightness).map_err(|_| bad()),
            "contrast" => args.parse().map(Filter::Contrast).map_err(|_| bad()),
            "blur" => args.parse().map(Filter::Blur).map_err(|_| bad()),
            "sharpen" => args.parse().map(Filter::Sharpen).map_err(|_| bad()),
            "rgb" => {
                let parts: Vec<i32> = args
                    .split(',')
                    .map(|p| p.trim().parse())
                    .collect::<Result<_, _>>()
                    .map_err(|_| bad())?;
                if parts.len() != 3 {
                    return Err(bad());
                }
                Ok(Filter::Rgb(parts[0], parts[1], parts[2]))
            }
            "round_corner" => {
                let mut parts = args.split(',');
                let rx = parts
                    .next()
                    .and_then(|p| p.trim().parse().ok())
                    .ok_or_else(bad)?;
                let ry = match parts.next() {
                    Some(p) => Some(p.trim().parse().map_err(|_| bad())?),
                    None => None,
                };
                if parts.next().is_some() {
                    return Err(bad());
                }
                Ok(Filter::RoundCorner(rx, ry))
            }
            "grayscale" => Ok(Filter::Grayscale),
            "rotate" => {
                let deg: u16 = args.parse().map_err(|_| bad())?;
                if !matches!(deg, 0 | 90 | 180 | 270) {
                    return Err(bad());
                }
                Ok(Filter::Rotate(deg))
            }
            "hue" => args.parse().map(Filter::Hue).map_err(|_| bad()),
            "saturation" => args.parse().map(Filter::Saturation).map_err(|_| bad()),
            "fill" => {
                if args.is_empty() {
                    return Err(bad());
                }
                Ok(Filter::Fill(args.to_string()))
            }
            "focal" => parse_focal(args).ok_or_else(bad).map(Filter::Focal),
            "upscale" => Ok(Filter::Upscale),
            "strip_exif" => Ok(Filter::StripExif),
            "strip_icc" => Ok(Filter::StripIcc),
            "strip_metadata" => Ok(Filter::StripMetadata),
            "max_frames" => args.parse().map(Filter::MaxFrames).map_err(|_| bad()),
            _ => Err(AppError::BadRequest(format!("unknown filter {name}"))),
        }
    }

    pub fn format(&self) -> String {
        match self {
            Filter::Quality(q) => format!("quality({q})"),
            Filter::Format(f) => format!("format({})", f.name()),
            Filter::Brightness(v) => format!("brightness({v})"),
            Filter::Contrast(v) => format!("contrast({v})"),
            Filter::Blur(v) => format!("blur({v})"),
            Filter::Sharpen(v) => format!("sharpen({v})"),
            Filter::Rgb(r, g, b) => format!("rgb({r},{g},{b})"),
            Filter::RoundCorner(rx, None) => format!("round_corner({rx})"),
            Filter::RoundCorner(rx, Some(ry)) => format!("round_corner({rx},{ry})"),
            Filter::Grayscale => "grayscale()".to_string(),
            Filter::Rotate(deg) => format!("rotate({deg})"),
            Filter::Hue(v) => format!("hue({v})"),
            Filter::Saturation(v) => format!("saturation({v})"),
            Filter::Fill(color) => format!("fill({color})"),
            Filter::Focal(f) => {
                format!("focal({}x{}:{}x{})", f.left, f.top, f.right, f.bottom)
            }
            Filter::Upscale => "upscale()".to_string(),
            Filter::StripExif => "strip_exif()".to_string(),
            Filter::StripIcc => "strip_icc()".to_string(),
            Filter::StripMetadata => "strip_metadata()".to_string(),
            Filter::MaxFrames(n) => format!("max_frames({n})"),
        }
    }
}

fn parse_focal(args: &str) -> Option<FocalRegion> {
    let (a, b) = args.split_once(':')?;
    let (left, top) = a.split_once('x')?;
    let (right, bottom) = b.split_once('x')?;
    Some(FocalRegion {
        left: left.parse().ok()?,
        top: top.parse().ok()?,
        right: right.parse().ok()?,
        bottom: bottom.parse().ok()?,
    })
}

/// Parse a `filters:a(1):b(2)` segment. Colons inside parentheses (the
/// focal region) do not split.
pub fn parse_filter_chain(segment: &str) -> Result<Vec<Filter>, AppError> {
    let rest = segment
        .strip_prefix("filters:")
        .ok_or_else(|| AppError::BadRequest("malformed filters segment".to_string()))?;

    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    let bytes = rest.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        match b {
            b'(' => depth += 1,
            b')' => depth = depth.saturating_sub(1),
            b':' if depth == 0 => {
                out.push(parse_one(&rest[start..i])?);
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(parse_one(&rest[start..])?);
    Ok(out)
}

fn parse_one(item: &str) -> Result<Filter, AppError> {
    let item = item.trim();
    if item.is_empty() {
        return Err(AppError::BadRequest("empty filter".to_string()));
    }
    match item.split_once('(') {
        Some((name, rest)) => {
            let args = rest
                .strip_suffix(')')
                .ok_or_else(|| AppError::BadRequest(format!("unbalanced filter {item}")))?;
            Filter::parse(name, args)
        }
        None => Filter::parse(item, ""),
    }
}

pub fn format_filter_chain(filters: &[Filter]) -> String {
    let mut out = String::from("filters");
    for filter in filters {
        out.push(':');
        out.push_str(&filter.format());
    }
    out
}
