// params.rs
//
// The slash-separated operation grammar, parsed in strict order:
//
//   [trim] [AxB:CxD] [fit-in] [stretch] [-ExF] [GxH:IxJ]
//   [left|center|right] [top|middle|bottom] [smart] [filters:...] source
//
// The signature (or `unsafe`) segment and the optional `meta` marker are
// handled by the serve handler before this parser runs.

use super::filters::{format_filter_chain, parse_filter_chain, Filter};
use crate::image_operations::handler_utils::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CropValue {
    Px(u32),
    Pct(u32),
}

impl CropValue {
    fn parse(raw: &str) -> Option<CropValue> {
        if let Some(pct) = raw.strip_suffix('%') {
            return pct.parse().ok().map(CropValue::Pct);
        }
        raw.parse().ok().map(CropValue::Px)
    }

    fn format(&self) -> String {
        match self {
            CropValue::Px(v) => v.to_string(),
            CropValue::Pct(v) => format!("{v}%"),
        }
    }

    /// Resolve against a dimension in pixels.
    pub fn resolve(&self, dim: u32) -> u32 {
        match self {
            CropValue::Px(v) => *v,
            CropValue::Pct(v) => ((*v as u64 * dim as u64) / 100) as u32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub left: CropValue,
    pub top: CropValue,
    pub right: CropValue,
    pub bottom: CropValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Padding {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HAlign {
    Left,
    Center,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VAlign {
    Top,
    Middle,
    Bottom,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    Blob(String),
    Url(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Params {
    pub trim: bool,
    pub crop: Option<CropRect>,
    pub fit_in: bool,
    pub stretch: bool,
    pub width: u32,
    pub height: u32,
    pub h_flip: bool,
    pub v_flip: bool,
    pub padding: Option<Padding>,
    pub h_align: Option<HAlign>,
    pub v_align: Option<VAlign>,
    pub smart: bool,
    pub filters: Vec<Filter>,
    pub source: Source,
}

impl Params {
    pub fn parse(op_path: &str) -> Result<Params, AppError> {
        let segments: Vec<&str> = op_path.split('/').collect();
        let mut i = 0;

        let mut params = Params {
            trim: false,
            crop: None,
            fit_in: false,
            stretch: false,
            width: 0,
            height: 0,
            h_flip: false,
            v_flip: false,
            padding: None,
            h_align: None,
            v_align: None,
            smart: false,
            filters: Vec::new(),
            source: Source::Blob(String::new()),
        };

        let peek = |i: usize| segments.get(i).copied().unwrap_or("");

        if peek(i) == "trim" {
            params.trim = true;
            i += 1;
        }
        if let Some(crop) = parse_crop(peek(i)) {
            params.crop = Some(crop);
            i += 1;
        }
        if peek(i) == "fit-in" {
            params.fit_in = true;
            i += 1;
        }
        if peek(i) == "stretch" {
            params.stretch = true;
            i += 1;
        }
        if let Some((w, h, hf, vf)) = parse_dims(peek(i)) {
            params.width = w;
            params.height = h;
            params.h_flip = hf;
            params.v_flip = vf;
            i += 1;
        }
        if let Some(padding) = parse_padding(peek(i)) {
            params.padding = Some(padding);
            i += 1;
        }
        match peek(i) {
            "left" => {
                params.h_align = Some(HAlign::Left);
                i += 1;
            }
            "center" => {
                params.h_align = Some(HAlign::Center);
                i += 1;
            }
            "right" => {
                params.h_align = Some(HAlign::Right);
                i += 1;
            }
            _ => {}
        }
        match peek(i) {
            "top" => {
                params.v_align = Some(VAlign::Top);
                i += 1;
            }
            "middle" => {
                params.v_align = Some(VAlign::Middle);
                i += 1;
            }
            "bottom" => {
                params.v_align = Some(VAlign::Bottom);
                i += 1;
            }
            _ => {}
        }
        if peek(i) == "smart" {
            params.smart = true;
            i += 1;
        }
        if peek(i).starts_with("filters:") {
            params.filters = parse_filter_chain(peek(i))?;
            i += 1;
        }

        // Everything left is the source.
        if i >= segments.len() {
            return Err(AppError::BadRequest("missing source".to_string()));
        }
        let kind = segments[i];
        let rest = segments[i + 1..].join("/");
        if rest.is_empty() {
            return Err(AppError::BadRequest("empty source".to_string()));
        }
        params.source = match kind {
            "blob" => Source::Blob(rest),
            "url" => Source::Url(percent_decode(&rest)),
            other => {
                return Err(AppError::BadRequest(format!(
                    "unknown source kind {other}"
                )))
            }
        };

        Ok(params)
    }

    /// Canonical path form; `parse(format(p)) == p` for any parsed value.
    /// This is also the cache key material and the signature message.
    pub fn format(&self) -> String {
        let mut segs: Vec<String> = Vec::new();
        if self.trim {
            segs.push("trim".to_string());
        }
        if let Some(crop) = &self.crop {
            segs.push(format!(
                "{}x{}:{}x{}",
                crop.left.format(),
                crop.top.format(),
                crop.right.format(),
                crop.bottom.format()
            ));
        }
        if self.fit_in {
            segs.push("fit-in".to_string());
        }
        if self.stretch {
            segs.push("stretch".to_string());
        }
        if self.width > 0 || self.height > 0 || self.h_flip || self.v_flip {
            segs.push(format!(
                "{}{}x{}{}",
                if self.h_flip { "-" } else { "" },
                self.width,
                if self.v_flip { "-" } else { "" },
                self.height
            ));
        }
        if let Some(p) = &self.padding {
            segs.push(format!("{}x{}:{}x{}", p.left, p.top, p.right, p.bottom));
        }
        if let Some(h) = self.h_align {
            segs.push(
                match h {
                    HAlign::Left => "left",
                    HAlign::Center => "center",
                    HAlign::Right => "right",
                }
                .to_string(),
            );
        }
        if let Some(v) = self.v_align {
            segs.push(
                match v {
                    VAlign::Top => "top",
                    VAlign::Middle => "middle",
                    VAlign::Bottom => "bottom",
                }
                .to_string(),
            );
        }
        if self.smart {
            segs.push("smart".to_string());
        }
        if !self.filters.is_empty() {
            segs.push(format_filter_chain(&self.filters));
        }
        match &self.source {
            Source::Blob(key) => segs.push(format!("blob/{key}")),
            Source::Url(url) => segs.push(format!("url/{url}")),
        }
        segs.join("/")
    }

    /// True when the request changes neither pixels nor encoding, so the
    /// source bytes can be streamed through untouched.
    pub fn is_noop(&self) -> bool {
        !self.trim
            && self.crop.is_none()
            && self.width == 0
            && self.height == 0
            && !self.h_flip
            && !self.v_flip
            && self.padding.is_none()
            && !self.smart
            && self
                .filters
                .iter()
                .all(|f| matches!(f, Filter::StripExif | Filter::StripIcc | Filter::StripMetadata | Filter::MaxFrames(_)))
    }
}

fn parse_dims(seg: &str) -> Option<(u32, u32, bool, bool)> {
    if seg.contains(':') || seg.contains('%') {
        return None;
    }
    let (w, h) = seg.split_once('x')?;
    let parse_side = |raw: &str| -> Option<(u32, bool)> {
        if raw.is_empty() {
            return Some((0, false));
        }
        let (flip, digits) = match raw.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, raw),
        };
        digits.parse::<u32>().ok().map(|v| (v, flip))
    };
    let (width, h_flip) = parse_side(w)?;
    let (height, v_flip) = parse_side(h)?;
    Some((width, height, h_flip, v_flip))
}

fn parse_crop(seg: &str) -> Option<CropRect> {
    let (a, b) = seg.split_once(':')?;
    let (left, top) = a.split_once('x')?;
    let (right, bottom) = b.split_once('x')?;
    Some(CropRect {
        left: CropValue::parse(left)?,
        top: CropValue::parse(top)?,
        right: CropValue::parse(right)?,
        bottom: CropValue::parse(bottom)?,
    })
}

fn parse_padding(seg: &str) -> Option<Padding> {
    if seg.contains('%') {
        return None;
    }
    let (a, b) = seg.split_once(':')?;
    let (left, top) = a.split_once('x')?;
    let (right, bottom) = b.split_once('x')?;
    Some(Padding {
        left: left.parse().ok()?,
        top: top.parse().ok()?,
        right: right.parse().ok()?,
        bottom: bottom.parse().ok()?,
    })
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hi = (bytes[i + 1] as char).to_digit(16);
            let lo = (bytes[i + 2] as char).to_digit(16);
            if let (Some(hi), Some(lo)) = (hi, lo) {
                out.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_operations::serve::filters::OutputFormat;

    #[test]
    fn parse_full_grammar() {
        let p = Params::parse(
            "trim/10x20:300x400/fit-in/-200x-300/5x5:5x5/left/top/smart/filters:quality(80)/blob/a/b.jpg",
        )
        .unwrap();
        assert!(p.trim);
        assert_eq!(
            p.crop,
            Some(CropRect {
                left: CropValue::Px(10),
                top: CropValue::Px(20),
                right: CropValue::Px(300),
                bottom: CropValue::Px(400),
            })
        );
        assert!(p.fit_in);
        assert!(!p.stretch);
        assert_eq!((p.width, p.height), (200, 300));
        assert!(p.h_flip && p.v_flip);
        assert_eq!(
            p.padding,
            Some(Padding {
                left: 5,
                top: 5,
                right: 5,
                bottom: 5
            })
        );
        assert_eq!(p.h_align, Some(HAlign::Left));
        assert_eq!(p.v_align, Some(VAlign::Top));
        assert!(p.smart);
        assert_eq!(p.filters, vec![Filter::Quality(80)]);
        assert_eq!(p.source, Source::Blob("a/b.jpg".to_string()));
    }

    #[test]
    fn parse_minimal() {
        let p = Params::parse("blob/k").unwrap();
        assert!(p.is_noop());
        assert_eq!(p.source, Source::Blob("k".to_string()));

        let p = Params::parse("100x100/blob/a/b.jpg").unwrap();
        assert_eq!((p.width, p.height), (100, 100));
        assert!(!p.is_noop());
    }

    #[test]
    fn format_parse_round_trip() {
        let paths = [
            "blob/a/b.jpg",
            "100x100/blob/a/b.jpg",
            "trim/10%x10%:90%x90%/200x0/blob/k",
            "fit-in/300x200/filters:fill(white):quality(75)/blob/img.png",
            "stretch/-100x200/right/bottom/blob/k",
            "50x50/10x10:10x10/center/middle/blob/k",
            "200x200/smart/filters:focal(10x10:50x50)/blob/face.jpg",
            "url/example.com/pic.jpg",
        ];
        for path in paths {
            let p = Params::parse(path).unwrap();
            assert_eq!(p.format(), path, "canonical form differs for {path}");
            assert_eq!(Params::parse(&p.format()).unwrap(), p);
        }
    }

    #[test]
    fn url_source_is_percent_decoded() {
        let p = Params::parse("200x200/url/https%3A%2F%2Fexample.com%2Fa.jpg").unwrap();
        assert_eq!(p.source, Source::Url("https://example.com/a.jpg".to_string()));
    }

    #[test]
    fn missing_or_unknown_source_is_rejected() {
        assert!(Params::parse("100x100").is_err());
        assert!(Params::parse("100x100/ftp/xx").is_err());
        assert!(Params::parse("blob").is_err());
        assert!(Params::parse("").is_err());
    }

    #[test]
    fn crop_values_resolve() {
        assert_eq!(CropValue::Px(10).resolve(200), 10);
        assert_eq!(CropValue::Pct(25).resolve(200), 50);
    }

    #[test]
    fn format_filter_interaction() {
        let p = Params::parse("filters:format(webp)/blob/k").unwrap();
        assert_eq!(p.filters, vec![Filter::Format(OutputFormat::Webp)]);
        // Format changes are not a noop even without pixel operations.
        assert!(!p.is_noop());
    }
}
