//! Raw sensor frame to canonical 8-bit image conversion

use std::borrow::Cow;

use serde::{Deserialize, Serialize};

use super::frame::{Cfa, PixelFormat, RawFrame};
use crate::error::AcqError;

/// Canonical interleaved output layout, fixed per converter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputLayout {
    /// 1 byte per pixel
    Mono8,
    /// 3 bytes per pixel, blue-green-red
    Bgr8,
}

impl OutputLayout {
    pub fn channels(self) -> usize {
        match self {
            OutputLayout::Mono8 => 1,
            OutputLayout::Bgr8 => 3,
        }
    }
}

/// How samples deeper than 8 bits are brought down to 8 bits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DepthScaling {
    /// Keep the 8 most significant bits
    #[default]
    Shift,
    /// Rounded `v * 255 / max`
    Divide,
}

impl DepthScaling {
    fn scale(self, value: u16, bit_depth: u32) -> u8 {
        let max = (1u32 << bit_depth) - 1;
        let v = u32::from(value).min(max);
        match self {
            DepthScaling::Shift => (v >> (bit_depth - 8)) as u8,
            DepthScaling::Divide => ((v * 255 + max / 2) / max) as u8,
        }
    }
}

/// Converted frame, independent of the buffer it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub layout: OutputLayout,
    /// Sequence id of the source buffer
    pub frame_id: u64,
    pub data: Vec<u8>,
}

impl DecodedImage {
    pub fn channels(&self) -> usize {
        self.layout.channels()
    }

    /// `(height, width, channels)`
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.height as usize, self.width as usize, self.channels())
    }

    /// Row `y`, or `None` outside the image.
    pub fn row(&self, y: u32) -> Option<&[u8]> {
        if y >= self.height {
            return None;
        }
        let stride = (self.width as usize).checked_mul(self.channels())?;
        let start = (y as usize).checked_mul(stride)?;
        self.data.get(start..start.checked_add(stride)?)
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<&[u8]> {
        if x >= self.width {
            return None;
        }
        let c = self.channels();
        let start = (x as usize).checked_mul(c)?;
        self.row(y)?.get(start..start + c)
    }
}

/// Converts raw frames into one fixed [`OutputLayout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelConverter {
    layout: OutputLayout,
    scaling: DepthScaling,
}

impl PixelConverter {
    pub fn new(layout: OutputLayout) -> Self {
        Self {
            layout,
            scaling: DepthScaling::default(),
        }
    }

    /// BGR8 for cameras operated in colour, Mono8 otherwise.
    pub fn for_camera(color: bool) -> Self {
        Self::new(if color {
            OutputLayout::Bgr8
        } else {
            OutputLayout::Mono8
        })
    }

    pub fn with_scaling(mut self, scaling: DepthScaling) -> Self {
        self.scaling = scaling;
        self
    }

    pub fn layout(&self) -> OutputLayout {
        self.layout
    }

    pub fn scaling(&self) -> DepthScaling {
        self.scaling
    }

    /// Converts `frame` into a newly allocated image.
    ///
    /// The payload length must be exactly `width * height * bytes_per_pixel`
    /// for the declared format; anything else is [`AcqError::Format`].
    pub fn convert(&self, frame: &RawFrame<'_>) -> Result<DecodedImage, AcqError> {
        let format = frame.pixel_format;
        let (w, h) = (frame.width as usize, frame.height as usize);
        // Saturates on corrupt headers; no slice is ever usize::MAX long.
        let expected = w
            .saturating_mul(h)
            .saturating_mul(format.bytes_per_pixel());
        if w == 0 || h == 0 || frame.data.len() != expected {
            return Err(AcqError::Format {
                frame_id: frame.frame_id,
                width: frame.width,
                height: frame.height,
                format,
                expected,
                actual: frame.data.len(),
            });
        }

        let samples = self.narrow(frame.data, format);
        let data = match (format, self.layout) {
            (PixelFormat::Bgr8, OutputLayout::Bgr8) => samples.into_owned(),
            (PixelFormat::Rgb8, OutputLayout::Bgr8) => samples
                .chunks_exact(3)
                .flat_map(|p| [p[2], p[1], p[0]])
                .collect(),
            (PixelFormat::Bgr8, OutputLayout::Mono8) => samples
                .chunks_exact(3)
                .map(|p| luma(p[0], p[1], p[2]))
                .collect(),
            (PixelFormat::Rgb8, OutputLayout::Mono8) => samples
                .chunks_exact(3)
                .map(|p| luma(p[2], p[1], p[0]))
                .collect(),
            _ => match format.cfa() {
                Some(cfa) => {
                    let bgr = demosaic(&samples, w, h, cfa);
                    match self.layout {
                        OutputLayout::Bgr8 => bgr,
                        OutputLayout::Mono8 => bgr
                            .chunks_exact(3)
                            .map(|p| luma(p[0], p[1], p[2]))
                            .collect(),
                    }
                }
                None => match self.layout {
                    OutputLayout::Mono8 => samples.into_owned(),
                    OutputLayout::Bgr8 => samples.iter().flat_map(|&v| [v, v, v]).collect(),
                },
            },
        };

        Ok(DecodedImage {
            width: frame.width,
            height: frame.height,
            layout: self.layout,
            frame_id: frame.frame_id,
            data,
        })
    }

    /// One byte per sample, scaling deep containers down.
    fn narrow<'a>(&self, data: &'a [u8], format: PixelFormat) -> Cow<'a, [u8]> {
        if format.bytes_per_sample() == 1 {
            return Cow::Borrowed(data);
        }
        let depth = format.bit_depth();
        Cow::Owned(
            data.chunks_exact(2)
                .map(|c| self.scaling.scale(u16::from_le_bytes([c[0], c[1]]), depth))
                .collect(),
        )
    }
}

fn luma(b: u8, g: u8, r: u8) -> u8 {
    ((29 * u32::from(b) + 150 * u32::from(g) + 77 * u32::from(r) + 128) >> 8) as u8
}

/// `(dx, dy)` of red, blue and the two greens within a 2x2 tile.
fn cfa_sites(cfa: Cfa) -> ((usize, usize), (usize, usize), [(usize, usize); 2]) {
    match cfa {
        Cfa::Rggb => ((0, 0), (1, 1), [(1, 0), (0, 1)]),
        Cfa::Grbg => ((1, 0), (0, 1), [(0, 0), (1, 1)]),
        Cfa::Gbrg => ((0, 1), (1, 0), [(0, 0), (1, 1)]),
        Cfa::Bggr => ((1, 1), (0, 0), [(1, 0), (0, 1)]),
    }
}

/// 2x2 block demosaic: every pixel of a tile takes the tile's R, B and
/// mean G. Tiles hanging over an odd edge reuse the last row/column.
fn demosaic(samples: &[u8], w: usize, h: usize, cfa: Cfa) -> Vec<u8> {
    let (r_at, b_at, g_at) = cfa_sites(cfa);
    let at = |x: usize, y: usize| samples[y.min(h - 1) * w + x.min(w - 1)];

    let mut out = vec![0u8; w * h * 3];
    for ty in (0..h).step_by(2) {
        for tx in (0..w).step_by(2) {
            let r = at(tx + r_at.0, ty + r_at.1);
            let b = at(tx + b_at.0, ty + b_at.1);
            let g0 = u16::from(at(tx + g_at[0].0, ty + g_at[0].1));
            let g1 = u16::from(at(tx + g_at[1].0, ty + g_at[1].1));
            let g = ((g0 + g1 + 1) / 2) as u8;

            for y in ty..(ty + 2).min(h) {
                for x in tx..(tx + 2).min(w) {
                    let i = (y * w + x) * 3;
                    out[i..i + 3].copy_from_slice(&[b, g, r]);
                }
            }
        }
    }
    out
}
