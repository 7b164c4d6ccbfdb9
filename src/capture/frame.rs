use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::SdkResult;
use crate::sdk::{BufferSource, BufferToken};

/// Sensor pixel encodings we can convert from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    Mono8,
    Mono10,
    Mono12,
    Mono16,
    BayerRG8,
    BayerGR8,
    BayerGB8,
    BayerBG8,
    BayerRG12,
    BayerBG12,
    Rgb8,
    Bgr8,
}

/// Colour filter array layout, named by the 2x2 tile read left-to-right, top-to-bottom.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cfa {
    Rggb,
    Grbg,
    Gbrg,
    Bggr,
}

impl PixelFormat {
    /// Significant bits per sample.
    pub fn bit_depth(self) -> u32 {
        match self {
            PixelFormat::Mono10 => 10,
            PixelFormat::Mono12 | PixelFormat::BayerRG12 | PixelFormat::BayerBG12 => 12,
            PixelFormat::Mono16 => 16,
            _ => 8,
        }
    }

    /// Bytes per sample in the payload. Deep formats use a little-endian u16 container.
    pub fn bytes_per_sample(self) -> usize {
        if self.bit_depth() > 8 {
            2
        } else {
            1
        }
    }

    pub fn samples_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb8 | PixelFormat::Bgr8 => 3,
            _ => 1,
        }
    }

    pub fn bytes_per_pixel(self) -> usize {
        self.bytes_per_sample() * self.samples_per_pixel()
    }

    pub fn cfa(self) -> Option<Cfa> {
        match self {
            PixelFormat::BayerRG8 | PixelFormat::BayerRG12 => Some(Cfa::Rggb),
            PixelFormat::BayerGR8 => Some(Cfa::Grbg),
            PixelFormat::BayerGB8 => Some(Cfa::Gbrg),
            PixelFormat::BayerBG8 | PixelFormat::BayerBG12 => Some(Cfa::Bggr),
            _ => None,
        }
    }

    /// Whether the sensor delivers colour information at all.
    pub fn is_color(self) -> bool {
        self.cfa().is_some() || self.samples_per_pixel() == 3
    }

    /// GenICam pixel format name.
    pub fn name(self) -> &'static str {
        match self {
            PixelFormat::Mono8 => "Mono8",
            PixelFormat::Mono10 => "Mono10",
            PixelFormat::Mono12 => "Mono12",
            PixelFormat::Mono16 => "Mono16",
            PixelFormat::BayerRG8 => "BayerRG8",
            PixelFormat::BayerGR8 => "BayerGR8",
            PixelFormat::BayerGB8 => "BayerGB8",
            PixelFormat::BayerBG8 => "BayerBG8",
            PixelFormat::BayerRG12 => "BayerRG12",
            PixelFormat::BayerBG12 => "BayerBG12",
            PixelFormat::Rgb8 => "RGB8",
            PixelFormat::Bgr8 => "BGR8",
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-buffer metadata reported by the stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferInfo {
    /// Monotonically increasing per device
    pub frame_id: u64,
    pub image_present: bool,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
}

/// Borrowed view of one raw frame, valid only while its buffer is held
#[derive(Debug, Clone, Copy)]
pub struct RawFrame<'a> {
    pub frame_id: u64,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub data: &'a [u8],
}

/// Scoped handle to one hardware buffer slot.
///
/// The slot goes back to the device pool exactly once: either through
/// [`FrameBuffer::release`], which consumes the handle, or on drop. Because
/// release takes `self`, payload access after release does not compile.
pub struct FrameBuffer<'s, S: BufferSource + ?Sized> {
    source: &'s mut S,
    token: BufferToken,
    info: BufferInfo,
    payload: bytes::Bytes,
    released: bool,
}

impl<'s, S: BufferSource + ?Sized> FrameBuffer<'s, S> {
    /// Waits up to `timeout` for the next buffer. `Ok(None)` means nothing
    /// arrived in time.
    pub fn retrieve(source: &'s mut S, timeout: Duration) -> SdkResult<Option<Self>> {
        let raw = match source.retrieve(timeout)? {
            Some(raw) => raw,
            None => return Ok(None),
        };

        Ok(Some(Self {
            source,
            token: raw.token,
            info: raw.info,
            payload: raw.payload,
            released: false,
        }))
    }

    pub fn info(&self) -> &BufferInfo {
        &self.info
    }

    pub fn frame_id(&self) -> u64 {
        self.info.frame_id
    }

    pub fn is_image_present(&self) -> bool {
        self.info.image_present
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn frame(&self) -> RawFrame<'_> {
        RawFrame {
            frame_id: self.info.frame_id,
            width: self.info.width,
            height: self.info.height,
            pixel_format: self.info.pixel_format,
            data: &self.payload,
        }
    }

    /// Returns the slot to the pool and reports the outcome.
    pub fn release(mut self) -> SdkResult<()> {
        self.released = true;
        self.source.release(self.token)
    }
}

impl<S: BufferSource + ?Sized> Drop for FrameBuffer<'_, S> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.source.release(self.token) {
            warn!(frame_id = self.info.frame_id, "Buffer release failed: {}", e);
        }
    }
}

impl<S: BufferSource + ?Sized> fmt::Debug for FrameBuffer<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("token", &self.token)
            .field("info", &self.info)
            .field("len", &self.payload.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SdkError;
    use crate::sdk::RawBuffer;
    use std::collections::VecDeque;

    /// Hands out queued buffers and counts releases per token.
    #[derive(Default)]
    struct CountingSource {
        queued: VecDeque<RawBuffer>,
        outstanding: Vec<BufferToken>,
        released: Vec<BufferToken>,
        double_released: usize,
    }

    impl CountingSource {
        fn push(&mut self, frame_id: u64, present: bool) {
            self.queued.push_back(RawBuffer {
                token: BufferToken(frame_id + 100),
                info: BufferInfo {
                    frame_id,
                    image_present: present,
                    width: 2,
                    height: 2,
                    pixel_format: PixelFormat::Mono8,
                },
                payload: bytes::Bytes::from_static(&[1, 2, 3, 4]),
            });
        }
    }

    impl BufferSource for CountingSource {
        fn retrieve(&mut self, _timeout: Duration) -> SdkResult<Option<RawBuffer>> {
            let raw = self.queued.pop_front();
            if let Some(raw) = &raw {
                self.outstanding.push(raw.token);
            }
            Ok(raw)
        }

        fn release(&mut self, token: BufferToken) -> SdkResult<()> {
            match self.outstanding.iter().position(|t| *t == token) {
                Some(pos) => {
                    self.outstanding.remove(pos);
                    self.released.push(token);
                    Ok(())
                }
                None => {
                    self.double_released += 1;
                    Err(SdkError::InvalidBuffer(token.0))
                }
            }
        }
    }

    #[test]
    fn timed_out_retrieve_yields_none() {
        let mut source = CountingSource::default();
        let timed_out = FrameBuffer::retrieve(&mut source, Duration::from_millis(1))
            .unwrap()
            .is_none();
        assert!(timed_out);
        assert!(source.released.is_empty());
    }

    #[test]
    fn explicit_release_happens_once() {
        let mut source = CountingSource::default();
        source.push(7, true);

        let buffer = FrameBuffer::retrieve(&mut source, Duration::ZERO)
            .unwrap()
            .unwrap();
        assert_eq!(buffer.frame_id(), 7);
        assert_eq!(buffer.payload(), &[1, 2, 3, 4]);
        buffer.release().unwrap();

        assert_eq!(source.released, vec![BufferToken(107)]);
        assert_eq!(source.double_released, 0);
    }

    #[test]
    fn drop_releases_on_early_exit() {
        fn inspect(source: &mut CountingSource) -> Result<u64, &'static str> {
            let buffer = FrameBuffer::retrieve(source, Duration::ZERO)
                .map_err(|_| "retrieve")?
                .ok_or("timeout")?;
            if !buffer.is_image_present() {
                return Err("empty");
            }
            Ok(buffer.frame_id())
        }

        let mut source = CountingSource::default();
        source.push(1, false);
        source.push(2, true);

        assert_eq!(inspect(&mut source), Err("empty"));
        assert_eq!(inspect(&mut source), Ok(2));
        assert_eq!(source.released.len(), 2);
        assert!(source.outstanding.is_empty());
        assert_eq!(source.double_released, 0);
    }

    #[test]
    fn frame_view_matches_info() {
        let mut source = CountingSource::default();
        source.push(9, true);
        let buffer = FrameBuffer::retrieve(&mut source, Duration::ZERO)
            .unwrap()
            .unwrap();
        let frame = buffer.frame();
        assert_eq!((frame.width, frame.height), (2, 2));
        assert_eq!(frame.pixel_format, PixelFormat::Mono8);
        assert_eq!(frame.data.len(), 4);
    }

    #[test]
    fn format_geometry() {
        assert_eq!(PixelFormat::Mono8.bytes_per_pixel(), 1);
        assert_eq!(PixelFormat::Mono12.bytes_per_pixel(), 2);
        assert_eq!(PixelFormat::Bgr8.bytes_per_pixel(), 3);
        assert_eq!(PixelFormat::BayerRG8.cfa(), Some(Cfa::Rggb));
        assert!(PixelFormat::BayerBG12.is_color());
        assert!(!PixelFormat::Mono16.is_color());
        assert_eq!(PixelFormat::Rgb8.to_string(), "RGB8");
    }
}
