//! Persistence of converted frames

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use image::{ExtendedColorType, ImageFormat};
use tracing::debug;

use crate::capture::convert::{DecodedImage, OutputLayout};

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("i/o: {0}")]
    Io(#[from] io::Error),

    #[error("encode: {0}")]
    Encode(#[from] image::ImageError),
}

/// Receives every successfully converted frame.
///
/// Called on the acquisition thread (or SDK callback thread); failures are
/// logged by the worker and never stop acquisition.
pub trait FrameSink: Send + Sync {
    fn save(&self, image: &DecodedImage, device_id: &str, frame_id: u64) -> Result<(), SinkError>;
}

/// Writes each frame as `<directory>/<device_id>_<frame_id>.bmp`.
#[derive(Debug, Clone)]
pub struct BmpSink {
    directory: PathBuf,
}

impl BmpSink {
    /// Creates `directory` if it does not exist yet.
    pub fn new(directory: impl Into<PathBuf>) -> Result<Self, SinkError> {
        let directory = directory.into();
        fs::create_dir_all(&directory)?;
        Ok(Self { directory })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn path_for(&self, device_id: &str, frame_id: u64) -> PathBuf {
        self.directory.join(format!("{device_id}_{frame_id}.bmp"))
    }
}

impl FrameSink for BmpSink {
    fn save(&self, image: &DecodedImage, device_id: &str, frame_id: u64) -> Result<(), SinkError> {
        let path = self.path_for(device_id, frame_id);
        match image.layout {
            OutputLayout::Mono8 => image::save_buffer_with_format(
                &path,
                &image.data,
                image.width,
                image.height,
                ExtendedColorType::L8,
                ImageFormat::Bmp,
            )?,
            OutputLayout::Bgr8 => {
                let rgb: Vec<u8> = image
                    .data
                    .chunks_exact(3)
                    .flat_map(|p| [p[2], p[1], p[0]])
                    .collect();
                image::save_buffer_with_format(
                    &path,
                    &rgb,
                    image.width,
                    image.height,
                    ExtendedColorType::Rgb8,
                    ImageFormat::Bmp,
                )?
            }
        }
        debug!(path = %path.display(), "Frame saved");
        Ok(())
    }
}
