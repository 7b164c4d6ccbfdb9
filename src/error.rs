//! Error types for device access and acquisition orchestration

use std::time::Duration;

use crate::capture::frame::PixelFormat;

/// Failures reported by the camera capability layer (the vendor SDK side).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SdkError {
    #[error("no device at index {0}")]
    NoDevice(usize),

    #[error("device {0} is already open")]
    AlreadyOpen(usize),

    #[error("node {0} not found")]
    NodeNotFound(String),

    /// The node exists but does not offer the requested entry.
    #[error("{node} does not support entry {entry}")]
    EntryNotAvailable { node: String, entry: String },

    #[error("node {0} is not writable")]
    AccessDenied(String),

    #[error("device lost: {0}")]
    DeviceLost(String),

    #[error("buffer {0} is not outstanding")]
    InvalidBuffer(u64),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("camera system already initialized")]
    AlreadyInitialized,

    #[error("camera system not initialized")]
    NotInitialized,
}

pub type SdkResult<T> = std::result::Result<T, SdkError>;

/// Acquisition errors.
///
/// Per-frame variants ([`AcqError::is_frame_local`]) are recovered inside the
/// worker loop. Everything else is surfaced to the caller or the manager.
#[derive(Debug, thiserror::Error)]
pub enum AcqError {
    /// Feature write rejected while setting a device up.
    #[error("configuration rejected on {camera}: {message}")]
    Configuration { camera: String, message: String },

    /// Operation invoked in a state that forbids it. Worker state is unchanged.
    #[error("{operation} rejected on {camera}: {reason}")]
    Protocol {
        camera: String,
        operation: &'static str,
        reason: String,
    },

    #[error("{0} is already running")]
    AlreadyRunning(String),

    #[error("no buffer within {0:?}")]
    RetrievalTimeout(Duration),

    #[error("buffer {frame_id} carries no image")]
    EmptyBuffer { frame_id: u64 },

    #[error("buffer retrieval failed on {camera}: {source}")]
    Retrieval {
        camera: String,
        #[source]
        source: SdkError,
    },

    #[error(
        "frame {frame_id}: {width}x{height} {format} needs {expected} bytes, payload has {actual}"
    )]
    Format {
        frame_id: u64,
        width: u32,
        height: u32,
        format: PixelFormat,
        expected: usize,
        actual: usize,
    },

    #[error("device fault on {camera}: {message}")]
    DeviceFault { camera: String, message: String },

    #[error("camera index {index} out of range ({count} cameras)")]
    InvalidIndex { index: usize, count: usize },

    #[error(transparent)]
    Sdk(#[from] SdkError),
}

impl AcqError {
    /// Errors confined to a single acquisition cycle.
    pub fn is_frame_local(&self) -> bool {
        matches!(
            self,
            AcqError::RetrievalTimeout(_)
                | AcqError::EmptyBuffer { .. }
                | AcqError::Retrieval { .. }
                | AcqError::Format { .. }
        )
    }

    /// Maps an SDK failure observed on `camera` to the acquisition taxonomy.
    /// A lost device is always a fault; anything else keeps its SDK meaning.
    pub fn from_sdk(camera: &str, err: SdkError) -> Self {
        match err {
            SdkError::DeviceLost(message) => AcqError::DeviceFault {
                camera: camera.to_string(),
                message,
            },
            other => AcqError::Sdk(other),
        }
    }

    pub(crate) fn protocol(camera: &str, operation: &'static str, reason: impl Into<String>) -> Self {
        AcqError::Protocol {
            camera: camera.to_string(),
            operation,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_local_classification() {
        assert!(AcqError::RetrievalTimeout(Duration::from_millis(5)).is_frame_local());
        assert!(AcqError::EmptyBuffer { frame_id: 3 }.is_frame_local());
        assert!(!AcqError::InvalidIndex { index: 4, count: 2 }.is_frame_local());
        assert!(!AcqError::DeviceFault {
            camera: "cam".into(),
            message: "gone".into()
        }
        .is_frame_local());
    }

    #[test]
    fn device_lost_becomes_fault() {
        let err = AcqError::from_sdk("cam0", SdkError::DeviceLost("unplugged".into()));
        assert!(matches!(err, AcqError::DeviceFault { ref camera, .. } if camera == "cam0"));

        let err = AcqError::from_sdk("cam0", SdkError::NodeNotFound("Gain".into()));
        assert!(matches!(err, AcqError::Sdk(SdkError::NodeNotFound(_))));
    }
}
