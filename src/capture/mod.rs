pub mod convert;
pub mod frame;
pub mod trigger;
pub mod worker;

pub use convert::{DecodedImage, DepthScaling, OutputLayout, PixelConverter};
pub use frame::{FrameBuffer, PixelFormat};
pub use trigger::{TriggerController, TriggerSelector};
pub use worker::{AcquisitionStyle, AcquisitionWorker, CameraConfig, TriggerMode, WorkerEvent, WorkerState};
