//! Capability interface to the camera vendor SDK.
//!
//! The acquisition core never talks to hardware directly. Everything it needs
//! from the vendor layer (device creation, nodemap writes, stream control,
//! buffer retrieve/release and stream callbacks) goes through these traits,
//! so the same workers drive real cameras or the in-process [`sim`] system.

pub mod sim;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info};

use crate::capture::frame::BufferInfo;
use crate::error::SdkResult;

/// Identifies one outstanding hardware buffer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferToken(pub u64);

/// One filled buffer as handed out by a stream.
///
/// `payload` stays valid until the token is released; callers copy out
/// anything they keep.
#[derive(Debug, Clone)]
pub struct RawBuffer {
    pub token: BufferToken,
    pub info: BufferInfo,
    pub payload: Bytes,
}

/// Static identity of a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub display_name: String,
    pub model: String,
    pub serial_number: String,
    /// Whether the sensor produces colour data
    pub color: bool,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} #{})", self.display_name, self.model, self.serial_number)
    }
}

/// Device feature tree (GenICam nodemap)
pub trait NodeMap {
    /// Selects `entry` on enumeration node `node`.
    /// Unsupported entries report [`SdkError::EntryNotAvailable`](crate::error::SdkError::EntryNotAvailable).
    fn set_enum(&mut self, node: &str, entry: &str) -> SdkResult<()>;

    fn get_enum(&self, node: &str) -> SdkResult<String>;

    fn set_integer(&mut self, node: &str, value: i64) -> SdkResult<()>;

    /// Returns `(value, max)` of an integer node.
    fn get_integer(&self, node: &str) -> SdkResult<(i64, i64)>;

    /// Executes a command node such as `TriggerSoftware`.
    fn execute(&mut self, node: &str) -> SdkResult<()>;
}

/// One opened camera.
pub trait Device: Send {
    fn info(&self) -> &DeviceInfo;

    fn nodemap(&mut self) -> &mut dyn NodeMap;

    /// Creates the data stream bound to this device. Only one stream per device.
    fn create_stream(&mut self) -> SdkResult<Box<dyn DataStream>>;

    fn acquisition_start(&mut self) -> SdkResult<()>;

    fn acquisition_stop(&mut self) -> SdkResult<()>;

    /// Mirrors the SDK's device-lost event node.
    fn is_lost(&self) -> bool;
}

/// Retrieve/release half of a stream; the only part visible to callbacks.
pub trait BufferSource: Send {
    /// Blocks up to `timeout` for the next filled buffer; `Ok(None)` on timeout.
    fn retrieve(&mut self, timeout: Duration) -> SdkResult<Option<RawBuffer>>;

    /// Returns a slot to the pool. Releasing a token that is not outstanding
    /// fails with `InvalidBuffer`.
    fn release(&mut self, token: BufferToken) -> SdkResult<()>;
}

/// Invoked by the SDK once per buffer-ready event, on an SDK-owned thread.
///
/// The callback only sees the [`BufferSource`] half of the stream, so it
/// cannot re-enter stream start/stop.
pub type StreamCallback = Box<dyn FnMut(&mut dyn BufferSource) + Send>;

/// Data stream bound 1:1 to a device.
pub trait DataStream: BufferSource {
    fn start_acquisition(&mut self) -> SdkResult<()>;

    /// Stops delivery. When a callback is registered this returns only after
    /// any in-flight invocation has finished; no invocation starts afterwards.
    fn stop_acquisition(&mut self) -> SdkResult<()>;

    /// Registers the buffer-ready handler. Must be called before
    /// `start_acquisition`.
    fn register_callback(&mut self, callback: StreamCallback) -> SdkResult<()>;

    fn unregister_callback(&mut self);
}

/// Process-wide vendor system.
pub trait CameraSystem: Send + Sync {
    fn initialize(&self) -> SdkResult<()>;

    fn terminate(&self);

    fn device_count(&self) -> usize;

    fn create_device(&self, index: usize) -> SdkResult<Box<dyn Device>>;
}

/// Explicit handle on the initialized vendor system.
///
/// Created once at process start and shared (`Arc`) with the manager and every
/// worker. The system is terminated when the last handle drops, which is after
/// every worker holding one has stopped and released its device.
pub struct SdkContext {
    system: Arc<dyn CameraSystem>,
}

impl SdkContext {
    pub fn initialize(system: Arc<dyn CameraSystem>) -> SdkResult<Self> {
        system.initialize()?;
        info!(devices = system.device_count(), "Camera system initialized");
        Ok(Self { system })
    }

    pub fn device_count(&self) -> usize {
        self.system.device_count()
    }

    pub fn create_device(&self, index: usize) -> SdkResult<Box<dyn Device>> {
        self.system.create_device(index)
    }
}

impl Drop for SdkContext {
    fn drop(&mut self) {
        self.system.terminate();
        debug!("Camera system terminated");
    }
}

impl fmt::Debug for SdkContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SdkContext")
            .field("devices", &self.system.device_count())
            .finish()
    }
}
