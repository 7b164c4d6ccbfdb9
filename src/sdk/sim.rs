//! In-process simulated GenICam camera system.
//!
//! Each simulated device has a bounded buffer pool, a nodemap with the
//! trigger/decimation nodes the acquisition core touches, free-run and
//! software-trigger capture, and stream callbacks delivered from an SDK-owned
//! thread. A [`SimProbe`] exposes counters and fault injection so tests can
//! verify buffer discipline and failure isolation.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::capture::frame::{BufferInfo, PixelFormat};
use crate::error::{SdkError, SdkResult};
use crate::sdk::{
    BufferSource, BufferToken, CameraSystem, DataStream, Device, DeviceInfo, NodeMap, RawBuffer,
    StreamCallback,
};

const TRIGGER_SELECTORS: [&str; 3] = ["FrameStart", "ExposureStart", "AcquisitionStart"];
const TRIGGER_SOURCES: [&str; 3] = ["Software", "Line0", "Line2"];
const MAX_DECIMATION: i64 = 4;

/// Static description of one simulated camera
#[derive(Debug, Clone)]
pub struct SimCameraSpec {
    pub display_name: String,
    pub model: String,
    pub serial_number: String,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    /// Free-run frame period when trigger mode is off
    pub frame_interval: Duration,
    pub buffer_count: u32,
    /// Trigger selector entries this device does not offer
    pub unsupported_selectors: Vec<String>,
    /// Nodes whose writes are refused
    pub locked_nodes: Vec<String>,
}

impl SimCameraSpec {
    pub fn new(index: usize, pixel_format: PixelFormat) -> Self {
        Self {
            display_name: format!("SimCam-{index}"),
            model: "SIM-GEN1".to_string(),
            serial_number: format!("{:08}", 24_000_000 + index),
            width: 64,
            height: 48,
            pixel_format,
            frame_interval: Duration::from_millis(20),
            buffer_count: 4,
            unsupported_selectors: Vec::new(),
            locked_nodes: Vec::new(),
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    pub fn with_buffer_count(mut self, count: u32) -> Self {
        self.buffer_count = count.max(1);
        self
    }

    pub fn without_selector(mut self, selector: &str) -> Self {
        self.unsupported_selectors.push(selector.to_string());
        self
    }

    pub fn with_locked_node(mut self, node: &str) -> Self {
        self.locked_nodes.push(node.to_string());
        self
    }
}

/// Deterministic payload for `frame_id`, laid out in `format`.
pub fn test_pattern(format: PixelFormat, width: u32, height: u32, frame_id: u64) -> Vec<u8> {
    let samples = width as usize * height as usize * format.samples_per_pixel();
    let seed = (frame_id as usize).wrapping_mul(13);
    if format.bytes_per_sample() == 1 {
        (0..samples).map(|i| (seed + i * 3) as u8).collect()
    } else {
        let mask = (1usize << format.bit_depth()) - 1;
        (0..samples)
            .flat_map(|i| ((((seed + i * 3) * 17) & mask) as u16).to_le_bytes())
            .collect()
    }
}

/// Snapshot of a device's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimCounters {
    pub emitted: u64,
    pub dropped: u64,
    pub retrieved: u64,
    pub released: u64,
    pub double_releases: u64,
    pub triggers: u64,
}

#[derive(Default)]
struct Counters {
    emitted: AtomicU64,
    dropped: AtomicU64,
    retrieved: AtomicU64,
    released: AtomicU64,
    double_releases: AtomicU64,
    triggers: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
enum Injected {
    Empty,
    Truncated,
}

struct Nodes {
    enums: HashMap<String, String>,
    integers: HashMap<String, (i64, i64)>,
}

struct Pipe {
    streaming: bool,
    acquiring: bool,
    geometry: (u32, u32),
    queue: VecDeque<RawBuffer>,
    outstanding: HashSet<BufferToken>,
    free_slots: u32,
    next_frame_id: u64,
    next_token: u64,
    pending_events: u64,
    lost_signaled: bool,
    injected: VecDeque<Injected>,
}

struct SimCore {
    index: usize,
    spec: SimCameraSpec,
    info: DeviceInfo,
    opened: AtomicBool,
    lost: AtomicBool,
    nodes: Mutex<Nodes>,
    pipe: Mutex<Pipe>,
    ready: Condvar,
    counters: Counters,
}

impl SimCore {
    fn new(index: usize, spec: SimCameraSpec) -> Self {
        let info = DeviceInfo {
            display_name: spec.display_name.clone(),
            model: spec.model.clone(),
            serial_number: spec.serial_number.clone(),
            color: spec.pixel_format.is_color(),
        };

        let enums = HashMap::from([
            ("TriggerSelector".to_string(), "FrameStart".to_string()),
            ("TriggerMode".to_string(), "Off".to_string()),
            ("TriggerSource".to_string(), "Line0".to_string()),
            ("PixelFormat".to_string(), spec.pixel_format.name().to_string()),
        ]);
        let integers = HashMap::from([
            ("Width".to_string(), (i64::from(spec.width), i64::from(spec.width))),
            ("Height".to_string(), (i64::from(spec.height), i64::from(spec.height))),
            ("DecimationHorizontal".to_string(), (1, MAX_DECIMATION)),
            ("DecimationVertical".to_string(), (1, MAX_DECIMATION)),
        ]);

        Self {
            index,
            pipe: Mutex::new(Pipe {
                streaming: false,
                acquiring: false,
                geometry: (spec.width, spec.height),
                queue: VecDeque::new(),
                outstanding: HashSet::new(),
                free_slots: spec.buffer_count,
                next_frame_id: 1,
                next_token: 1,
                pending_events: 0,
                lost_signaled: false,
                injected: VecDeque::new(),
            }),
            nodes: Mutex::new(Nodes { enums, integers }),
            spec,
            info,
            opened: AtomicBool::new(false),
            lost: AtomicBool::new(false),
            ready: Condvar::new(),
            counters: Counters::default(),
        }
    }

    fn lock_pipe(&self) -> MutexGuard<'_, Pipe> {
        self.pipe.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_nodes(&self) -> MutexGuard<'_, Nodes> {
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    fn check_lost(&self) -> SdkResult<()> {
        if self.is_lost() {
            Err(SdkError::DeviceLost(self.info.display_name.clone()))
        } else {
            Ok(())
        }
    }

    fn enum_value(&self, node: &str) -> Option<String> {
        self.lock_nodes().enums.get(node).cloned()
    }

    fn allowed_entries(&self, node: &str) -> Vec<&str> {
        match node {
            "TriggerSelector" => TRIGGER_SELECTORS
                .iter()
                .copied()
                .filter(|s| !self.spec.unsupported_selectors.iter().any(|u| u == s))
                .collect(),
            "TriggerMode" => vec!["Off", "On"],
            "TriggerSource" => TRIGGER_SOURCES.to_vec(),
            "PixelFormat" => vec![self.spec.pixel_format.name()],
            _ => Vec::new(),
        }
    }

    /// Current output geometry after decimation.
    fn output_geometry(&self) -> (u32, u32) {
        let nodes = self.lock_nodes();
        let get = |name: &str| nodes.integers.get(name).map(|(v, _)| *v).unwrap_or(1);
        let width = get("Width") / get("DecimationHorizontal").max(1);
        let height = get("Height") / get("DecimationVertical").max(1);
        (width.max(1) as u32, height.max(1) as u32)
    }

    /// Fills one free slot with a new frame. Caller holds the pipe lock.
    fn emit_locked(&self, pipe: &mut Pipe) {
        if !pipe.streaming || !pipe.acquiring || self.is_lost() || pipe.free_slots == 0 {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        pipe.free_slots -= 1;

        let frame_id = pipe.next_frame_id;
        pipe.next_frame_id += 1;
        let token = BufferToken(pipe.next_token);
        pipe.next_token += 1;

        let (width, height) = pipe.geometry;
        let format = self.spec.pixel_format;
        let mut info = BufferInfo {
            frame_id,
            image_present: true,
            width,
            height,
            pixel_format: format,
        };
        let mut payload = test_pattern(format, width, height, frame_id);
        match pipe.injected.pop_front() {
            Some(Injected::Empty) => {
                info.image_present = false;
                payload.clear();
            }
            Some(Injected::Truncated) => payload.truncate(payload.len() / 2),
            None => {}
        }

        pipe.queue.push_back(RawBuffer {
            token,
            info,
            payload: Bytes::from(payload),
        });
        pipe.pending_events += 1;
        self.counters.emitted.fetch_add(1, Ordering::Relaxed);
        self.ready.notify_all();
    }

    fn emit(&self) {
        let mut pipe = self.lock_pipe();
        self.emit_locked(&mut pipe);
    }

    fn free_run(&self) {
        let interval = self.spec.frame_interval;
        let mut pipe = self.lock_pipe();
        loop {
            let (guard, _) = self
                .ready
                .wait_timeout_while(pipe, interval, |p| p.acquiring)
                .unwrap_or_else(PoisonError::into_inner);
            pipe = guard;
            if !pipe.acquiring || self.is_lost() {
                break;
            }
            self.emit_locked(&mut pipe);
        }
    }

    fn retrieve(&self, timeout: Duration) -> SdkResult<Option<RawBuffer>> {
        let pipe = self.lock_pipe();
        if !pipe.streaming {
            return Err(SdkError::InvalidState("stream not started".to_string()));
        }
        let (mut pipe, _) = self
            .ready
            .wait_timeout_while(pipe, timeout, |p| {
                p.queue.is_empty() && p.streaming && !self.is_lost()
            })
            .unwrap_or_else(PoisonError::into_inner);

        self.check_lost()?;
        match pipe.queue.pop_front() {
            Some(raw) => {
                pipe.outstanding.insert(raw.token);
                self.counters.retrieved.fetch_add(1, Ordering::Relaxed);
                Ok(Some(raw))
            }
            None => Ok(None),
        }
    }

    fn release(&self, token: BufferToken) -> SdkResult<()> {
        let mut pipe = self.lock_pipe();
        if pipe.outstanding.remove(&token) {
            pipe.free_slots += 1;
            self.counters.released.fetch_add(1, Ordering::Relaxed);
            Ok(())
        } else {
            self.counters.double_releases.fetch_add(1, Ordering::Relaxed);
            Err(SdkError::InvalidBuffer(token.0))
        }
    }
}

/// Simulated vendor system holding a fixed set of cameras
pub struct SimSystem {
    cores: Vec<Arc<SimCore>>,
    initialized: AtomicBool,
}

impl SimSystem {
    pub fn new(specs: Vec<SimCameraSpec>) -> Self {
        let cores = specs
            .into_iter()
            .enumerate()
            .map(|(index, spec)| Arc::new(SimCore::new(index, spec)))
            .collect();
        Self {
            cores,
            initialized: AtomicBool::new(false),
        }
    }

    /// `count` identical cameras delivering `pixel_format`.
    pub fn with_cameras(count: usize, pixel_format: PixelFormat) -> Self {
        Self::new(
            (0..count)
                .map(|i| SimCameraSpec::new(i, pixel_format))
                .collect(),
        )
    }

    pub fn probe(&self, index: usize) -> Option<SimProbe> {
        self.cores.get(index).map(|core| SimProbe {
            core: Arc::clone(core),
        })
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }
}

impl CameraSystem for SimSystem {
    fn initialize(&self) -> SdkResult<()> {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Err(SdkError::AlreadyInitialized);
        }
        Ok(())
    }

    fn terminate(&self) {
        self.initialized.store(false, Ordering::Release);
    }

    fn device_count(&self) -> usize {
        self.cores.len()
    }

    fn create_device(&self, index: usize) -> SdkResult<Box<dyn Device>> {
        if !self.is_initialized() {
            return Err(SdkError::NotInitialized);
        }
        let core = self.cores.get(index).ok_or(SdkError::NoDevice(index))?;
        if core.opened.swap(true, Ordering::AcqRel) {
            return Err(SdkError::AlreadyOpen(index));
        }
        debug!(index, device = %core.info, "Simulated device opened");
        Ok(Box::new(SimDevice {
            core: Arc::clone(core),
            stream_created: false,
            generator: None,
        }))
    }
}

pub struct SimDevice {
    core: Arc<SimCore>,
    stream_created: bool,
    generator: Option<JoinHandle<()>>,
}

impl SimDevice {
    fn stop_generator(&mut self) {
        {
            let mut pipe = self.core.lock_pipe();
            pipe.acquiring = false;
            self.core.ready.notify_all();
        }
        if let Some(handle) = self.generator.take() {
            if handle.join().is_err() {
                warn!(device = %self.core.info.display_name, "Free-run thread panicked");
            }
        }
    }
}

impl NodeMap for SimDevice {
    fn set_enum(&mut self, node: &str, entry: &str) -> SdkResult<()> {
        self.core.check_lost()?;
        if self.core.spec.locked_nodes.iter().any(|n| n == node) {
            return Err(SdkError::AccessDenied(node.to_string()));
        }
        let allowed = self.core.allowed_entries(node);
        if allowed.is_empty() {
            return Err(SdkError::NodeNotFound(node.to_string()));
        }
        if !allowed.contains(&entry) {
            return Err(SdkError::EntryNotAvailable {
                node: node.to_string(),
                entry: entry.to_string(),
            });
        }
        self.core
            .lock_nodes()
            .enums
            .insert(node.to_string(), entry.to_string());
        Ok(())
    }

    fn get_enum(&self, node: &str) -> SdkResult<String> {
        self.core.check_lost()?;
        self.core
            .enum_value(node)
            .ok_or_else(|| SdkError::NodeNotFound(node.to_string()))
    }

    fn set_integer(&mut self, node: &str, value: i64) -> SdkResult<()> {
        self.core.check_lost()?;
        if self.core.spec.locked_nodes.iter().any(|n| n == node) {
            return Err(SdkError::AccessDenied(node.to_string()));
        }
        let mut nodes = self.core.lock_nodes();
        let slot = nodes
            .integers
            .get_mut(node)
            .ok_or_else(|| SdkError::NodeNotFound(node.to_string()))?;
        if value < 1 || value > slot.1 {
            return Err(SdkError::InvalidState(format!(
                "{node}={value} outside 1..={}",
                slot.1
            )));
        }
        slot.0 = value;
        Ok(())
    }

    fn get_integer(&self, node: &str) -> SdkResult<(i64, i64)> {
        self.core.check_lost()?;
        self.core
            .lock_nodes()
            .integers
            .get(node)
            .copied()
            .ok_or_else(|| SdkError::NodeNotFound(node.to_string()))
    }

    fn execute(&mut self, node: &str) -> SdkResult<()> {
        self.core.check_lost()?;
        if node != "TriggerSoftware" {
            return Err(SdkError::NodeNotFound(node.to_string()));
        }
        self.core.counters.triggers.fetch_add(1, Ordering::Relaxed);

        let armed = {
            let nodes = self.core.lock_nodes();
            nodes.enums.get("TriggerMode").map(String::as_str) == Some("On")
                && nodes.enums.get("TriggerSource").map(String::as_str) == Some("Software")
        };
        if armed {
            self.core.emit();
        }
        Ok(())
    }
}

impl Device for SimDevice {
    fn info(&self) -> &DeviceInfo {
        &self.core.info
    }

    fn nodemap(&mut self) -> &mut dyn NodeMap {
        self
    }

    fn create_stream(&mut self) -> SdkResult<Box<dyn DataStream>> {
        self.core.check_lost()?;
        if self.stream_created {
            return Err(SdkError::InvalidState("stream already created".to_string()));
        }
        self.stream_created = true;
        Ok(Box::new(SimStream {
            core: Arc::clone(&self.core),
            callback: None,
            dispatcher: None,
        }))
    }

    fn acquisition_start(&mut self) -> SdkResult<()> {
        self.core.check_lost()?;
        let free_run = self.core.enum_value("TriggerMode").as_deref() != Some("On");
        let geometry = self.core.output_geometry();
        {
            let mut pipe = self.core.lock_pipe();
            if pipe.acquiring {
                return Err(SdkError::InvalidState("acquisition already started".to_string()));
            }
            pipe.acquiring = true;
            pipe.geometry = geometry;
        }

        if free_run {
            let core = Arc::clone(&self.core);
            let handle = thread::Builder::new()
                .name(format!("sim-free-run-{}", self.core.index))
                .spawn(move || core.free_run())
                .map_err(|e| SdkError::InvalidState(format!("free-run thread: {e}")))?;
            self.generator = Some(handle);
        }
        Ok(())
    }

    fn acquisition_stop(&mut self) -> SdkResult<()> {
        self.stop_generator();
        self.core.check_lost()
    }

    fn is_lost(&self) -> bool {
        self.core.is_lost()
    }
}

impl Drop for SimDevice {
    fn drop(&mut self) {
        self.stop_generator();
        self.core.opened.store(false, Ordering::Release);
    }
}

pub struct SimStream {
    core: Arc<SimCore>,
    callback: Option<StreamCallback>,
    dispatcher: Option<JoinHandle<StreamCallback>>,
}

/// Retrieve/release handle given to stream callbacks
struct SimSource {
    core: Arc<SimCore>,
}

impl BufferSource for SimSource {
    fn retrieve(&mut self, timeout: Duration) -> SdkResult<Option<RawBuffer>> {
        self.core.retrieve(timeout)
    }

    fn release(&mut self, token: BufferToken) -> SdkResult<()> {
        self.core.release(token)
    }
}

fn dispatch(core: Arc<SimCore>, mut callback: StreamCallback) -> StreamCallback {
    let mut source = SimSource {
        core: Arc::clone(&core),
    };
    loop {
        {
            let mut pipe = core.lock_pipe();
            while pipe.streaming
                && pipe.pending_events == 0
                && !(core.is_lost() && !pipe.lost_signaled)
            {
                pipe = core.ready.wait(pipe).unwrap_or_else(PoisonError::into_inner);
            }
            if !pipe.streaming {
                break;
            }
            if pipe.pending_events > 0 {
                pipe.pending_events -= 1;
            } else {
                pipe.lost_signaled = true;
            }
        }
        callback(&mut source);
    }
    callback
}

impl BufferSource for SimStream {
    fn retrieve(&mut self, timeout: Duration) -> SdkResult<Option<RawBuffer>> {
        self.core.retrieve(timeout)
    }

    fn release(&mut self, token: BufferToken) -> SdkResult<()> {
        self.core.release(token)
    }
}

impl DataStream for SimStream {
    fn start_acquisition(&mut self) -> SdkResult<()> {
        self.core.check_lost()?;
        {
            let mut pipe = self.core.lock_pipe();
            if pipe.streaming {
                return Err(SdkError::InvalidState("stream already started".to_string()));
            }
            pipe.streaming = true;
            pipe.queue.clear();
            pipe.pending_events = 0;
            pipe.lost_signaled = false;
            pipe.free_slots = self
                .core
                .spec
                .buffer_count
                .saturating_sub(pipe.outstanding.len() as u32);
        }

        if let Some(callback) = self.callback.take() {
            let core = Arc::clone(&self.core);
            let handle = thread::Builder::new()
                .name(format!("sim-stream-{}", self.core.index))
                .spawn(move || dispatch(core, callback))
                .map_err(|e| SdkError::InvalidState(format!("stream thread: {e}")))?;
            self.dispatcher = Some(handle);
        }
        Ok(())
    }

    fn stop_acquisition(&mut self) -> SdkResult<()> {
        {
            let mut pipe = self.core.lock_pipe();
            pipe.streaming = false;
            let drained = pipe.queue.len() as u32;
            pipe.queue.clear();
            pipe.free_slots += drained;
            pipe.pending_events = 0;
            self.core.ready.notify_all();
        }

        if let Some(handle) = self.dispatcher.take() {
            match handle.join() {
                Ok(callback) => self.callback = Some(callback),
                Err(_) => warn!(device = %self.core.info.display_name, "Stream callback panicked"),
            }
        }
        Ok(())
    }

    fn register_callback(&mut self, callback: StreamCallback) -> SdkResult<()> {
        if self.dispatcher.is_some() {
            return Err(SdkError::InvalidState(
                "cannot register a callback while streaming".to_string(),
            ));
        }
        self.callback = Some(callback);
        Ok(())
    }

    fn unregister_callback(&mut self) {
        self.callback = None;
    }
}

impl Drop for SimStream {
    fn drop(&mut self) {
        if self.dispatcher.is_some() {
            let _ = self.stop_acquisition();
        }
    }
}

/// Test/diagnostic handle on one simulated camera
#[derive(Clone)]
pub struct SimProbe {
    core: Arc<SimCore>,
}

impl SimProbe {
    pub fn counters(&self) -> SimCounters {
        let c = &self.core.counters;
        SimCounters {
            emitted: c.emitted.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            retrieved: c.retrieved.load(Ordering::Relaxed),
            released: c.released.load(Ordering::Relaxed),
            double_releases: c.double_releases.load(Ordering::Relaxed),
            triggers: c.triggers.load(Ordering::Relaxed),
        }
    }

    /// Buffers retrieved and not yet released
    pub fn outstanding(&self) -> usize {
        self.core.lock_pipe().outstanding.len()
    }

    pub fn is_streaming(&self) -> bool {
        self.core.lock_pipe().streaming
    }

    pub fn is_acquiring(&self) -> bool {
        self.core.lock_pipe().acquiring
    }

    pub fn is_open(&self) -> bool {
        self.core.opened.load(Ordering::Acquire)
    }

    pub fn enum_value(&self, node: &str) -> Option<String> {
        self.core.enum_value(node)
    }

    pub fn integer_value(&self, node: &str) -> Option<i64> {
        self.core
            .lock_nodes()
            .integers
            .get(node)
            .map(|(value, _)| *value)
    }

    /// Simulates unplugging the camera.
    pub fn lose_device(&self) {
        self.core.lost.store(true, Ordering::Release);
        let _pipe = self.core.lock_pipe();
        self.core.ready.notify_all();
    }

    /// The next `count` frames arrive without image payload.
    pub fn inject_empty(&self, count: usize) {
        let mut pipe = self.core.lock_pipe();
        pipe.injected.extend(std::iter::repeat(Injected::Empty).take(count));
    }

    /// The next `count` frames arrive with half their payload missing.
    pub fn inject_truncated(&self, count: usize) {
        let mut pipe = self.core.lock_pipe();
        pipe.injected
            .extend(std::iter::repeat(Injected::Truncated).take(count));
    }

    /// Emits one frame regardless of trigger configuration (hardware line).
    pub fn emit(&self) {
        self.core.emit();
    }
}
