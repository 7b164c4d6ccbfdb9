//! Per-camera acquisition worker
//!
//! One [`AcquisitionWorker`] owns one device and its data stream. In polling
//! style a dedicated thread loops on buffer retrieval; in callback style the
//! stream invokes the same cycle from its own thread on every buffer-ready
//! event. Either way every cycle retrieves one buffer, converts it, releases
//! it and publishes the image to the worker's [`LatestImageCache`].

use std::fmt;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use crossbeam::utils::CachePadded;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, trace, warn};

use super::convert::{DecodedImage, DepthScaling, PixelConverter};
use super::frame::FrameBuffer;
use super::trigger::{TriggerController, TriggerSelector};
use crate::error::{AcqError, SdkError, SdkResult};
use crate::pipeline::latest::LatestImageCache;
use crate::pipeline::sink::FrameSink;
use crate::sdk::{BufferSource, DataStream, Device, NodeMap, SdkContext};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerMode {
    /// Free-run, the device paces itself
    Continuous,
    /// One frame per software trigger pulse
    #[default]
    SoftwareTriggered,
}

/// How buffers reach the worker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AcquisitionStyle {
    /// Dedicated thread blocking on retrieve with a timeout
    #[default]
    Polling,
    /// Stream buffer-ready callback
    Callback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Created,
    Configured,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WorkerState::Created => "created",
            WorkerState::Configured => "configured",
            WorkerState::Running => "running",
            WorkerState::Stopping => "stopping",
            WorkerState::Stopped => "stopped",
        })
    }
}

/// Per-worker settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraConfig {
    pub device_index: usize,
    /// BGR8 output when true, Mono8 otherwise
    pub color: bool,
    pub trigger_mode: TriggerMode,
    pub style: AcquisitionStyle,
    pub retrieve_timeout: Duration,
    pub decimation: Option<i64>,
    pub depth_scaling: DepthScaling,
    /// CPU core for the polling thread
    pub core: Option<usize>,
}

impl CameraConfig {
    pub fn new(device_index: usize) -> Self {
        Self {
            device_index,
            color: true,
            trigger_mode: TriggerMode::default(),
            style: AcquisitionStyle::default(),
            retrieve_timeout: Duration::from_millis(1000),
            decimation: None,
            depth_scaling: DepthScaling::default(),
            core: None,
        }
    }
}

/// Lifecycle notifications sent to the manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    Started { index: usize, camera: String },
    /// The worker hit a device-level error and stopped itself
    Faulted {
        index: usize,
        camera: String,
        error: String,
    },
    Stopped { index: usize, camera: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStatus {
    pub state: WorkerState,
    /// Set when the worker stopped because of a device fault
    pub fault: Option<String>,
}

/// Status shared between the control side and the acquisition thread.
struct StatusCell(ArcSwap<WorkerStatus>);

impl StatusCell {
    fn new() -> Self {
        Self(ArcSwap::from_pointee(WorkerStatus {
            state: WorkerState::Created,
            fault: None,
        }))
    }

    fn load(&self) -> Arc<WorkerStatus> {
        self.0.load_full()
    }

    fn state(&self) -> WorkerState {
        self.0.load().state
    }

    /// Moves to `to` if the current state satisfies `from`; keeps the fault.
    /// Returns the state that was found.
    fn transition(
        &self,
        from: impl Fn(WorkerState) -> bool,
        to: WorkerState,
    ) -> Result<WorkerState, WorkerState> {
        loop {
            let current = self.0.load_full();
            if !from(current.state) {
                return Err(current.state);
            }
            let next = Arc::new(WorkerStatus {
                state: to,
                fault: current.fault.clone(),
            });
            let previous = self.0.compare_and_swap(&current, next);
            if Arc::ptr_eq(&*previous, &current) {
                return Ok(current.state);
            }
        }
    }

    fn fail(&self, fault: String) {
        self.0.store(Arc::new(WorkerStatus {
            state: WorkerState::Stopped,
            fault: Some(fault),
        }));
    }
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    empty: AtomicU64,
    timeouts: AtomicU64,
    dropped: AtomicU64,
    triggers: AtomicU64,
}

/// Per-worker counters, cache padded so the acquisition thread does not
/// share a line with its neighbours.
#[derive(Default)]
pub struct WorkerStats {
    counters: CachePadded<Counters>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub published: u64,
    pub empty: u64,
    pub timeouts: u64,
    /// Frames lost to retrieval or conversion failures
    pub dropped: u64,
    pub triggers: u64,
}

impl WorkerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        let c = &self.counters;
        StatsSnapshot {
            published: c.published.load(Ordering::Relaxed),
            empty: c.empty.load(Ordering::Relaxed),
            timeouts: c.timeouts.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            triggers: c.triggers.load(Ordering::Relaxed),
        }
    }
}

fn lock_device(device: &Mutex<Box<dyn Device>>) -> MutexGuard<'_, Box<dyn Device>> {
    device.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Everything one acquisition cycle needs, shared with the loop thread or
/// the stream callback.
struct Cycle {
    index: usize,
    camera: String,
    timeout: Duration,
    device: Arc<Mutex<Box<dyn Device>>>,
    converter: PixelConverter,
    cache: Arc<LatestImageCache>,
    sink: Option<Arc<dyn FrameSink>>,
    stats: Arc<WorkerStats>,
    status: Arc<StatusCell>,
    events: flume::Sender<WorkerEvent>,
}

impl Cycle {
    fn sdk_failure(&self, err: SdkError) -> AcqError {
        match err {
            SdkError::DeviceLost(message) => AcqError::DeviceFault {
                camera: self.camera.clone(),
                message,
            },
            source => AcqError::Retrieval {
                camera: self.camera.clone(),
                source,
            },
        }
    }

    /// Retrieve, convert, release, publish. Returns the published frame id.
    fn run_once<S: BufferSource + ?Sized>(
        &self,
        source: &mut S,
        timeout: Duration,
    ) -> Result<u64, AcqError> {
        let buffer = match FrameBuffer::retrieve(source, timeout) {
            Ok(Some(buffer)) => buffer,
            Ok(None) if lock_device(&self.device).is_lost() => {
                return Err(AcqError::DeviceFault {
                    camera: self.camera.clone(),
                    message: "device lost".to_string(),
                })
            }
            Ok(None) => return Err(AcqError::RetrievalTimeout(timeout)),
            Err(e) => return Err(self.sdk_failure(e)),
        };

        let frame_id = buffer.frame_id();
        if !buffer.is_image_present() {
            return Err(AcqError::EmptyBuffer { frame_id });
        }

        let started = Instant::now();
        let image = self.converter.convert(&buffer.frame())?;
        buffer.release().map_err(|e| self.sdk_failure(e))?;
        metrics::histogram!("multicam_convert_time_us", "camera" => self.camera.clone())
            .record(started.elapsed().as_micros() as f64);

        // Consumers see the frame before any disk I/O happens.
        let persist = self.sink.as_ref().map(|sink| (sink, image.clone()));
        if self.cache.publish(image) {
            self.stats.counters.published.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("multicam_frames_published", "camera" => self.camera.clone())
                .increment(1);
        }

        if let Some((sink, image)) = persist {
            if let Err(e) = sink.save(&image, &self.camera, frame_id) {
                warn!(camera = %self.camera, frame_id, "Failed to save frame: {}", e);
            }
        }
        Ok(frame_id)
    }

    /// Absorbs frame-local errors; breaks on anything fatal.
    fn absorb(&self, result: Result<u64, AcqError>) -> ControlFlow<AcqError> {
        let counters = &self.stats.counters;
        match result {
            Ok(frame_id) => trace!(camera = %self.camera, frame_id, "Frame published"),
            Err(AcqError::RetrievalTimeout(timeout)) => {
                trace!(camera = %self.camera, ?timeout, "No buffer");
                counters.timeouts.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("multicam_retrieve_timeouts", "camera" => self.camera.clone())
                    .increment(1);
            }
            Err(AcqError::EmptyBuffer { frame_id }) => {
                debug!(camera = %self.camera, frame_id, "Buffer without image");
                counters.empty.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("multicam_frames_empty", "camera" => self.camera.clone())
                    .increment(1);
            }
            Err(e) if e.is_frame_local() => {
                warn!(camera = %self.camera, "Frame dropped: {}", e);
                counters.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("multicam_frames_dropped", "camera" => self.camera.clone())
                    .increment(1);
            }
            Err(e) => return ControlFlow::Break(e),
        }
        ControlFlow::Continue(())
    }

    /// Halts the device after a fatal error and reports it.
    fn fault(&self, error: AcqError) {
        error!(camera = %self.camera, index = self.index, "Acquisition stopped: {}", error);
        if let Err(e) = lock_device(&self.device).acquisition_stop() {
            debug!(camera = %self.camera, "Acquisition stop after fault: {}", e);
        }
        self.status.fail(error.to_string());
        let _ = self.events.send(WorkerEvent::Faulted {
            index: self.index,
            camera: self.camera.clone(),
            error: error.to_string(),
        });
    }

    fn poll(
        &self,
        mut stream: Box<dyn DataStream>,
        stop: &AtomicBool,
        core: Option<usize>,
    ) -> Box<dyn DataStream> {
        if let Some(core) = core {
            pin_current_thread(&self.camera, core);
        }

        while !stop.load(Ordering::Acquire) {
            let result = self.run_once(&mut *stream, self.timeout);
            if let ControlFlow::Break(fatal) = self.absorb(result) {
                if let Err(e) = stream.stop_acquisition() {
                    debug!(camera = %self.camera, "Stream stop after fault: {}", e);
                }
                self.fault(fatal);
                break;
            }
        }
        stream
    }

    fn on_buffer_ready(&self, source: &mut dyn BufferSource) {
        if self.status.state() == WorkerState::Stopped {
            return;
        }
        let result = self.run_once(source, Duration::ZERO);
        if let ControlFlow::Break(fatal) = self.absorb(result) {
            self.fault(fatal);
        }
    }
}

fn pin_current_thread(camera: &str, core: usize) {
    match core_affinity::get_core_ids() {
        Some(ids) if !ids.is_empty() => {
            let id = ids[core % ids.len()];
            if core_affinity::set_for_current(id) {
                debug!(camera, core = id.id, "Acquisition thread pinned");
            } else {
                warn!(camera, core = id.id, "Failed to pin acquisition thread");
            }
        }
        _ => warn!(camera, "CPU core ids unavailable, thread not pinned"),
    }
}

fn decimate(nodes: &mut dyn NodeMap, factor: i64) -> SdkResult<()> {
    nodes.set_integer("DecimationHorizontal", factor)?;
    nodes.set_integer("DecimationVertical", factor)?;
    if factor == 1 {
        let (_, width) = nodes.get_integer("Width")?;
        nodes.set_integer("Width", width)?;
        let (_, height) = nodes.get_integer("Height")?;
        nodes.set_integer("Height", height)?;
    }
    Ok(())
}

/// Where the data stream currently lives
enum Execution {
    Idle(Box<dyn DataStream>),
    Polling(JoinHandle<Box<dyn DataStream>>),
    Callback(Box<dyn DataStream>),
    /// Lost with a panicked or unspawned thread
    Detached,
}

/// Acquisition worker for one camera.
///
/// `Created -> Configured -> Running -> Stopping -> Stopped`. Stopped is
/// terminal: a stopped worker is not restarted.
pub struct AcquisitionWorker {
    config: CameraConfig,
    cycle: Arc<Cycle>,
    trigger: TriggerController,
    stop_flag: Arc<AtomicBool>,
    execution: Execution,
    finished: bool,
    // Keeps the camera system alive until this worker's device is gone.
    _ctx: Arc<SdkContext>,
}

impl AcquisitionWorker {
    /// Opens the device and its stream. The worker starts in `Created`.
    pub fn new(
        index: usize,
        ctx: Arc<SdkContext>,
        config: CameraConfig,
        events: flume::Sender<WorkerEvent>,
        sink: Option<Arc<dyn FrameSink>>,
    ) -> Result<Self, AcqError> {
        let open_failed = |e: SdkError| AcqError::Configuration {
            camera: format!("device #{}", config.device_index),
            message: e.to_string(),
        };
        let mut device = ctx.create_device(config.device_index).map_err(open_failed)?;
        let stream = device.create_stream().map_err(open_failed)?;
        let camera = device.info().display_name.clone();
        info!(index, device = %device.info(), "Camera opened");

        let cycle = Cycle {
            index,
            camera: camera.clone(),
            timeout: config.retrieve_timeout,
            device: Arc::new(Mutex::new(device)),
            converter: PixelConverter::for_camera(config.color).with_scaling(config.depth_scaling),
            cache: Arc::new(LatestImageCache::new()),
            sink,
            stats: Arc::new(WorkerStats::default()),
            status: Arc::new(StatusCell::new()),
            events,
        };

        Ok(Self {
            config,
            cycle: Arc::new(cycle),
            trigger: TriggerController::new(camera),
            stop_flag: Arc::new(AtomicBool::new(false)),
            execution: Execution::Idle(stream),
            finished: false,
            _ctx: ctx,
        })
    }

    /// Applies decimation and the trigger mode. `Created -> Configured`.
    #[instrument(skip(self), fields(camera = %self.cycle.camera))]
    pub fn configure(&mut self) -> Result<(), AcqError> {
        let state = self.state();
        if state != WorkerState::Created {
            return Err(self.protocol("configure", format!("worker is {state}")));
        }

        let mut device = lock_device(&self.cycle.device);
        if let Some(factor) = self.config.decimation {
            match decimate(device.nodemap(), factor) {
                Ok(()) => info!(factor, "Decimation applied"),
                Err(e) => warn!(factor, "Decimation not applied: {}", e),
            }
        }

        match self.config.trigger_mode {
            TriggerMode::SoftwareTriggered => {
                self.trigger.configure(device.nodemap())?;
            }
            TriggerMode::Continuous => {
                if let Err(e) = device.nodemap().set_enum("TriggerMode", "Off") {
                    warn!("Could not switch trigger mode off: {}", e);
                }
            }
        }
        drop(device);

        let _ = self
            .cycle
            .status
            .transition(|s| s == WorkerState::Created, WorkerState::Configured);
        Ok(())
    }

    /// Starts stream and device acquisition and returns immediately.
    /// `Configured -> Running`; a second start is [`AcqError::AlreadyRunning`].
    #[instrument(skip(self), fields(camera = %self.cycle.camera))]
    pub fn start(&mut self) -> Result<(), AcqError> {
        match self.state() {
            WorkerState::Configured => {}
            WorkerState::Running | WorkerState::Stopping => {
                return Err(AcqError::AlreadyRunning(self.cycle.camera.clone()))
            }
            state => return Err(self.protocol("start", format!("worker is {state}"))),
        }
        if self.config.trigger_mode == TriggerMode::SoftwareTriggered {
            self.trigger.arm()?;
        }
        let mut stream = match std::mem::replace(&mut self.execution, Execution::Detached) {
            Execution::Idle(stream) => stream,
            other => {
                self.execution = other;
                self.trigger.disarm();
                return Err(self.protocol("start", "stream is not idle"));
            }
        };
        self.stop_flag.store(false, Ordering::Release);

        if self.config.style == AcquisitionStyle::Callback {
            let cycle = Arc::clone(&self.cycle);
            let registered = stream.register_callback(Box::new(
                move |source: &mut dyn BufferSource| cycle.on_buffer_ready(source),
            ));
            if let Err(e) = registered {
                self.trigger.disarm();
                self.execution = Execution::Idle(stream);
                return Err(AcqError::from_sdk(&self.cycle.camera, e));
            }
        }

        if let Err(e) = self.begin(&mut *stream) {
            self.trigger.disarm();
            stream.unregister_callback();
            self.execution = Execution::Idle(stream);
            return Err(e);
        }

        let _ = self
            .cycle
            .status
            .transition(|s| s == WorkerState::Configured, WorkerState::Running);

        self.execution = match self.config.style {
            AcquisitionStyle::Callback => Execution::Callback(stream),
            AcquisitionStyle::Polling => {
                let cycle = Arc::clone(&self.cycle);
                let stop = Arc::clone(&self.stop_flag);
                let core = self.config.core;
                let spawned = thread::Builder::new()
                    .name(format!("acq-{}", self.cycle.index))
                    .spawn(move || cycle.poll(stream, &stop, core));
                match spawned {
                    Ok(handle) => Execution::Polling(handle),
                    Err(e) => {
                        let fault = AcqError::DeviceFault {
                            camera: self.cycle.camera.clone(),
                            message: format!("acquisition thread: {e}"),
                        };
                        self.cycle.fault(fault);
                        Execution::Detached
                    }
                }
            }
        };

        info!(index = self.cycle.index, style = ?self.config.style, "Acquisition started");
        let _ = self.cycle.events.send(WorkerEvent::Started {
            index: self.cycle.index,
            camera: self.cycle.camera.clone(),
        });
        Ok(())
    }

    fn begin(&self, stream: &mut dyn DataStream) -> Result<(), AcqError> {
        let camera = &self.cycle.camera;
        stream
            .start_acquisition()
            .map_err(|e| AcqError::from_sdk(camera, e))?;
        if let Err(e) = lock_device(&self.cycle.device).acquisition_start() {
            if let Err(stop) = stream.stop_acquisition() {
                debug!(camera = %camera, "Stream stop after failed start: {}", stop);
            }
            return Err(AcqError::from_sdk(camera, e));
        }
        Ok(())
    }

    /// Stops acquisition and waits for the loop thread or any in-flight
    /// callback to finish. `Running -> Stopping -> Stopped`; calling it on
    /// a stopped worker does nothing.
    #[instrument(skip(self), fields(camera = %self.cycle.camera))]
    pub fn stop(&mut self) {
        if self.finished {
            return;
        }
        let _ = self
            .cycle
            .status
            .transition(|s| s == WorkerState::Running, WorkerState::Stopping);
        self.stop_flag.store(true, Ordering::Release);

        match std::mem::replace(&mut self.execution, Execution::Detached) {
            Execution::Polling(handle) => match handle.join() {
                Ok(mut stream) => {
                    self.halt(&mut *stream);
                    self.execution = Execution::Idle(stream);
                }
                Err(_) => error!("Acquisition thread panicked"),
            },
            Execution::Callback(mut stream) => {
                self.halt(&mut *stream);
                stream.unregister_callback();
                self.execution = Execution::Idle(stream);
            }
            other => self.execution = other,
        }

        if self.config.trigger_mode == TriggerMode::SoftwareTriggered {
            self.trigger.disarm();
            let mut device = lock_device(&self.cycle.device);
            self.trigger.teardown(device.nodemap());
        }

        let _ = self
            .cycle
            .status
            .transition(|s| s != WorkerState::Stopped, WorkerState::Stopped);
        self.finished = true;
        info!(index = self.cycle.index, "Acquisition stopped");
        let _ = self.cycle.events.send(WorkerEvent::Stopped {
            index: self.cycle.index,
            camera: self.cycle.camera.clone(),
        });
    }

    /// Device first so nothing new arrives, then the stream, which waits
    /// for an in-flight callback.
    fn halt(&self, stream: &mut dyn DataStream) {
        let camera = &self.cycle.camera;
        if let Err(e) = lock_device(&self.cycle.device).acquisition_stop() {
            debug!(camera = %camera, "Acquisition stop: {}", e);
        }
        if let Err(e) = stream.stop_acquisition() {
            warn!(camera = %camera, "Stream stop failed: {}", e);
        }
    }

    /// Issues one software trigger. Only valid while Running in
    /// software-triggered mode; otherwise rejected without a device call.
    pub fn trigger(&self) -> Result<(), AcqError> {
        if self.config.trigger_mode != TriggerMode::SoftwareTriggered {
            return Err(self.protocol("trigger", "camera runs in continuous mode"));
        }
        let state = self.state();
        if state != WorkerState::Running {
            return Err(self.protocol("trigger", format!("worker is {state}")));
        }

        let mut device = lock_device(&self.cycle.device);
        self.trigger.pulse(device.nodemap())?;
        drop(device);

        self.cycle
            .stats
            .counters
            .triggers
            .fetch_add(1, Ordering::Relaxed);
        metrics::counter!("multicam_triggers", "camera" => self.cycle.camera.clone()).increment(1);
        debug!(camera = %self.cycle.camera, "Trigger sent");
        Ok(())
    }

    fn protocol(&self, operation: &'static str, reason: impl Into<String>) -> AcqError {
        AcqError::protocol(&self.cycle.camera, operation, reason)
    }

    pub fn index(&self) -> usize {
        self.cycle.index
    }

    pub fn name(&self) -> &str {
        &self.cycle.camera
    }

    pub fn config(&self) -> &CameraConfig {
        &self.config
    }

    pub fn state(&self) -> WorkerState {
        self.cycle.status.state()
    }

    pub fn status(&self) -> Arc<WorkerStatus> {
        self.cycle.status.load()
    }

    pub fn trigger_selector(&self) -> Option<TriggerSelector> {
        self.trigger.selector()
    }

    pub fn cache(&self) -> Arc<LatestImageCache> {
        Arc::clone(&self.cycle.cache)
    }

    pub fn latest_image(&self) -> Option<DecodedImage> {
        self.cycle.cache.read()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.cycle.stats.snapshot()
    }
}

impl Drop for AcquisitionWorker {
    fn drop(&mut self) {
        if matches!(
            self.execution,
            Execution::Polling(_) | Execution::Callback(_)
        ) {
            self.stop();
        }
    }
}

impl fmt::Debug for AcquisitionWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquisitionWorker")
            .field("index", &self.cycle.index)
            .field("camera", &self.cycle.camera)
            .field("status", &self.status())
            .finish()
    }
}
