//! Fan-out of commands to many acquisition workers

use std::fmt;
use std::sync::Arc;
use std::thread;

use tracing::{info, instrument, warn};

use crate::capture::convert::DecodedImage;
use crate::capture::worker::{
    AcquisitionWorker, CameraConfig, StatsSnapshot, WorkerEvent, WorkerState,
};
use crate::error::AcqError;
use crate::pipeline::latest::LatestImageCache;
use crate::pipeline::sink::FrameSink;
use crate::sdk::SdkContext;

/// One line of the status report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraSummary {
    pub index: usize,
    pub name: String,
    pub state: WorkerState,
    pub fault: Option<String>,
    pub latest_frame_id: Option<u64>,
    pub stats: StatsSnapshot,
}

impl fmt::Display for CameraSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.index, self.name, self.state)?;
        match self.latest_frame_id {
            Some(id) => write!(f, ", last frame {id}")?,
            None => write!(f, ", no frame yet")?,
        }
        write!(
            f,
            " (published {}, empty {}, dropped {}, timeouts {}, triggers {})",
            self.stats.published,
            self.stats.empty,
            self.stats.dropped,
            self.stats.timeouts,
            self.stats.triggers
        )?;
        if let Some(fault) = &self.fault {
            write!(f, " fault: {fault}")?;
        }
        Ok(())
    }
}

/// Owns every acquisition worker of the process.
///
/// Indices are dense and assigned in creation order. Device-level calls
/// always go through the owning worker.
pub struct CameraManager {
    ctx: Arc<SdkContext>,
    workers: Vec<AcquisitionWorker>,
    sink: Option<Arc<dyn FrameSink>>,
    events_tx: flume::Sender<WorkerEvent>,
    events_rx: flume::Receiver<WorkerEvent>,
}

impl CameraManager {
    pub fn new(ctx: Arc<SdkContext>) -> Self {
        let (events_tx, events_rx) = flume::unbounded();
        Self {
            ctx,
            workers: Vec::new(),
            sink: None,
            events_tx,
            events_rx,
        }
    }

    /// Every worker added afterwards persists its frames to `sink`.
    pub fn with_sink(mut self, sink: Arc<dyn FrameSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Creates and configures a worker. A failed worker does not take an
    /// index.
    #[instrument(skip(self, config), fields(device = config.device_index))]
    pub fn add_worker(&mut self, config: CameraConfig) -> Result<usize, AcqError> {
        let index = self.workers.len();
        let mut worker = AcquisitionWorker::new(
            index,
            Arc::clone(&self.ctx),
            config,
            self.events_tx.clone(),
            self.sink.clone(),
        )?;
        worker.configure()?;
        info!(index, camera = worker.name(), "Worker ready");
        self.workers.push(worker);
        Ok(index)
    }

    /// Starts every worker; failures are collected, not propagated.
    #[instrument(skip(self))]
    pub fn start_all(&mut self) -> Vec<(usize, AcqError)> {
        self.workers
            .iter_mut()
            .enumerate()
            .filter_map(|(index, worker)| worker.start().err().map(|e| (index, e)))
            .inspect(|(index, e)| warn!(index, "Start failed: {}", e))
            .collect()
    }

    pub fn start(&mut self, index: usize) -> Result<(), AcqError> {
        self.worker_mut(index)?.start()
    }

    /// Stops all workers concurrently and returns once each is Stopped.
    #[instrument(skip(self))]
    pub fn stop_all(&mut self) {
        thread::scope(|scope| {
            for worker in self.workers.iter_mut() {
                scope.spawn(move || worker.stop());
            }
        });
        info!(count = self.workers.len(), "All workers stopped");
    }

    pub fn stop(&mut self, index: usize) -> Result<(), AcqError> {
        self.worker_mut(index)?.stop();
        Ok(())
    }

    pub fn trigger(&self, index: usize) -> Result<(), AcqError> {
        self.worker(index)?.trigger()
    }

    /// Triggers each listed camera once, in order. Repeated indices are
    /// pulsed once; every index gets its own result.
    pub fn trigger_many(&self, indices: &[usize]) -> Vec<(usize, Result<(), AcqError>)> {
        let mut seen = Vec::with_capacity(indices.len());
        for &index in indices {
            if !seen.contains(&index) {
                seen.push(index);
            }
        }
        seen.into_iter()
            .map(|index| (index, self.trigger(index)))
            .collect()
    }

    pub fn worker(&self, index: usize) -> Result<&AcquisitionWorker, AcqError> {
        let count = self.workers.len();
        self.workers
            .get(index)
            .ok_or(AcqError::InvalidIndex { index, count })
    }

    fn worker_mut(&mut self, index: usize) -> Result<&mut AcquisitionWorker, AcqError> {
        let count = self.workers.len();
        self.workers
            .get_mut(index)
            .ok_or(AcqError::InvalidIndex { index, count })
    }

    pub fn latest_image(&self, index: usize) -> Result<Option<DecodedImage>, AcqError> {
        Ok(self.worker(index)?.latest_image())
    }

    pub fn cache(&self, index: usize) -> Result<Arc<LatestImageCache>, AcqError> {
        Ok(self.worker(index)?.cache())
    }

    pub fn state(&self, index: usize) -> Result<WorkerState, AcqError> {
        Ok(self.worker(index)?.state())
    }

    pub fn states(&self) -> Vec<WorkerState> {
        self.workers.iter().map(AcquisitionWorker::state).collect()
    }

    pub fn all_stopped(&self) -> bool {
        self.states().iter().all(|s| *s == WorkerState::Stopped)
    }

    pub fn summary(&self) -> Vec<CameraSummary> {
        self.workers
            .iter()
            .map(|worker| {
                let status = worker.status();
                CameraSummary {
                    index: worker.index(),
                    name: worker.name().to_string(),
                    state: status.state,
                    fault: status.fault.clone(),
                    latest_frame_id: worker.cache().latest_frame_id(),
                    stats: worker.stats(),
                }
            })
            .collect()
    }

    /// Receiver for lifecycle events; clones share one queue.
    pub fn events(&self) -> flume::Receiver<WorkerEvent> {
        self.events_rx.clone()
    }

    /// Events queued since the last call.
    pub fn drain_events(&self) -> Vec<WorkerEvent> {
        self.events_rx.try_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

impl Drop for CameraManager {
    fn drop(&mut self) {
        if !self.all_stopped() {
            self.stop_all();
        }
    }
}

impl fmt::Debug for CameraManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CameraManager")
            .field("workers", &self.workers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::PixelFormat;
    use crate::sdk::sim::{SimCameraSpec, SimSystem};
    use std::time::Duration;

    fn manager(specs: Vec<SimCameraSpec>) -> CameraManager {
        let system = Arc::new(SimSystem::new(specs));
        CameraManager::new(Arc::new(SdkContext::initialize(system).unwrap()))
    }

    fn config(index: usize) -> CameraConfig {
        CameraConfig {
            retrieve_timeout: Duration::from_millis(50),
            ..CameraConfig::new(index)
        }
    }

    #[test]
    fn indices_are_dense_and_failures_do_not_consume_one() {
        let mut manager = manager(vec![
            SimCameraSpec::new(0, PixelFormat::Mono8),
            SimCameraSpec::new(1, PixelFormat::Mono8)
                .without_selector("FrameStart")
                .without_selector("ExposureStart"),
            SimCameraSpec::new(2, PixelFormat::Mono8),
        ]);

        assert_eq!(manager.add_worker(config(0)).unwrap(), 0);
        assert!(matches!(
            manager.add_worker(config(1)),
            Err(AcqError::Configuration { .. })
        ));
        assert_eq!(manager.add_worker(config(2)).unwrap(), 1);
        assert!(matches!(
            manager.add_worker(config(7)),
            Err(AcqError::Configuration { .. })
        ));
        assert_eq!(manager.len(), 2);
        assert_eq!(manager.worker(1).unwrap().name(), "SimCam-2");
    }

    #[test]
    fn out_of_range_index_is_reported() {
        let mut manager = manager(vec![SimCameraSpec::new(0, PixelFormat::Mono8)]);
        manager.add_worker(config(0)).unwrap();

        assert!(matches!(
            manager.trigger(3),
            Err(AcqError::InvalidIndex { index: 3, count: 1 })
        ));
        assert!(manager.latest_image(1).is_err());
        assert!(manager.stop(5).is_err());
        assert_eq!(manager.state(0).unwrap(), WorkerState::Configured);
    }

    #[test]
    fn trigger_many_pulses_each_index_once() {
        let mut manager = manager(vec![
            SimCameraSpec::new(0, PixelFormat::Mono8),
            SimCameraSpec::new(1, PixelFormat::Mono8),
        ]);
        manager.add_worker(config(0)).unwrap();
        manager.add_worker(config(1)).unwrap();
        assert!(manager.start_all().is_empty());

        let results = manager.trigger_many(&[1, 0, 1, 4]);
        let indices: Vec<usize> = results.iter().map(|(i, _)| *i).collect();
        assert_eq!(indices, vec![1, 0, 4]);
        assert!(results[0].1.is_ok());
        assert!(results[1].1.is_ok());
        assert!(matches!(results[2].1, Err(AcqError::InvalidIndex { .. })));

        manager.stop_all();
        assert!(manager.all_stopped());
        let summary = manager.summary();
        assert!(summary.iter().all(|s| s.stats.triggers == 1));
    }

    #[test]
    fn events_report_lifecycle() {
        let mut manager = manager(vec![SimCameraSpec::new(0, PixelFormat::Mono8)]);
        manager.add_worker(config(0)).unwrap();
        manager.start_all();
        manager.stop_all();

        let events = manager.drain_events();
        assert!(matches!(events.first(), Some(WorkerEvent::Started { index: 0, .. })));
        assert!(matches!(events.last(), Some(WorkerEvent::Stopped { index: 0, .. })));
        assert!(manager.drain_events().is_empty());
    }

    #[test]
    fn summary_line_mentions_state() {
        let summary = CameraSummary {
            index: 1,
            name: "SimCam-1".into(),
            state: WorkerState::Stopped,
            fault: Some("device lost".into()),
            latest_frame_id: Some(9),
            stats: StatsSnapshot::default(),
        };
        let line = summary.to_string();
        assert!(line.starts_with("[1] SimCam-1: stopped, last frame 9"));
        assert!(line.ends_with("fault: device lost"));
    }
}
