//! End-to-end acquisition against the simulated camera system

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use multicam::capture::convert::DecodedImage;
use multicam::capture::frame::PixelFormat;
use multicam::capture::trigger::TriggerSelector;
use multicam::capture::worker::{
    AcquisitionStyle, CameraConfig, TriggerMode, WorkerEvent, WorkerState,
};
use multicam::pipeline::sink::{FrameSink, SinkError};
use multicam::sdk::sim::{SimCameraSpec, SimProbe, SimSystem};
use multicam::sdk::CameraSystem;
use multicam::{AcqError, CameraManager, SdkContext};

const WAIT: Duration = Duration::from_secs(2);

struct Rig {
    manager: CameraManager,
    probes: Vec<SimProbe>,
}

fn rig(specs: Vec<SimCameraSpec>) -> Rig {
    let system = Arc::new(SimSystem::new(specs));
    let probes = (0..system.device_count())
        .filter_map(|i| system.probe(i))
        .collect();
    let ctx = Arc::new(SdkContext::initialize(system).unwrap());
    Rig {
        manager: CameraManager::new(ctx),
        probes,
    }
}

fn cameras(count: usize, format: PixelFormat) -> Vec<SimCameraSpec> {
    (0..count).map(|i| SimCameraSpec::new(i, format)).collect()
}

fn camera(index: usize, style: AcquisitionStyle) -> CameraConfig {
    CameraConfig {
        style,
        retrieve_timeout: Duration::from_millis(50),
        ..CameraConfig::new(index)
    }
}

fn started(specs: Vec<SimCameraSpec>, style: AcquisitionStyle) -> Rig {
    let count = specs.len();
    let mut rig = rig(specs);
    for i in 0..count {
        rig.manager.add_worker(camera(i, style)).unwrap();
    }
    assert!(rig.manager.start_all().is_empty());
    rig
}

/// First `Faulted` event within [`WAIT`].
fn next_fault(events: &flume::Receiver<WorkerEvent>) -> Option<WorkerEvent> {
    let deadline = Instant::now() + WAIT;
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        match events.recv_timeout(left) {
            Ok(event @ WorkerEvent::Faulted { .. }) => return Some(event),
            Ok(_) => {}
            Err(_) => return None,
        }
    }
    None
}

#[test]
fn every_retrieved_buffer_is_released_once() {
    for style in [AcquisitionStyle::Polling, AcquisitionStyle::Callback] {
        let mut rig = started(cameras(2, PixelFormat::BayerGB8), style);
        let cache = rig.manager.cache(0).unwrap();

        rig.probes[0].inject_empty(2);
        rig.probes[0].inject_truncated(1);
        for _ in 0..3 {
            rig.manager.trigger(0).unwrap();
        }
        let mut last = None;
        for _ in 0..8 {
            rig.manager.trigger(0).unwrap();
            let image = cache.wait_newer(last, WAIT).expect("frame");
            last = Some(image.frame_id);
        }
        rig.manager.stop_all();

        for probe in &rig.probes {
            let counters = probe.counters();
            assert_eq!(counters.retrieved, counters.released, "{style:?}");
            assert_eq!(counters.double_releases, 0, "{style:?}");
            assert_eq!(probe.outstanding(), 0, "{style:?}");
        }
        assert_eq!(rig.probes[0].counters().retrieved, 11, "{style:?}");
    }
}

#[test]
fn trigger_outside_running_issues_no_hardware_command() {
    let mut rig = rig(cameras(1, PixelFormat::Mono8));
    rig.manager
        .add_worker(camera(0, AcquisitionStyle::Polling))
        .unwrap();

    assert_eq!(rig.manager.state(0).unwrap(), WorkerState::Configured);
    assert!(matches!(
        rig.manager.trigger(0),
        Err(AcqError::Protocol { .. })
    ));

    rig.manager.stop_all();
    assert_eq!(rig.manager.state(0).unwrap(), WorkerState::Stopped);
    assert!(matches!(
        rig.manager.trigger(0),
        Err(AcqError::Protocol { .. })
    ));
    assert_eq!(rig.probes[0].counters().triggers, 0);
}

#[test]
fn selector_falls_back_to_exposure_start() {
    let mut rig = rig(vec![
        SimCameraSpec::new(0, PixelFormat::Mono8).without_selector("FrameStart"),
        SimCameraSpec::new(1, PixelFormat::Mono8)
            .without_selector("FrameStart")
            .without_selector("ExposureStart"),
    ]);

    let index = rig
        .manager
        .add_worker(camera(0, AcquisitionStyle::Polling))
        .unwrap();
    assert_eq!(
        rig.manager.worker(index).unwrap().trigger_selector(),
        Some(TriggerSelector::ExposureStart)
    );
    assert_eq!(
        rig.probes[0].enum_value("TriggerSelector").as_deref(),
        Some("ExposureStart")
    );
    assert_eq!(rig.probes[0].enum_value("TriggerSource").as_deref(), Some("Software"));

    assert!(matches!(
        rig.manager.add_worker(camera(1, AcquisitionStyle::Polling)),
        Err(AcqError::Configuration { .. })
    ));
    assert!(!rig.probes[1].is_open());
}

#[test]
fn device_fault_is_isolated_to_one_worker() {
    for style in [AcquisitionStyle::Polling, AcquisitionStyle::Callback] {
        let mut rig = started(cameras(3, PixelFormat::Mono8), style);
        let events = rig.manager.events();

        rig.probes[1].lose_device();
        match next_fault(&events) {
            Some(WorkerEvent::Faulted { index, error, .. }) => {
                assert_eq!(index, 1, "{style:?}");
                assert!(error.contains("device fault"), "{style:?}: {error}");
            }
            other => panic!("{style:?}: expected a fault, got {other:?}"),
        }
        assert_eq!(rig.manager.state(1).unwrap(), WorkerState::Stopped, "{style:?}");

        for index in [0, 2] {
            assert_eq!(rig.manager.state(index).unwrap(), WorkerState::Running);
            let cache = rig.manager.cache(index).unwrap();
            let mut last = None;
            for _ in 0..2 {
                rig.manager.trigger(index).unwrap();
                let image = cache.wait_newer(last, WAIT);
                assert!(image.is_some(), "{style:?}: camera {index} stalled");
                last = image.map(|image| image.frame_id);
            }
        }
        assert!(matches!(
            rig.manager.trigger(1),
            Err(AcqError::Protocol { .. })
        ));

        rig.manager.stop_all();
        assert_eq!(rig.manager.states(), vec![WorkerState::Stopped; 3]);
        let summary = rig.manager.summary();
        assert!(summary[1].fault.is_some(), "{style:?}");
        assert!(summary[0].fault.is_none(), "{style:?}");
        assert_eq!(rig.probes[0].outstanding(), 0, "{style:?}");
    }
}

#[test]
fn trigger_many_advances_each_cache_once() {
    let rig = started(cameras(2, PixelFormat::BayerRG8), AcquisitionStyle::Polling);
    let caches: Vec<_> = (0..2).map(|i| rig.manager.cache(i).unwrap()).collect();

    let mut previous = vec![None; 2];
    for round in 0..3 {
        let before: Vec<u64> = rig.probes.iter().map(|p| p.counters().triggers).collect();
        let results = rig.manager.trigger_many(&[0, 1]);
        assert!(results.iter().all(|(_, r)| r.is_ok()));

        for (i, cache) in caches.iter().enumerate() {
            assert_eq!(rig.probes[i].counters().triggers, before[i] + 1);
            let image = cache
                .wait_newer(previous[i], WAIT)
                .unwrap_or_else(|| panic!("camera {i} round {round}"));
            if let Some(prev) = previous[i] {
                assert!(image.frame_id > prev);
            }
            previous[i] = Some(image.frame_id);
        }
    }
}

#[test]
fn cache_holds_only_the_latest_frame() {
    let rig = started(cameras(1, PixelFormat::Mono8), AcquisitionStyle::Polling);
    let cache = rig.manager.cache(0).unwrap();
    assert!(rig.manager.latest_image(0).unwrap().is_none());

    let mut last = None;
    for _ in 0..5 {
        rig.manager.trigger(0).unwrap();
        last = cache.wait_newer(last, WAIT).map(|image| image.frame_id);
    }
    let latest = rig.manager.latest_image(0).unwrap().unwrap();
    assert_eq!(Some(latest.frame_id), last);
    assert_eq!(latest.frame_id, 5);
}

#[test]
fn continuous_callback_acquisition() {
    let specs = vec![
        SimCameraSpec::new(0, PixelFormat::Mono12).with_frame_interval(Duration::from_millis(5)),
    ];
    let mut rig = rig(specs);
    let config = CameraConfig {
        trigger_mode: TriggerMode::Continuous,
        color: false,
        ..camera(0, AcquisitionStyle::Callback)
    };
    rig.manager.add_worker(config).unwrap();
    rig.manager.start_all();

    let cache = rig.manager.cache(0).unwrap();
    let first = cache.wait_newer(None, WAIT).unwrap();
    let next = cache.wait_newer(Some(first.frame_id), WAIT).unwrap();
    assert!(next.frame_id > first.frame_id);
    assert_eq!(next.shape(), (48, 64, 1));

    rig.manager.stop_all();
    assert_eq!(rig.probes[0].enum_value("TriggerMode").as_deref(), Some("Off"));
    assert_eq!(rig.probes[0].outstanding(), 0);
    assert!(!rig.probes[0].is_streaming());
}

#[derive(Default)]
struct CollectingSink {
    saved: Mutex<Vec<(String, u64)>>,
}

impl FrameSink for CollectingSink {
    fn save(&self, image: &DecodedImage, device_id: &str, frame_id: u64) -> Result<(), SinkError> {
        assert_eq!(image.frame_id, frame_id);
        self.saved
            .lock()
            .unwrap()
            .push((device_id.to_string(), frame_id));
        Ok(())
    }
}

#[test]
fn sink_sees_every_converted_frame() {
    let sink = Arc::new(CollectingSink::default());
    let mut rig = rig(cameras(1, PixelFormat::Rgb8));
    rig.manager = rig.manager.with_sink(sink.clone());
    rig.manager
        .add_worker(camera(0, AcquisitionStyle::Polling))
        .unwrap();
    rig.manager.start_all();

    let cache = rig.manager.cache(0).unwrap();
    let mut last = None;
    for _ in 0..3 {
        rig.manager.trigger(0).unwrap();
        last = cache.wait_newer(last, WAIT).map(|image| image.frame_id);
    }
    rig.manager.stop_all();

    let saved = sink.saved.lock().unwrap().clone();
    assert_eq!(
        saved,
        vec![
            ("SimCam-0".to_string(), 1),
            ("SimCam-0".to_string(), 2),
            ("SimCam-0".to_string(), 3),
        ]
    );
}
