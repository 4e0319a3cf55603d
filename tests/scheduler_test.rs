//! Scheduler timing, failure budget and shutdown behavior.

use parking_lot::Mutex;
use serial_test::serial;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thermocal_daq::acquisition::{
    AcquisitionScheduler, DeviceStatus, EngineEvent, SchedulerConfig,
};
use thermocal_daq::core::{Tick, TickClock, TickHandler};
use thermocal_daq::error::{DaqError, JoinFailure};
use thermocal_daq::instrument::mock::{PollOutcome, ScriptedInstrument};
use tokio::sync::broadcast;

#[derive(Default)]
struct Recorder(Mutex<Vec<Tick>>);

impl TickHandler for Recorder {
    fn on_tick(&self, tick: &Tick) {
        self.0.lock().push(tick.clone());
    }
}

impl Recorder {
    fn len(&self) -> usize {
        self.0.lock().len()
    }
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

fn scheduler(
    instrument: ScriptedInstrument,
    channels: usize,
    handler: Arc<Recorder>,
    config: SchedulerConfig,
    events: broadcast::Sender<EngineEvent>,
) -> AcquisitionScheduler {
    AcquisitionScheduler::new(
        Box::new(instrument),
        channels,
        handler,
        TickClock::new(),
        config,
        events,
    )
}

#[test]
#[serial]
fn overrunning_polls_skip_ticks_instead_of_queueing() {
    let (events, _rx) = broadcast::channel(64);
    let recorder = Arc::new(Recorder::default());
    let instrument =
        ScriptedInstrument::new("mux", ["101"]).with_delay(Duration::from_millis(120));
    let counters = instrument.counters();
    let scheduler = scheduler(
        instrument,
        1,
        recorder.clone(),
        SchedulerConfig::default(),
        events,
    );

    scheduler.start(Duration::from_millis(50)).expect("start");
    thread::sleep(Duration::from_millis(700));
    scheduler.stop().expect("stop");

    let ticks = recorder.0.lock();
    assert!(ticks.len() >= 2, "only {} ticks", ticks.len());
    assert!(ticks.len() <= 7, "{} ticks in 700 ms", ticks.len());
    for pair in ticks.windows(2) {
        assert!(pair[1].timestamp - pair[0].timestamp >= Duration::from_millis(120));
    }
    assert_eq!(counters.max_in_flight(), 1);
    assert!(scheduler.stats().skipped_ticks >= 1);
    assert!(counters.closed());
}

#[test]
#[serial]
fn failures_mark_device_unavailable_without_stopping_others() {
    let (events, mut rx) = broadcast::channel(64);
    let flaky_recorder = Arc::new(Recorder::default());
    let healthy_recorder = Arc::new(Recorder::default());

    let flaky = scheduler(
        ScriptedInstrument::new("bath", ["P1", "P2"]).with_script([
            PollOutcome::Values(vec![25.0, 24.8]),
            PollOutcome::Fail,
            PollOutcome::Fail,
            PollOutcome::Values(vec![25.1, 24.9]),
            PollOutcome::Fail,
            PollOutcome::Fail,
            PollOutcome::Fail,
        ]),
        2,
        flaky_recorder.clone(),
        SchedulerConfig {
            max_consecutive_failures: 3,
            ..SchedulerConfig::default()
        },
        events.clone(),
    );
    let healthy = scheduler(
        ScriptedInstrument::new("pt104", ["ch1"])
            .with_fallback(PollOutcome::Values(vec![24.9])),
        1,
        healthy_recorder.clone(),
        SchedulerConfig::default(),
        events,
    );

    flaky.start(Duration::from_millis(5)).expect("start flaky");
    healthy.start(Duration::from_millis(5)).expect("start healthy");

    assert!(wait_until(Duration::from_secs(5), || {
        flaky.status() == DeviceStatus::Unavailable
    }));
    let stats = flaky.stats();
    assert_eq!(stats.ticks, 7);
    assert_eq!(stats.failures, 5);
    assert_eq!(stats.consecutive_failures, 3);

    let flaky_ticks = flaky_recorder.0.lock().clone();
    assert_eq!(flaky_ticks.len(), 7);
    assert!(!flaky_ticks[0].failed);
    assert!(flaky_ticks[1].failed);
    assert!(flaky_ticks[1].readings.iter().all(|r| r.value.is_nan() && !r.valid));
    assert_eq!(flaky_ticks[3].value(0), 25.1);

    let before = healthy_recorder.len();
    assert!(wait_until(Duration::from_secs(5), || {
        healthy_recorder.len() > before + 3
    }));
    assert_eq!(healthy.status(), DeviceStatus::Running);
    assert_eq!(flaky_recorder.len(), 7);

    flaky.stop().expect("stop flaky");
    healthy.stop().expect("stop healthy");
    assert_eq!(flaky.status(), DeviceStatus::Unavailable);
    assert_eq!(healthy.status(), DeviceStatus::Stopped);

    let mut consecutive = Vec::new();
    let mut went_unavailable = false;
    while let Ok(event) = rx.try_recv() {
        match event {
            EngineEvent::PollFailed {
                device,
                consecutive: n,
                ..
            } if device == "bath" => consecutive.push(n),
            EngineEvent::DeviceStatusChanged { device, status } if device == "bath" => {
                went_unavailable |= status == DeviceStatus::Unavailable;
            }
            _ => {}
        }
    }
    assert_eq!(consecutive, vec![1, 2, 1, 2, 3]);
    assert!(went_unavailable);
}

#[test]
#[serial]
fn shutdown_waits_a_bounded_time_for_a_blocked_poll() {
    let (events, _rx) = broadcast::channel(16);
    let instrument =
        ScriptedInstrument::new("mux", ["101"]).with_delay(Duration::from_millis(400));
    let counters = instrument.counters();
    let scheduler = scheduler(
        instrument,
        1,
        Arc::new(Recorder::default()),
        SchedulerConfig::default(),
        events,
    );

    scheduler.start(Duration::from_millis(10)).expect("start");
    thread::sleep(Duration::from_millis(50));

    let started = Instant::now();
    scheduler.halt();
    assert!(matches!(
        scheduler.join(Duration::from_millis(20)),
        Err(DaqError::ThreadJoin { failure: JoinFailure::TimedOut(_), .. })
    ));
    assert!(scheduler.close_device(Duration::from_millis(20)).is_err());
    assert!(started.elapsed() < Duration::from_millis(300));
    assert!(!counters.closed());

    // once the poll returns the device can still be closed
    scheduler
        .close_device(Duration::from_secs(2))
        .expect("close after poll finished");
    assert!(counters.closed());
    assert_eq!(counters.polls(), 1);
}
