//! End-to-end runs against the producing fake device

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use trackfeed::capture::{FakeCaptureHost, HostCall};
use trackfeed::config::{MonitorConfig, SchedulerConfig};
use trackfeed::scheduler::{BufferingState, PipelineStatistics};
use trackfeed::{
    ConstraintSet, Error, Frame, FrameScheduler, Pipeline, PixelFormat, ReadyState, Rect,
    RendererClient, Size, SourceState, StartOutcome, TrackFrameStream, VideoCaptureFormat,
    VideoSink, VideoTrack, WallClockTimeSource,
};

const WAIT: Duration = Duration::from_secs(5);

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn device(size: Size, fps: f64) -> Arc<FakeCaptureHost> {
    let format = VideoCaptureFormat::new(size, fps, PixelFormat::I420);
    Arc::new(FakeCaptureHost::producing(format))
}

fn pipeline(host: &Arc<FakeCaptureHost>) -> Pipeline {
    Pipeline::builder()
        .host(host.clone())
        .monitor(MonitorConfig {
            enabled: false,
            ..Default::default()
        })
        .build()
        .unwrap()
}

/// Records geometry and timestamps without holding on to frames
#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<(Rect, Size, Duration)>>,
    states: Mutex<Vec<ReadyState>>,
}

impl Recorder {
    fn count(&self) -> usize {
        self.seen.lock().len()
    }
}

impl VideoSink for Recorder {
    fn on_frame(&self, frame: Frame, _reference_time: Duration) {
        self.seen
            .lock()
            .push((frame.visible_rect(), frame.natural_size(), frame.timestamp()));
    }

    fn on_ready_state_changed(&self, state: ReadyState) {
        self.states.lock().push(state);
    }
}

fn open(pipeline: &Pipeline, constraints: ConstraintSet) -> (VideoTrack, Arc<Recorder>) {
    let track = pipeline.add_track(constraints, |_| {}).unwrap();
    let recorder = Arc::new(Recorder::default());
    track.add_sink(recorder.clone());
    (track, recorder)
}

#[test]
fn frames_reach_every_track_with_its_geometry() {
    let host = device(Size::VGA, 60.0);
    let pipeline = pipeline(&host);

    let (_full, full) = open(&pipeline, ConstraintSet::new());
    let (_cropped, cropped) = open(&pipeline, ConstraintSet::new().with_max_height(360));
    let (_square, square) = open(
        &pipeline,
        ConstraintSet::new().with_aspect_ratio(Some(1.0), Some(1.0)),
    );

    assert!(wait_until(|| full.count() >= 5 && cropped.count() >= 5 && square.count() >= 5));
    assert_eq!(pipeline.state(), SourceState::Started);

    let (rect, natural, _) = full.seen.lock()[0];
    assert_eq!(rect, Rect::from_size(Size::VGA));
    assert_eq!(natural, Size::VGA);

    let (rect, natural, _) = cropped.seen.lock()[0];
    assert_eq!(rect, Rect::new(0, 60, 640, 360));
    assert_eq!(natural, Size::new(640, 360));

    let (rect, natural, _) = square.seen.lock()[0];
    assert_eq!(rect, Rect::new(80, 0, 480, 480));
    assert_eq!(natural, Size::new(480, 480));
}

#[test]
fn frame_rate_cap_thins_delivery() {
    let host = device(Size::QVGA, 30.0);
    let pipeline = pipeline(&host);

    let (_full, full) = open(&pipeline, ConstraintSet::new());
    let (_capped, capped) = open(&pipeline, ConstraintSet::new().with_max_frame_rate(10.0));

    assert!(wait_until(|| full.count() >= 15));
    drop(pipeline);

    let full_count = full.count();
    let capped_count = capped.count();
    assert!(capped_count >= 1);
    assert!(
        capped_count * 2 <= full_count + 2,
        "capped {capped_count} vs full {full_count}"
    );

    let stamps: Vec<Duration> = capped.seen.lock().iter().map(|(_, _, ts)| *ts).collect();
    for pair in stamps.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_millis(99));
    }
}

#[test]
fn every_buffer_is_released_once_tracks_are_gone() {
    let host = device(Size::QVGA, 60.0);
    let pipeline = pipeline(&host);

    let (a, a_seen) = open(&pipeline, ConstraintSet::new());
    let (b, _) = open(&pipeline, ConstraintSet::new().with_max_size(160, 120));
    assert!(wait_until(|| a_seen.count() >= 10));

    drop(a);
    drop(b);
    assert!(wait_until(|| pipeline.state() == SourceState::Idle));
    assert!(host
        .calls()
        .iter()
        .any(|c| matches!(c, HostCall::Stop { .. })));

    assert!(wait_until(|| {
        let stats = pipeline.stats();
        stats.buffers_released == stats.frames_captured + stats.buffers_rejected
    }));
    let stats = pipeline.stats();
    assert!(stats.frames_captured >= 10);
    assert_eq!(host.released().len() as u64, stats.buffers_released);
}

#[test]
fn dropping_the_pipeline_ends_tracks() {
    let host = device(Size::QVGA, 30.0);
    let pipeline = pipeline(&host);
    let (track, recorder) = open(&pipeline, ConstraintSet::new());
    assert!(wait_until(|| recorder.count() >= 1));

    drop(pipeline);
    assert_eq!(track.ready_state(), ReadyState::Ended);
    assert!(wait_until(|| recorder
        .states
        .lock()
        .contains(&ReadyState::Ended)));
}

#[test]
fn constraint_errors_name_the_failing_key() {
    let host = device(Size::QVGA, 30.0);
    let pipeline = pipeline(&host);

    let err = pipeline
        .add_track(ConstraintSet::new().with_min_size(640, 0).with_max_width(320), |_| {})
        .unwrap_err();
    assert!(matches!(err, Error::ConstraintViolation { .. }));
    assert_eq!(err.failure_name(), "min_width");
    assert_eq!(pipeline.track_count(), 0);
}

#[test]
fn start_outcome_reported_for_each_track() {
    let host = device(Size::QVGA, 30.0);
    let pipeline = pipeline(&host);
    let outcomes = Arc::new(Mutex::new(Vec::new()));

    let mut tracks = Vec::new();
    for _ in 0..2 {
        let outcomes = outcomes.clone();
        tracks.push(
            pipeline
                .add_track(ConstraintSet::new(), move |o| outcomes.lock().push(o))
                .unwrap(),
        );
    }

    assert!(wait_until(|| outcomes.lock().len() == 2));
    assert!(outcomes.lock().iter().all(StartOutcome::is_started));
}

struct Presenter {
    clock: Arc<WallClockTimeSource>,
    states: Mutex<Vec<BufferingState>>,
    stats: Mutex<PipelineStatistics>,
}

impl RendererClient for Presenter {
    fn on_buffering_state_change(&self, state: BufferingState) {
        match state {
            BufferingState::HaveEnough => self.clock.start_ticking(),
            BufferingState::HaveNothing => self.clock.stop_ticking(),
        }
        self.states.lock().push(state);
    }

    fn on_ended(&self) {}

    fn on_error(&self, error: Error) {
        panic!("unexpected scheduler error: {error}");
    }

    fn on_statistics_update(&self, stats: PipelineStatistics) {
        *self.stats.lock() = stats;
    }
}

#[test]
fn scheduler_paints_captured_frames_in_order() {
    let host = device(Size::QVGA, 30.0);
    let pipeline = pipeline(&host);
    let track = pipeline.add_track(ConstraintSet::new(), |_| {}).unwrap();

    let clock = Arc::new(WallClockTimeSource::new());
    let presenter = Arc::new(Presenter {
        clock: clock.clone(),
        states: Mutex::default(),
        stats: Mutex::default(),
    });
    let painted = Arc::new(Mutex::new(Vec::new()));
    let count = Arc::new(AtomicU64::new(0));
    let (p, n) = (painted.clone(), count.clone());
    let scheduler = FrameScheduler::new(
        pipeline.context(),
        &SchedulerConfig::default(),
        clock,
        presenter.clone(),
        move |frame: Frame| {
            p.lock().push(frame.timestamp());
            n.fetch_add(1, Ordering::Relaxed);
        },
    );

    let (stream, sink) = TrackFrameStream::new(8);
    track.add_sink(sink);
    scheduler.initialize(Box::new(stream)).unwrap();
    scheduler.start_playing_from(Duration::ZERO).unwrap();

    assert!(wait_until(|| count.load(Ordering::Relaxed) >= 5));
    scheduler.stop();

    assert_eq!(presenter.states.lock().first(), Some(&BufferingState::HaveEnough));
    let stamps = painted.lock().clone();
    assert!(stamps.windows(2).all(|w| w[0] < w[1]));
    assert!(presenter.stats.lock().frames_decoded > 0);
}
