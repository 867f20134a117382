//! Integration tests: media sessions driving the simulated graph engine
//! across real threads.
//!
//! Each test builds a bin of `payN` / `dynpayN` producers, wraps it in a
//! [`Media`] and checks both the media's status and the exact requests the
//! graph received.

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::thread;
use std::time::{Duration, Instant};

use rtsp_media::pipeline::sim::{Preroll, SimBin, SimFactory, SimPipeline};
use rtsp_media::pipeline::{Message, SeekFlags, SeekType, State};
use rtsp_media::{
    Graph, ImmediateTeardown, Media, MediaConfig, MediaError, MediaEvent, MediaStatus,
    PortRangePool, RangeTime, RangeUnit, StreamTransport, ThreadPool, TimeRange, Transport,
};

struct Fixture {
    media: Arc<Media>,
    bin: Arc<SimBin>,
    pipeline: Arc<SimPipeline>,
}

fn fixture(preroll: Preroll, n_static: usize, n_dynamic: usize, config: MediaConfig) -> Fixture {
    fixture_with_factory(preroll, n_static, n_dynamic, config, SimFactory::new())
}

fn fixture_with_factory(
    preroll: Preroll,
    n_static: usize,
    n_dynamic: usize,
    config: MediaConfig,
    factory: Arc<SimFactory>,
) -> Fixture {
    let bin = SimBin::with_payloaders("media", n_static, n_dynamic);
    let pipeline = SimPipeline::new(preroll);
    let graph = Graph::new(bin.clone(), pipeline.clone(), factory);
    let media = Media::with_config(graph, ThreadPool::new(), config);
    Fixture {
        media,
        bin,
        pipeline,
    }
}

fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn drain(events: &Receiver<MediaEvent>) -> Vec<&'static str> {
    events.try_iter().map(|e| e.name()).collect()
}

fn client(media: &Media, port: u16) -> Arc<StreamTransport> {
    let stream = media.stream(0).expect("stream 0");
    let addr = format!("192.168.1.10:{port}").parse().unwrap();
    StreamTransport::new(stream, Transport::udp(addr, (5000, 5001)))
}

#[test]
fn prepare_static_media() {
    let f = fixture(Preroll::Immediate, 2, 0, MediaConfig::default());
    let events = f.media.events();

    f.media.prepare().expect("prepare");

    assert_eq!(f.media.status(), MediaStatus::Prepared);
    assert!(f.media.is_seekable());
    assert!(!f.media.is_live());
    assert_eq!(f.pipeline.state_requests(), vec![State::Paused]);
    assert_eq!(
        f.pipeline.joined_streams(),
        vec![(0, State::Null), (1, State::Null)]
    );
    assert!(f.pipeline.contains("rtpbin"));
    assert_eq!(f.bin.ghost_pads().len(), 2);
    assert_eq!(f.media.range_string(true).unwrap(), "npt=0-10");
    assert_eq!(drain(&events), vec!["prepared"]);

    f.media.unprepare().unwrap();
}

#[test]
fn prepare_is_idempotent_once_prepared() {
    let f = fixture(Preroll::Immediate, 1, 0, MediaConfig::default());
    f.media.prepare().unwrap();
    f.media.prepare().unwrap();

    assert_eq!(f.pipeline.state_requests(), vec![State::Paused]);
    assert_eq!(f.pipeline.joined_streams().len(), 1);
    f.media.unprepare().unwrap();
}

#[test]
fn dynamic_producer_streams() {
    let f = fixture(
        Preroll::Async(Duration::from_millis(10)),
        0,
        1,
        MediaConfig::default(),
    );
    let events = f.media.events();
    assert_eq!(f.media.n_streams(), 0);

    let preparing = {
        let media = f.media.clone();
        thread::spawn(move || media.prepare())
    };

    let dynpay = f.bin.child("dynpay0").unwrap();
    assert!(wait_for(
        || dynpay.handler_count() == 2 && f.pipeline.contains("fakesink")
    ));

    dynpay.emit_pad_added("src_0");
    dynpay.emit_pad_added("src_1");
    dynpay.emit_no_more_pads();

    preparing.join().unwrap().expect("prepare");

    assert_eq!(f.media.status(), MediaStatus::Prepared);
    assert_eq!(f.media.n_streams(), 2);
    assert!(!f.pipeline.contains("fakesink"));
    assert_eq!(
        f.pipeline.joined_streams(),
        vec![(0, State::Paused), (1, State::Paused)]
    );
    assert_eq!(drain(&events), vec!["new-stream", "new-stream", "prepared"]);

    f.media.unprepare().unwrap();
    assert_eq!(dynpay.handler_count(), 0);
    assert!(f.bin.ghost_pads().is_empty());
}

#[test]
fn live_media_goes_straight_to_playing() {
    let f = fixture(Preroll::Live, 1, 0, MediaConfig::default());
    f.media.prepare().expect("prepare");

    assert!(f.media.is_live());
    assert!(!f.media.is_seekable());
    assert_eq!(
        f.pipeline.state_requests(),
        vec![State::Paused, State::Playing]
    );
    assert_eq!(f.media.range_string(true).unwrap(), "npt=now-");

    // Not seekable: accepted without touching the graph.
    f.media.seek(&"npt=5-".parse().unwrap()).unwrap();
    assert!(f.pipeline.seeks().is_empty());

    f.media.unprepare().unwrap();
}

#[test]
fn graph_error_fails_prepare() {
    let f = fixture(Preroll::Never, 1, 0, MediaConfig::default());
    let preparing = {
        let media = f.media.clone();
        thread::spawn(move || media.prepare())
    };

    assert!(wait_for(|| f.pipeline.has_bus_handler()));
    f.pipeline.post(Message::Warning {
        message: "falling behind".to_string(),
        debug: Some("queue overrun".to_string()),
    });
    f.pipeline.post(Message::Error {
        message: "internal data stream error".to_string(),
        debug: None,
    });
    // Must not resurrect the media after the error.
    f.pipeline.post(Message::AsyncDone);

    let result = preparing.join().unwrap();
    assert!(matches!(result, Err(MediaError::PrepareFailed)));
    assert_eq!(f.media.status_now(), MediaStatus::Unprepared);
    assert!(f.media.was_used());
    assert!(!f.pipeline.contains("rtpbin"));

    // Not reusable: a failed media must be discarded.
    assert!(matches!(f.media.prepare(), Err(MediaError::NotReusable)));
}

#[test]
fn prepare_times_out() {
    let config = MediaConfig {
        prepare_timeout: Duration::from_millis(100),
        ..MediaConfig::default()
    };
    let f = fixture(Preroll::Never, 1, 0, config);

    let started = Instant::now();
    assert!(matches!(f.media.prepare(), Err(MediaError::PrepareFailed)));
    assert!(started.elapsed() >= Duration::from_millis(100));

    assert_eq!(f.media.status_now(), MediaStatus::Unprepared);
    assert_eq!(f.pipeline.state_requests(), vec![State::Paused, State::Null]);
}

#[test]
fn refused_state_change_fails_prepare() {
    let f = fixture(Preroll::Fail, 1, 0, MediaConfig::default());
    assert!(matches!(
        f.media.prepare(),
        Err(MediaError::StateChangeFailed)
    ));
    assert_eq!(f.media.status_now(), MediaStatus::Unprepared);
    assert!(!f.pipeline.has_bus_handler());
}

#[test]
fn missing_placeholder_sink() {
    let f = fixture_with_factory(
        Preroll::Immediate,
        0,
        1,
        MediaConfig::default(),
        SimFactory::without(&["fakesink"]),
    );
    assert!(matches!(
        f.media.prepare(),
        Err(MediaError::ElementUnavailable(name)) if name == "fakesink"
    ));
    assert_eq!(f.media.status_now(), MediaStatus::Unprepared);
    assert_eq!(f.bin.child("dynpay0").unwrap().handler_count(), 0);
}

#[test]
fn non_reusable_media_refuses_second_prepare() {
    let f = fixture(Preroll::Immediate, 1, 0, MediaConfig::default());
    f.media.prepare().unwrap();
    f.media.unprepare().unwrap();

    assert!(f.media.was_used());
    assert!(matches!(f.media.prepare(), Err(MediaError::NotReusable)));
}

#[test]
fn reusable_media_prepares_again() {
    let config = MediaConfig {
        reusable: true,
        ..MediaConfig::default()
    };
    let f = fixture(Preroll::Immediate, 1, 0, config);

    f.media.prepare().unwrap();
    f.media.unprepare().unwrap();
    assert_eq!(f.media.n_streams(), 0);

    f.media.prepare().unwrap();
    assert_eq!(f.media.n_streams(), 1);
    assert_eq!(
        f.pipeline.state_requests(),
        vec![State::Paused, State::Null, State::Paused]
    );
    f.media.unprepare().unwrap();
}

#[test]
fn concurrent_prepare_waits_for_first() {
    let f = fixture(
        Preroll::Async(Duration::from_millis(50)),
        1,
        0,
        MediaConfig::default(),
    );
    let events = f.media.events();

    let callers: Vec<_> = (0..3)
        .map(|_| {
            let media = f.media.clone();
            thread::spawn(move || media.prepare())
        })
        .collect();
    for caller in callers {
        caller.join().unwrap().expect("prepare");
    }

    assert_eq!(f.pipeline.state_requests(), vec![State::Paused]);
    assert_eq!(drain(&events), vec!["prepared"]);
    f.media.unprepare().unwrap();
}

#[test]
fn identical_seek_is_elided() {
    let f = fixture(Preroll::Immediate, 1, 0, MediaConfig::default());
    f.media.prepare().unwrap();

    f.media.seek(&"npt=0-10".parse().unwrap()).unwrap();
    assert!(f.pipeline.seeks().is_empty());

    f.media.seek(&"npt=2-".parse().unwrap()).unwrap();
    let seeks = f.pipeline.seeks();
    assert_eq!(seeks.len(), 1);
    assert_eq!(seeks[0].start_type, SeekType::Set);
    assert_eq!(seeks[0].start, Some(Duration::from_secs(2)));
    assert_eq!(seeks[0].stop_type, SeekType::None);
    assert!(
        seeks[0]
            .flags
            .contains(SeekFlags::FLUSH | SeekFlags::ACCURATE | SeekFlags::KEY_UNIT)
    );
    assert_eq!(f.media.range_string(true).unwrap(), "npt=2-10");

    let smpte = TimeRange::new(RangeUnit::Smpte, RangeTime::Seconds(1.0), RangeTime::End);
    assert!(matches!(
        f.media.seek(&smpte),
        Err(MediaError::UnsupportedRangeUnit(RangeUnit::Smpte))
    ));
    assert_eq!(f.pipeline.seeks().len(), 1);

    f.media.unprepare().unwrap();
}

#[test]
fn seek_beyond_clock_range_is_harmless() {
    let f = fixture(Preroll::Immediate, 1, 0, MediaConfig::default());
    f.media.prepare().unwrap();

    assert!(matches!(
        "npt=1e20-".parse::<TimeRange>(),
        Err(MediaError::InvalidRange(_))
    ));

    let huge = TimeRange::new(RangeUnit::Npt, RangeTime::Seconds(1e20), RangeTime::End);
    f.media.seek(&huge).unwrap();
    assert!(f.pipeline.seeks().is_empty());
    assert_eq!(f.media.status_now(), MediaStatus::Prepared);

    f.media.unprepare().unwrap();
}

#[test]
fn graph_touched_only_on_active_count_edges() {
    let f = fixture(Preroll::Immediate, 1, 0, MediaConfig::default());
    f.media.prepare().unwrap();
    f.pipeline.clear_state_requests();
    let events = f.media.events();

    let a = client(&f.media, 8000);
    let b = client(&f.media, 8002);

    f.media.set_state(State::Playing, &[a.clone()]).unwrap();
    assert_eq!(f.media.n_active(), 1);
    assert_eq!(f.pipeline.state_requests(), vec![State::Playing]);

    f.media.set_state(State::Playing, &[b.clone()]).unwrap();
    f.media.set_state(State::Playing, &[a.clone()]).unwrap();
    assert_eq!(f.media.n_active(), 2);
    assert_eq!(f.media.stream(0).unwrap().n_transports(), 2);
    assert_eq!(f.media.range_string(false).unwrap(), "npt=now-10");
    assert_eq!(f.media.range_string(true).unwrap(), "npt=0-10");

    f.media.set_state(State::Paused, &[a.clone()]).unwrap();
    assert_eq!(f.media.n_active(), 1);
    assert_eq!(f.media.target_state(), State::Playing);
    assert_eq!(f.pipeline.state_requests(), vec![State::Playing]);

    f.media.set_state(State::Paused, &[b.clone()]).unwrap();
    assert_eq!(f.media.n_active(), 0);
    assert_eq!(
        f.pipeline.state_requests(),
        vec![State::Playing, State::Paused]
    );

    let seen: Vec<MediaEvent> = events.try_iter().collect();
    let states: Vec<State> = seen
        .iter()
        .filter_map(|e| match e {
            MediaEvent::NewState(state) => Some(*state),
            _ => None,
        })
        .collect();
    assert_eq!(states, vec![State::Playing, State::Paused, State::Paused]);

    // Stopping with nobody left tears the media down.
    f.media.set_state(State::Null, &[]).unwrap();
    assert_eq!(f.media.status_now(), MediaStatus::Unprepared);
    assert!(matches!(
        f.media.set_state(State::Playing, &[a]),
        Err(MediaError::NotPrepared(MediaStatus::Unprepared))
    ));
}

#[test]
fn eos_shutdown_waits_for_end_of_stream() {
    let config = MediaConfig {
        eos_shutdown: true,
        ..MediaConfig::default()
    };
    let f = fixture(Preroll::Immediate, 1, 0, config);
    f.pipeline.set_auto_eos(false);
    f.media.prepare().unwrap();
    f.pipeline.clear_state_requests();

    f.media.unprepare().unwrap();
    assert_eq!(f.media.status_now(), MediaStatus::Unpreparing);
    assert_eq!(f.pipeline.eos_sent(), 1);
    assert_eq!(f.pipeline.state_requests(), vec![State::Playing]);
    assert_eq!(f.media.n_streams(), 1);
    assert!(f.pipeline.contains("rtpbin"));

    f.pipeline.post(Message::Eos);
    assert!(wait_for(|| f.media.status_now() == MediaStatus::Unprepared));
    assert_eq!(f.media.n_streams(), 0);
    assert!(f.pipeline.joined_streams().is_empty());
    assert!(!f.pipeline.contains("rtpbin"));
    assert_eq!(f.pipeline.current_state(), State::Null);
}

#[test]
fn error_during_eos_shutdown_finishes_teardown() {
    let config = MediaConfig {
        eos_shutdown: true,
        ..MediaConfig::default()
    };
    let f = fixture(Preroll::Immediate, 1, 0, config);
    f.pipeline.set_auto_eos(false);
    f.media.prepare().unwrap();

    f.media.unprepare().unwrap();
    assert_eq!(f.media.status_now(), MediaStatus::Unpreparing);
    assert!(wait_for(|| Arc::strong_count(&f.media) == 2));

    f.pipeline.post(Message::Error {
        message: "sink went away".to_string(),
        debug: None,
    });
    assert!(wait_for(|| f.media.status_now() == MediaStatus::Unprepared));
    assert!(!f.pipeline.contains("rtpbin"));
    // The self-reference held for the shutdown is released.
    assert!(wait_for(|| Arc::strong_count(&f.media) == 1));
}

#[test]
fn immediate_teardown_ignores_eos_shutdown() {
    let config = MediaConfig {
        eos_shutdown: true,
        ..MediaConfig::default()
    };
    let bin = SimBin::with_payloaders("media", 1, 0);
    let pipeline = SimPipeline::new(Preroll::Immediate);
    let graph = Graph::new(bin, pipeline.clone(), SimFactory::new());
    let media = Media::with_hooks(graph, ThreadPool::new(), config, Box::new(ImmediateTeardown));

    media.prepare().unwrap();
    media.unprepare().unwrap();

    assert_eq!(media.status_now(), MediaStatus::Unprepared);
    assert_eq!(pipeline.eos_sent(), 0);
}

#[test]
fn address_pool_reaches_streams() {
    let f = fixture(Preroll::Immediate, 2, 0, MediaConfig::default());
    f.media.set_address_pool(Some(Arc::new(PortRangePool::new())));

    assert!(f.media.address_pool().is_some());
    assert_eq!(f.media.stream(0).unwrap().allocate_ports(), Some((5000, 5001)));
    assert_eq!(f.media.stream(1).unwrap().allocate_ports(), Some((5002, 5003)));
}

#[test]
fn dropping_prepared_media_tears_down() {
    let f = fixture(Preroll::Immediate, 1, 0, MediaConfig::default());
    f.media.prepare().unwrap();
    let pipeline = f.pipeline.clone();
    drop(f);

    assert!(wait_for(|| !pipeline.has_bus_handler()));
    assert!(!pipeline.contains("rtpbin"));
    assert_eq!(pipeline.current_state(), State::Null);
}
