//! Presentation behavior of a loaded scheduler: pacing, wrap-around and
//! seeking.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use vidpipe_core::{Clock, ManualClock, PlaybackConfig};
use vidpipe_media::PatternSpec;
use vidpipe_playback::{MemorySurface, PlaybackCallbacks, PlaybackScheduler, PlaybackStatus};

// ── Helpers ────────────────────────────────────────────────────

struct Rig {
    scheduler: PlaybackScheduler,
    clock: Arc<ManualClock>,
    surface: MemorySurface,
    seeks: Arc<Mutex<Vec<usize>>>,
    changes: Arc<Mutex<Vec<usize>>>,
}

fn rig(spec: PatternSpec, config: PlaybackConfig) -> Rig {
    let clock = Arc::new(ManualClock::new());
    let surface = MemorySurface::matching_stream();
    let seeks = Arc::new(Mutex::new(Vec::new()));
    let changes = Arc::new(Mutex::new(Vec::new()));

    let callbacks = {
        let changes = Arc::clone(&changes);
        PlaybackCallbacks::new().on_frame_changed(move |frame| changes.lock().push(frame))
    };
    let scheduler = PlaybackScheduler::new(config, Box::new(surface.clone()), callbacks)
        .unwrap()
        .with_clock(clock.clone())
        .with_opener(spec.opener(Arc::clone(&seeks)));

    Rig {
        scheduler,
        clock,
        surface,
        seeks,
        changes,
    }
}

/// Advance simulated time one frame at a time, but only once the frame
/// due next has been decoded.
fn play_until(rig: &mut Rig, mut done: impl FnMut(&PlaybackScheduler) -> bool) {
    let interval = rig.scheduler.frame_interval_us();
    for _ in 0..50_000 {
        if done(&rig.scheduler) {
            return;
        }
        rig.scheduler.tick();
        let next = rig.scheduler.current_frame();
        if rig.scheduler.frame_buffer().contains(next) {
            rig.clock.advance_us(interval);
        } else {
            std::thread::sleep(Duration::from_millis(1));
        }
    }
    panic!("playback stalled at frame {}", rig.scheduler.current_frame());
}

// ── Pacing ─────────────────────────────────────────────────────

#[test]
fn one_second_at_30fps_presents_30_frames() {
    let config = PlaybackConfig {
        max_buffer_size: 64,
        target_fps: Some(30.0),
        ..Default::default()
    };
    let mut rig = rig(PatternSpec::new(16, 8, 300), config);
    assert!(rig.scheduler.load_video("pattern"));
    assert_eq!(rig.scheduler.frame_interval_us(), 33_333);
    assert!(rig
        .scheduler
        .frame_buffer()
        .wait_for_initial_buffer(40, Duration::from_secs(5)));

    let start = rig.clock.now_us();
    rig.scheduler.play().unwrap();
    rig.scheduler.run_for(Duration::from_secs(1));
    assert_eq!(rig.clock.now_us() - start, 1_000_000);

    let advanced = rig.scheduler.current_frame();
    assert!((29..=31).contains(&advanced), "advanced {advanced} frames");
    assert_eq!(rig.scheduler.performance_metrics().underruns, 0);
}

#[test]
fn presentation_follows_target_rate_not_stream_rate() {
    let config = PlaybackConfig {
        max_buffer_size: 64,
        target_fps: Some(10.0),
        ..Default::default()
    };
    let mut rig = rig(PatternSpec::new(16, 8, 300), config);
    assert!(rig.scheduler.load_video("pattern"));
    assert!(rig
        .scheduler
        .frame_buffer()
        .wait_for_initial_buffer(20, Duration::from_secs(5)));

    rig.scheduler.play().unwrap();
    rig.scheduler.run_for(Duration::from_secs(1));
    assert_eq!(rig.scheduler.current_frame(), 10);
}

// ── Wrap-around ────────────────────────────────────────────────

#[test]
fn looping_wraps_from_last_frame_with_internal_seek() {
    let mut rig = rig(PatternSpec::new(4, 2, 300), PlaybackConfig::default());
    assert!(rig.scheduler.load_video("pattern"));
    rig.scheduler.play().unwrap();

    play_until(&mut rig, |s| s.current_frame() == 299);
    assert!(rig.seeks.lock().is_empty());
    play_until(&mut rig, |s| s.current_frame() == 0);

    let changes = rig.changes.lock();
    assert_eq!(changes.len(), 300);
    assert_eq!(changes[298], 299);
    assert_eq!(changes[299], 0);
    assert_eq!(*rig.seeks.lock(), vec![0]);
    assert!(rig.scheduler.is_playing());
}

#[test]
fn looping_keeps_presenting_after_wrap() {
    let mut rig = rig(PatternSpec::new(4, 2, 20), PlaybackConfig::default());
    assert!(rig.scheduler.load_video("pattern"));
    rig.scheduler.play().unwrap();

    let changes = Arc::clone(&rig.changes);
    play_until(&mut rig, |_| changes.lock().len() >= 45);
    assert_eq!(rig.surface.presented(), 45);
    assert_eq!(rig.scheduler.current_frame(), 5);
}

#[test]
fn without_looping_playback_pauses_on_last_frame() {
    let config = PlaybackConfig {
        looping: false,
        ..Default::default()
    };
    let mut rig = rig(PatternSpec::new(4, 2, 30), config);
    assert!(rig.scheduler.load_video("pattern"));
    rig.scheduler.play().unwrap();

    play_until(&mut rig, |s| s.status() == PlaybackStatus::Paused);
    assert_eq!(rig.scheduler.current_frame(), 29);
    assert_eq!(rig.surface.presented(), 30);

    // Resuming presents the last frame again and pauses.
    rig.scheduler.play().unwrap();
    rig.scheduler.tick();
    assert_eq!(rig.scheduler.status(), PlaybackStatus::Paused);
    assert_eq!(rig.scheduler.current_frame(), 29);
}

// ── Seeking ────────────────────────────────────────────────────

#[test]
fn seek_clears_buffer_then_refills_at_target() {
    let spec = PatternSpec::new(4, 2, 300).with_read_delay(Duration::from_millis(20));
    let mut rig = rig(spec, PlaybackConfig::default());
    assert!(rig.scheduler.load_video("pattern"));

    rig.scheduler.seek(150).unwrap();
    assert_eq!(rig.scheduler.frame_buffer().len(), 0);
    assert!(rig.scheduler.frame_buffer().get_frame(0).is_none());

    let buffer = Arc::clone(rig.scheduler.frame_buffer());
    assert!(buffer.wait_for_initial_buffer(1, Duration::from_secs(5)));
    let frame = buffer.get_frame(150).expect("target frame decoded");
    assert_eq!(vidpipe_media::frame_marker(&frame), 150);
    assert!(rig.seeks.lock().contains(&150));
}

#[test]
fn playback_resumes_from_seek_target() {
    let mut rig = rig(PatternSpec::new(4, 2, 300), PlaybackConfig::default());
    assert!(rig.scheduler.load_video("pattern"));
    rig.scheduler.play().unwrap();
    play_until(&mut rig, |s| s.current_frame() >= 4);

    rig.scheduler.seek(200).unwrap();
    play_until(&mut rig, |s| s.current_frame() >= 203);
    let changes = rig.changes.lock();
    assert_eq!(&changes[changes.len() - 3..], &[201, 202, 203]);
}
