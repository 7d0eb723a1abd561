//! Load, failure and teardown behavior, including pixel buffer accounting.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use vidpipe_core::{BufferLedger, ManualClock, PlaybackConfig, RenderMode};
use vidpipe_media::PatternSpec;
use vidpipe_playback::{MemorySurface, PlaybackCallbacks, PlaybackScheduler, PlaybackStatus};

// ── Helpers ────────────────────────────────────────────────────

fn error_log() -> (Arc<Mutex<Vec<String>>>, PlaybackCallbacks) {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let callbacks = {
        let errors = Arc::clone(&errors);
        PlaybackCallbacks::new().on_error(move |message| errors.lock().push(message.to_string()))
    };
    (errors, callbacks)
}

fn pattern_scheduler(
    spec: PatternSpec,
    config: PlaybackConfig,
    surface: &MemorySurface,
    callbacks: PlaybackCallbacks,
) -> (PlaybackScheduler, Arc<ManualClock>, BufferLedger) {
    let clock = Arc::new(ManualClock::new());
    let ledger = BufferLedger::new();
    let scheduler = PlaybackScheduler::new(config, Box::new(surface.clone()), callbacks)
        .unwrap()
        .with_clock(clock.clone())
        .with_ledger(ledger.clone())
        .with_opener(spec.opener(Default::default()));
    (scheduler, clock, ledger)
}

fn play_to_end(scheduler: &mut PlaybackScheduler, clock: &ManualClock) {
    let interval = scheduler.frame_interval_us();
    scheduler.play().unwrap();
    for _ in 0..50_000 {
        if scheduler.status() != PlaybackStatus::Playing {
            return;
        }
        scheduler.tick();
        if scheduler.frame_buffer().contains(scheduler.current_frame()) {
            clock.advance_us(interval);
        } else {
            std::thread::sleep(Duration::from_millis(1));
        }
    }
    panic!("playback stalled at frame {}", scheduler.current_frame());
}

// ── Load failures ──────────────────────────────────────────────

#[test]
fn missing_file_fails_load_and_reports_once() {
    let (errors, callbacks) = error_log();
    let mut scheduler = PlaybackScheduler::new(
        PlaybackConfig::default(),
        Box::new(MemorySurface::matching_stream()),
        callbacks,
    )
    .unwrap();

    let started = Instant::now();
    assert!(!scheduler.load_video("missing.mp4"));
    assert!(started.elapsed() < Duration::from_millis(5_000));
    assert_eq!(scheduler.status(), PlaybackStatus::Idle);

    let errors = errors.lock();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("missing.mp4"), "{}", errors[0]);
}

#[test]
fn slow_open_times_out_within_load_timeout() {
    let config = PlaybackConfig {
        load_timeout_ms: 100,
        dispose_grace_ms: 50,
        ..Default::default()
    };
    let surface = MemorySurface::matching_stream();
    let (errors, callbacks) = error_log();
    let spec = PatternSpec::new(4, 2, 30).with_open_delay(Duration::from_secs(2));
    let (mut scheduler, _clock, _ledger) = pattern_scheduler(spec, config, &surface, callbacks);

    let started = Instant::now();
    assert!(!scheduler.load_video("slow"));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(errors.lock().len(), 1);
}

// ── Decode errors ──────────────────────────────────────────────

#[test]
fn decode_error_surfaces_once_and_reload_recovers() {
    let surface = MemorySurface::matching_stream();
    let (errors, callbacks) = error_log();
    let spec = PatternSpec::new(4, 2, 60).failing_at(10);
    let (mut scheduler, clock, ledger) =
        pattern_scheduler(spec, PlaybackConfig::default(), &surface, callbacks);

    assert!(scheduler.load_video("broken"));
    play_to_end(&mut scheduler, &clock);
    assert_eq!(scheduler.status(), PlaybackStatus::Idle);
    assert_eq!(errors.lock().len(), 1);
    assert_eq!(ledger.live(), 0);

    for _ in 0..10 {
        scheduler.tick();
    }
    assert_eq!(errors.lock().len(), 1);

    let mut scheduler = scheduler.with_opener(PatternSpec::new(4, 2, 60).opener(Default::default()));
    assert!(scheduler.load_video("fixed"));
    assert_eq!(scheduler.status(), PlaybackStatus::Ready);
}

// ── Teardown ───────────────────────────────────────────────────

#[test]
fn dispose_twice_balances_ledger() {
    let surface = MemorySurface::matching_stream();
    let (errors, callbacks) = error_log();
    let (mut scheduler, _clock, ledger) = pattern_scheduler(
        PatternSpec::new(64, 36, 300),
        PlaybackConfig::default(),
        &surface,
        callbacks,
    );
    assert!(scheduler.load_video("pattern"));
    scheduler.play().unwrap();
    scheduler.run_for(Duration::from_millis(200));

    scheduler.dispose();
    let after_first = ledger.snapshot();
    assert!(after_first.allocated > 0);
    assert_eq!(after_first.live(), 0);
    assert_eq!(after_first.live_bytes, 0);

    scheduler.dispose();
    assert_eq!(ledger.snapshot(), after_first);
    assert_eq!(scheduler.status(), PlaybackStatus::Disposed);
    assert!(errors.lock().is_empty());
}

#[test]
fn dispose_with_stalled_decoder_is_bounded() {
    let config = PlaybackConfig {
        dispose_grace_ms: 100,
        initial_buffer_wait_timeout_ms: 300,
        ..Default::default()
    };
    let surface = MemorySurface::matching_stream();
    let (_errors, callbacks) = error_log();
    let spec = PatternSpec::new(4, 2, 300).with_read_delay(Duration::from_millis(400));
    let (mut scheduler, _clock, _ledger) = pattern_scheduler(spec, config, &surface, callbacks);

    // Initial fill will not complete; load still succeeds after its wait.
    assert!(scheduler.load_video("slow"));
    assert!(scheduler.frame_buffer().len() < 5);

    let started = Instant::now();
    scheduler.dispose();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(scheduler.status(), PlaybackStatus::Disposed);
}

#[test]
fn copy_mode_round_trip_releases_every_buffer() {
    let config = PlaybackConfig {
        max_buffer_size: 8,
        looping: false,
        ..Default::default()
    };
    let surface = MemorySurface::matching_stream();
    let (_errors, callbacks) = error_log();
    let (mut scheduler, clock, ledger) =
        pattern_scheduler(PatternSpec::new(32, 18, 60), config, &surface, callbacks);

    assert!(scheduler.load_video("pattern"));
    play_to_end(&mut scheduler, &clock);
    assert_eq!(surface.presented(), 60);
    assert!(ledger.snapshot().allocated >= 60);
    assert!(scheduler.frame_buffer().len() <= 8);

    scheduler.dispose();
    let snapshot = ledger.snapshot();
    assert_eq!(snapshot.allocated, snapshot.released);
}

#[test]
fn hand_off_mode_releases_held_frame_on_dispose() {
    let config = PlaybackConfig {
        max_buffer_size: 8,
        looping: false,
        render_mode: RenderMode::HandOff,
        ..Default::default()
    };
    let surface = MemorySurface::matching_stream();
    let (_errors, callbacks) = error_log();
    let (mut scheduler, clock, ledger) =
        pattern_scheduler(PatternSpec::new(32, 18, 40), config, &surface, callbacks);

    assert!(scheduler.load_video("pattern"));
    play_to_end(&mut scheduler, &clock);
    let held = surface.held_frame().expect("surface holds the last frame");
    assert_eq!(held.frame_number, 39);
    drop(held);

    scheduler.dispose();
    assert!(surface.held_frame().is_none());
    assert_eq!(ledger.live(), 0);
}
