//! Playback on the system clock, with the decoder racing presentation.
//!
//! Nothing here waits for a frame before letting time pass, so a buffer that
//! loses its look-ahead or a stream that ends early shows up as a stall.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use vidpipe_core::PlaybackConfig;
use vidpipe_media::PatternSpec;
use vidpipe_playback::{MemorySurface, PlaybackCallbacks, PlaybackScheduler, PlaybackStatus};

// ── Helpers ────────────────────────────────────────────────────

fn realtime(spec: PatternSpec, config: PlaybackConfig) -> (PlaybackScheduler, Arc<Mutex<Vec<usize>>>) {
    let changes = Arc::new(Mutex::new(Vec::new()));
    let callbacks = {
        let changes = Arc::clone(&changes);
        PlaybackCallbacks::new().on_frame_changed(move |frame| changes.lock().push(frame))
    };
    let scheduler = PlaybackScheduler::new(config, Box::new(MemorySurface::matching_stream()), callbacks)
        .unwrap()
        .with_opener(spec.opener(Default::default()));
    (scheduler, changes)
}

fn wrapped_after(changes: &[usize], last: usize) -> bool {
    changes.windows(2).any(|pair| pair[0] == last && pair[1] == 0)
}

// ── Wrap-around ────────────────────────────────────────────────

#[test]
fn default_config_plays_through_the_wrap() {
    let (mut scheduler, changes) = realtime(PatternSpec::new(4, 2, 100), PlaybackConfig::default());
    assert!(scheduler.load_video("pattern"));
    scheduler.play().unwrap();
    scheduler.run_for(Duration::from_secs(5));

    assert_eq!(scheduler.status(), PlaybackStatus::Playing);
    let metrics = scheduler.performance_metrics();
    assert!(metrics.frames_presented >= 60, "presented {}", metrics.frames_presented);
    assert!(wrapped_after(&changes.lock(), 99), "no wrap from 99 to 0");
}

#[test]
fn short_stream_wraps_where_it_really_ends() {
    let spec = PatternSpec::new(4, 2, 100).truncated_at(40);
    let (mut scheduler, changes) = realtime(spec, PlaybackConfig::default());
    assert!(scheduler.load_video("pattern"));
    scheduler.play().unwrap();
    scheduler.run_for(Duration::from_secs(3));

    assert_eq!(scheduler.total_frames(), 40);
    assert!(scheduler.current_frame() < 40);
    assert!(scheduler.performance_metrics().frames_presented >= 45);
    let changes = changes.lock();
    assert!(changes.contains(&0));
    assert!(changes.iter().all(|&frame| frame <= 40));
}

// ── Seeking ────────────────────────────────────────────────────

#[test]
fn seek_while_playing_resumes_from_target() {
    let (mut scheduler, changes) = realtime(PatternSpec::new(4, 2, 300), PlaybackConfig::default());
    assert!(scheduler.load_video("pattern"));
    scheduler.play().unwrap();
    scheduler.run_for(Duration::from_secs(1));
    assert!(scheduler.current_frame() >= 10);

    assert_eq!(scheduler.seek(150).unwrap(), 150);
    scheduler.run_for(Duration::from_secs(1));

    let frame = scheduler.current_frame();
    assert!(frame >= 165, "only reached frame {frame} after seeking to 150");
    assert!(changes.lock().contains(&151));
}
