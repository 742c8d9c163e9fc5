//! Render loop
//!
//! Runs on a blocking thread, one iteration per output frame:
//! - follow the cue controller (open the cue's source on a new run, drop it
//!   when playback stops)
//! - warp the current frame through the latest published mesh
//! - hand the result to the output sink and, when someone is watching, the
//!   JPEG preview
//! - report completion back to the session
//!
//! Mesh edits never block this loop; it only reads the `ArcSwap` slot. The
//! session lock is taken briefly for the controller status.

use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::frame::{open_source, FrameSource, TestPatternSource};
use crate::output::{FrameSink, NullSink, RawSink};
use crate::playback::PlaybackState;
use crate::server::{AppState, RenderStats};
use crate::warp::{RenderStatus, WarpRenderer};

/// Source for the run currently on screen
struct ActiveCue {
    token: u64,
    name: String,
    looping: bool,
    source: Box<dyn FrameSource>,
}

/// What the loop draws when no cue is playing
enum Idle {
    Dark,
    Pattern(TestPatternSource),
}

pub fn run_render_loop(state: Arc<AppState>) -> Result<()> {
    let output = state.output_config().clone();
    let (width, height) = (output.width, output.height);
    let fps = output.fps.max(1);

    info!("=== warpcue render loop ===");
    info!("Output: {}x{} @ {} fps", width, height, fps);

    let mut renderer = WarpRenderer::new(width, height, state.warp_settings());
    info!("Warp: {:?}", renderer.settings());
    let mesh_slot = state.mesh_slot();

    let mut sink: Box<dyn FrameSink> = match &output.sink {
        Some(path) => Box::new(RawSink::new(path)),
        None => Box::new(NullSink),
    };
    info!("Frame sink: {}", sink.info());

    let mut active: Option<ActiveCue> = None;
    let mut idle = Idle::Dark;
    let pattern_clock = Instant::now();

    let frame_interval = Duration::from_secs_f64(1.0 / fps as f64);
    let mut next_deadline = Instant::now();

    // Performance tracking
    let mut frame_count = 0u64;
    let mut not_ready_count = 0u64;
    let mut render_us_total = 0u64;
    let mut last_stats_time = Instant::now();
    let stats_interval = Duration::from_secs(10);

    while !state.is_shutdown() {
        let status = state.session.lock().playback_status();

        // Follow the controller
        match status.state {
            PlaybackState::Playing => {
                if active.as_ref().map(|a| a.token) != Some(status.play_token) {
                    if let Some(mut old) = active.take() {
                        old.source.pause();
                    }
                    let cue = state.session.lock().cue_for_run(status.play_token);
                    if let Some(cue) = cue {
                        let mut source = open_source(&cue, width, height);
                        source.seek(Duration::ZERO);
                        source.play();
                        let (src_w, src_h) = source.frame_size();
                        info!(
                            "Started cue {:?} ({}x{}, run {})",
                            cue.name, src_w, src_h, status.play_token
                        );
                        active = Some(ActiveCue {
                            token: status.play_token,
                            name: cue.name,
                            looping: cue.looping,
                            source,
                        });
                    }
                }
            }
            PlaybackState::Armed | PlaybackState::Blackout => {
                if let Some(mut old) = active.take() {
                    old.source.pause();
                    info!("Stopped cue {:?}", old.name);
                }
            }
        }

        let pattern_wanted =
            status.state == PlaybackState::Armed && state.calibration_pattern_enabled();
        if pattern_wanted && matches!(idle, Idle::Dark) {
            idle = Idle::Pattern(TestPatternSource::new(width, height, None));
        } else if !pattern_wanted && matches!(idle, Idle::Pattern(_)) {
            idle = Idle::Dark;
        }

        let mesh = mesh_slot.load_full();
        let render_start = Instant::now();

        let render_status = match (&mut active, &mut idle) {
            (Some(cue), _) => {
                let position = cue.source.position();
                match cue.source.current_frame(position) {
                    Ok(frame) => renderer.render(&mesh, Some(frame)),
                    Err(e) => {
                        debug!("Cue {:?}: {}", cue.name, e);
                        renderer.render(&mesh, None)
                    }
                }
            }
            (None, Idle::Pattern(pattern)) => match pattern.current_frame(pattern_clock.elapsed()) {
                Ok(frame) => renderer.render(&mesh, Some(frame)),
                Err(_) => renderer.render(&mesh, None),
            },
            (None, Idle::Dark) => renderer.render(&mesh, None),
        };

        if active.is_some() && render_status == RenderStatus::Blank {
            not_ready_count += 1;
        }
        render_us_total += render_start.elapsed().as_micros() as u64;

        // Output write; the sink rate-limits its own warnings
        let _ = sink.write_frame(renderer.output());

        if state.should_encode_preview() && frame_count % 3 == 0 {
            state.update_preview(renderer.output());
        }

        // Completion signal
        let finished = match active.as_mut() {
            Some(cue) if cue.source.is_complete() => {
                if cue.looping {
                    cue.source.seek(Duration::ZERO);
                    None
                } else {
                    Some(cue.token)
                }
            }
            _ => None,
        };
        if let Some(token) = finished {
            if let Some(cue) = active.take() {
                info!("Cue {:?} finished", cue.name);
            }
            state.session.lock().complete_playback(token);
        }

        frame_count += 1;

        // Log performance stats periodically
        if last_stats_time.elapsed() >= stats_interval {
            let elapsed = last_stats_time.elapsed().as_secs_f64();
            let stats = RenderStats {
                fps: frame_count as f64 / elapsed,
                avg_render_us: render_us_total / frame_count.max(1),
                not_ready_frames: not_ready_count,
            };
            if not_ready_count > 0 {
                warn!(
                    "Performance: {:.1} fps, {} us/frame, {} frames not ready",
                    stats.fps, stats.avg_render_us, not_ready_count
                );
            } else {
                info!("Performance: {:.1} fps, {} us/frame", stats.fps, stats.avg_render_us);
            }
            debug!("Frame sink: {}", sink.info());
            state.record_stats(stats);
            frame_count = 0;
            not_ready_count = 0;
            render_us_total = 0;
            last_stats_time = Instant::now();
        }

        // Frame pacing; after a long stall resync instead of bursting
        next_deadline += frame_interval;
        let now = Instant::now();
        if next_deadline > now {
            std::thread::sleep(next_deadline - now);
        } else if now - next_deadline > frame_interval * 4 {
            next_deadline = now;
        }
    }

    info!("Render loop stopped");
    Ok(())
}
