//! Trigger-driven cue playback state machine
//!
//! `Armed --trigger--> Playing --completion--> Armed`, with `Blackout`
//! reachable from anywhere. Each entry into `Playing` gets a new play token
//! so the render loop restarts the source exactly once per trigger and stale
//! completions are ignored.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::playlist::Playlist;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    Armed,
    Playing,
    Blackout,
}

/// Named input events from the trigger bridge or the manual buttons
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerEvent {
    Trigger,
    NextCue,
    PrevCue,
    ToggleBlackout,
}

/// Snapshot read by the render loop and the API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlaybackStatus {
    pub state: PlaybackState,
    pub current_cue_index: usize,
    pub play_token: u64,
}

#[derive(Debug)]
pub struct CueController {
    state: PlaybackState,
    play_token: u64,
}

impl Default for CueController {
    fn default() -> Self {
        Self::new()
    }
}

impl CueController {
    pub fn new() -> Self {
        Self {
            state: PlaybackState::Armed,
            play_token: 0,
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn play_token(&self) -> u64 {
        self.play_token
    }

    pub fn status(&self, playlist: &Playlist) -> PlaybackStatus {
        PlaybackStatus {
            state: self.state,
            current_cue_index: playlist.current_index(),
            play_token: self.play_token,
        }
    }

    /// Apply one input event. Returns true when anything changed.
    pub fn handle(&mut self, event: TriggerEvent, playlist: &mut Playlist) -> bool {
        let changed = match event {
            TriggerEvent::Trigger => self.trigger(playlist),
            TriggerEvent::NextCue => self.navigate(playlist, 1),
            TriggerEvent::PrevCue => self.navigate(playlist, -1),
            TriggerEvent::ToggleBlackout => self.toggle_blackout(),
        };
        if changed {
            debug!("Playback: {:?} -> {:?}", event, self.status(playlist));
        }
        changed
    }

    fn trigger(&mut self, playlist: &Playlist) -> bool {
        if self.state != PlaybackState::Armed || playlist.current().is_none() {
            return false;
        }
        self.state = PlaybackState::Playing;
        self.play_token += 1;
        if let Some(cue) = playlist.current() {
            info!("Playing cue {} {:?}", playlist.current_index() + 1, cue.name);
        }
        true
    }

    fn navigate(&mut self, playlist: &mut Playlist, step: isize) -> bool {
        if self.state == PlaybackState::Playing {
            return false;
        }
        let Some(target) = playlist.current_index().checked_add_signed(step) else {
            return false;
        };
        playlist.select(target)
    }

    fn toggle_blackout(&mut self) -> bool {
        self.state = match self.state {
            PlaybackState::Blackout => {
                info!("Blackout off");
                PlaybackState::Armed
            }
            PlaybackState::Armed | PlaybackState::Playing => {
                info!("Blackout on");
                PlaybackState::Blackout
            }
        };
        true
    }

    /// Abort the current run, e.g. because its cue was removed. The cursor
    /// is left where it is.
    pub fn stop(&mut self) -> bool {
        if self.state != PlaybackState::Playing {
            return false;
        }
        info!("Run {} stopped", self.play_token);
        self.state = PlaybackState::Armed;
        true
    }

    /// The source for run `token` finished. Returns to `Armed`, advancing to
    /// the next cue unless the finished cue loops.
    pub fn complete(&mut self, token: u64, playlist: &mut Playlist) -> bool {
        if self.state != PlaybackState::Playing || token != self.play_token {
            debug!("Playback: ignoring stale completion for run {}", token);
            return false;
        }
        self.state = PlaybackState::Armed;

        let looping = playlist.current().is_some_and(|c| c.looping);
        if !looping {
            playlist.select(playlist.current_index() + 1);
        }
        info!("Cue finished, armed at cue {}", playlist.current_index() + 1);
        true
    }
}
