//! Editing and playback session
//!
//! The session is the one owner of the mesh history, the drag editor, the
//! playlist and the cue controller. Committed meshes are published through
//! an `ArcSwap` slot so the render loop can read them without locking.

use arc_swap::ArcSwap;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::editor::{MeshEditor, Viewport};
use crate::error::{WarpError, WarpResult};
use crate::frame::PATTERN_URI;
use crate::history::MeshHistory;
use crate::mesh::Mesh;
use crate::playback::{CueController, PlaybackState, PlaybackStatus, TriggerEvent};
use crate::playlist::{make_thumbnail, Playlist, VideoCue};
use crate::store::{BlobStore, MESH_KEY, PLAYLIST_KEY};

/// Session tunables, filled from the config file
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub default_rows: usize,
    pub default_cols: usize,
    pub history_limit: usize,
    pub hit_radius: f64,
    pub autosave: bool,
}

/// Mesh plus editing flags, as reported to clients
#[derive(Debug, Clone, Serialize)]
pub struct MeshSummary {
    pub rows: usize,
    pub cols: usize,
    pub points: Mesh,
    pub can_undo: bool,
    pub can_redo: bool,
    pub history_length: usize,
    /// Index of the shown state within the history
    pub history_position: usize,
    pub dragging: Option<String>,
}

pub struct Session {
    settings: SessionSettings,
    history: MeshHistory,
    editor: MeshEditor,
    playlist: Playlist,
    controller: CueController,
    store: Box<dyn BlobStore>,
    /// Cleared after a storage failure; the session then runs in memory only
    persistent: bool,
    published: Arc<ArcSwap<Mesh>>,
}

impl Session {
    /// Restore mesh and playlist from the store, falling back to a default
    /// grid and an empty playlist.
    ///
    /// Only fails when the configured default grid itself is invalid.
    pub fn load(store: Box<dyn BlobStore>, settings: SessionSettings) -> WarpResult<Self> {
        let default_mesh = Mesh::generate(settings.default_rows, settings.default_cols)?;
        let mut persistent = true;

        let mesh = match read_blob::<Mesh>(store.as_ref(), MESH_KEY) {
            Ok(Some(mesh)) => match mesh.validate() {
                Ok((rows, cols)) => {
                    info!("Restored {}x{} mesh", rows, cols);
                    mesh
                }
                Err(e) => {
                    warn!("Stored mesh rejected ({}), using default grid", e);
                    default_mesh
                }
            },
            Ok(None) => {
                info!(
                    "No stored mesh, using default {}x{} grid",
                    settings.default_rows, settings.default_cols
                );
                default_mesh
            }
            Err(e) => {
                warn!("{}; continuing without persistence", e);
                persistent = false;
                default_mesh
            }
        };

        let cues = match read_blob::<Vec<VideoCue>>(store.as_ref(), PLAYLIST_KEY) {
            Ok(Some(mut cues)) => {
                info!("Restored playlist with {} cues", cues.len());
                for cue in cues.iter_mut() {
                    if cue.duration.is_some() && cue.play_duration().is_none() {
                        warn!("Cue {:?} has an unusable duration, treating it as unknown", cue.name);
                        cue.duration = None;
                    }
                }
                cues
            }
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("{}; continuing without persistence", e);
                persistent = false;
                Vec::new()
            }
        };

        let history = MeshHistory::new(mesh, settings.history_limit);
        let published = Arc::new(ArcSwap::new(Arc::clone(history.current())));

        Ok(Self {
            settings,
            history,
            editor: MeshEditor::new(settings.hit_radius),
            playlist: Playlist::new(cues),
            controller: CueController::new(),
            store,
            persistent,
            published,
        })
    }

    /// Slot the render loop reads each tick
    pub fn published(&self) -> Arc<ArcSwap<Mesh>> {
        Arc::clone(&self.published)
    }

    /// Last committed mesh
    pub fn mesh(&self) -> &Arc<Mesh> {
        self.history.current()
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn playlist(&self) -> &Playlist {
        &self.playlist
    }

    pub fn summary(&self) -> MeshSummary {
        let shown = self
            .editor
            .live_mesh()
            .unwrap_or(self.history.current().as_ref());
        let (rows, cols) = shown.grid_shape().unwrap_or((0, 0));
        MeshSummary {
            rows,
            cols,
            points: shown.clone(),
            can_undo: self.history.can_undo(),
            can_redo: self.history.can_redo(),
            history_length: self.history.len(),
            history_position: self.history.cursor(),
            dragging: match self.editor.state() {
                crate::editor::DragState::Dragging { id } => Some(id.clone()),
                crate::editor::DragState::Idle => None,
            },
        }
    }

    // --- Mesh editing ---

    pub fn pointer_down(&mut self, viewport: Viewport, px: f64, py: f64) -> Option<String> {
        let mesh = Arc::clone(self.history.current());
        self.editor.press(&mesh, viewport, px, py).map(str::to_string)
    }

    /// Apply a drag move live. Returns false when no drag is active.
    pub fn pointer_move(&mut self, viewport: Viewport, px: f64, py: f64) -> WarpResult<bool> {
        match self.editor.drag_to(viewport, px, py)? {
            Some(live) => {
                self.published.store(Arc::new(live.clone()));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// End the drag and commit it. Returns whether a history entry was added.
    pub fn pointer_up(&mut self) -> bool {
        match self.editor.release() {
            Some(mesh) => self.commit(mesh),
            None => false,
        }
    }

    pub fn pointer_cancel(&mut self) -> bool {
        match self.editor.cancel() {
            Some(mesh) => self.commit(mesh),
            None => false,
        }
    }

    /// Set one point directly as a single edit. Refused while a drag is
    /// active.
    pub fn set_point(&mut self, id: &str, x: f64, y: f64) -> WarpResult<bool> {
        if self.editor.is_dragging() {
            return Ok(false);
        }
        let mesh = self.history.current().with_point(id, x, y)?;
        Ok(self.commit(mesh))
    }

    fn commit(&mut self, mesh: Mesh) -> bool {
        let recorded = self.history.record(mesh);
        // Publish even when nothing was recorded so a cancelled live drag
        // snaps back to the committed mesh
        self.publish();
        if recorded {
            self.autosave_mesh();
        }
        recorded
    }

    pub fn undo(&mut self) -> bool {
        if self.editor.is_dragging() || self.history.undo().is_none() {
            return false;
        }
        self.publish();
        self.autosave_mesh();
        true
    }

    pub fn redo(&mut self) -> bool {
        if self.editor.is_dragging() || self.history.redo().is_none() {
            return false;
        }
        self.publish();
        self.autosave_mesh();
        true
    }

    /// Revert to the identity grid of the current shape, clearing history
    pub fn reset_mesh(&mut self, confirmed: bool) -> WarpResult<()> {
        if !confirmed {
            return Err(WarpError::ConfirmationRequired("mesh reset"));
        }
        let (rows, cols) = self
            .history
            .current()
            .grid_shape()
            .unwrap_or((self.settings.default_rows, self.settings.default_cols));
        self.replace_mesh(Mesh::generate(rows, cols)?);
        info!("Mesh reset to {}x{} identity grid", rows, cols);
        Ok(())
    }

    /// Start over with a fresh grid of a different shape
    pub fn regenerate(&mut self, rows: usize, cols: usize, confirmed: bool) -> WarpResult<()> {
        let mesh = Mesh::generate(rows, cols)?;
        if !confirmed {
            return Err(WarpError::ConfirmationRequired("mesh regeneration"));
        }
        self.replace_mesh(mesh);
        info!("Mesh regenerated as {}x{}", rows, cols);
        Ok(())
    }

    fn replace_mesh(&mut self, mesh: Mesh) {
        self.editor.release();
        self.history.reset(mesh);
        self.publish();
        self.autosave_mesh();
    }

    fn publish(&self) {
        self.published.store(Arc::clone(self.history.current()));
    }

    // --- Playlist ---

    pub fn add_cue(&mut self, name: &str, uri: &str, looping: bool, duration: Option<f64>) -> VideoCue {
        let duration = duration.filter(|&d| Duration::try_from_secs_f64(d).is_ok());
        let mut cue = VideoCue::new(name, uri, looping, duration);
        if !uri.starts_with(PATTERN_URI) {
            let path = uri.strip_prefix("file://").unwrap_or(uri);
            match make_thumbnail(Path::new(path)) {
                Ok(thumbnail) => cue.thumbnail = Some(thumbnail),
                Err(e) => debug!("No thumbnail for {:?}: {:#}", name, e),
            }
        }
        info!("Added cue {:?} ({})", cue.name, cue.uri);
        let cue = self.playlist.push(cue).clone();
        self.autosave_playlist();
        cue
    }

    /// Remove a cue. Removing the cue that is playing stops the run and
    /// leaves the following cue armed.
    pub fn remove_cue(&mut self, id: &str) -> WarpResult<VideoCue> {
        let was_current = self.playlist.current().is_some_and(|c| c.id == id);
        let cue = self.playlist.remove(id)?;
        if was_current {
            self.controller.stop();
        }
        info!("Removed cue {:?}", cue.name);
        self.autosave_playlist();
        Ok(cue)
    }

    // --- Playback ---

    pub fn handle_event(&mut self, event: TriggerEvent) -> PlaybackStatus {
        self.controller.handle(event, &mut self.playlist);
        self.playback_status()
    }

    pub fn complete_playback(&mut self, token: u64) -> bool {
        self.controller.complete(token, &mut self.playlist)
    }

    pub fn playback_status(&self) -> PlaybackStatus {
        self.controller.status(&self.playlist)
    }

    /// Cue to play for run `token`, if that run is still current
    pub fn cue_for_run(&self, token: u64) -> Option<VideoCue> {
        let status = self.playback_status();
        if status.state != PlaybackState::Playing || status.play_token != token {
            return None;
        }
        self.playlist.current().cloned()
    }

    // --- Persistence ---

    /// Write mesh and playlist. A success re-enables autosave after an
    /// earlier failure.
    pub fn save(&mut self) -> WarpResult<()> {
        let result = self.write_mesh().and_then(|_| self.write_playlist());
        match &result {
            Ok(()) => {
                if !self.persistent {
                    info!("Storage available again, autosave re-enabled");
                }
                self.persistent = true;
            }
            Err(e) => self.degrade(e),
        }
        result
    }

    fn write_mesh(&self) -> WarpResult<()> {
        let data = serde_json::to_vec_pretty(self.history.current().as_ref())
            .map_err(|e| WarpError::persistence(e.to_string()))?;
        self.store.put(MESH_KEY, &data)
    }

    fn write_playlist(&self) -> WarpResult<()> {
        let data = serde_json::to_vec_pretty(self.playlist.cues())
            .map_err(|e| WarpError::persistence(e.to_string()))?;
        self.store.put(PLAYLIST_KEY, &data)
    }

    fn autosave_mesh(&mut self) {
        if self.settings.autosave && self.persistent {
            if let Err(e) = self.write_mesh() {
                self.degrade(&e);
            }
        }
    }

    fn autosave_playlist(&mut self) {
        if self.settings.autosave && self.persistent {
            if let Err(e) = self.write_playlist() {
                self.degrade(&e);
            }
        }
    }

    fn degrade(&mut self, e: &WarpError) {
        warn!("{}; continuing in memory only", e);
        self.persistent = false;
    }
}

/// Read and decode a blob. Undecodable data counts as absent.
fn read_blob<T: serde::de::DeserializeOwned>(store: &dyn BlobStore, key: &str) -> WarpResult<Option<T>> {
    let Some(data) = store.get(key)? else {
        return Ok(None);
    };
    match serde_json::from_slice(&data) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            warn!("Stored {} is unreadable: {}", key, e);
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBlobStore;

    const VIEW: Viewport = Viewport {
        width: 1000,
        height: 1000,
    };

    fn settings() -> SessionSettings {
        SessionSettings {
            default_rows: 4,
            default_cols: 4,
            history_limit: 20,
            hit_radius: 32.0,
            autosave: true,
        }
    }

    fn session() -> Session {
        Session::load(Box::new(MemoryBlobStore::new()), settings()).unwrap()
    }

    /// Store that fails every call
    struct BrokenStore;

    impl BlobStore for BrokenStore {
        fn get(&self, _key: &str) -> WarpResult<Option<Vec<u8>>> {
            Err(WarpError::persistence("disk on fire"))
        }

        fn put(&self, _key: &str, _data: &[u8]) -> WarpResult<()> {
            Err(WarpError::persistence("disk on fire"))
        }
    }

    /// Shares its map so tests can inspect what the session wrote
    #[derive(Clone, Default)]
    struct SharedStore(Arc<MemoryBlobStore>);

    impl BlobStore for SharedStore {
        fn get(&self, key: &str) -> WarpResult<Option<Vec<u8>>> {
            self.0.get(key)
        }

        fn put(&self, key: &str, data: &[u8]) -> WarpResult<()> {
            self.0.put(key, data)
        }
    }

    #[test]
    fn test_drag_commit_undo_scenario() {
        let mut session = session();
        let original = session.mesh().as_ref().clone();
        let start = original.get("1-1").unwrap().clone();
        assert!((start.x - 1.0 / 3.0).abs() < 1e-12);

        // Move 1-1 onto (0.25, 0.25) as the starting position
        session.set_point("1-1", 0.25, 0.25).unwrap();
        let before = session.mesh().as_ref().clone();
        let len_before = session.summary().history_length;

        assert_eq!(session.pointer_down(VIEW, 250.0, 250.0).as_deref(), Some("1-1"));
        assert!(session.pointer_move(VIEW, 300.0, 280.0).unwrap());
        assert!(session.pointer_move(VIEW, 400.0, 300.0).unwrap());
        // Live drag is visible to the renderer but not committed yet
        let live = session.published().load_full();
        assert!((live.get("1-1").unwrap().x - 0.4).abs() < 1e-12);
        assert_eq!(session.summary().history_length, len_before);

        assert!(session.pointer_up());
        let after = session.mesh().as_ref().clone();
        let p = after.get("1-1").unwrap();
        assert!((p.x - 0.4).abs() < 1e-12 && (p.y - 0.3).abs() < 1e-12);
        for point in before.points().iter().filter(|p| p.id != "1-1") {
            assert_eq!(after.get(&point.id), Some(point));
        }
        assert_eq!(session.summary().history_length, len_before + 1);

        assert!(session.undo());
        let p = session.mesh().get("1-1").unwrap().clone();
        assert_eq!((p.x, p.y), (0.25, 0.25));
        assert_eq!(session.published().load().get("1-1"), Some(&p));
    }

    #[test]
    fn test_click_without_move_records_nothing() {
        let mut session = session();
        assert!(session.pointer_down(VIEW, 0.0, 0.0).is_some());
        assert!(!session.pointer_up());
        assert_eq!(session.summary().history_length, 1);
    }

    #[test]
    fn test_reset_requires_confirmation() {
        let mut session = session();
        session.set_point("1-1", 0.5, 0.5).unwrap();
        assert_eq!(
            session.reset_mesh(false),
            Err(WarpError::ConfirmationRequired("mesh reset"))
        );
        assert!(session.summary().can_undo);

        session.reset_mesh(true).unwrap();
        assert_eq!(**session.mesh(), Mesh::generate(4, 4).unwrap());
        assert!(!session.summary().can_undo);
    }

    #[test]
    fn test_regenerate_validates_before_confirming() {
        let mut session = session();
        assert!(matches!(
            session.regenerate(1, 5, true),
            Err(WarpError::InvalidDimension { .. })
        ));
        assert!(session.regenerate(5, 6, false).is_err());
        session.regenerate(5, 6, true).unwrap();
        assert_eq!(session.summary().rows, 5);
        assert_eq!(session.published().load().len(), 30);
    }

    #[test]
    fn test_restores_from_store() {
        let store = SharedStore::default();
        {
            let mut session = Session::load(Box::new(store.clone()), settings()).unwrap();
            session.set_point("2-2", 0.9, 0.1).unwrap();
            session.add_cue("grid", "pattern:grid", true, None);
        }
        let session = Session::load(Box::new(store), settings()).unwrap();
        assert_eq!(session.mesh().get("2-2").unwrap().x, 0.9);
        assert_eq!(session.playlist().len(), 1);
        assert!(session.playlist().cues()[0].looping);
    }

    #[test]
    fn test_malformed_blob_falls_back() {
        let store = SharedStore::default();
        store.put(MESH_KEY, br#"[{"id":"0-0","x":0.0,"y":0.0},{"id":"x","x":1,"y":1}]"#).unwrap();
        store.put(PLAYLIST_KEY, b"not json").unwrap();
        let session = Session::load(Box::new(store), settings()).unwrap();
        assert_eq!(**session.mesh(), Mesh::generate(4, 4).unwrap());
        assert!(session.playlist().is_empty());
        assert!(session.is_persistent());
    }

    #[test]
    fn test_storage_failure_degrades() {
        let mut session = Session::load(Box::new(BrokenStore), settings()).unwrap();
        assert!(!session.is_persistent());
        assert_eq!(session.mesh().len(), 16);

        // Edits keep working in memory
        assert!(session.set_point("0-0", 0.1, 0.1).unwrap());
        assert!(matches!(session.save(), Err(WarpError::PersistenceFailure(_))));
        assert!(!session.is_persistent());
    }

    #[test]
    fn test_set_point_refused_while_dragging() {
        let mut session = session();
        assert_eq!(session.pointer_down(VIEW, 0.0, 0.0).as_deref(), Some("0-0"));
        assert!(session.pointer_move(VIEW, 100.0, 100.0).unwrap());
        assert!(!session.set_point("3-3", 0.9, 0.9).unwrap());
        assert!(session.pointer_up());

        let mesh = session.mesh();
        assert_eq!(mesh.get("3-3").unwrap().x, 1.0);
        assert!((mesh.get("0-0").unwrap().x - 0.1).abs() < 1e-12);
        assert_eq!(session.summary().history_position, 1);
        assert!(session.set_point("3-3", 0.9, 0.9).unwrap());
    }

    #[test]
    fn test_unusable_durations_dropped() {
        let store = SharedStore::default();
        {
            let mut session = Session::load(Box::new(store.clone()), settings()).unwrap();
            let cue = session.add_cue("huge", "pattern:grid", false, Some(1e20));
            assert_eq!(cue.duration, None);
        }
        store
            .put(
                PLAYLIST_KEY,
                br#"[{"id":"a","name":"stored","uri":"pattern:grid","loop":false,"duration":1e20,"createdAt":0}]"#,
            )
            .unwrap();
        let session = Session::load(Box::new(store), settings()).unwrap();
        assert_eq!(session.playlist().cues()[0].duration, None);
    }

    #[test]
    fn test_remove_playing_cue_arms_next() {
        let mut session = session();
        let a = session.add_cue("a", "pattern:grid", false, None);
        session.add_cue("b", "pattern:grid", false, None);
        session.add_cue("c", "pattern:grid", false, None);
        let run = session.handle_event(TriggerEvent::Trigger).play_token;

        session.remove_cue(&a.id).unwrap();
        assert!(session.cue_for_run(run).is_none());
        assert!(!session.complete_playback(run));

        let status = session.playback_status();
        assert_eq!(status.state, PlaybackState::Armed);
        assert_eq!(session.playlist().current().unwrap().name, "b");
    }

    #[test]
    fn test_remove_earlier_cue_keeps_run() {
        let mut session = session();
        let a = session.add_cue("a", "pattern:grid", false, None);
        session.add_cue("b", "pattern:grid", false, None);
        session.add_cue("c", "pattern:grid", false, None);
        session.handle_event(TriggerEvent::NextCue);
        let run = session.handle_event(TriggerEvent::Trigger).play_token;

        session.remove_cue(&a.id).unwrap();
        assert_eq!(session.cue_for_run(run).unwrap().name, "b");
        assert!(session.complete_playback(run));
        assert_eq!(session.playlist().current().unwrap().name, "c");
    }

    #[test]
    fn test_invalid_default_grid() {
        let mut bad = settings();
        bad.default_cols = 1;
        assert!(Session::load(Box::new(MemoryBlobStore::new()), bad).is_err());
    }

    #[test]
    fn test_playback_flow() {
        let mut session = session();
        let first = session.add_cue("one", "pattern:grid", false, Some(1.0));
        session.add_cue("two", "pattern:grid", false, Some(1.0));
        assert!(first.thumbnail.is_none());

        let status = session.handle_event(TriggerEvent::Trigger);
        assert_eq!(status.state, PlaybackState::Playing);
        assert_eq!(session.cue_for_run(status.play_token).unwrap().id, first.id);
        assert!(session.cue_for_run(status.play_token + 1).is_none());

        assert!(session.complete_playback(status.play_token));
        let status = session.playback_status();
        assert_eq!(status.state, PlaybackState::Armed);
        assert_eq!(status.current_cue_index, 1);

        let second = session.playlist().cues()[1].id.clone();
        let removed = session.remove_cue(&second).unwrap();
        assert_eq!(removed.name, "two");
        assert_eq!(session.playback_status().current_cue_index, 0);
        assert!(session.remove_cue("missing").is_err());
    }
}
