//! Pointer interaction for mesh calibration
//!
//! Translates viewport pixel events into point edits. Only one drag can be
//! active; intermediate positions are kept as a live mesh for feedback and
//! the final mesh is handed back on release as a single committed edit.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::WarpResult;
use crate::mesh::{normalize_pixels, Mesh};

/// Handle radius plus hit slop, in pixels
pub const DEFAULT_HIT_RADIUS: f64 = 32.0;

/// Size of the editing surface in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Find the point closest to `(px, py)` within `radius` pixels.
///
/// Ties resolve to the first point in iteration order.
pub fn hit_test<'a>(
    mesh: &'a Mesh,
    viewport: Viewport,
    px: f64,
    py: f64,
    radius: f64,
) -> Option<&'a str> {
    let mut best: Option<(&str, f64)> = None;
    for point in mesh.points() {
        let (x, y) = point.to_pixels(viewport.width, viewport.height);
        let dist = ((x - px).powi(2) + (y - py).powi(2)).sqrt();
        if best.map_or(true, |(_, d)| dist < d) {
            best = Some((point.id.as_str(), dist));
        }
    }
    best.filter(|&(_, d)| d < radius).map(|(id, _)| id)
}

/// A grid segment in viewport pixels
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Segment {
    pub from: (f64, f64),
    pub to: (f64, f64),
}

/// Feedback grid lines for drawing over the editing surface
pub fn grid_segments(mesh: &Mesh, viewport: Viewport) -> WarpResult<Vec<Segment>> {
    Ok(mesh
        .grid_lines()?
        .into_iter()
        .map(|line| Segment {
            from: line.from.to_pixels(viewport.width, viewport.height),
            to: line.to.to_pixels(viewport.width, viewport.height),
        })
        .collect())
}

#[derive(Debug, Clone, PartialEq)]
pub enum DragState {
    Idle,
    Dragging { id: String },
}

#[derive(Debug)]
pub struct MeshEditor {
    state: DragState,
    hit_radius: f64,
    /// Mesh including the in-progress drag
    live: Option<Mesh>,
}

impl MeshEditor {
    pub fn new(hit_radius: f64) -> Self {
        Self {
            state: DragState::Idle,
            hit_radius,
            live: None,
        }
    }

    pub fn state(&self) -> &DragState {
        &self.state
    }

    pub fn is_dragging(&self) -> bool {
        matches!(self.state, DragState::Dragging { .. })
    }

    /// The mesh with the current drag applied, if a drag is active
    pub fn live_mesh(&self) -> Option<&Mesh> {
        self.live.as_ref()
    }

    /// Pointer down. Starts a drag when a point is hit; ignored while a drag
    /// is already active.
    pub fn press(&mut self, mesh: &Mesh, viewport: Viewport, px: f64, py: f64) -> Option<&str> {
        if self.is_dragging() {
            debug!("Editor: ignoring press while a drag is active");
            return None;
        }

        let id = hit_test(mesh, viewport, px, py, self.hit_radius)?.to_string();
        debug!("Editor: drag started on {}", id);
        self.live = Some(mesh.clone());
        self.state = DragState::Dragging { id };
        match &self.state {
            DragState::Dragging { id } => Some(id.as_str()),
            DragState::Idle => None,
        }
    }

    /// Pointer move. Returns the updated live mesh, or `None` when idle.
    pub fn drag_to(&mut self, viewport: Viewport, px: f64, py: f64) -> WarpResult<Option<&Mesh>> {
        let DragState::Dragging { id } = &self.state else {
            return Ok(None);
        };
        let Some(live) = self.live.as_ref() else {
            return Ok(None);
        };

        let (x, y) = normalize_pixels(px, py, viewport.width, viewport.height);
        let updated = live.with_point(id, x, y)?;
        self.live = Some(updated);
        Ok(self.live.as_ref())
    }

    /// Pointer up. Returns the final mesh to commit to history.
    pub fn release(&mut self) -> Option<Mesh> {
        if let DragState::Dragging { id } = &self.state {
            debug!("Editor: drag ended on {}", id);
        }
        self.state = DragState::Idle;
        self.live.take()
    }

    /// Pointer cancelled (touch termination). Commits like a release.
    pub fn cancel(&mut self) -> Option<Mesh> {
        self.release()
    }
}

impl Default for MeshEditor {
    fn default() -> Self {
        Self::new(DEFAULT_HIT_RADIUS)
    }
}
