//! Control-point mesh for the projection warp
//!
//! A mesh is a flat list of points whose ids encode their grid position as
//! `"row-col"`. Rows and columns are never stored; they are derived from the
//! largest indices present and validated strictly.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

use crate::error::{WarpError, WarpResult};

/// A draggable control point with normalized coordinates (0.0 to 1.0)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MeshPoint {
    pub id: String,
    pub x: f64,
    pub y: f64,
}

impl MeshPoint {
    pub fn new(row: usize, col: usize, x: f64, y: f64) -> Self {
        Self {
            id: point_id(row, col),
            x,
            y,
        }
    }

    /// Convert to pixel coordinates
    pub fn to_pixels(&self, width: u32, height: u32) -> (f64, f64) {
        (self.x * width as f64, self.y * height as f64)
    }

    /// Grid position encoded in the id, if it is well formed
    pub fn grid_pos(&self) -> Option<(usize, usize)> {
        parse_id(&self.id)
    }
}

/// Normalize a pixel position, clamping it to the viewport first
pub fn normalize_pixels(px: f64, py: f64, width: u32, height: u32) -> (f64, f64) {
    let w = width.max(1) as f64;
    let h = height.max(1) as f64;
    (clamp_unit(px.clamp(0.0, w) / w), clamp_unit(py.clamp(0.0, h) / h))
}

/// Build the `"row-col"` id for a grid position
pub fn point_id(row: usize, col: usize) -> String {
    format!("{}-{}", row, col)
}

/// Parse a `"row-col"` id. Both halves must be plain decimal digits.
pub fn parse_id(id: &str) -> Option<(usize, usize)> {
    let (row, col) = id.split_once('-')?;
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if !digits(row) || !digits(col) {
        return None;
    }
    Some((row.parse().ok()?, col.parse().ok()?))
}

fn clamp_unit(v: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

/// The full set of control points defining the warp grid
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(transparent)]
pub struct Mesh {
    points: Vec<MeshPoint>,
}

impl Mesh {
    /// Wrap an arbitrary point list. Nothing is validated here; callers that
    /// accept foreign data should run [`Mesh::validate`].
    pub fn from_points(points: Vec<MeshPoint>) -> Self {
        Self { points }
    }

    /// Evenly spaced identity grid with `rows x cols` points
    pub fn generate(rows: usize, cols: usize) -> WarpResult<Self> {
        if rows < 2 || cols < 2 {
            return Err(WarpError::InvalidDimension { rows, cols });
        }

        let mut points = Vec::with_capacity(rows * cols);
        for r in 0..rows {
            for c in 0..cols {
                points.push(MeshPoint::new(
                    r,
                    c,
                    c as f64 / (cols - 1) as f64,
                    r as f64 / (rows - 1) as f64,
                ));
            }
        }
        Ok(Self { points })
    }

    pub fn points(&self) -> &[MeshPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&MeshPoint> {
        self.points.iter().find(|p| p.id == id)
    }

    pub fn point_at(&self, row: usize, col: usize) -> WarpResult<&MeshPoint> {
        let id = point_id(row, col);
        self.get(&id).ok_or(WarpError::NotFound(id))
    }

    /// Derive `(rows, cols)` from the point ids.
    ///
    /// Fails on unparsable or duplicate ids, on an empty mesh, and when some
    /// row or column index below the maximum is never used.
    pub fn grid_shape(&self) -> WarpResult<(usize, usize)> {
        if self.points.is_empty() {
            return Err(WarpError::malformed("mesh has no points"));
        }

        let mut ids = HashSet::with_capacity(self.points.len());
        let mut rows = BTreeSet::new();
        let mut cols = BTreeSet::new();

        for point in &self.points {
            let (r, c) = point
                .grid_pos()
                .ok_or_else(|| WarpError::malformed(format!("invalid point id {:?}", point.id)))?;
            if !ids.insert((r, c)) {
                return Err(WarpError::malformed(format!("duplicate point id {:?}", point.id)));
            }
            rows.insert(r);
            cols.insert(c);
        }

        // BTreeSet is sorted, so the last element is the maximum
        let row_count = rows.last().map_or(0, |r| r + 1);
        let col_count = cols.last().map_or(0, |c| c + 1);

        if rows.len() != row_count {
            return Err(WarpError::malformed(format!(
                "rows are non-contiguous ({} of {} used)",
                rows.len(),
                row_count
            )));
        }
        if cols.len() != col_count {
            return Err(WarpError::malformed(format!(
                "columns are non-contiguous ({} of {} used)",
                cols.len(),
                col_count
            )));
        }

        Ok((row_count, col_count))
    }

    /// Check that the mesh is a complete grid of at least 2x2 with
    /// coordinates inside the unit square.
    pub fn validate(&self) -> WarpResult<(usize, usize)> {
        let (rows, cols) = self.grid_shape()?;
        if rows < 2 || cols < 2 {
            return Err(WarpError::malformed(format!(
                "grid {}x{} is smaller than 2x2",
                rows, cols
            )));
        }
        if self.points.len() != rows * cols {
            return Err(WarpError::malformed(format!(
                "grid {}x{} has {} points, expected {}",
                rows,
                cols,
                self.points.len(),
                rows * cols
            )));
        }
        if let Some(p) = self
            .points
            .iter()
            .find(|p| !(0.0..=1.0).contains(&p.x) || !(0.0..=1.0).contains(&p.y))
        {
            return Err(WarpError::malformed(format!(
                "point {} lies outside the unit square",
                p.id
            )));
        }
        Ok((rows, cols))
    }

    /// Replace one point's position, returning a new mesh
    pub fn with_point(&self, id: &str, x: f64, y: f64) -> WarpResult<Self> {
        let index = self
            .points
            .iter()
            .position(|p| p.id == id)
            .ok_or_else(|| WarpError::not_found(id))?;

        let mut mesh = self.clone();
        mesh.points[index].x = clamp_unit(x);
        mesh.points[index].y = clamp_unit(y);
        Ok(mesh)
    }

    /// Dense row-major lookup table for per-frame cell access
    pub fn index(&self) -> WarpResult<GridIndex<'_>> {
        let (rows, cols) = self.grid_shape()?;
        let mut slots = vec![None; rows * cols];
        for point in &self.points {
            // grid_shape already proved every id parses
            if let Some((r, c)) = point.grid_pos() {
                slots[r * cols + c] = Some(point);
            }
        }
        Ok(GridIndex { rows, cols, slots })
    }

    /// Segments joining each point to its right and lower neighbour
    pub fn grid_lines(&self) -> WarpResult<Vec<GridLine<'_>>> {
        let index = self.index()?;
        let mut lines = Vec::with_capacity(2 * self.points.len());
        for r in 0..index.rows {
            for c in 0..index.cols {
                let Some(from) = index.get(r, c) else {
                    continue;
                };
                if let Some(to) = index.get(r, c + 1) {
                    lines.push(GridLine { from, to });
                }
                if let Some(to) = index.get(r + 1, c) {
                    lines.push(GridLine { from, to });
                }
            }
        }
        Ok(lines)
    }
}

/// Row-major view of a mesh; holes are `None`
#[derive(Debug)]
pub struct GridIndex<'a> {
    pub rows: usize,
    pub cols: usize,
    slots: Vec<Option<&'a MeshPoint>>,
}

impl<'a> GridIndex<'a> {
    pub fn get(&self, row: usize, col: usize) -> Option<&'a MeshPoint> {
        if row >= self.rows || col >= self.cols {
            return None;
        }
        self.slots[row * self.cols + col]
    }
}

/// One segment of the feedback grid
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridLine<'a> {
    pub from: &'a MeshPoint,
    pub to: &'a MeshPoint,
}
