//! Piecewise mesh warp of video frames
//!
//! The source frame is split into `(rows-1) x (cols-1)` equal cells. Each
//! cell's destination is the quad spanned by four mesh points, and each cell
//! is further split into `K x K` sub-cells whose destination corners come
//! from bilinear interpolation of the cell corners. Every sub-cell becomes a
//! [`DrawOp`], and the ops are rasterized in order into a cleared frame.
//!
//! Two rasterizers share the op list:
//! - [`WarpMode::Blit`] resamples the source sub-rect into the axis-aligned
//!   bounding box of the destination sub-quad. Cheap, and exact for an
//!   undeformed mesh.
//! - [`WarpMode::InverseBilinear`] solves the inverse bilinear map per
//!   output pixel, so each sub-quad is filled exactly. A bilinear patch
//!   restricted to a `(u, v)` sub-rectangle is again the bilinear patch of
//!   its corners, so the result does not depend on `K`.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::frame::{Frame, CHANNELS};
use crate::mesh::Mesh;

/// Sub-cells per cell edge used when nothing is configured
pub const DEFAULT_SUBDIVISIONS: u32 = 8;
const MAX_SUBDIVISIONS: u32 = 64;

/// Tolerance on `(u, v)` when deciding whether a pixel lies inside a quad
const UV_EPSILON: f64 = 1e-9;

/// Rasterization strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WarpMode {
    /// Bounding-box resample per sub-cell
    #[default]
    Blit,
    /// Per-pixel inverse bilinear mapping
    InverseBilinear,
}

/// Warp settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WarpSettings {
    /// Sub-cells per cell edge (K)
    #[serde(default = "default_subdivisions")]
    pub subdivisions: u32,
    #[serde(default)]
    pub mode: WarpMode,
}

fn default_subdivisions() -> u32 {
    DEFAULT_SUBDIVISIONS
}

impl Default for WarpSettings {
    fn default() -> Self {
        Self {
            subdivisions: DEFAULT_SUBDIVISIONS,
            mode: WarpMode::default(),
        }
    }
}

/// Axis-aligned rectangle in pixels, `[x0, x1) x [y0, y1)`
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Rect {
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
}

impl Rect {
    pub fn width(&self) -> f64 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> f64 {
        self.y1 - self.y0
    }

    /// Point at parametric `(u, v)` inside the rectangle
    fn at(&self, u: f64, v: f64) -> (f64, f64) {
        (lerp(self.x0, self.x1, u), lerp(self.y0, self.y1, v))
    }

    /// Integer pixel span whose centres fall inside `[lo, hi)`, clamped to `len`
    fn pixel_span(lo: f64, hi: f64, len: usize) -> (usize, usize) {
        let start = (lo - 0.5).ceil().max(0.0) as usize;
        let end = ((hi - 0.5).ceil().max(0.0) as usize).min(len);
        (start.min(end), end)
    }
}

/// Destination quad, corners ordered top-left, top-right, bottom-right,
/// bottom-left
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Quad(pub [(f64, f64); 4]);

impl Quad {
    pub fn from_rect(rect: &Rect) -> Self {
        Self([
            (rect.x0, rect.y0),
            (rect.x1, rect.y0),
            (rect.x1, rect.y1),
            (rect.x0, rect.y1),
        ])
    }

    /// Bilinear interpolation of the corners.
    ///
    /// Written as weighted sums so `(1, 1)` lands exactly on the
    /// bottom-right corner and neighbouring cells share edges bit for bit.
    pub fn at(&self, u: f64, v: f64) -> (f64, f64) {
        let [tl, tr, br, bl] = self.0;
        let top = (lerp(tl.0, tr.0, u), lerp(tl.1, tr.1, u));
        let bottom = (lerp(bl.0, br.0, u), lerp(bl.1, br.1, u));
        (lerp(top.0, bottom.0, v), lerp(top.1, bottom.1, v))
    }

    pub fn bounds(&self) -> Rect {
        let xs = self.0.map(|p| p.0);
        let ys = self.0.map(|p| p.1);
        Rect {
            x0: xs.iter().copied().fold(f64::INFINITY, f64::min),
            y0: ys.iter().copied().fold(f64::INFINITY, f64::min),
            x1: xs.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            y1: ys.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        }
    }

    /// Solve `at(u, v) == p` for `(u, v)` in the unit square.
    ///
    /// Returns `None` when `p` is outside the quad or the quad is degenerate.
    pub fn inverse(&self, p: (f64, f64)) -> Option<(f64, f64)> {
        let [a, b, c, d] = self.0;
        let e = sub(b, a);
        let f = sub(d, a);
        let g = (a.0 - b.0 + c.0 - d.0, a.1 - b.1 + c.1 - d.1);
        let h = sub(p, a);

        let k2 = cross(g, f);
        let k1 = cross(e, f) + cross(h, g);
        let k0 = cross(h, e);

        let solve_u = |v: f64| {
            let den_x = e.0 + g.0 * v;
            let den_y = e.1 + g.1 * v;
            if den_x.abs() >= den_y.abs() {
                if den_x == 0.0 {
                    return None;
                }
                Some((h.0 - f.0 * v) / den_x)
            } else {
                Some((h.1 - f.1 * v) / den_y)
            }
        };
        let inside = |t: f64| (-UV_EPSILON..=1.0 + UV_EPSILON).contains(&t);

        if k2.abs() <= 1e-9 * k1.abs().max(1.0) {
            // Parallel opposite edges: linear in v
            if k1 == 0.0 {
                return None;
            }
            let v = -k0 / k1;
            let u = solve_u(v)?;
            return (inside(u) && inside(v)).then_some((u, v));
        }

        let disc = k1 * k1 - 4.0 * k0 * k2;
        if disc < 0.0 {
            return None;
        }
        let w = disc.sqrt();
        let ik2 = 0.5 / k2;
        [(-k1 - w) * ik2, (-k1 + w) * ik2]
            .into_iter()
            .filter(|&v| inside(v))
            .find_map(|v| solve_u(v).filter(|&u| inside(u)).map(|u| (u, v)))
    }
}

/// One mesh cell: a source rectangle and its destination quad
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CellPlan {
    pub row: usize,
    pub col: usize,
    pub src: Rect,
    pub dst: Quad,
    /// The mesh had a hole at one of the corners; `dst` is the identity quad
    pub fallback: bool,
}

/// One sub-cell draw command
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DrawOp {
    pub src: Rect,
    pub dst: Quad,
    pub bounds: Rect,
}

/// Cells and draw commands for one mesh at one pair of frame sizes
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WarpPlan {
    pub rows: usize,
    pub cols: usize,
    pub cells: Vec<CellPlan>,
    pub ops: Vec<DrawOp>,
}

impl WarpPlan {
    /// Plan the warp of a `src_size` frame into an `out_size` output
    pub fn build(mesh: &Mesh, src_size: (u32, u32), out_size: (u32, u32), subdivisions: u32) -> Self {
        let (src_w, src_h) = (src_size.0 as f64, src_size.1 as f64);
        let (out_w, out_h) = (out_size.0 as f64, out_size.1 as f64);

        let index = match mesh.index() {
            Ok(index) if index.rows >= 2 && index.cols >= 2 => Some(index),
            Ok(index) => {
                debug!("Warp: {}x{} mesh is degenerate, drawing unwarped", index.rows, index.cols);
                None
            }
            Err(e) => {
                debug!("Warp: {}, drawing unwarped", e);
                None
            }
        };
        let (rows, cols) = index.as_ref().map_or((2, 2), |i| (i.rows, i.cols));
        let (cell_rows, cell_cols) = (rows - 1, cols - 1);

        let mut cells = Vec::with_capacity(cell_rows * cell_cols);
        for r in 0..cell_rows {
            for c in 0..cell_cols {
                let src = Rect {
                    x0: c as f64 * src_w / cell_cols as f64,
                    y0: r as f64 * src_h / cell_rows as f64,
                    x1: (c + 1) as f64 * src_w / cell_cols as f64,
                    y1: (r + 1) as f64 * src_h / cell_rows as f64,
                };

                let corners = index.as_ref().and_then(|index| {
                    let corner = |r: usize, c: usize| {
                        index.get(r, c).map(|p| p.to_pixels(out_size.0, out_size.1))
                    };
                    Some([
                        corner(r, c)?,
                        corner(r, c + 1)?,
                        corner(r + 1, c + 1)?,
                        corner(r + 1, c)?,
                    ])
                });

                let (dst, fallback) = match corners {
                    Some(corners) => (Quad(corners), false),
                    None => {
                        if index.is_some() {
                            debug!("Warp: cell {}-{} has a missing corner, drawing unwarped", r, c);
                        }
                        let identity = Rect {
                            x0: c as f64 / cell_cols as f64 * out_w,
                            y0: r as f64 / cell_rows as f64 * out_h,
                            x1: (c + 1) as f64 / cell_cols as f64 * out_w,
                            y1: (r + 1) as f64 / cell_rows as f64 * out_h,
                        };
                        (Quad::from_rect(&identity), index.is_some())
                    }
                };

                cells.push(CellPlan {
                    row: r,
                    col: c,
                    src,
                    dst,
                    fallback,
                });
            }
        }

        let k = subdivisions.clamp(1, MAX_SUBDIVISIONS) as usize;
        let mut ops = Vec::with_capacity(cells.len() * k * k);
        let mut lattice = Vec::with_capacity((k + 1) * (k + 1));
        for cell in &cells {
            // Shared lattice so adjacent sub-cells agree on their edges
            lattice.clear();
            for j in 0..=k {
                for i in 0..=k {
                    let (u, v) = (i as f64 / k as f64, j as f64 / k as f64);
                    lattice.push((cell.dst.at(u, v), cell.src.at(u, v)));
                }
            }
            let node = |i: usize, j: usize| lattice[j * (k + 1) + i];

            for j in 0..k {
                for i in 0..k {
                    let (tl, src_tl) = node(i, j);
                    let (tr, _) = node(i + 1, j);
                    let (br, src_br) = node(i + 1, j + 1);
                    let (bl, _) = node(i, j + 1);
                    let dst = Quad([tl, tr, br, bl]);
                    ops.push(DrawOp {
                        src: Rect {
                            x0: src_tl.0,
                            y0: src_tl.1,
                            x1: src_br.0,
                            y1: src_br.1,
                        },
                        bounds: dst.bounds(),
                        dst,
                    });
                }
            }
        }

        Self {
            rows,
            cols,
            cells,
            ops,
        }
    }
}

/// Per-tick warp renderer owning its output frame
pub struct WarpRenderer {
    settings: WarpSettings,
    output: Frame,
    /// Plan for the last mesh and source size seen
    cache: Option<(Mesh, (u32, u32), WarpPlan)>,
}

/// What happened on one render call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderStatus {
    /// Frame warped with this many draw ops
    Drawn { ops: usize },
    /// No source frame; output left cleared
    Blank,
}

impl WarpRenderer {
    pub fn new(width: u32, height: u32, settings: WarpSettings) -> Self {
        Self {
            settings,
            output: Frame::new_black(width, height),
            cache: None,
        }
    }

    pub fn output(&self) -> &Frame {
        &self.output
    }

    pub fn settings(&self) -> WarpSettings {
        self.settings
    }

    /// The plan for `mesh` and a source of `src_size`, rebuilt only when
    /// either changed since the last call
    pub fn plan(&mut self, mesh: &Mesh, src_size: (u32, u32)) -> &WarpPlan {
        let fresh = matches!(&self.cache, Some((m, s, _)) if m == mesh && *s == src_size);
        if !fresh {
            self.cache = None;
        }
        let out_size = (self.output.width, self.output.height);
        let subdivisions = self.settings.subdivisions;
        let (_, _, plan) = self.cache.get_or_insert_with(|| {
            (
                mesh.clone(),
                src_size,
                WarpPlan::build(mesh, src_size, out_size, subdivisions),
            )
        });
        plan
    }

    /// Warp `source` through `mesh` into the output frame. With no source the
    /// output is just cleared.
    pub fn render(&mut self, mesh: &Mesh, source: Option<&Frame>) -> RenderStatus {
        self.output.clear();

        let Some(source) = source else {
            return RenderStatus::Blank;
        };
        if source.width == 0 || source.height == 0 || self.output.data.is_empty() {
            return RenderStatus::Blank;
        }

        let mode = self.settings.mode;
        self.plan(mesh, (source.width, source.height));

        let Some((_, _, plan)) = &self.cache else {
            return RenderStatus::Blank;
        };
        let ops = &plan.ops;
        let width = self.output.width as usize;
        let stride = self.output.stride();

        self.output
            .data
            .par_chunks_mut(stride)
            .enumerate()
            .for_each(|(y, row)| {
                let cy = y as f64 + 0.5;
                for op in ops {
                    if cy < op.bounds.y0 || cy >= op.bounds.y1 {
                        continue;
                    }
                    let (x_start, x_end) = Rect::pixel_span(op.bounds.x0, op.bounds.x1, width);
                    match mode {
                        WarpMode::Blit => blit_span(op, source, row, cy, x_start, x_end),
                        WarpMode::InverseBilinear => {
                            inverse_span(op, source, row, cy, x_start, x_end)
                        }
                    }
                }
            });

        RenderStatus::Drawn { ops: ops.len() }
    }
}

/// Resample the op's source rect into its destination bounding box
fn blit_span(op: &DrawOp, source: &Frame, row: &mut [u8], cy: f64, x_start: usize, x_end: usize) {
    let b = &op.bounds;
    let (bw, bh) = (b.width(), b.height());
    if bw <= 0.0 || bh <= 0.0 {
        return;
    }
    let sy = op.src.y0 + (cy - b.y0) / bh * op.src.height() - 0.5;
    let scale_x = op.src.width() / bw;

    for x in x_start..x_end {
        let sx = op.src.x0 + (x as f64 + 0.5 - b.x0) * scale_x - 0.5;
        write_pixel(row, x, bilinear_sample(source, sx, sy));
    }
}

/// Fill the pixels of the op's quad by inverse bilinear mapping
fn inverse_span(op: &DrawOp, source: &Frame, row: &mut [u8], cy: f64, x_start: usize, x_end: usize) {
    for x in x_start..x_end {
        let Some((u, v)) = op.dst.inverse((x as f64 + 0.5, cy)) else {
            continue;
        };
        let (sx, sy) = op.src.at(u.clamp(0.0, 1.0), v.clamp(0.0, 1.0));
        write_pixel(row, x, bilinear_sample(source, sx - 0.5, sy - 0.5));
    }
}

#[inline]
fn write_pixel(row: &mut [u8], x: usize, pixel: [u8; 3]) {
    let offset = x * CHANNELS;
    if let Some(dst) = row.get_mut(offset..offset + CHANNELS) {
        dst.copy_from_slice(&pixel);
    }
}

/// Bilinear interpolation sampling at pixel coordinates (pixel centres on
/// integers), clamped to the frame edges
#[inline]
fn bilinear_sample(src: &Frame, x: f64, y: f64) -> [u8; 3] {
    let width = src.width as usize;
    let height = src.height as usize;
    let stride = src.stride();

    let x = x.max(0.0).min((width - 1) as f64);
    let y = y.max(0.0).min((height - 1) as f64);

    let x0 = x.floor() as usize;
    let y0 = y.floor() as usize;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);

    let fx = x - x0 as f64;
    let fy = y - y0 as f64;

    let mut result = [0u8; 3];

    for (c, out) in result.iter_mut().enumerate() {
        let p00 = src.data.get(y0 * stride + x0 * CHANNELS + c).copied().unwrap_or(0) as f64;
        let p10 = src.data.get(y0 * stride + x1 * CHANNELS + c).copied().unwrap_or(0) as f64;
        let p01 = src.data.get(y1 * stride + x0 * CHANNELS + c).copied().unwrap_or(0) as f64;
        let p11 = src.data.get(y1 * stride + x1 * CHANNELS + c).copied().unwrap_or(0) as f64;

        let value = p00 * (1.0 - fx) * (1.0 - fy)
            + p10 * fx * (1.0 - fy)
            + p01 * (1.0 - fx) * fy
            + p11 * fx * fy;

        *out = value.round().clamp(0.0, 255.0) as u8;
    }

    result
}

#[inline]
fn lerp(a: f64, b: f64, t: f64) -> f64 {
    a * (1.0 - t) + b * t
}

#[inline]
fn sub(a: (f64, f64), b: (f64, f64)) -> (f64, f64) {
    (a.0 - b.0, a.1 - b.1)
}

#[inline]
fn cross(a: (f64, f64), b: (f64, f64)) -> f64 {
    a.0 * b.1 - a.1 * b.0
}
