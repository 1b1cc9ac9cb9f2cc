use std::fmt;

use serde::Serialize;

use crate::drivers::transform::convert_value;
use crate::types::DisplayMode;

pub const VERTICAL_DEFAULTS_PS: [f64; 2] = [1000.0, 2000.0];
pub const HORIZONTAL_DEFAULTS: [f64; 2] = [0.71, 0.6];

/// Where a cursor lands when its position falls outside the data range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClampPolicy {
    ToMin,
    ToMax,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CursorAxis {
    /// Time-axis cursor, positioned in picoseconds.
    Vertical,
    /// Value-axis cursor, positioned in displayed coordinates.
    Horizontal,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Cursor {
    pub position: f64,
    pub visible: bool,
    pub policy: ClampPolicy,
}

impl Cursor {
    fn new(position: f64, policy: ClampPolicy) -> Self {
        Self {
            position,
            visible: false,
            policy,
        }
    }

    /// Pulls the cursor into `[lo, hi]`. A NaN position counts as outside.
    fn clamp_into(&mut self, lo: f64, hi: f64) {
        let pos = self.position;
        if pos.is_nan() || pos < lo || pos > hi {
            self.position = match self.policy {
                ClampPolicy::ToMin => lo,
                ClampPolicy::ToMax => hi,
            };
        }
    }
}

/// Linear interpolation of `y` at `xq` over ascending `x`.
///
/// Queries at or beyond either end return the end value. Returns `None` when
/// there is no data or the query is NaN.
pub fn interpolate(x: &[f64], y: &[f64], xq: f64) -> Option<f64> {
    let n = x.len().min(y.len());
    if n == 0 || xq.is_nan() {
        return None;
    }
    let idx = x[..n].partition_point(|&v| v < xq);
    if idx == 0 {
        return Some(y[0]);
    }
    if idx >= n {
        return Some(y[n - 1]);
    }
    if x[idx] == xq {
        return Some(y[idx]);
    }
    let (x0, x1) = (x[idx - 1], x[idx]);
    let (y0, y1) = (y[idx - 1], y[idx]);
    if x1 == x0 {
        return Some(y0);
    }
    let t = (xq - x0) / (x1 - x0);
    Some(y0 + t * (y1 - y0))
}

/// Finite extent of `values`, skipping NaN and infinities.
pub fn finite_range(values: &[f64]) -> Option<(f64, f64)> {
    values
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(None, |acc, v| match acc {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct VerticalReadout {
    pub x_ps: f64,
    /// Physical value at `x_ps`; `None` when nothing is displayed.
    pub value: Option<f64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CursorReadouts {
    pub vertical: [Option<VerticalReadout>; 2],
    pub vertical_delta_ps: Option<f64>,
    pub horizontal: [Option<f64>; 2],
    pub horizontal_delta: Option<f64>,
}

impl fmt::Display for CursorReadouts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, readout) in self.vertical.iter().enumerate() {
            match readout {
                Some(VerticalReadout { x_ps, value: Some(v) }) => {
                    write!(f, "V{}: {x_ps:.1}ps, {v:.2}  ", idx + 1)?
                }
                Some(VerticalReadout { x_ps, value: None }) => {
                    write!(f, "V{}: {x_ps:.1}ps, --  ", idx + 1)?
                }
                None => write!(f, "V{}: --ps, --  ", idx + 1)?,
            }
        }
        match self.vertical_delta_ps {
            Some(delta) => write!(f, "dV: {delta:.2}ps  ")?,
            None => write!(f, "dV: --ps  ")?,
        }
        for (idx, value) in self.horizontal.iter().enumerate() {
            match value {
                Some(v) => write!(f, "H{}: {v:.2}  ", idx + 1)?,
                None => write!(f, "H{}: --  ", idx + 1)?,
            }
        }
        match self.horizontal_delta {
            Some(delta) => write!(f, "dH: {delta:.2}"),
            None => write!(f, "dH: --"),
        }
    }
}

/// Two time-axis and two value-axis cursors. Cursor 1 of each pair clamps to
/// the minimum, cursor 2 to the maximum.
#[derive(Clone, Debug, PartialEq)]
pub struct CursorSet {
    pub vertical: [Cursor; 2],
    pub horizontal: [Cursor; 2],
    /// Coordinate space the horizontal positions are expressed in.
    horizontal_mode: DisplayMode,
}

impl Default for CursorSet {
    fn default() -> Self {
        Self {
            vertical: [
                Cursor::new(VERTICAL_DEFAULTS_PS[0], ClampPolicy::ToMin),
                Cursor::new(VERTICAL_DEFAULTS_PS[1], ClampPolicy::ToMax),
            ],
            horizontal: [
                Cursor::new(HORIZONTAL_DEFAULTS[0], ClampPolicy::ToMin),
                Cursor::new(HORIZONTAL_DEFAULTS[1], ClampPolicy::ToMax),
            ],
            horizontal_mode: DisplayMode::Normalized,
        }
    }
}

impl CursorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cursor(&self, axis: CursorAxis, index: usize) -> Option<&Cursor> {
        match axis {
            CursorAxis::Vertical => self.vertical.get(index),
            CursorAxis::Horizontal => self.horizontal.get(index),
        }
    }

    pub fn cursor_mut(&mut self, axis: CursorAxis, index: usize) -> Option<&mut Cursor> {
        match axis {
            CursorAxis::Vertical => self.vertical.get_mut(index),
            CursorAxis::Horizontal => self.horizontal.get_mut(index),
        }
    }

    pub fn any_visible(&self) -> bool {
        self.vertical.iter().chain(&self.horizontal).any(|c| c.visible)
    }

    /// Re-clamps visible time-axis cursors after new data arrived.
    pub fn clamp_vertical(&mut self, x: &[f64]) {
        let (Some(&lo), Some(&hi)) = (x.first(), x.last()) else {
            return;
        };
        for cursor in self.vertical.iter_mut().filter(|c| c.visible) {
            cursor.clamp_into(lo, hi);
        }
    }

    /// Shows or hides one cursor. A cursor being shown is clamped into the
    /// currently displayed range. Returns the new visibility.
    pub fn set_visible(
        &mut self,
        axis: CursorAxis,
        index: usize,
        visible: bool,
        x: &[f64],
        y: &[f64],
    ) -> bool {
        let Some(cursor) = self.cursor_mut(axis, index) else {
            return false;
        };
        cursor.visible = visible;
        if visible {
            let range = match axis {
                CursorAxis::Vertical => x.first().copied().zip(x.last().copied()),
                CursorAxis::Horizontal => finite_range(y),
            };
            if let Some((lo, hi)) = range {
                cursor.clamp_into(lo, hi);
            }
        }
        visible
    }

    pub fn toggle(&mut self, axis: CursorAxis, index: usize, x: &[f64], y: &[f64]) -> bool {
        let visible = self.cursor(axis, index).map(|c| !c.visible).unwrap_or(false);
        self.set_visible(axis, index, visible, x, y)
    }

    /// Re-expresses the value-axis cursors in `to` so they keep tracking the
    /// same physical level. Returns whether anything was converted.
    pub fn rescale_horizontal(
        &mut self,
        to: DisplayMode,
        ref_50ohm: f64,
        ref_unit_amp: f64,
    ) -> bool {
        let from = self.horizontal_mode;
        if from == to {
            return false;
        }
        for cursor in &mut self.horizontal {
            cursor.position = convert_value(cursor.position, from, to, ref_50ohm, ref_unit_amp);
        }
        self.horizontal_mode = to;
        true
    }

    /// Places every visible cursor on the point `(x_ps, value)`.
    pub fn move_visible_to(&mut self, x_ps: f64, value: f64) {
        for cursor in self.vertical.iter_mut().filter(|c| c.visible) {
            cursor.position = x_ps;
        }
        for cursor in self.horizontal.iter_mut().filter(|c| c.visible) {
            cursor.position = value;
        }
    }

    pub fn readouts(&self, x: &[f64], y: &[f64], mode: DisplayMode) -> CursorReadouts {
        let physical = |v: f64| if mode.is_log() { 10f64.powf(v) } else { v };
        let vertical = self.vertical.map(|cursor| {
            cursor.visible.then(|| VerticalReadout {
                x_ps: cursor.position,
                value: interpolate(x, y, cursor.position).map(physical),
            })
        });
        let horizontal = self
            .horizontal
            .map(|cursor| cursor.visible.then(|| physical(cursor.position)));
        let vertical_delta_ps = match (&self.vertical[0], &self.vertical[1]) {
            (a, b) if a.visible && b.visible => Some((b.position - a.position).abs()),
            _ => None,
        };
        let horizontal_delta = match horizontal {
            [Some(h1), Some(h2)] => Some((h1 - h2).abs()),
            _ => None,
        };
        CursorReadouts {
            vertical,
            vertical_delta_ps,
            horizontal,
            horizontal_delta,
        }
    }
}
