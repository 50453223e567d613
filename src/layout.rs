//! Square-cell grid layout for the units of one layer.
//!
//! The viewport is tiled by `columns x rows` square cells of side `d`
//! (the pitch). `d` comes from the continuous relaxation
//! `N d^2 + W d = W H`, which leaves roughly one row of vertical slack:
//!
//! ```text
//! d       = floor((sqrt(W^2 + 4 N W H) - W) / (2 N))
//! columns = floor(W / d)
//! rows    = ceil(N / columns)
//! ```
//!
//! Rows may overflow the viewport height; the host scrolls vertically. The
//! drawn unit is `d - border`, but never smaller than `unit_size * f`.

use crate::error::{Result, VisError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub fn new(width: u32, height: u32) -> Self {
        Viewport { width, height }
    }
}

/// Result of a layout pass. All zero for an empty unit set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GridLayout {
    pub columns: u32,
    pub rows: u32,
    /// Edge length a unit image is scaled to.
    pub cell_size: u32,
    /// Edge length of a cell including its border.
    pub pitch: u32,
}

impl GridLayout {
    pub fn is_empty(&self) -> bool {
        self.columns == 0
    }

    /// Capacity of the grid, at least the unit count it was computed for.
    pub fn slots(&self) -> u32 {
        self.columns * self.rows
    }

    /// Row and column of the unit at `index`.
    pub fn position_of(&self, index: usize) -> Option<(u32, u32)> {
        if self.is_empty() || index >= self.slots() as usize {
            return None;
        }
        let columns = self.columns as usize;
        Some(((index / columns) as u32, (index % columns) as u32))
    }

    pub fn index_at(&self, row: u32, column: u32) -> Option<usize> {
        if column >= self.columns || row >= self.rows {
            return None;
        }
        Some((row * self.columns + column) as usize)
    }

    /// Size of the canvas the grid occupies, which can exceed the viewport.
    pub fn extent(&self) -> (u32, u32) {
        let pitch = self.pitch.max(self.cell_size);
        (self.columns * pitch, self.rows * pitch)
    }
}

fn validate(unit_size: u32, viewport: Viewport, min_scale_factor: f64) -> Result<()> {
    if viewport.width == 0 || viewport.height == 0 {
        return Err(VisError::InvalidLayoutInput(format!(
            "viewport {}x{} must be non-empty",
            viewport.width, viewport.height
        )));
    }
    if unit_size == 0 {
        return Err(VisError::InvalidLayoutInput(
            "unit size must be positive".to_string(),
        ));
    }
    if !(min_scale_factor > 0.0 && min_scale_factor <= 1.0) {
        return Err(VisError::InvalidLayoutInput(format!(
            "minimum scale factor {} outside (0, 1]",
            min_scale_factor
        )));
    }
    Ok(())
}

/// Smallest edge a unit is ever drawn at.
pub fn min_cell_size(unit_size: u32, min_scale_factor: f64) -> u32 {
    (unit_size as f64 * min_scale_factor).ceil() as u32
}

/// Closed-form layout of `unit_count` square units of `unit_size` pixels.
///
/// The pitch is kept within `[1, W]`: the raw formula reaches 0 for tiny
/// viewports and exceeds `W` for very tall ones, and either would leave the
/// grid without a column.
pub fn compute_layout(
    unit_size: u32,
    viewport: Viewport,
    unit_count: usize,
    min_scale_factor: f64,
    border_width: u32,
) -> Result<GridLayout> {
    validate(unit_size, viewport, min_scale_factor)?;
    if unit_count == 0 {
        return Ok(GridLayout::default());
    }

    let (w, h, n) = (
        viewport.width as f64,
        viewport.height as f64,
        unit_count as f64,
    );
    let d = ((w * w + 4.0 * n * w * h).sqrt() - w) / (2.0 * n);
    let pitch = (d.floor() as u32).clamp(1, viewport.width);
    Ok(layout_for_pitch(
        pitch,
        viewport,
        unit_count,
        min_cell_size(unit_size, min_scale_factor),
        border_width,
    ))
}

fn layout_for_pitch(
    pitch: u32,
    viewport: Viewport,
    unit_count: usize,
    min_cell: u32,
    border_width: u32,
) -> GridLayout {
    let columns = (viewport.width / pitch).max(1);
    let rows = ((unit_count as u32) + columns - 1) / columns;
    GridLayout {
        columns,
        rows,
        cell_size: pitch.saturating_sub(border_width).max(min_cell),
        pitch,
    }
}

/// Integer search for the largest pitch whose grid fits the viewport in both
/// directions. Slower than [`compute_layout`]; used to check it.
pub fn exact_layout(
    unit_size: u32,
    viewport: Viewport,
    unit_count: usize,
    min_scale_factor: f64,
    border_width: u32,
) -> Result<GridLayout> {
    validate(unit_size, viewport, min_scale_factor)?;
    if unit_count == 0 {
        return Ok(GridLayout::default());
    }
    let n = unit_count as u32;
    let best = (1..=n.min(viewport.width))
        .map(|columns| {
            let rows = (n + columns - 1) / columns;
            (viewport.width / columns).min(viewport.height / rows)
        })
        .max()
        .unwrap_or(0)
        .max(1);
    Ok(layout_for_pitch(
        best,
        viewport,
        unit_count,
        min_cell_size(unit_size, min_scale_factor),
        border_width,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_scenario_fits_and_respects_floor() {
        let layout = compute_layout(112, Viewport::new(800, 600), 128, 0.2, 10).unwrap();
        assert_eq!(layout.pitch, 58);
        assert_eq!(layout.columns, 13);
        assert_eq!(layout.rows, 10);
        assert_eq!(layout.cell_size, 48);
        assert!(layout.slots() >= 128);
    }

    #[test]
    fn floor_kicks_in_for_crowded_viewports() {
        let layout = compute_layout(112, Viewport::new(200, 100), 512, 0.2, 10).unwrap();
        assert_eq!(layout.cell_size, 23);
        assert!(layout.slots() >= 512);
        assert!(layout.extent().0 > 200);
    }

    #[test]
    fn zero_units_is_an_empty_layout() {
        let layout = compute_layout(64, Viewport::new(300, 300), 0, 0.5, 10).unwrap();
        assert!(layout.is_empty());
        assert_eq!(layout, GridLayout::default());
        assert_eq!(layout.position_of(0), None);
    }

    #[test]
    fn invalid_inputs_fail_fast() {
        let bad = [
            compute_layout(0, Viewport::new(10, 10), 1, 0.5, 0),
            compute_layout(8, Viewport::new(0, 10), 1, 0.5, 0),
            compute_layout(8, Viewport::new(10, 0), 1, 0.5, 0),
            compute_layout(8, Viewport::new(10, 10), 1, 0.0, 0),
            compute_layout(8, Viewport::new(10, 10), 1, 1.5, 0),
            compute_layout(8, Viewport::new(10, 10), 1, f64::NAN, 0),
        ];
        for result in bad.iter() {
            assert!(matches!(result, Err(VisError::InvalidLayoutInput(_))));
        }
    }

    #[test]
    fn degenerate_viewports_keep_one_column() {
        // raw pitch would be 0
        let tiny = compute_layout(16, Viewport::new(10, 10), 1000, 0.5, 2).unwrap();
        assert!(tiny.columns >= 1);
        assert!(tiny.slots() >= 1000);
        // raw pitch would exceed the width
        let tall = compute_layout(16, Viewport::new(100, 10_000), 1, 0.5, 2).unwrap();
        assert_eq!(tall.columns, 1);
        assert_eq!(tall.pitch, 100);
    }

    #[test]
    fn positions_round_trip() {
        let layout = compute_layout(32, Viewport::new(400, 300), 20, 0.25, 4).unwrap();
        for index in 0..20 {
            let (row, column) = layout.position_of(index).unwrap();
            assert_eq!(layout.index_at(row, column), Some(index));
        }
        assert_eq!(layout.index_at(0, layout.columns), None);
    }

    #[test]
    fn exact_layout_fits_both_directions() {
        let viewport = Viewport::new(800, 600);
        let exact = exact_layout(112, viewport, 128, 0.2, 10).unwrap();
        assert!(exact.slots() >= 128);
        assert!(exact.columns * exact.pitch <= 800);
        assert!(exact.rows * exact.pitch <= 600);
        // 13 columns of 60 px use the full height; the relaxation settles on 58
        assert_eq!(exact.pitch, 60);
        assert_eq!((exact.columns, exact.rows), (13, 10));
    }
}
