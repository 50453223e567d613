//! The scrollable grid of unit thumbnails of the selected layer.

use image::imageops::{self, FilterType};
use image::Rgb;

use crate::config::LayoutSettings;
use crate::error::{Result, VisError};
use crate::layout::{compute_layout, GridLayout, Viewport};
use crate::PixelBuffer;

const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);
const HIGHLIGHT: Rgb<u8> = Rgb([0, 0, 255]);

/// Emitted whenever the grid (re-)asserts which unit the detail view shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionChanged(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReflowKind {
    /// Unit count changed; cells were laid out from scratch.
    Relayout,
    /// Same unit count; only pixel content was swapped.
    ContentOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reflow {
    pub kind: ReflowKind,
    pub selection: Option<SelectionChanged>,
}

#[derive(Debug, Clone)]
pub struct LayerGrid {
    units: Vec<PixelBuffer>,
    cells: Vec<PixelBuffer>,
    layout: GridLayout,
    viewport: Viewport,
    clicked: usize,
    border_width: u32,
    min_scale_factor: f64,
}

impl LayerGrid {
    pub fn new(viewport: Viewport, settings: &LayoutSettings) -> Self {
        LayerGrid {
            units: Vec::new(),
            cells: Vec::new(),
            layout: GridLayout::default(),
            viewport,
            clicked: 0,
            border_width: settings.border_width,
            min_scale_factor: settings.min_scale_factor,
        }
    }

    pub fn layout(&self) -> GridLayout {
        self.layout
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    pub fn clicked_index(&self) -> usize {
        self.clicked
    }

    /// Unit images scaled to the current cell size, in grid order.
    pub fn cells(&self) -> &[PixelBuffer] {
        &self.cells
    }

    pub fn position_of(&self, index: usize) -> Option<(u32, u32)> {
        if index >= self.units.len() {
            return None;
        }
        self.layout.position_of(index)
    }

    pub fn index_at(&self, row: u32, column: u32) -> Option<usize> {
        self.layout
            .index_at(row, column)
            .filter(|&index| index < self.units.len())
    }

    /// Replaces the unit set. A new unit count triggers a full relayout;
    /// the same count only refreshes the cell images in place.
    pub fn set_units(&mut self, units: Vec<PixelBuffer>) -> Result<Reflow> {
        let same_count = !self.units.is_empty() && units.len() == self.units.len();
        self.units = units;
        if same_count {
            self.rescale();
            return Ok(Reflow {
                kind: ReflowKind::ContentOnly,
                selection: self.reassert_selection(),
            });
        }
        let selection = self.relayout()?;
        Ok(Reflow {
            kind: ReflowKind::Relayout,
            selection,
        })
    }

    pub fn resize(&mut self, viewport: Viewport) -> Result<Option<SelectionChanged>> {
        self.viewport = viewport;
        self.relayout()
    }

    /// Marks the unit at `index` as the clicked one.
    pub fn click(&mut self, index: usize) -> Result<SelectionChanged> {
        if index >= self.units.len() {
            return Err(VisError::InvalidLayoutInput(format!(
                "unit {} clicked in a grid of {}",
                index,
                self.units.len()
            )));
        }
        self.clicked = index;
        Ok(SelectionChanged(index))
    }

    fn relayout(&mut self) -> Result<Option<SelectionChanged>> {
        let unit_size = match self.units.first() {
            Some(unit) => unit.width(),
            None => {
                self.layout = GridLayout::default();
                self.cells.clear();
                return Ok(None);
            }
        };
        self.layout = compute_layout(
            unit_size,
            self.viewport,
            self.units.len(),
            self.min_scale_factor,
            self.border_width,
        )?;
        tracing::debug!(
            units = self.units.len(),
            columns = self.layout.columns,
            rows = self.layout.rows,
            cell = self.layout.cell_size,
            "grid relayout"
        );
        self.rescale();
        Ok(self.reassert_selection())
    }

    fn rescale(&mut self) {
        let cell = self.layout.cell_size.max(1);
        self.cells = self
            .units
            .iter()
            .map(|unit| {
                let height = scaled_height(unit, cell);
                imageops::resize(unit, cell, height, FilterType::Nearest)
            })
            .collect();
    }

    fn reassert_selection(&mut self) -> Option<SelectionChanged> {
        if self.units.is_empty() {
            return None;
        }
        if self.clicked >= self.units.len() {
            self.clicked = 0;
        }
        Some(SelectionChanged(self.clicked))
    }

    /// Paints the whole grid, clicked cell highlighted, into one image.
    pub fn compose(&self) -> PixelBuffer {
        let (width, height) = self.layout.extent();
        let mut canvas = PixelBuffer::from_pixel(width.max(1), height.max(1), BACKGROUND);
        let pitch = self.layout.pitch.max(self.layout.cell_size);
        for (index, cell) in self.cells.iter().enumerate() {
            let (row, column) = match self.layout.position_of(index) {
                Some(position) => position,
                None => continue,
            };
            let (x0, y0) = (column * pitch, row * pitch);
            if index == self.clicked {
                let frame = PixelBuffer::from_pixel(pitch, pitch, HIGHLIGHT);
                imageops::replace(&mut canvas, &frame, x0 as i64, y0 as i64);
            }
            let dx = pitch.saturating_sub(cell.width()) / 2;
            let dy = pitch.saturating_sub(cell.height()) / 2;
            imageops::replace(&mut canvas, cell, (x0 + dx) as i64, (y0 + dy) as i64);
        }
        canvas
    }
}

fn scaled_height(unit: &PixelBuffer, width: u32) -> u32 {
    let (w, h) = unit.dimensions();
    if w == 0 {
        return width;
    }
    ((h as u64 * width as u64 + w as u64 / 2) / w as u64).max(1) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn units(count: usize, shade: u8) -> Vec<PixelBuffer> {
        (0..count)
            .map(|_| PixelBuffer::from_pixel(112, 112, Rgb([shade, shade, shade])))
            .collect()
    }

    fn grid() -> LayerGrid {
        LayerGrid::new(Viewport::new(800, 600), &LayoutSettings::default())
    }

    #[test]
    fn first_units_trigger_layout_and_select_zero() {
        let mut grid = grid();
        let reflow = grid.set_units(units(128, 10)).unwrap();
        assert_eq!(reflow.kind, ReflowKind::Relayout);
        assert_eq!(reflow.selection, Some(SelectionChanged(0)));
        assert_eq!(grid.cells().len(), 128);
        assert_eq!(grid.cells()[0].width(), grid.layout().cell_size);
    }

    #[test]
    fn same_count_only_swaps_content() {
        let mut grid = grid();
        grid.set_units(units(10, 10)).unwrap();
        grid.click(7).unwrap();
        let before = grid.layout();
        let reflow = grid.set_units(units(10, 200)).unwrap();
        assert_eq!(reflow.kind, ReflowKind::ContentOnly);
        assert_eq!(grid.layout(), before);
        assert_eq!(reflow.selection, Some(SelectionChanged(7)));
        assert_eq!(grid.cells()[3].get_pixel(0, 0), &Rgb([200, 200, 200]));
    }

    #[test]
    fn shrinking_clamps_selection_to_zero() {
        let mut grid = grid();
        grid.set_units(units(10, 10)).unwrap();
        grid.click(5).unwrap();
        let reflow = grid.set_units(units(3, 10)).unwrap();
        assert_eq!(reflow.kind, ReflowKind::Relayout);
        assert_eq!(reflow.selection, Some(SelectionChanged(0)));
        assert_eq!(grid.clicked_index(), 0);
    }

    #[test]
    fn growing_keeps_valid_selection() {
        let mut grid = grid();
        grid.set_units(units(4, 10)).unwrap();
        grid.click(2).unwrap();
        let reflow = grid.set_units(units(64, 10)).unwrap();
        assert_eq!(reflow.selection, Some(SelectionChanged(2)));
    }

    #[test]
    fn resize_relayouts_once() {
        let mut grid = grid();
        grid.set_units(units(32, 10)).unwrap();
        let wide = grid.layout();
        let event = grid.resize(Viewport::new(300, 900)).unwrap();
        assert_eq!(event, Some(SelectionChanged(0)));
        assert_ne!(grid.layout(), wide);
        assert!(grid.layout().slots() >= 32);
    }

    #[test]
    fn clicks_out_of_range_are_rejected() {
        let mut grid = grid();
        grid.set_units(units(3, 10)).unwrap();
        assert!(grid.click(3).is_err());
        assert_eq!(grid.click(2).unwrap(), SelectionChanged(2));
        assert_eq!(grid.index_at(0, 2), Some(2));
        assert_eq!(grid.position_of(3), None);
    }

    #[test]
    fn empty_unit_set_has_no_selection() {
        let mut grid = grid();
        let reflow = grid.set_units(Vec::new()).unwrap();
        assert_eq!(reflow.selection, None);
        assert!(grid.layout().is_empty());
    }

    #[test]
    fn composed_grid_highlights_clicked_cell() {
        let mut grid = LayerGrid::new(
            Viewport::new(100, 100),
            &LayoutSettings {
                border_width: 10,
                min_scale_factor: 0.1,
                initial_viewport: (100, 100),
            },
        );
        grid.set_units(units(4, 0)).unwrap();
        grid.click(1).unwrap();
        let layout = grid.layout();
        let canvas = grid.compose();
        assert_eq!(canvas.dimensions(), layout.extent());
        let pitch = layout.pitch;
        // border of the clicked cell is blue, of the others white
        assert_eq!(canvas.get_pixel(pitch, 0), &HIGHLIGHT);
        assert_eq!(canvas.get_pixel(0, 0), &BACKGROUND);
        // unit content is drawn in the middle of its cell
        assert_eq!(canvas.get_pixel(pitch / 2, pitch / 2), &Rgb([0, 0, 0]));
    }
}
