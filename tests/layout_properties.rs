use deepvis_rs::layout::{compute_layout, exact_layout, min_cell_size, Viewport};
use proptest::prelude::*;

proptest! {
    #[test]
    fn every_unit_gets_a_slot(
        unit_size in 1u32..512,
        width in 1u32..4000,
        height in 1u32..4000,
        units in 1usize..2000,
        factor in 0.01f64..=1.0,
        border in 0u32..20,
    ) {
        let viewport = Viewport::new(width, height);
        let layout = compute_layout(unit_size, viewport, units, factor, border).unwrap();
        prop_assert!(layout.slots() as usize >= units);
        prop_assert!(layout.columns >= 1);
        prop_assert!(layout.columns <= width);
        prop_assert!(layout.cell_size >= min_cell_size(unit_size, factor));
        prop_assert!(layout.pitch >= 1 && layout.pitch <= width);
        // no row is completely empty
        prop_assert!((layout.rows as usize - 1) * (layout.columns as usize) < units);
    }

    #[test]
    fn layout_is_deterministic(
        width in 1u32..2000,
        height in 1u32..2000,
        units in 0usize..600,
    ) {
        let viewport = Viewport::new(width, height);
        let first = compute_layout(64, viewport, units, 0.2, 10).unwrap();
        let second = compute_layout(64, viewport, units, 0.2, 10).unwrap();
        prop_assert_eq!(first, second);
    }

    #[test]
    fn exact_layout_fits_the_viewport(
        width in 1u32..1500,
        height in 1u32..1500,
        units in 1usize..300,
    ) {
        let viewport = Viewport::new(width, height);
        let exact = exact_layout(32, viewport, units, 0.5, 2).unwrap();
        prop_assert!(exact.slots() as usize >= units);
        if (units as u64) <= (width as u64) * (height as u64) {
            prop_assert!(exact.columns * exact.pitch <= width);
            prop_assert!(exact.rows * exact.pitch <= height);
        }
    }
}
