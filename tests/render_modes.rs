use deepvis_rs::config::RenderSettings;
use deepvis_rs::render::{overlay_alpha, render_activation, render_deconv, DeconvView, OverlayMode};
use deepvis_rs::PixelBuffer;
use image::Rgb;
use ndarray::{Array2, Array3};
use proptest::prelude::*;

proptest! {
    #[test]
    fn alpha_is_bounded_and_monotonic(a in 0.0f32..255.0, step in 0.5f32..50.0) {
        let settings = RenderSettings::default();
        let low = overlay_alpha(a, &settings);
        let high = overlay_alpha((a + step).min(255.0), &settings);
        prop_assert!((0.0..=255.0).contains(&low));
        prop_assert!(high >= low - 1e-3);
    }

    #[test]
    fn every_mode_renders_the_canonical_size(
        values in proptest::collection::vec(-1e3f32..1e3, 3 * 5 * 7),
    ) {
        let settings = RenderSettings::default();
        let tensor = Array3::from_shape_vec((3, 5, 7), values).unwrap();
        for view in DeconvView::ALL.iter() {
            let out = render_deconv(tensor.view().into_dyn(), *view, &settings).unwrap();
            prop_assert_eq!(out.dimensions(), (224, 224));
        }
        let map = tensor.index_axis(ndarray::Axis(0), 0).mapv(|v| (v + 1e3) / 2e3 * 255.0);
        let input = PixelBuffer::from_pixel(30, 20, Rgb([10, 200, 30]));
        for mode in OverlayMode::ALL.iter() {
            let out = render_activation(map.view().into_dyn(), &input, *mode, &settings).unwrap();
            prop_assert_eq!(out.dimensions(), (224, 224));
        }
    }
}

#[test]
fn non_finite_maps_still_render() {
    let settings = RenderSettings::default();
    let mut map = Array2::<f32>::from_elem((4, 4), 40.0);
    map[[0, 0]] = f32::NAN;
    map[[1, 1]] = f32::INFINITY;
    let input = PixelBuffer::from_pixel(4, 4, Rgb([255, 255, 255]));
    let out = render_activation(map.view().into_dyn(), &input, OverlayMode::OverActive, &settings).unwrap();
    assert_eq!(out.dimensions(), (224, 224));

    let mut tensor = Array3::<f32>::ones((3, 4, 4));
    tensor[[2, 3, 3]] = f32::NAN;
    for view in DeconvView::ALL.iter() {
        render_deconv(tensor.view().into_dyn(), *view, &settings).unwrap();
    }
}
