//! The "jet" perceptual colour map as a 256-entry lookup table.

use image::Rgb;

type Segments = &'static [(f32, f32)];

// (x, y) anchor points of each channel, linearly interpolated in between.
const RED: Segments = &[(0.0, 0.0), (0.35, 0.0), (0.66, 1.0), (0.89, 1.0), (1.0, 0.5)];
const GREEN: Segments = &[
    (0.0, 0.0),
    (0.125, 0.0),
    (0.375, 1.0),
    (0.64, 1.0),
    (0.91, 0.0),
    (1.0, 0.0),
];
const BLUE: Segments = &[(0.0, 0.5), (0.11, 1.0), (0.34, 1.0), (0.65, 0.0), (1.0, 0.0)];

const LUT_SIZE: usize = 256;

fn interpolate(segments: Segments, x: f32) -> f32 {
    for pair in segments.windows(2) {
        let ((x0, y0), (x1, y1)) = (pair[0], pair[1]);
        if x <= x1 {
            return y0 + (y1 - y0) * (x - x0) / (x1 - x0);
        }
    }
    segments[segments.len() - 1].1
}

/// Precomputed jet table, indexed like matplotlib's 256-colour quantization.
#[derive(Debug, Clone)]
pub struct Jet {
    lut: Vec<[f32; 3]>,
}

impl Default for Jet {
    fn default() -> Self {
        let lut = (0..LUT_SIZE)
            .map(|i| {
                let x = i as f32 / (LUT_SIZE - 1) as f32;
                [interpolate(RED, x), interpolate(GREEN, x), interpolate(BLUE, x)]
            })
            .collect();
        Jet { lut }
    }
}

impl Jet {
    /// Colour of `value` in [0, 1] with channels in [0, 1].
    pub fn rgb(&self, value: f32) -> [f32; 3] {
        let value = if value.is_finite() { value } else { 0.0 };
        let index = ((value * LUT_SIZE as f32) as isize).clamp(0, LUT_SIZE as isize - 1);
        self.lut[index as usize]
    }

    /// Colour of `value` in [0, 1] as an 8-bit pixel (channel * 255, truncated).
    pub fn pixel(&self, value: f32) -> Rgb<u8> {
        let [r, g, b] = self.rgb(value);
        Rgb([(r * 255.0) as u8, (g * 255.0) as u8, (b * 255.0) as u8])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_are_dark_blue_and_dark_red() {
        let jet = Jet::default();
        assert_eq!(jet.pixel(0.0), Rgb([0, 0, 127]));
        assert_eq!(jet.pixel(1.0), Rgb([127, 0, 0]));
    }

    #[test]
    fn middle_is_greenish() {
        let jet = Jet::default();
        let Rgb([r, g, b]) = jet.pixel(0.5);
        assert!(g > 240, "{:?}", (r, g, b));
        assert!(r > 100 && r < 140);
        assert!(b > 100 && b < 140);
    }

    #[test]
    fn out_of_range_is_clamped() {
        let jet = Jet::default();
        assert_eq!(jet.pixel(-3.0), jet.pixel(0.0));
        assert_eq!(jet.pixel(7.0), jet.pixel(1.0));
        assert_eq!(jet.pixel(f32::NAN), jet.pixel(0.0));
    }
}
