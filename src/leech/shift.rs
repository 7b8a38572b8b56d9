//! FFT phase-correlation shift estimation.
//!
//! Estimates the translation between two captures of the same anchor region.
//! The cross-power spectrum of the two images is normalized to unit
//! magnitude; its inverse transform is a correlation surface whose peak sits
//! at the (wrapped) displacement. A parabolic fit through the peak and its
//! two neighbours on each axis refines the estimate below one pixel.

use crate::data::Frame;
use crate::error::{AcqError, AcqResult};
use num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

/// Magnitudes below this are treated as zero when normalizing the spectrum.
const SPECTRUM_EPS: f64 = 1e-12;

/// Measure the shift of `probe` relative to `reference`, in pixels.
///
/// Returns `(dx, dy)`: positive `dx` means the probe content moved toward
/// larger x. Both frames must share the same dimensions. The estimate is
/// only meaningful up to half the frame size on each axis; beyond that the
/// correlation wraps.
///
/// # Errors
///
/// [`AcqError::Configuration`] on mismatched or empty frames.
pub fn measure_shift(reference: &Frame, probe: &Frame) -> AcqResult<(f64, f64)> {
    if reference.width != probe.width || reference.height != probe.height {
        return Err(AcqError::Configuration(format!(
            "anchor frames differ in shape: {}x{} vs {}x{}",
            reference.width, reference.height, probe.width, probe.height
        )));
    }
    let w = reference.width as usize;
    let h = reference.height as usize;
    if w == 0 || h == 0 {
        return Err(AcqError::Configuration("empty anchor frame".into()));
    }

    let mut spec_a = to_complex_zero_mean(reference);
    let mut spec_b = to_complex_zero_mean(probe);

    let mut planner = FftPlanner::new();
    fft_2d(&mut spec_a, w, h, &mut planner, false);
    fft_2d(&mut spec_b, w, h, &mut planner, false);

    // Normalized cross-power spectrum: phase carries the displacement.
    let mut cross: Vec<Complex<f64>> = spec_a
        .iter()
        .zip(spec_b.iter())
        .map(|(a, b)| {
            let c = a * b.conj();
            let mag = c.norm();
            if mag > SPECTRUM_EPS {
                c / mag
            } else {
                Complex::new(0.0, 0.0)
            }
        })
        .collect();
    fft_2d(&mut cross, w, h, &mut planner, true);

    let corr: Vec<f64> = cross.iter().map(|c| c.re).collect();

    // Peak of the correlation surface.
    let mut peak = 0;
    for (i, &v) in corr.iter().enumerate() {
        if v > corr[peak] {
            peak = i;
        }
    }
    let px = peak % w;
    let py = peak / w;

    let dx = refine_axis(&corr, |x| py * w + x.rem_euclid(w as isize) as usize, px, w);
    let dy = refine_axis(&corr, |y| y.rem_euclid(h as isize) as usize * w + px, py, h);

    Ok((-dx, -dy))
}

/// Wrapped peak position along one axis with parabolic sub-pixel refinement.
fn refine_axis(corr: &[f64], index: impl Fn(isize) -> usize, peak: usize, n: usize) -> f64 {
    let p = peak as isize;
    let v0 = corr[index(p)];
    let vm = corr[index(p - 1)];
    let vp = corr[index(p + 1)];
    let denom = vm - 2.0 * v0 + vp;
    let delta = if denom.abs() > SPECTRUM_EPS {
        (0.5 * (vm - vp) / denom).clamp(-0.5, 0.5)
    } else {
        0.0
    };
    let wrapped = if peak > n / 2 {
        peak as f64 - n as f64
    } else {
        peak as f64
    };
    wrapped + delta
}

fn to_complex_zero_mean(frame: &Frame) -> Vec<Complex<f64>> {
    let mean = frame.mean();
    frame
        .data
        .iter()
        .map(|&v| Complex::new(f64::from(v) - mean, 0.0))
        .collect()
}

/// In-place 2-D FFT: rows, then columns.
fn fft_2d(
    data: &mut [Complex<f64>],
    width: usize,
    height: usize,
    planner: &mut FftPlanner<f64>,
    inverse: bool,
) {
    let row_fft: Arc<dyn Fft<f64>> = if inverse {
        planner.plan_fft_inverse(width)
    } else {
        planner.plan_fft_forward(width)
    };
    for row in data.chunks_exact_mut(width) {
        row_fft.process(row);
    }

    let col_fft: Arc<dyn Fft<f64>> = if inverse {
        planner.plan_fft_inverse(height)
    } else {
        planner.plan_fft_forward(height)
    };
    let mut column = vec![Complex::new(0.0, 0.0); height];
    for x in 0..width {
        for (y, c) in column.iter_mut().enumerate() {
            *c = data[y * width + x];
        }
        col_fft.process(&mut column);
        for (y, c) in column.iter().enumerate() {
            data[y * width + x] = *c;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A synthetic anchor pattern: a bright blob with a secondary spot so
    /// the correlation peak is unambiguous.
    fn pattern(width: u32, height: u32, ox: f64, oy: f64) -> Frame {
        let mut data = Vec::with_capacity((width * height) as usize);
        for y in 0..height {
            for x in 0..width {
                let gx = f64::from(x) - (f64::from(width) / 2.0 + ox);
                let gy = f64::from(y) - (f64::from(height) / 2.0 + oy);
                let blob = 3000.0 * (-(gx * gx + gy * gy) / 18.0).exp();
                let sx = f64::from(x) - (f64::from(width) / 4.0 + ox);
                let sy = f64::from(y) - (f64::from(height) / 4.0 + oy);
                let spot = 1500.0 * (-(sx * sx + sy * sy) / 8.0).exp();
                data.push((100.0 + blob + spot) as u16);
            }
        }
        Frame::from_u16(width, height, data)
    }

    #[test]
    fn test_zero_shift() {
        let a = pattern(32, 32, 0.0, 0.0);
        let b = pattern(32, 32, 0.0, 0.0);
        let (dx, dy) = measure_shift(&a, &b).unwrap();
        assert!(dx.abs() < 0.1, "dx = {dx}");
        assert!(dy.abs() < 0.1, "dy = {dy}");
    }

    #[test]
    fn test_integer_shift_both_axes() {
        let a = pattern(32, 32, 0.0, 0.0);
        let b = pattern(32, 32, 3.0, -2.0);
        let (dx, dy) = measure_shift(&a, &b).unwrap();
        assert!((dx - 3.0).abs() < 0.5, "dx = {dx}");
        assert!((dy + 2.0).abs() < 0.5, "dy = {dy}");
    }

    #[test]
    fn test_subpixel_shift_direction() {
        let a = pattern(32, 32, 0.0, 0.0);
        let b = pattern(32, 32, 1.5, 0.0);
        let (dx, dy) = measure_shift(&a, &b).unwrap();
        assert!((dx - 1.5).abs() < 0.6, "dx = {dx}");
        assert!(dy.abs() < 0.5, "dy = {dy}");
    }

    #[test]
    fn test_mismatched_shapes_rejected() {
        let a = pattern(32, 32, 0.0, 0.0);
        let b = pattern(16, 16, 0.0, 0.0);
        assert!(matches!(
            measure_shift(&a, &b),
            Err(AcqError::Configuration(_))
        ));
    }

    #[test]
    fn test_noisy_shift_still_resolved() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let mut a = pattern(32, 32, 0.0, 0.0);
        let mut b = pattern(32, 32, -4.0, 1.0);
        for v in a.data.iter_mut().chain(b.data.iter_mut()) {
            *v = v.saturating_add(rng.gen_range(0..40));
        }
        let (dx, dy) = measure_shift(&a, &b).unwrap();
        assert!((dx + 4.0).abs() < 0.7, "dx = {dx}");
        assert!((dy - 1.0).abs() < 0.7, "dy = {dy}");
    }
}
