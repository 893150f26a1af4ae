//! Zero-mean normalized cross-correlation (OpenCV's `TM_CCOEFF_NORMED`).
//!
//! Small searches take the raw cross-correlation surface from `imageproc`;
//! full-frame searches correlate through an FFT with `rustfft`. The mean
//! and variance of every image window come from summed-area tables, so the
//! normalisation is O(1) per output pixel.

use std::sync::Arc;

use image::{GrayImage, ImageBuffer, Luma};
use imageproc::template_matching::{match_template, MatchTemplateMethod};
use rustfft::num_complex::Complex32;
use rustfft::{Fft, FftPlanner};

pub type ScoreMap = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Windows whose variance falls below this are treated as flat.
const FLAT_EPSILON: f64 = 1e-6;

struct SummedArea {
    width: usize,
    sum: Vec<f64>,
    sq_sum: Vec<f64>,
}

impl SummedArea {
    fn new(image: &GrayImage) -> Self {
        let (w, h) = (image.width() as usize, image.height() as usize);
        let stride = w + 1;
        let mut sum = vec![0.0; stride * (h + 1)];
        let mut sq_sum = vec![0.0; stride * (h + 1)];
        for y in 0..h {
            let mut row = 0.0;
            let mut row_sq = 0.0;
            for x in 0..w {
                let v = image.get_pixel(x as u32, y as u32)[0] as f64;
                row += v;
                row_sq += v * v;
                let idx = (y + 1) * stride + (x + 1);
                sum[idx] = sum[idx - stride] + row;
                sq_sum[idx] = sq_sum[idx - stride] + row_sq;
            }
        }
        Self { width: stride, sum, sq_sum }
    }

    fn window(&self, x: usize, y: usize, w: usize, h: usize) -> (f64, f64) {
        let s = self.width;
        let (a, b, c, d) = (y * s + x, y * s + x + w, (y + h) * s + x, (y + h) * s + x + w);
        (
            self.sum[d] - self.sum[b] - self.sum[c] + self.sum[a],
            self.sq_sum[d] - self.sq_sum[b] - self.sq_sum[c] + self.sq_sum[a],
        )
    }
}

/// Relative cost of one FFT pass per pixel against one direct multiply-add.
const FFT_COST_FACTOR: f64 = 12.0;

fn prefers_fft((iw, ih): (u32, u32), (tw, th): (u32, u32)) -> bool {
    let direct = (iw - tw + 1) as f64 * (ih - th + 1) as f64 * (tw * th) as f64;
    let n = iw as f64 * ih as f64;
    FFT_COST_FACTOR * n * n.log2().max(1.0) < direct
}

fn plan(planner: &mut FftPlanner<f32>, len: usize, inverse: bool) -> Arc<dyn Fft<f32>> {
    if inverse {
        planner.plan_fft_inverse(len)
    } else {
        planner.plan_fft_forward(len)
    }
}

fn transpose(data: &[Complex32], w: usize, h: usize) -> Vec<Complex32> {
    let mut out = vec![Complex32::default(); w * h];
    for y in 0..h {
        for x in 0..w {
            out[x * h + y] = data[y * w + x];
        }
    }
    out
}

/// In-place 2-D transform of a row-major `w` x `h` buffer.
fn fft_2d(planner: &mut FftPlanner<f32>, data: &mut Vec<Complex32>, w: usize, h: usize, inverse: bool) {
    plan(planner, w, inverse).process(data);
    let mut columns = transpose(data, w, h);
    plan(planner, h, inverse).process(&mut columns);
    *data = transpose(&columns, h, w);
}

/// Valid-mode correlation of the image with a zero-mean template, which is
/// the ccoeff numerator directly. The transform is image sized; placements
/// inside the valid range never wrap.
fn centered_correlation(image: &GrayImage, template: &GrayImage, t_mean: f64) -> Vec<f32> {
    let (iw, ih) = (image.width() as usize, image.height() as usize);
    let (tw, th) = (template.width() as usize, template.height() as usize);

    // a constant offset leaves the numerator unchanged and keeps f32 error small
    let mut frame: Vec<Complex32> = image
        .pixels()
        .map(|p| Complex32::new(p[0] as f32 - 128.0, 0.0))
        .collect();
    let mut kernel = vec![Complex32::default(); iw * ih];
    for (x, y, p) in template.enumerate_pixels() {
        kernel[y as usize * iw + x as usize] = Complex32::new((p[0] as f64 - t_mean) as f32, 0.0);
    }

    let mut planner = FftPlanner::new();
    fft_2d(&mut planner, &mut frame, iw, ih, false);
    fft_2d(&mut planner, &mut kernel, iw, ih, false);
    for (f, k) in frame.iter_mut().zip(&kernel) {
        *f *= k.conj();
    }
    fft_2d(&mut planner, &mut frame, iw, ih, true);

    let scale = 1.0 / (iw * ih) as f32;
    let (ow, oh) = (iw - tw + 1, ih - th + 1);
    let mut out = Vec::with_capacity(ow * oh);
    for y in 0..oh {
        out.extend(frame[y * iw..y * iw + ow].iter().map(|c| c.re * scale));
    }
    out
}

enum Correlation {
    /// Raw sum of products; the window mean still has to come off.
    Direct(ScoreMap),
    /// Already zero-mean, row-major over the output.
    Centered(Vec<f32>),
}

/// Scores every placement of `template` inside `image` in `[-1, 1]`.
///
/// Returns `None` when the template is empty or larger than the image.
pub fn match_template_ccoeff_normed(image: &GrayImage, template: &GrayImage) -> Option<ScoreMap> {
    let (iw, ih) = image.dimensions();
    let (tw, th) = template.dimensions();
    if tw == 0 || th == 0 || tw > iw || th > ih {
        return None;
    }
    ccoeff_normed_with(image, template, prefers_fft((iw, ih), (tw, th)))
}

fn ccoeff_normed_with(image: &GrayImage, template: &GrayImage, use_fft: bool) -> Option<ScoreMap> {
    let (iw, ih) = image.dimensions();
    let (tw, th) = template.dimensions();
    if tw == 0 || th == 0 || tw > iw || th > ih {
        return None;
    }

    let n = (tw * th) as f64;
    let (t_sum, t_sq_sum) = template.pixels().fold((0.0f64, 0.0f64), |(s, sq), p| {
        let v = p[0] as f64;
        (s + v, sq + v * v)
    });
    let t_mean = t_sum / n;
    let t_var = t_sq_sum - t_sum * t_sum / n;

    let (ow, oh) = (iw - tw + 1, ih - th + 1);
    let mut out = ScoreMap::new(ow, oh);
    if t_var < FLAT_EPSILON {
        return Some(out);
    }

    let correlation = if use_fft {
        Correlation::Centered(centered_correlation(image, template, t_mean))
    } else {
        Correlation::Direct(match_template(image, template, MatchTemplateMethod::CrossCorrelation))
    };
    let table = SummedArea::new(image);

    for y in 0..oh {
        for x in 0..ow {
            let (w_sum, w_sq_sum) = table.window(x as usize, y as usize, tw as usize, th as usize);
            let w_var = w_sq_sum - w_sum * w_sum / n;
            if w_var < FLAT_EPSILON {
                continue;
            }
            let numerator = match &correlation {
                Correlation::Direct(cross) => cross.get_pixel(x, y)[0] as f64 - w_sum * t_mean,
                Correlation::Centered(values) => values[(y * ow + x) as usize] as f64,
            };
            let score = numerator / (w_var * t_var).sqrt();
            out.put_pixel(x, y, Luma([score.clamp(-1.0, 1.0) as f32]));
        }
    }
    Some(out)
}

/// Highest score and its top-left location.
pub fn best_match(scores: &ScoreMap) -> Option<(f32, (u32, u32))> {
    scores
        .enumerate_pixels()
        .map(|(x, y, p)| (p[0], (x, y)))
        .max_by(|a, b| a.0.total_cmp(&b.0))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Deterministic noise so every window is distinct.
    pub(crate) fn noise_image(w: u32, h: u32, seed: u32) -> GrayImage {
        GrayImage::from_fn(w, h, |x, y| {
            let mut h = (y * w + x) ^ seed.wrapping_mul(0x27d4_eb2d);
            h = h.wrapping_mul(0x9e37_79b1);
            h ^= h >> 15;
            h = h.wrapping_mul(0x85eb_ca77);
            h ^= h >> 13;
            Luma([(h >> 24) as u8])
        })
    }

    #[test]
    fn exact_crop_scores_one_at_origin() {
        let image = noise_image(80, 60, 7);
        let template = image::imageops::crop_imm(&image, 30, 17, 12, 10).to_image();
        let scores = match_template_ccoeff_normed(&image, &template).unwrap();
        assert_eq!(scores.dimensions(), (69, 51));

        let (score, loc) = best_match(&scores).unwrap();
        assert_eq!(loc, (30, 17));
        assert!(score > 0.99, "score was {score}");
    }

    #[test]
    fn brightness_shift_does_not_change_score() {
        let image = noise_image(40, 40, 3);
        let template = GrayImage::from_fn(8, 8, |x, y| {
            let v = image.get_pixel(10 + x, 12 + y)[0];
            Luma([v / 2 + 20])
        });
        let scores = match_template_ccoeff_normed(&image, &template).unwrap();
        let (score, loc) = best_match(&scores).unwrap();
        assert_eq!(loc, (10, 12));
        assert!(score > 0.98, "score was {score}");
    }

    #[test]
    fn flat_template_scores_zero() {
        let image = noise_image(20, 20, 1);
        let template = GrayImage::from_pixel(5, 5, Luma([128]));
        let scores = match_template_ccoeff_normed(&image, &template).unwrap();
        assert!(scores.pixels().all(|p| p[0] == 0.0));
    }

    #[test]
    fn oversized_template_is_rejected() {
        let image = noise_image(10, 10, 0);
        let template = noise_image(11, 4, 0);
        assert!(match_template_ccoeff_normed(&image, &template).is_none());
    }

    #[test]
    fn fft_path_agrees_with_direct_path() {
        let image = noise_image(61, 47, 11);
        let template = image::imageops::crop_imm(&image, 22, 9, 13, 11).to_image();
        let direct = ccoeff_normed_with(&image, &template, false).unwrap();
        let fft = ccoeff_normed_with(&image, &template, true).unwrap();
        assert_eq!(direct.dimensions(), fft.dimensions());
        for (a, b) in direct.pixels().zip(fft.pixels()) {
            assert!((a[0] - b[0]).abs() < 1e-3, "{} vs {}", a[0], b[0]);
        }
        assert_eq!(best_match(&fft).unwrap().1, (22, 9));
    }

    #[test]
    fn large_frames_take_the_fft_path() {
        assert!(prefers_fft((2732, 2048), (120, 60)));
        assert!(!prefers_fft((80, 60), (12, 10)));
        assert!(!prefers_fft((100, 100), (100, 100)));
    }
}
