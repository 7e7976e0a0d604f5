//! Binarization of the aligned sheet
//!
//! Produces the inverted binary image the mark detector works on: pencil
//! marks and printed grid lines become white foreground on black. Histogram
//! equalization and a median pass even out lighting before an integral-image
//! adaptive threshold; a morphological opening removes leftover speckle.

use image::{GrayImage, Luma};
use imageproc::contrast::equalize_histogram;
use imageproc::distance_transform::Norm;
use imageproc::filter::median_filter;
use imageproc::morphology::open;
use tracing::debug;

use crate::config::BinarizeConfig;

/// Binarize the aligned sheet for mark detection.
pub fn binarize_sheet(image: &GrayImage, config: &BinarizeConfig) -> GrayImage {
    let equalized = equalize_histogram(image);
    let blurred = median_filter(&equalized, config.median_radius, config.median_radius);
    let binary = adaptive_threshold_inv(&blurred, config.block_radius, config.offset);
    let cleaned = open(&binary, Norm::LInf, config.morph_open_k);
    debug!("sheet binarized");
    cleaned
}

/// Inverted adaptive threshold: a pixel darker than its neighbourhood mean
/// minus `offset` becomes foreground (255). Local means come from a
/// summed-area table so the block size does not affect the cost.
pub fn adaptive_threshold_inv(image: &GrayImage, block_radius: u32, offset: i32) -> GrayImage {
    let (width, height) = image.dimensions();
    let integral = integral_image(image);

    let mut output = GrayImage::new(width, height);
    for y in 0..height {
        for x in 0..width {
            let mean = region_mean(&integral, width, height, x, y, block_radius);
            let threshold = (mean as i32 - offset).clamp(0, 255);
            let value = image.get_pixel(x, y).0[0];
            let binary = if i32::from(value) < threshold { 255u8 } else { 0u8 };
            output.put_pixel(x, y, Luma([binary]));
        }
    }
    output
}

/// Summed-area table with a zero-padded border: entry `(x, y)` holds the sum
/// of all pixels in the rectangle exclusive of row `y` and column `x`.
fn integral_image(image: &GrayImage) -> Vec<u64> {
    let (width, height) = image.dimensions();
    let stride = (width + 1) as usize;
    let mut integral = vec![0u64; stride * (height + 1) as usize];

    for y in 0..height as usize {
        let mut row_sum = 0u64;
        for x in 0..width as usize {
            row_sum += u64::from(image.get_pixel(x as u32, y as u32).0[0]);
            integral[(y + 1) * stride + x + 1] = integral[y * stride + x + 1] + row_sum;
        }
    }
    integral
}

fn region_mean(integral: &[u64], width: u32, height: u32, x: u32, y: u32, radius: u32) -> u8 {
    let stride = (width + 1) as usize;
    let x0 = x.saturating_sub(radius) as usize;
    let y0 = y.saturating_sub(radius) as usize;
    let x1 = (x + radius + 1).min(width) as usize;
    let y1 = (y + radius + 1).min(height) as usize;

    let sum = integral[y1 * stride + x1] + integral[y0 * stride + x0]
        - integral[y0 * stride + x1]
        - integral[y1 * stride + x0];
    let count = ((x1 - x0) * (y1 - y0)) as u64;
    (sum / count.max(1)) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integral_region_mean_matches_naive() {
        let image = GrayImage::from_fn(16, 12, |x, y| Luma([((x * 7 + y * 13) % 251) as u8]));
        let integral = integral_image(&image);

        for &(x, y, r) in &[(0u32, 0u32, 2u32), (8, 6, 3), (15, 11, 4), (5, 5, 0)] {
            let x0 = x.saturating_sub(r);
            let y0 = y.saturating_sub(r);
            let x1 = (x + r + 1).min(16);
            let y1 = (y + r + 1).min(12);
            let mut sum = 0u64;
            let mut count = 0u64;
            for yy in y0..y1 {
                for xx in x0..x1 {
                    sum += u64::from(image.get_pixel(xx, yy).0[0]);
                    count += 1;
                }
            }
            let expected = (sum / count) as u8;
            assert_eq!(region_mean(&integral, 16, 12, x, y, r), expected);
        }
    }

    #[test]
    fn test_dark_mark_becomes_foreground() {
        // Light sheet with one dark 8x8 mark.
        let mut image = GrayImage::from_pixel(40, 40, Luma([220u8]));
        for y in 16..24 {
            for x in 16..24 {
                image.put_pixel(x, y, Luma([20u8]));
            }
        }

        let binary = adaptive_threshold_inv(&image, 10, 10);
        assert_eq!(binary.get_pixel(20, 20).0[0], 255);
        assert_eq!(binary.get_pixel(2, 2).0[0], 0);
    }

    #[test]
    fn test_uniform_image_has_no_foreground() {
        let image = GrayImage::from_pixel(30, 30, Luma([180u8]));
        let binary = adaptive_threshold_inv(&image, 8, 10);
        assert!(binary.pixels().all(|p| p.0[0] == 0));
    }

    #[test]
    fn test_binarize_sheet_preserves_dimensions() {
        let config = BinarizeConfig {
            median_radius: 1,
            morph_open_k: 1,
            block_radius: 8,
            offset: 10,
        };
        let image = GrayImage::from_pixel(50, 60, Luma([200u8]));
        let binary = binarize_sheet(&image, &config);
        assert_eq!(binary.dimensions(), (50, 60));
    }
}
