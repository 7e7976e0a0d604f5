//! Template alignment via multi-scale keypoint matching
//!
//! Makes a photographed sheet geometrically comparable to the reference
//! template regardless of camera angle and zoom: FAST corners with binary
//! intensity-pair descriptors, brute-force Hamming matching with a mutual
//! nearest-neighbour cross-check, and a RANSAC homography per scale. The
//! first of eleven uniformly spaced scales between 0.5x and 1.5x that yields
//! a homography wins; there is no search for a globally best scale.

use image::{imageops, GrayImage, Luma};
use imageproc::corners::corners_fast9;
use imageproc::filter::gaussian_blur_f32;
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};
use rand::prelude::*;
use tracing::{debug, info, warn};

use crate::config::AlignmentConfig;
use crate::vision::homography::{estimate_ransac, RansacParams};

const SCALE_MIN: f32 = 0.5;
const SCALE_MAX: f32 = 1.5;
const SCALE_STEPS: usize = 11;

const DESCRIPTOR_BITS: usize = 256;
const DESCRIPTOR_WORDS: usize = DESCRIPTOR_BITS / 64;
/// Half-width of the patch each descriptor samples from.
const PATCH_RADIUS: i32 = 15;
/// Sigma of the smoothing pass applied before sampling intensity pairs.
const PATCH_BLUR_SIGMA: f32 = 2.0;
/// Seed for the descriptor sampling pattern and the RANSAC sampler. Fixed so
/// that aligning the same image twice is bit-identical.
const ALIGNMENT_SEED: u64 = 0;

/// Keypoints with their 256-bit descriptors for one image.
#[derive(Debug, Clone)]
pub struct DescriptorSet {
    pub keypoints: Vec<(f32, f32)>,
    pub descriptors: Vec<[u64; DESCRIPTOR_WORDS]>,
}

impl DescriptorSet {
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

/// FAST corner detector plus binary descriptor extractor with a fixed
/// sampling pattern.
pub struct KeypointDetector {
    pairs: Vec<((i32, i32), (i32, i32))>,
    fast_threshold: u8,
    max_keypoints: usize,
}

impl KeypointDetector {
    pub fn new(config: &AlignmentConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(ALIGNMENT_SEED);
        let pairs = (0..DESCRIPTOR_BITS)
            .map(|_| {
                (
                    (
                        rng.gen_range(-PATCH_RADIUS..=PATCH_RADIUS),
                        rng.gen_range(-PATCH_RADIUS..=PATCH_RADIUS),
                    ),
                    (
                        rng.gen_range(-PATCH_RADIUS..=PATCH_RADIUS),
                        rng.gen_range(-PATCH_RADIUS..=PATCH_RADIUS),
                    ),
                )
            })
            .collect();

        Self {
            pairs,
            fast_threshold: config.fast_threshold,
            max_keypoints: config.max_keypoints,
        }
    }

    /// Detect corners and compute their descriptors. Corners too close to the
    /// border for a full patch are dropped.
    pub fn describe(&self, image: &GrayImage) -> DescriptorSet {
        let (width, height) = image.dimensions();
        let smoothed = gaussian_blur_f32(image, PATCH_BLUR_SIGMA);

        let mut corners = corners_fast9(&smoothed, self.fast_threshold);
        corners.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        corners.truncate(self.max_keypoints);

        let mut keypoints = Vec::with_capacity(corners.len());
        let mut descriptors = Vec::with_capacity(corners.len());

        for corner in corners {
            let (cx, cy) = (corner.x as i32, corner.y as i32);
            if cx < PATCH_RADIUS
                || cy < PATCH_RADIUS
                || cx + PATCH_RADIUS >= width as i32
                || cy + PATCH_RADIUS >= height as i32
            {
                continue;
            }

            let mut bits = [0u64; DESCRIPTOR_WORDS];
            for (i, ((ax, ay), (bx, by))) in self.pairs.iter().enumerate() {
                let a = smoothed.get_pixel((cx + ax) as u32, (cy + ay) as u32).0[0];
                let b = smoothed.get_pixel((cx + bx) as u32, (cy + by) as u32).0[0];
                if a < b {
                    bits[i / 64] |= 1u64 << (i % 64);
                }
            }

            keypoints.push((corner.x as f32, corner.y as f32));
            descriptors.push(bits);
        }

        DescriptorSet {
            keypoints,
            descriptors,
        }
    }
}

fn hamming(a: &[u64; DESCRIPTOR_WORDS], b: &[u64; DESCRIPTOR_WORDS]) -> u32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x ^ y).count_ones())
        .sum()
}

/// Brute-force match with mutual nearest-neighbour cross-checking: a pair
/// survives only when each descriptor is the other's closest match and their
/// distance stays under `max_distance`. Returned sorted by distance.
pub fn match_descriptors(
    template: &DescriptorSet,
    candidate: &DescriptorSet,
    max_distance: u32,
) -> Vec<(usize, usize, u32)> {
    if template.is_empty() || candidate.is_empty() {
        return Vec::new();
    }

    let nearest = |from: &DescriptorSet, to: &DescriptorSet| -> Vec<(usize, u32)> {
        from.descriptors
            .iter()
            .map(|d| {
                let mut best = (0usize, u32::MAX);
                for (j, other) in to.descriptors.iter().enumerate() {
                    let dist = hamming(d, other);
                    if dist < best.1 {
                        best = (j, dist);
                    }
                }
                best
            })
            .collect()
    };

    let template_to_candidate = nearest(template, candidate);
    let candidate_to_template = nearest(candidate, template);

    let mut matches: Vec<(usize, usize, u32)> = template_to_candidate
        .iter()
        .enumerate()
        .filter(|(t_idx, (c_idx, dist))| {
            *dist <= max_distance && candidate_to_template[*c_idx].0 == *t_idx
        })
        .map(|(t_idx, (c_idx, dist))| (t_idx, *c_idx, *dist))
        .collect();

    matches.sort_by_key(|m| m.2);
    matches
}

/// The eleven uniformly spaced scale factors of the sweep, ascending.
fn scale_sweep() -> impl Iterator<Item = f32> {
    (0..SCALE_STEPS).map(|i| SCALE_MIN + i as f32 * (SCALE_MAX - SCALE_MIN) / (SCALE_STEPS - 1) as f32)
}

/// Align `image` to `template`. Returns the warped image in the template's
/// pixel dimensions together with the winning scale, or `None` when no scale
/// produces a usable homography (fatal for the run; the caller reports it).
pub fn align(
    image: &GrayImage,
    template: &GrayImage,
    config: &AlignmentConfig,
) -> Option<(GrayImage, f32)> {
    let detector = KeypointDetector::new(config);
    let template_set = detector.describe(template);
    if template_set.is_empty() {
        warn!("template produced no keypoints; alignment cannot succeed");
        return None;
    }
    debug!(keypoints = template_set.len(), "template described");

    let ransac = RansacParams {
        max_iters: config.ransac_iters,
        inlier_threshold: config.reproj_threshold,
        min_inliers: 4,
        seed: ALIGNMENT_SEED,
    };

    for scale in scale_sweep() {
        let new_w = (image.width() as f32 * scale).round() as u32;
        let new_h = (image.height() as f32 * scale).round() as u32;
        if new_w == 0 || new_h == 0 {
            continue;
        }
        let resized = imageops::resize(image, new_w, new_h, imageops::FilterType::Triangle);

        let candidate_set = detector.describe(&resized);
        let matches = match_descriptors(&template_set, &candidate_set, config.max_match_distance);
        if matches.len() < config.min_matches {
            debug!(
                scale,
                matches = matches.len(),
                required = config.min_matches,
                "too few matches at this scale"
            );
            continue;
        }

        // The homography maps the resized candidate into template coordinates.
        let src: Vec<(f64, f64)> = matches
            .iter()
            .map(|&(_, c, _)| {
                let (x, y) = candidate_set.keypoints[c];
                (f64::from(x), f64::from(y))
            })
            .collect();
        let dst: Vec<(f64, f64)> = matches
            .iter()
            .map(|&(t, _, _)| {
                let (x, y) = template_set.keypoints[t];
                (f64::from(x), f64::from(y))
            })
            .collect();

        let h = match estimate_ransac(&src, &dst, &ransac) {
            Ok(h) => h,
            Err(err) => {
                debug!(scale, %err, "homography estimation failed at this scale");
                continue;
            }
        };

        let matrix = [
            h[(0, 0)] as f32,
            h[(0, 1)] as f32,
            h[(0, 2)] as f32,
            h[(1, 0)] as f32,
            h[(1, 1)] as f32,
            h[(1, 2)] as f32,
            h[(2, 0)] as f32,
            h[(2, 1)] as f32,
            h[(2, 2)] as f32,
        ];
        let projection = match Projection::from_matrix(matrix) {
            Some(p) => p,
            None => {
                debug!(scale, "homography not invertible; skipping scale");
                continue;
            }
        };

        let mut aligned = GrayImage::new(template.width(), template.height());
        warp_into(
            &resized,
            &projection,
            Interpolation::Bilinear,
            Luma([255u8]),
            &mut aligned,
        );
        info!(scale, matches = matches.len(), "sheet aligned to template");
        return Some((aligned, scale));
    }

    warn!("no scale in the sweep produced a usable homography");
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScanConfig;

    fn test_alignment_config() -> AlignmentConfig {
        AlignmentConfig {
            max_keypoints: 400,
            fast_threshold: 20,
            max_match_distance: 64,
            min_matches: 8,
            ransac_iters: 100,
            reproj_threshold: 5.0,
        }
    }

    /// Corner-rich synthetic sheet: scattered dark blocks on white.
    fn textured_sheet(width: u32, height: u32) -> GrayImage {
        let mut image = GrayImage::from_pixel(width, height, Luma([255u8]));
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..60 {
            let bw = rng.gen_range(6..14);
            let bh = rng.gen_range(6..14);
            let x0 = rng.gen_range(0..width.saturating_sub(bw));
            let y0 = rng.gen_range(0..height.saturating_sub(bh));
            for y in y0..y0 + bh {
                for x in x0..x0 + bw {
                    image.put_pixel(x, y, Luma([0u8]));
                }
            }
        }
        image
    }

    #[test]
    fn test_hamming_distance() {
        let zero = [0u64; DESCRIPTOR_WORDS];
        let mut one_bit = zero;
        one_bit[0] = 1;
        let full = [u64::MAX; DESCRIPTOR_WORDS];

        assert_eq!(hamming(&zero, &zero), 0);
        assert_eq!(hamming(&zero, &one_bit), 1);
        assert_eq!(hamming(&zero, &full), DESCRIPTOR_BITS as u32);
    }

    #[test]
    fn test_scale_sweep_is_eleven_uniform_steps() {
        let scales: Vec<f32> = scale_sweep().collect();
        assert_eq!(scales.len(), 11);
        assert!((scales[0] - 0.5).abs() < 1e-6);
        assert!((scales[5] - 1.0).abs() < 1e-6);
        assert!((scales[10] - 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_mutual_cross_check_drops_one_sided_matches() {
        let mut d0 = [0u64; DESCRIPTOR_WORDS];
        d0[0] = 0b1111;
        let mut d1 = [0u64; DESCRIPTOR_WORDS];
        d1[0] = 0b1110;
        let mut far = [0u64; DESCRIPTOR_WORDS];
        far[1] = u64::MAX;

        let template = DescriptorSet {
            keypoints: vec![(0.0, 0.0), (1.0, 1.0)],
            descriptors: vec![d0, far],
        };
        // Both template descriptors are nearest to candidate 0, but candidate 0
        // is only mutual with template 0.
        let candidate = DescriptorSet {
            keypoints: vec![(2.0, 2.0)],
            descriptors: vec![d1],
        };

        let matches = match_descriptors(&template, &candidate, u32::MAX);
        assert_eq!(matches.len(), 1);
        assert_eq!((matches[0].0, matches[0].1), (0, 0));
    }

    #[test]
    fn test_descriptors_are_deterministic() {
        let config = test_alignment_config();
        let image = textured_sheet(120, 120);

        let a = KeypointDetector::new(&config).describe(&image);
        let b = KeypointDetector::new(&config).describe(&image);
        assert_eq!(a.keypoints, b.keypoints);
        assert_eq!(a.descriptors, b.descriptors);
    }

    #[test]
    fn test_align_identical_image_succeeds() {
        let config = test_alignment_config();
        let template = textured_sheet(240, 300);

        let result = align(&template, &template, &config);
        assert!(result.is_some());
        let (aligned, _scale) = result.unwrap();
        assert_eq!(aligned.dimensions(), template.dimensions());
    }

    #[test]
    fn test_align_featureless_image_fails() {
        let config = ScanConfig::default();
        let template = textured_sheet(240, 300);
        let flat = GrayImage::from_pixel(240, 300, Luma([128u8]));

        assert!(align(&flat, &template, &config.alignment).is_none());
    }
}
