//! Homography estimation from keypoint correspondences
//!
//! Direct Linear Transform with Hartley normalization, wrapped in a RANSAC
//! loop. The RANSAC sampler runs from a fixed seed: aligning the same image
//! twice yields the same transform.

use nalgebra::{DMatrix, Matrix3, Vector3};
use rand::prelude::*;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum HomographyError {
    #[error("need at least {needed} correspondences, got {got}")]
    TooFewPoints { needed: usize, got: usize },
    #[error("homography estimation degenerated: {0}")]
    Degenerate(String),
    #[error("only {found} of the required {needed} inliers survived")]
    TooFewInliers { needed: usize, found: usize },
}

/// RANSAC settings for [`estimate_ransac`].
#[derive(Debug, Clone)]
pub struct RansacParams {
    pub max_iters: usize,
    /// Reprojection error in pixels below which a correspondence is an inlier.
    pub inlier_threshold: f64,
    pub min_inliers: usize,
    pub seed: u64,
}

impl Default for RansacParams {
    fn default() -> Self {
        Self {
            max_iters: 1000,
            inlier_threshold: 5.0,
            min_inliers: 4,
            seed: 0,
        }
    }
}

/// Apply `h` to a 2D point: H * [x, y, 1]^T, dehomogenized.
pub fn project(h: &Matrix3<f64>, x: f64, y: f64) -> (f64, f64) {
    let p = h * Vector3::new(x, y, 1.0);
    if p[2].abs() < 1e-15 {
        return (f64::NAN, f64::NAN);
    }
    (p[0] / p[2], p[1] / p[2])
}

fn reprojection_error(h: &Matrix3<f64>, src: (f64, f64), dst: (f64, f64)) -> f64 {
    let (px, py) = project(h, src.0, src.1);
    ((px - dst.0).powi(2) + (py - dst.1).powi(2)).sqrt()
}

/// Hartley normalization: centroid to origin, mean distance sqrt(2).
fn normalize_points(pts: &[(f64, f64)]) -> (Matrix3<f64>, Vec<(f64, f64)>) {
    let n = pts.len() as f64;
    let cx: f64 = pts.iter().map(|p| p.0).sum::<f64>() / n;
    let cy: f64 = pts.iter().map(|p| p.1).sum::<f64>() / n;

    let mean_dist: f64 = pts
        .iter()
        .map(|p| ((p.0 - cx).powi(2) + (p.1 - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;

    let s = if mean_dist > 1e-15 {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };

    let t = Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0);
    let normalized = pts.iter().map(|p| (s * (p.0 - cx), s * (p.1 - cy))).collect();
    (t, normalized)
}

/// Estimate a homography mapping `src` onto `dst` from at least four
/// correspondences.
pub fn estimate_dlt(
    src: &[(f64, f64)],
    dst: &[(f64, f64)],
) -> Result<Matrix3<f64>, HomographyError> {
    let n = src.len();
    if n < 4 || dst.len() < 4 {
        return Err(HomographyError::TooFewPoints {
            needed: 4,
            got: n.min(dst.len()),
        });
    }
    if src.len() != dst.len() {
        return Err(HomographyError::Degenerate(
            "source and destination counts differ".into(),
        ));
    }

    let (t_src, src_n) = normalize_points(src);
    let (t_dst, dst_n) = normalize_points(dst);

    let mut a = DMatrix::zeros(2 * n, 9);
    for i in 0..n {
        let (sx, sy) = src_n[i];
        let (dx, dy) = dst_n[i];

        a[(2 * i, 3)] = -sx;
        a[(2 * i, 4)] = -sy;
        a[(2 * i, 5)] = -1.0;
        a[(2 * i, 6)] = dy * sx;
        a[(2 * i, 7)] = dy * sy;
        a[(2 * i, 8)] = dy;

        a[(2 * i + 1, 0)] = sx;
        a[(2 * i + 1, 1)] = sy;
        a[(2 * i + 1, 2)] = 1.0;
        a[(2 * i + 1, 6)] = -dx * sx;
        a[(2 * i + 1, 7)] = -dx * sy;
        a[(2 * i + 1, 8)] = -dx;
    }

    // The solution is the eigenvector of A^T A with the smallest eigenvalue.
    let ata = a.transpose() * &a;
    let eig = nalgebra::SymmetricEigen::new(ata);

    let mut min_idx = 0;
    let mut min_val = eig.eigenvalues[0].abs();
    for i in 1..9 {
        let v = eig.eigenvalues[i].abs();
        if v < min_val {
            min_val = v;
            min_idx = i;
        }
    }

    let h_norm = Matrix3::from_fn(|r, c| eig.eigenvectors[(3 * r + c, min_idx)]);

    let t_dst_inv = t_dst
        .try_inverse()
        .ok_or_else(|| HomographyError::Degenerate("destination transform not invertible".into()))?;
    let h = t_dst_inv * h_norm * t_src;

    let scale = h[(2, 2)];
    if scale.abs() < 1e-15 {
        Ok(h)
    } else {
        Ok(h / scale)
    }
}

/// Outlier-tolerant homography fit. Samples minimal four-point sets with a
/// seeded generator, keeps the model with the most inliers, then refits on
/// the full inlier set.
pub fn estimate_ransac(
    src: &[(f64, f64)],
    dst: &[(f64, f64)],
    params: &RansacParams,
) -> Result<Matrix3<f64>, HomographyError> {
    let n = src.len();
    if n < 4 {
        return Err(HomographyError::TooFewPoints { needed: 4, got: n });
    }

    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut best_inliers: Vec<usize> = Vec::new();

    for _ in 0..params.max_iters {
        let mut indices = [0usize; 4];
        let mut attempts = 0;
        loop {
            for idx in &mut indices {
                *idx = rng.gen_range(0..n);
            }
            let distinct = (0..4).all(|i| ((i + 1)..4).all(|j| indices[i] != indices[j]));
            if distinct {
                break;
            }
            attempts += 1;
            if attempts > 100 {
                break;
            }
        }

        let s4: Vec<(f64, f64)> = indices.iter().map(|&i| src[i]).collect();
        let d4: Vec<(f64, f64)> = indices.iter().map(|&i| dst[i]).collect();

        let h = match estimate_dlt(&s4, &d4) {
            Ok(h) => h,
            Err(_) => continue,
        };

        let inliers: Vec<usize> = (0..n)
            .filter(|&i| reprojection_error(&h, src[i], dst[i]) < params.inlier_threshold)
            .collect();

        if inliers.len() > best_inliers.len() {
            best_inliers = inliers;
            if best_inliers.len() == n {
                break;
            }
        }
    }

    if best_inliers.len() < params.min_inliers {
        return Err(HomographyError::TooFewInliers {
            needed: params.min_inliers,
            found: best_inliers.len(),
        });
    }

    let src_in: Vec<(f64, f64)> = best_inliers.iter().map(|&i| src[i]).collect();
    let dst_in: Vec<(f64, f64)> = best_inliers.iter().map(|&i| dst[i]).collect();
    estimate_dlt(&src_in, &dst_in)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_points() -> Vec<(f64, f64)> {
        let mut pts = Vec::new();
        for y in 0..5 {
            for x in 0..5 {
                pts.push((x as f64 * 20.0, y as f64 * 20.0));
            }
        }
        pts
    }

    #[test]
    fn test_dlt_recovers_translation() {
        let src = grid_points();
        let dst: Vec<(f64, f64)> = src.iter().map(|p| (p.0 + 13.0, p.1 - 7.0)).collect();

        let h = estimate_dlt(&src, &dst).unwrap();
        for (s, d) in src.iter().zip(&dst) {
            let (px, py) = project(&h, s.0, s.1);
            assert!((px - d.0).abs() < 1e-6);
            assert!((py - d.1).abs() < 1e-6);
        }
    }

    #[test]
    fn test_dlt_rejects_too_few_points() {
        let pts = vec![(0.0, 0.0), (1.0, 0.0), (1.0, 1.0)];
        assert!(matches!(
            estimate_dlt(&pts, &pts),
            Err(HomographyError::TooFewPoints { .. })
        ));
    }

    #[test]
    fn test_ransac_survives_outliers() {
        let src = grid_points();
        let mut dst: Vec<(f64, f64)> = src.iter().map(|p| (p.0 * 1.5 + 10.0, p.1 * 1.5 + 5.0)).collect();
        // Corrupt a fifth of the correspondences.
        for i in (0..dst.len()).step_by(5) {
            dst[i] = (dst[i].0 + 300.0, dst[i].1 - 250.0);
        }

        let h = estimate_ransac(&src, &dst, &RansacParams::default()).unwrap();
        let (px, py) = project(&h, 40.0, 40.0);
        assert!((px - 70.0).abs() < 0.5);
        assert!((py - 65.0).abs() < 0.5);
    }

    #[test]
    fn test_ransac_is_deterministic() {
        let src = grid_points();
        let dst: Vec<(f64, f64)> = src.iter().map(|p| (p.0 + 4.0, p.1 + 9.0)).collect();
        let params = RansacParams::default();

        let h1 = estimate_ransac(&src, &dst, &params).unwrap();
        let h2 = estimate_ransac(&src, &dst, &params).unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn test_ransac_reports_too_few_inliers() {
        // Pure noise: no consistent homography relates src to dst.
        let src = grid_points();
        let dst: Vec<(f64, f64)> = src
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let k = (i * 37 % 101) as f64;
                (p.1 * k + 1000.0, p.0 * (100.0 - k) - 500.0)
            })
            .collect();

        let params = RansacParams {
            min_inliers: 20,
            ..RansacParams::default()
        };
        assert!(matches!(
            estimate_ransac(&src, &dst, &params),
            Err(HomographyError::TooFewInliers { .. })
        ));
    }
}
