//! Geometric normalization of a photographed sheet
//!
//! Border cropping, optional quadrilateral rectification and rotational
//! deskew. This stage never fails: every step that cannot find what it is
//! looking for passes the image through unchanged.

use image::{GrayImage, Luma};
use imageproc::contours::{find_contours, BorderType, Contour};
use imageproc::edges::canny;
use imageproc::filter::gaussian_blur_f32;
use imageproc::geometric_transformations::{rotate_about_center, warp_into, Interpolation, Projection};
use imageproc::geometry::{approximate_polygon_dp, arc_length};
use imageproc::hough::{detect_lines, LineDetectionOptions};
use imageproc::point::Point;
use tracing::{debug, info, warn};

use crate::config::ScanConfig;
use crate::vision::polygon_area;

/// Run the full normalization stage: crop stray borders, optionally rectify
/// the sheet outline, then correct rotational skew.
pub fn normalize(image: GrayImage, config: &ScanConfig) -> GrayImage {
    let cropped = crop_borders(&image, config.normalize.crop_threshold);

    let rectified = if config.normalize.rectify {
        match find_document_quad(&cropped, config) {
            Some(quad) => rectify_perspective(&cropped, &quad),
            None => {
                debug!("no four-corner document outline found; skipping rectification");
                cropped
            }
        }
    } else {
        cropped
    };

    deskew(rectified, config)
}

/// Crop the image to the bounding rectangle of its largest bright region,
/// removing black borders left by the camera or scanner bed. Pass-through
/// when nothing qualifies.
pub fn crop_borders(image: &GrayImage, threshold: u8) -> GrayImage {
    let mask = GrayImage::from_fn(image.width(), image.height(), |x, y| {
        if image.get_pixel(x, y).0[0] > threshold {
            Luma([255u8])
        } else {
            Luma([0u8])
        }
    });

    let contours = find_contours::<i32>(&mask);
    let largest = contours
        .iter()
        .filter(|c| c.border_type == BorderType::Outer)
        .max_by(|a, b| {
            polygon_area(&a.points)
                .partial_cmp(&polygon_area(&b.points))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

    match largest {
        Some(contour) => {
            let (x, y, w, h) = contour_bounds(contour);
            debug!(x, y, w, h, "cropped stray borders");
            image::imageops::crop_imm(image, x, y, w, h).to_image()
        }
        None => {
            debug!("no contour to crop against; image unchanged");
            image.clone()
        }
    }
}

fn contour_bounds(contour: &Contour<i32>) -> (u32, u32, u32, u32) {
    let min_x = contour.points.iter().map(|p| p.x).min().unwrap_or(0).max(0) as u32;
    let min_y = contour.points.iter().map(|p| p.y).min().unwrap_or(0).max(0) as u32;
    let max_x = contour.points.iter().map(|p| p.x).max().unwrap_or(0).max(0) as u32;
    let max_y = contour.points.iter().map(|p| p.y).max().unwrap_or(0).max(0) as u32;
    (min_x, min_y, max_x - min_x + 1, max_y - min_y + 1)
}

/// Find the sheet outline: the largest edge contour that approximates to a
/// four-corner polygon.
pub fn find_document_quad(image: &GrayImage, config: &ScanConfig) -> Option<[Point<i32>; 4]> {
    let blurred = gaussian_blur_f32(image, config.deskew.blur_sigma);
    let edges = canny(&blurred, config.deskew.canny_low, config.deskew.canny_high);

    let mut contours: Vec<Contour<i32>> = find_contours::<i32>(&edges)
        .into_iter()
        .filter(|c| c.border_type == BorderType::Outer)
        .collect();
    contours.sort_by(|a, b| {
        polygon_area(&b.points)
            .partial_cmp(&polygon_area(&a.points))
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    for contour in &contours {
        let perimeter = arc_length(&contour.points, true);
        let approx = approximate_polygon_dp(
            &contour.points,
            config.normalize.poly_epsilon_factor * perimeter,
            true,
        );
        if approx.len() == 4 {
            debug!("document outline found");
            return Some([approx[0], approx[1], approx[2], approx[3]]);
        }
    }
    None
}

/// Order four quadrilateral corners as top-left, top-right, bottom-right,
/// bottom-left. Top-left has the minimum coordinate sum, bottom-right the
/// maximum; top-right has the minimum y-x difference, bottom-left the maximum.
pub fn order_corners(pts: &[Point<i32>; 4]) -> [(f32, f32); 4] {
    let sum = |p: &Point<i32>| p.x + p.y;
    let diff = |p: &Point<i32>| p.y - p.x;

    let tl = pts.iter().min_by_key(|p| sum(p)).unwrap();
    let br = pts.iter().max_by_key(|p| sum(p)).unwrap();
    let tr = pts.iter().min_by_key(|p| diff(p)).unwrap();
    let bl = pts.iter().max_by_key(|p| diff(p)).unwrap();

    [
        (tl.x as f32, tl.y as f32),
        (tr.x as f32, tr.y as f32),
        (br.x as f32, br.y as f32),
        (bl.x as f32, bl.y as f32),
    ]
}

/// Warp the quadrilateral outline to an axis-aligned rectangle whose sides
/// are the longer of each pair of opposite edges.
pub fn rectify_perspective(image: &GrayImage, quad: &[Point<i32>; 4]) -> GrayImage {
    let [tl, tr, br, bl] = order_corners(quad);

    let dist = |a: (f32, f32), b: (f32, f32)| ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt();
    let max_width = dist(br, bl).max(dist(tr, tl)).round() as u32;
    let max_height = dist(tr, br).max(dist(tl, bl)).round() as u32;
    if max_width == 0 || max_height == 0 {
        warn!("degenerate document outline; skipping rectification");
        return image.clone();
    }

    let dst = [
        (0.0, 0.0),
        (max_width as f32 - 1.0, 0.0),
        (max_width as f32 - 1.0, max_height as f32 - 1.0),
        (0.0, max_height as f32 - 1.0),
    ];

    match Projection::from_control_points([tl, tr, br, bl], dst) {
        Some(projection) => {
            let mut output = GrayImage::new(max_width, max_height);
            warp_into(
                image,
                &projection,
                Interpolation::Bilinear,
                Luma([255u8]),
                &mut output,
            );
            info!(max_width, max_height, "perspective rectified");
            output
        }
        None => {
            warn!("projective transform from outline corners failed; skipping rectification");
            image.clone()
        }
    }
}

/// Correct rotational skew: Hough lines vote on the sheet's dominant lean and
/// the image is rotated back by the median deviation. A sheet with no
/// qualifying lines, or one already straight enough, passes through.
pub fn deskew(image: GrayImage, config: &ScanConfig) -> GrayImage {
    let cfg = &config.deskew;

    let blurred = gaussian_blur_f32(&image, cfg.blur_sigma);
    let edges = canny(&blurred, cfg.canny_low, cfg.canny_high);
    let lines = detect_lines(
        &edges,
        LineDetectionOptions {
            vote_threshold: cfg.hough_vote_threshold,
            suppression_radius: cfg.hough_suppression_radius,
        },
    );

    // angle_in_degrees is 0..180 with 90 meaning vertical; the deviation from
    // vertical is what the rotation has to undo.
    let mut deviations: Vec<f32> = lines
        .iter()
        .map(|line| line.angle_in_degrees as f32 - 90.0)
        .filter(|dev| cfg.angle_range[0] < *dev && *dev < cfg.angle_range[1])
        .collect();

    if deviations.is_empty() {
        debug!("no lines inside the plausible skew range; deskew skipped");
        return image;
    }

    let angle = median(&mut deviations);
    if angle.abs() <= cfg.min_rotation_deg {
        debug!(angle, "median skew below rotation threshold; deskew skipped");
        return image;
    }

    info!(angle, "rotating sheet by median skew");
    rotate_about_center(
        &image,
        angle.to_radians(),
        Interpolation::Bilinear,
        Luma([255u8]),
    )
}

fn median(values: &mut [f32]) -> f32 {
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}
