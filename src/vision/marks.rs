//! Bubble-fill detection over binarized grid regions
//!
//! Three detectors share the same partitioning idea but differ in how they
//! decide. The answer grid and the student number take the best fill ratio
//! per row against a floor threshold: "no mark" is a legitimate outcome per
//! question. The single-choice selector additionally demands dominance over
//! the runner-up, because a selector must actively reject near-ties.

use image::{GrayImage, Luma};
use imageproc::contours::{find_contours, BorderType};
use imageproc::contrast::otsu_level;
use imageproc::distance_transform::Norm;
use imageproc::filter::gaussian_blur_f32;
use imageproc::morphology::{close, erode};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::config::{AnswerGridConfig, StudentNumberConfig, TestGroupConfig};
use crate::vision::polygon_area;

/// column index -> question index -> marked choice letter.
///
/// Both indices are 1-based and contiguous. `None` records a question with no
/// readable mark, which is distinct from a question absent from the map
/// (never processed).
pub type AnswerGrid = BTreeMap<u32, BTreeMap<u32, Option<char>>>;

/// The 29 letters answer choices and group labels may use.
pub const CHOICE_ALPHABET: [char; 29] = [
    'A', 'B', 'C', 'Ç', 'D', 'E', 'F', 'G', 'Ğ', 'H', 'I', 'İ', 'J', 'K', 'L', 'M', 'N', 'O', 'Ö',
    'P', 'R', 'S', 'Ş', 'T', 'U', 'Ü', 'V', 'Y', 'Z',
];

/// Fraction of a choice cell's width trimmed from both edges so shared grid
/// lines are not counted as fill.
const CELL_PADDING_FRACTION: f32 = 0.05;

const CELL_BLUR_SIGMA: f32 = 1.0;

/// Outcome of the single-choice selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupSelection {
    Selected(String),
    /// Two candidates scored too close together to call.
    Ambiguous,
    NotFound,
}

/// Filled-pixel fraction of one candidate cell: blur, Otsu threshold,
/// morphological closing, then count.
fn fill_ratio(cell: &GrayImage) -> f64 {
    let (width, height) = cell.dimensions();
    if width == 0 || height == 0 {
        return 0.0;
    }

    let blurred = gaussian_blur_f32(cell, CELL_BLUR_SIGMA);
    let level = otsu_level(&blurred);
    let binary = GrayImage::from_fn(width, height, |x, y| {
        if blurred.get_pixel(x, y).0[0] > level {
            Luma([255u8])
        } else {
            Luma([0u8])
        }
    });
    let closed = close(&binary, Norm::LInf, 1);

    let filled = closed.pixels().filter(|p| p.0[0] > 0).count();
    filled as f64 / f64::from(width * height)
}

/// Pick the winning index from per-cell fill ratios. The maximum wins only
/// when it reaches the threshold; a ratio exactly equal to the threshold
/// counts as filled.
fn decide_row(ratios: &[f64], threshold: f64) -> Option<usize> {
    let (best_idx, best_ratio) = ratios
        .iter()
        .enumerate()
        .fold((None, 0.0f64), |(idx, max), (i, &r)| {
            if r > max {
                (Some(i), r)
            } else {
                (idx, max)
            }
        });
    best_idx.filter(|_| best_ratio >= threshold)
}

/// Fill ratios of the equal-width cells a row band splits into, with 5% of a
/// cell's width trimmed from both edges of every cell.
fn row_fill_ratios(area: &GrayImage, num_cells: u32) -> Vec<f64> {
    let (width, height) = area.dimensions();
    if width == 0 || height == 0 || num_cells == 0 {
        return vec![0.0; num_cells as usize];
    }

    let cell_width = width / num_cells;
    let padding = (cell_width as f32 * CELL_PADDING_FRACTION) as u32;

    (0..num_cells)
        .map(|i| {
            let x_start = (i * cell_width + padding).min(width);
            let x_end = ((i + 1) * cell_width).saturating_sub(padding).min(width);
            if x_end <= x_start {
                return 0.0;
            }
            let cell = image::imageops::crop_imm(area, x_start, 0, x_end - x_start, height)
                .to_image();
            fill_ratio(&cell)
        })
        .collect()
}

/// Detect the marked choice per question across the whole answer grid.
///
/// The region splits into `num_columns` equal-width column bands, each into
/// `num_questions` equal-height question rows, each into `num_choices` cells.
/// Winner-takes-all per row against the fill threshold; no dominance check.
pub fn detect_answers(roi: &GrayImage, config: &AnswerGridConfig) -> AnswerGrid {
    let (width, height) = roi.dimensions();
    let mut answers = AnswerGrid::new();

    let column_width = width / config.num_columns;
    let question_height = height / config.num_questions;
    if column_width == 0 || question_height == 0 {
        warn!(width, height, "answer region too small for the configured grid");
        return answers;
    }

    for col in 0..config.num_columns {
        let mut column = BTreeMap::new();
        let column_area = image::imageops::crop_imm(roi, col * column_width, 0, column_width, height)
            .to_image();

        for q in 0..config.num_questions {
            let question_area = image::imageops::crop_imm(
                &column_area,
                0,
                q * question_height,
                column_width,
                question_height,
            )
            .to_image();

            let ratios = row_fill_ratios(&question_area, config.num_choices);
            let mark = decide_row(&ratios, config.fill_threshold)
                .map(|choice| (b'A' + choice as u8) as char);
            column.insert(q + 1, mark);
        }
        answers.insert(col + 1, column);
    }

    debug!(
        columns = config.num_columns,
        questions = config.num_questions,
        "answer grid decoded"
    );
    answers
}

/// Decode the student number grid: one column per digit position, one row per
/// option (digits 0-9 conventionally). An undetermined position is `None`.
/// The last band on each axis absorbs the integer-division remainder.
pub fn detect_identifier(roi: &GrayImage, config: &StudentNumberConfig) -> Vec<Option<u8>> {
    let (width, height) = roi.dimensions();
    let num_digits = config.num_digits;
    let num_options = config.num_options;

    let digit_width = width / num_digits;
    if digit_width == 0 || height / num_options == 0 {
        warn!(width, height, "student number region too small for the configured grid");
        return vec![None; num_digits as usize];
    }

    (0..num_digits)
        .map(|i| {
            let x_start = i * digit_width;
            let x_end = if i + 1 == num_digits { width } else { (i + 1) * digit_width };
            let digit_area =
                image::imageops::crop_imm(roi, x_start, 0, x_end - x_start, height).to_image();

            let option_height = digit_area.height() / num_options;
            let ratios: Vec<f64> = (0..num_options)
                .map(|j| {
                    let y_start = j * option_height;
                    let y_end = if j + 1 == num_options {
                        digit_area.height()
                    } else {
                        (j + 1) * option_height
                    };
                    let option_area = image::imageops::crop_imm(
                        &digit_area,
                        0,
                        y_start,
                        digit_area.width(),
                        y_end - y_start,
                    )
                    .to_image();
                    fill_ratio(&option_area)
                })
                .collect();

            decide_row(&ratios, config.fill_threshold).map(|option| option as u8)
        })
        .collect()
}

/// Render a decoded identifier with `-` for undetermined positions.
pub fn render_identifier(digits: &[Option<u8>]) -> String {
    digits
        .iter()
        .map(|d| match d {
            Some(v) => char::from(b'0' + v),
            None => '-',
        })
        .collect()
}

/// Detect the single marked label of a selector region (e.g. the test group).
///
/// Contour-area dominance instead of raw fill: the region is inverted and
/// eroded, each label band scores the largest contour above the area floor,
/// and the best label must beat the runner-up by the dominance margin as well
/// as reach the fill threshold.
pub fn detect_selector(
    roi: &GrayImage,
    labels: &[String],
    config: &TestGroupConfig,
) -> GroupSelection {
    if labels.is_empty() {
        return GroupSelection::NotFound;
    }
    let (width, height) = roi.dimensions();
    let num_bands = labels.len() as u32;
    let band_width = width / num_bands;
    if band_width == 0 || height == 0 {
        warn!(width, height, "selector region too small for its label bands");
        return GroupSelection::NotFound;
    }

    let inverted = GrayImage::from_fn(width, height, |x, y| {
        Luma([255u8 - roi.get_pixel(x, y).0[0]])
    });
    let eroded = erode(&inverted, Norm::LInf, 1);

    let mut scores: Vec<(String, f64)> = labels
        .iter()
        .enumerate()
        .map(|(i, label)| {
            let x_start = i as u32 * band_width;
            let x_end = if i + 1 == labels.len() {
                width
            } else {
                (i as u32 + 1) * band_width
            };
            let band =
                image::imageops::crop_imm(&eroded, x_start, 0, x_end - x_start, height).to_image();

            let largest_area = find_contours::<i32>(&band)
                .iter()
                .filter(|c| c.border_type == BorderType::Outer)
                .map(|c| polygon_area(&c.points))
                .filter(|&area| area >= config.min_contour_area)
                .fold(0.0f64, f64::max);

            let band_pixels = f64::from(band.width() * band.height());
            let score = largest_area / band_pixels;
            debug!(label = %label, score, "selector band scored");
            (label.clone(), score)
        })
        .collect();

    scores.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    decide_selector(&scores, config.dominance_margin, config.fill_threshold)
}

/// Decision rule over descending-sorted label scores. With two or more
/// candidates the winner needs a gap of at least the dominance margin over
/// the runner-up (a gap exactly equal to the margin is dominant) and must
/// reach the fill threshold.
fn decide_selector(
    scores: &[(String, f64)],
    dominance_margin: f64,
    fill_threshold: f64,
) -> GroupSelection {
    match scores {
        [] => GroupSelection::NotFound,
        [(label, top)] => {
            if *top >= fill_threshold {
                GroupSelection::Selected(label.clone())
            } else {
                GroupSelection::NotFound
            }
        }
        [(label, top), (_, second), ..] => {
            if top - second >= dominance_margin && *top >= fill_threshold {
                GroupSelection::Selected(label.clone())
            } else {
                warn!(
                    top = *top,
                    second = *second,
                    "selector scores too close or too weak; ambiguous"
                );
                GroupSelection::Ambiguous
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AnswerGridConfig, StudentNumberConfig, TestGroupConfig};

    fn labels(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    /// Paint a bubble-like blob into the given choice cell of a grid, inset
    /// from the cell edges the way a real pencil mark sits inside its bubble.
    fn fill_cell(
        image: &mut GrayImage,
        cols: u32,
        rows: u32,
        col: u32,
        row: u32,
        sub_cells: u32,
        sub_cell: u32,
    ) {
        let cell_w = image.width() / cols;
        let cell_h = image.height() / rows;
        let sub_w = cell_w / sub_cells;
        let x0 = col * cell_w + sub_cell * sub_w;
        let y0 = row * cell_h;
        let inset_x = sub_w / 10 + 1;
        let inset_y = cell_h / 10 + 1;
        for y in y0 + inset_y..y0 + cell_h - inset_y {
            for x in x0 + inset_x..x0 + sub_w - inset_x {
                image.put_pixel(x, y, Luma([255u8]));
            }
        }
    }

    #[test]
    fn test_decide_row_threshold_boundary() {
        // Exactly at the threshold counts as filled; strictly below does not.
        assert_eq!(decide_row(&[0.1, 0.3, 0.05], 0.3), Some(1));
        assert_eq!(decide_row(&[0.1, 0.299, 0.05], 0.3), None);
    }

    #[test]
    fn test_decide_row_empty_cells() {
        assert_eq!(decide_row(&[0.0, 0.0, 0.0], 0.3), None);
    }

    #[test]
    fn test_decide_selector_dominance_margin_boundary() {
        // Gap above the margin: dominant.
        let s = [("A".to_string(), 0.30), ("B".to_string(), 0.24)];
        assert_eq!(
            decide_selector(&s, 0.05, 0.2),
            GroupSelection::Selected("A".into())
        );

        // Gap below the margin: ambiguous.
        let s = [("A".to_string(), 0.30), ("B".to_string(), 0.27)];
        assert_eq!(decide_selector(&s, 0.05, 0.2), GroupSelection::Ambiguous);

        // Gap exactly equal to the margin still counts as dominant.
        let s = [("A".to_string(), 0.30), ("B".to_string(), 0.25)];
        assert_eq!(
            decide_selector(&s, 0.05, 0.2),
            GroupSelection::Selected("A".into())
        );
    }

    #[test]
    fn test_decide_selector_needs_fill_threshold_too() {
        // Dominant gap but the top score is below the fill threshold.
        let s = [("A".to_string(), 0.15), ("B".to_string(), 0.01)];
        assert_eq!(decide_selector(&s, 0.05, 0.2), GroupSelection::Ambiguous);
    }

    #[test]
    fn test_decide_selector_single_label() {
        let s = [("A".to_string(), 0.25)];
        assert_eq!(
            decide_selector(&s, 0.05, 0.2),
            GroupSelection::Selected("A".into())
        );
        let s = [("A".to_string(), 0.1)];
        assert_eq!(decide_selector(&s, 0.05, 0.2), GroupSelection::NotFound);
        assert_eq!(decide_selector(&[], 0.05, 0.2), GroupSelection::NotFound);
    }

    #[test]
    fn test_detect_answers_single_filled_column() {
        // 4 columns x 10 questions x 4 choices; every question in column 1
        // marks choice A, everything else stays blank.
        let config = AnswerGridConfig {
            num_columns: 4,
            num_questions: 10,
            num_choices: 4,
            fill_threshold: 0.3,
        };
        let mut roi = GrayImage::new(320, 200);
        for q in 0..10 {
            fill_cell(&mut roi, 4, 10, 0, q, 4, 0);
        }

        let answers = detect_answers(&roi, &config);
        assert_eq!(answers.len(), 4);
        for q in 1..=10 {
            assert_eq!(answers[&1][&q], Some('A'), "question {q} in column 1");
        }
        for col in 2..=4 {
            for q in 1..=10 {
                assert_eq!(answers[&col][&q], None, "column {col} question {q}");
            }
        }
    }

    #[test]
    fn test_detect_answers_too_small_region_is_empty() {
        let config = AnswerGridConfig {
            num_columns: 4,
            num_questions: 10,
            num_choices: 4,
            fill_threshold: 0.3,
        };
        let roi = GrayImage::new(3, 5);
        assert!(detect_answers(&roi, &config).is_empty());
    }

    #[test]
    fn test_detect_identifier_reads_digits() {
        // 3 digit columns x 10 options; mark digit 2 in the first column and
        // digit 9 in the third, leave the middle column blank.
        let config = StudentNumberConfig {
            num_digits: 3,
            num_options: 10,
            fill_threshold: 0.3,
        };
        let mut roi = GrayImage::new(90, 200);
        // Column 0, option 2 (band y 40..60), blob inset from the band edges.
        for y in 43..57 {
            for x in 4..26 {
                roi.put_pixel(x, y, Luma([255u8]));
            }
        }
        // Column 2, option 9 (band y 180..200).
        for y in 183..197 {
            for x in 64..86 {
                roi.put_pixel(x, y, Luma([255u8]));
            }
        }

        let digits = detect_identifier(&roi, &config);
        assert_eq!(digits, vec![Some(2), None, Some(9)]);
        assert_eq!(render_identifier(&digits), "2-9");
    }

    #[test]
    fn test_render_identifier_all_unknown() {
        assert_eq!(render_identifier(&[None, None, None, None]), "----");
    }

    #[test]
    fn test_detect_selector_clear_winner() {
        let config = TestGroupConfig {
            groups: labels(&["A", "B", "C", "D"]),
            min_contour_area: 20.0,
            fill_threshold: 0.1,
            dominance_margin: 0.05,
        };
        // Binarized selector region: marks are foreground (white), so the
        // band for "B" is dark in the *input* (which detect_selector inverts).
        let mut roi = GrayImage::from_pixel(120, 30, Luma([255u8]));
        // Dark blob in band 1 (x 30..60).
        for y in 5..25 {
            for x in 35..55 {
                roi.put_pixel(x, y, Luma([0u8]));
            }
        }

        assert_eq!(
            detect_selector(&roi, &config.groups, &config),
            GroupSelection::Selected("B".into())
        );
    }

    #[test]
    fn test_detect_selector_blank_region_not_found_or_ambiguous() {
        let config = TestGroupConfig {
            groups: labels(&["A", "B"]),
            min_contour_area: 20.0,
            fill_threshold: 0.1,
            dominance_margin: 0.05,
        };
        let roi = GrayImage::from_pixel(80, 30, Luma([255u8]));
        // All bands score zero: tie at 0.0, below the threshold.
        assert_eq!(
            detect_selector(&roi, &config.groups, &config),
            GroupSelection::Ambiguous
        );
    }
}
