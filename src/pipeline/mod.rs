//! Sheet-processing pipeline
//!
//! Orchestrates the vision stages over one photograph and assembles the
//! canonical result record: normalize, align to the template, binarize,
//! locate heading-anchored regions, detect marks, persist and visualize.
//! Stages run strictly forward; a failed required stage short-circuits with
//! a typed error, while the optional student-number and test-group
//! sub-results degrade to unknown instead of aborting the run.

use image::{DynamicImage, GrayImage, Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{RoiConfig, ScanConfig};
use crate::ocr::OcrProvider;
use crate::storage::SheetStore;
use crate::vision::marks::{self, AnswerGrid, GroupSelection};
use crate::vision::{align, binarize, locate, normalize, Roi};

/// Label used when a sheet's student number or test group cannot be read.
const UNKNOWN_LABEL: &str = "Unknown";

/// Typed failure kinds of one pipeline run.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
    #[error("could not read {kind} image {path}: {source}")]
    Asset {
        kind: &'static str,
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("no scale produced a usable homography against the template")]
    AlignmentFailed,
    #[error("heading for the {0} was not found on the sheet")]
    RegionNotFound(&'static str),
    #[error("the {0} could not be extracted")]
    ExtractionFailed(&'static str),
}

/// Canonical record of a decoded student sheet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SheetResult {
    pub student_number: Option<String>,
    pub test_group: Option<String>,
    pub answers: AnswerGrid,
}

/// Canonical record of a decoded answer-key sheet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyResult {
    pub test_group: String,
    pub answers: AnswerGrid,
}

struct Prepared {
    aligned: GrayImage,
    binarized: GrayImage,
}

/// Process a photographed student sheet into a [`SheetResult`].
///
/// The answer area is mandatory; the student number and test group degrade
/// to unknown when their headings cannot be found or their marks are
/// ambiguous. When `store` is given the record is persisted and the
/// student's scores are recalculated.
pub fn process_sheet(
    image_path: &Path,
    config: &ScanConfig,
    ocr: &dyn OcrProvider,
    store: Option<&SheetStore>,
) -> Result<SheetResult, ScanError> {
    let prepared = prepare(image_path, config)?;

    let answer_roi = locate_area(&prepared, config, "answer area", &config.answer_area, ocr)
        .ok_or(ScanError::RegionNotFound("answer area"))?;

    let student_roi = locate_area(
        &prepared,
        config,
        "student number area",
        &config.student_number_area,
        ocr,
    );
    let group_roi = locate_area(
        &prepared,
        config,
        "test group area",
        &config.test_group_area,
        ocr,
    );

    let answers = detect_answer_grid(&prepared, config, answer_roi, "answer_area")?;

    let student_number = student_roi.map(|roi| {
        let crop = roi.crop(&prepared.binarized);
        save_roi_crop(config, "student_number_area", &crop);
        marks::render_identifier(&marks::detect_identifier(&crop, &config.student_number))
    });
    if student_number.is_none() {
        warn!("student number area not found; recording sheet with unknown student");
    }

    let test_group = group_roi.and_then(|roi| {
        let crop = roi.crop(&prepared.binarized);
        save_roi_crop(config, "test_group_area", &crop);
        match marks::detect_selector(&crop, &config.test_group.groups, &config.test_group) {
            GroupSelection::Selected(label) => Some(label),
            GroupSelection::Ambiguous => {
                warn!("test group marks are ambiguous; recording sheet without a group");
                None
            }
            GroupSelection::NotFound => {
                warn!("no test group mark found; recording sheet without a group");
                None
            }
        }
    });

    let result = SheetResult {
        student_number,
        test_group,
        answers,
    };

    save_results_json(config, &result);
    if let Some(store) = store {
        persist_sheet(store, &result);
    }
    save_visualization(
        config,
        &prepared.aligned,
        &[
            ("answer area", Some(answer_roi)),
            ("student number area", student_roi),
            ("test group area", group_roi),
        ],
    );

    info!("sheet processed");
    Ok(result)
}

/// Process a photographed answer-key sheet into a [`KeyResult`].
///
/// Unlike the student-sheet path, an unreadable test group is fatal here: an
/// answer key without a group cannot key anything.
pub fn process_answer_key(
    image_path: &Path,
    config: &ScanConfig,
    ocr: &dyn OcrProvider,
    store: Option<&SheetStore>,
) -> Result<KeyResult, ScanError> {
    let prepared = prepare(image_path, config)?;

    let answer_roi = locate_area(
        &prepared,
        config,
        "answer key area",
        &config.answer_key_area,
        ocr,
    )
    .ok_or(ScanError::RegionNotFound("answer key area"))?;

    let group_roi = locate_area(
        &prepared,
        config,
        "test group area",
        &config.test_group_area,
        ocr,
    )
    .ok_or(ScanError::RegionNotFound("test group area"))?;

    let group_crop = group_roi.crop(&prepared.binarized);
    save_roi_crop(config, "test_group_area", &group_crop);
    let test_group =
        match marks::detect_selector(&group_crop, &config.test_group.groups, &config.test_group) {
            GroupSelection::Selected(label) => label,
            GroupSelection::Ambiguous | GroupSelection::NotFound => {
                return Err(ScanError::ExtractionFailed("test group"));
            }
        };

    let answers = detect_answer_grid(&prepared, config, answer_roi, "answer_key_area")?;

    let result = KeyResult { test_group, answers };

    if let Some(store) = store {
        if let Err(err) = store.record_answer_key(&result.test_group, &result.answers) {
            warn!("could not persist answer key: {err}");
        }
    }
    save_visualization(
        config,
        &prepared.aligned,
        &[
            ("answer key area", Some(answer_roi)),
            ("test group area", Some(group_roi)),
        ],
    );

    info!(group = %result.test_group, "answer key processed");
    Ok(result)
}

/// Shared front half of both runs: load assets, normalize, align, binarize.
fn prepare(image_path: &Path, config: &ScanConfig) -> Result<Prepared, ScanError> {
    let template = image::open(&config.template.path)
        .map_err(|source| ScanError::Asset {
            kind: "template",
            path: config.template.path.clone(),
            source,
        })?
        .to_luma8();

    let photo = image::open(image_path)
        .map_err(|source| ScanError::Asset {
            kind: "input",
            path: image_path.to_path_buf(),
            source,
        })?
        .to_luma8();
    info!(path = %image_path.display(), "sheet photograph loaded");

    let photo = downscale_to_limits(photo, config);
    let normalized = normalize::normalize(photo, config);

    let (aligned, scale) = align::align(&normalized, &template, &config.alignment)
        .ok_or(ScanError::AlignmentFailed)?;
    if config.output.save_debug_images {
        save_gray(
            &config.output.debug_dir,
            &format!("aligned_scale_{scale:.1}.png"),
            &aligned,
        );
    }

    let binarized = binarize::binarize_sheet(&aligned, &config.binarize);
    if config.output.save_debug_images {
        save_gray(&config.output.debug_dir, "binarized.png", &binarized);
    }

    Ok(Prepared { aligned, binarized })
}

/// Shrink oversized photographs to the configured maxima, preserving aspect.
fn downscale_to_limits(image: GrayImage, config: &ScanConfig) -> GrayImage {
    let (width, height) = image.dimensions();
    let limits = &config.input;
    let scale = (limits.max_width as f32 / width as f32)
        .min(limits.max_height as f32 / height as f32)
        .min(1.0);
    if scale >= 1.0 {
        return image;
    }
    let new_w = (width as f32 * scale) as u32;
    let new_h = (height as f32 * scale) as u32;
    debug!(new_w, new_h, "downscaled oversized photograph");
    image::imageops::resize(
        &image,
        new_w,
        new_h,
        image::imageops::FilterType::Triangle,
    )
}

fn locate_area(
    prepared: &Prepared,
    config: &ScanConfig,
    name: &'static str,
    area: &RoiConfig,
    ocr: &dyn OcrProvider,
) -> Option<Roi> {
    let roi = locate::locate_region(
        &prepared.aligned,
        ocr,
        area,
        config.ocr.similarity_threshold,
    );
    match &roi {
        Some(r) => debug!(name, ?r, "region located"),
        None => debug!(name, "region not located"),
    }
    roi
}

fn detect_answer_grid(
    prepared: &Prepared,
    config: &ScanConfig,
    roi: Roi,
    crop_name: &'static str,
) -> Result<AnswerGrid, ScanError> {
    let crop = roi.crop(&prepared.binarized);
    save_roi_crop(config, crop_name, &crop);
    let answers = marks::detect_answers(&crop, &config.answers);
    if answers.is_empty() {
        return Err(ScanError::ExtractionFailed("answer grid"));
    }
    Ok(answers)
}

fn persist_sheet(store: &SheetStore, result: &SheetResult) {
    let student = result.student_number.as_deref().unwrap_or(UNKNOWN_LABEL);
    let group = result.test_group.as_deref().unwrap_or(UNKNOWN_LABEL);

    // Collaborator failures are logged and never abort the run.
    match store.record_sheet(student, group, &result.answers) {
        Ok(student_id) => {
            // Scoring is an explicit follow-up operation, not a side effect
            // of the answer writes.
            if let Err(err) = store.recalculate_results(student_id) {
                warn!("could not recalculate student results: {err}");
            }
        }
        Err(err) => warn!("could not persist sheet record: {err}"),
    }
}

// -- Output sinks -------------------------------------------------------------
//
// Everything below is best-effort: a failed write warns and the run carries on.

fn save_gray(dir: &Path, name: &str, image: &GrayImage) {
    if let Err(err) = std::fs::create_dir_all(dir) {
        warn!(dir = %dir.display(), "could not create output directory: {err}");
        return;
    }
    let path = dir.join(name);
    if let Err(err) = image.save(&path) {
        warn!(path = %path.display(), "could not save image: {err}");
    } else {
        debug!(path = %path.display(), "image saved");
    }
}

fn save_roi_crop(config: &ScanConfig, name: &str, crop: &GrayImage) {
    if config.output.save_rois {
        save_gray(&config.output.rois_dir, &format!("{name}.png"), crop);
    }
}

fn save_results_json(config: &ScanConfig, result: &SheetResult) {
    if !config.output.save_results {
        return;
    }
    let path = &config.output.results_path;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                warn!(dir = %parent.display(), "could not create results directory: {err}");
                return;
            }
        }
    }
    match serde_json::to_string_pretty(result) {
        Ok(json) => {
            if let Err(err) = std::fs::write(path, json) {
                warn!(path = %path.display(), "could not write results: {err}");
            }
        }
        Err(err) => warn!("could not serialize results: {err}"),
    }
}

/// Draw one hollow rectangle per located region over the aligned sheet.
/// Region identity is color-coded in drawing order; the legend is logged.
fn save_visualization(config: &ScanConfig, aligned: &GrayImage, rois: &[(&str, Option<Roi>)]) {
    if !config.output.save_visualization {
        return;
    }

    const COLORS: [Rgb<u8>; 4] = [
        Rgb([0u8, 200, 0]),
        Rgb([0u8, 80, 255]),
        Rgb([255u8, 60, 0]),
        Rgb([200u8, 0, 200]),
    ];

    let mut canvas: RgbImage = DynamicImage::ImageLuma8(aligned.clone()).to_rgb8();
    for (i, (name, roi)) in rois.iter().enumerate() {
        let Some(roi) = roi else { continue };
        let color = COLORS[i % COLORS.len()];
        let rect = Rect::at(roi.x_start as i32, roi.y_start as i32)
            .of_size(roi.width(), roi.height());
        draw_hollow_rect_mut(&mut canvas, rect, color);
        info!(name = *name, ?color, "visualization region drawn");
    }

    let dir = &config.output.visualization_dir;
    if let Err(err) = std::fs::create_dir_all(dir) {
        warn!(dir = %dir.display(), "could not create visualization directory: {err}");
        return;
    }
    let path = dir.join("visualization.png");
    if let Err(err) = canvas.save(&path) {
        warn!(path = %path.display(), "could not save visualization: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocr::{OcrScan, SpanBounds, TextSpan};
    use image::Luma;
    use rand::prelude::*;
    use std::cell::Cell;
    use tempfile::TempDir;

    struct CannedOcr {
        spans: Vec<TextSpan>,
        calls: Cell<u32>,
    }

    impl CannedOcr {
        fn empty() -> Self {
            Self {
                spans: Vec::new(),
                calls: Cell::new(0),
            }
        }

        fn with_spans(spans: Vec<TextSpan>) -> Self {
            Self {
                spans,
                calls: Cell::new(0),
            }
        }
    }

    impl OcrProvider for CannedOcr {
        fn recognize(&self, _image: &GrayImage) -> OcrScan {
            self.calls.set(self.calls.get() + 1);
            OcrScan {
                full_text: String::new(),
                spans: self.spans.clone(),
            }
        }
    }

    /// Corner-rich synthetic sheet the aligner can latch onto.
    fn textured_sheet(width: u32, height: u32) -> GrayImage {
        let mut image = GrayImage::from_pixel(width, height, Luma([255u8]));
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..70 {
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

    fn test_config(dir: &TempDir) -> ScanConfig {
        let mut config = ScanConfig::default();
        config.template.path = dir.path().join("template.png");
        config.alignment.max_keypoints = 400;
        config.alignment.min_matches = 8;
        config.alignment.ransac_iters = 100;
        config.answer_area.width = 150;
        config.answer_area.height = 150;
        config.output.save_debug_images = false;
        config.output.save_rois = false;
        config.output.save_visualization = false;
        config.output.save_results = false;
        config
    }

    fn answers_span() -> TextSpan {
        TextSpan {
            text: "CEVAPLAR".into(),
            bounds: SpanBounds {
                x_min: 20,
                y_min: 20,
                x_max: 120,
                y_max: 40,
            },
        }
    }

    #[test]
    fn test_missing_template_is_an_asset_error() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let sheet_path = dir.path().join("sheet.png");
        textured_sheet(240, 300).save(&sheet_path).unwrap();

        let ocr = CannedOcr::empty();
        let err = process_sheet(&sheet_path, &config, &ocr, None).unwrap_err();
        assert!(matches!(err, ScanError::Asset { kind: "template", .. }));
    }

    #[test]
    fn test_ocr_without_spans_is_fatal_for_the_answer_area() {
        // End-to-end: alignment succeeds (sheet == template) but OCR sees
        // nothing, so the mandatory answer heading cannot be located.
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let sheet = textured_sheet(240, 300);
        sheet.save(&config.template.path).unwrap();
        let sheet_path = dir.path().join("sheet.png");
        sheet.save(&sheet_path).unwrap();

        let ocr = CannedOcr::empty();
        let err = process_sheet(&sheet_path, &config, &ocr, None).unwrap_err();
        assert!(matches!(err, ScanError::RegionNotFound("answer area")));
        assert!(ocr.calls.get() > 0);
    }

    #[test]
    fn test_alignment_failure_stops_before_localization() {
        // A featureless sheet yields no keypoints at any of the 11 scales;
        // the OCR collaborator must never be consulted afterwards.
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        textured_sheet(240, 300).save(&config.template.path).unwrap();
        let sheet_path = dir.path().join("flat.png");
        GrayImage::from_pixel(240, 300, Luma([128u8]))
            .save(&sheet_path)
            .unwrap();

        let ocr = CannedOcr::empty();
        let err = process_sheet(&sheet_path, &config, &ocr, None).unwrap_err();
        assert!(matches!(err, ScanError::AlignmentFailed));
        assert_eq!(ocr.calls.get(), 0);
    }

    #[test]
    fn test_sheet_run_degrades_optional_regions_and_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let sheet = textured_sheet(240, 300);
        sheet.save(&config.template.path).unwrap();
        let sheet_path = dir.path().join("sheet.png");
        sheet.save(&sheet_path).unwrap();

        // Only the answer heading is recognizable: the student number and
        // test group degrade to unknown instead of failing the run.
        let ocr = CannedOcr::with_spans(vec![answers_span()]);
        let first = process_sheet(&sheet_path, &config, &ocr, None).unwrap();
        assert_eq!(first.student_number, None);
        assert_eq!(first.test_group, None);
        assert_eq!(first.answers.len() as u32, config.answers.num_columns);

        // Same image, same configuration: identical record.
        let second = process_sheet(&sheet_path, &config, &ocr, None).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_answer_key_run_requires_a_test_group() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.answer_key_area.width = 150;
        config.answer_key_area.height = 150;
        let sheet = textured_sheet(240, 300);
        sheet.save(&config.template.path).unwrap();
        let sheet_path = dir.path().join("key.png");
        sheet.save(&sheet_path).unwrap();

        // The answer-key heading resolves but the test-group heading does not:
        // fatal on this path, unlike the student-sheet path.
        let key_span = TextSpan {
            text: "CEVAP ANAHTARI".into(),
            bounds: SpanBounds {
                x_min: 20,
                y_min: 20,
                x_max: 140,
                y_max: 40,
            },
        };
        let ocr = CannedOcr::with_spans(vec![key_span]);
        let err = process_answer_key(&sheet_path, &config, &ocr, None).unwrap_err();
        assert!(matches!(err, ScanError::RegionNotFound("test group area")));
    }

    #[test]
    fn test_downscale_preserves_small_images() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let image = GrayImage::new(100, 100);
        let out = downscale_to_limits(image.clone(), &config);
        assert_eq!(out.dimensions(), (100, 100));
    }

    #[test]
    fn test_downscale_caps_oversized_images() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.input.max_width = 50;
        config.input.max_height = 50;
        let image = GrayImage::new(200, 100);
        let out = downscale_to_limits(image, &config);
        assert_eq!(out.dimensions(), (50, 25));
    }
}
