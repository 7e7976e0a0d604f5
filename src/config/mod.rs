//! Scanner Configuration
//!
//! Every pipeline tunable lives in a TOML document loaded once per run.
//! Required keys (ROI geometry, grid dimensions, thresholds) have no serde
//! defaults: a missing key fails deserialization before any image work starts.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration loading and validation failures. All of them are fatal and
/// surface before the first image is touched.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("could not write config file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config value: {0}")]
    Invalid(String),
}

/// Scanner settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Input image limits
    #[serde(default)]
    pub input: InputConfig,
    /// Border crop and perspective rectification
    #[serde(default)]
    pub normalize: NormalizeConfig,
    /// Rotational skew correction
    pub deskew: DeskewConfig,
    /// Sheet binarization
    pub binarize: BinarizeConfig,
    /// Template alignment
    pub alignment: AlignmentConfig,
    /// OCR.space collaborator
    pub ocr: OcrConfig,
    /// Answer grid region on student sheets
    pub answer_area: RoiConfig,
    /// Answer grid region on answer-key sheets
    pub answer_key_area: RoiConfig,
    /// Student number region
    pub student_number_area: RoiConfig,
    /// Test group selector region
    pub test_group_area: RoiConfig,
    /// Answer grid dimensions
    pub answers: AnswerGridConfig,
    /// Student number grid dimensions
    pub student_number: StudentNumberConfig,
    /// Test group selector decision rules
    pub test_group: TestGroupConfig,
    /// Reference template asset
    pub template: TemplateConfig,
    /// Debug and result sinks
    #[serde(default)]
    pub output: OutputConfig,
}

/// Upper bounds applied to the input photograph before processing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    /// Maximum width in pixels; larger photos are downscaled
    pub max_width: u32,
    /// Maximum height in pixels
    pub max_height: u32,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            max_width: 2400,
            max_height: 3200,
        }
    }
}

/// Border cropping and optional quadrilateral rectification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizeConfig {
    /// Gray level above which a pixel counts as sheet (not border)
    pub crop_threshold: u8,
    /// Detect the sheet outline and warp it to a rectangle
    pub rectify: bool,
    /// Polygon approximation epsilon as a fraction of the contour perimeter
    pub poly_epsilon_factor: f64,
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            crop_threshold: 1,
            rectify: false,
            poly_epsilon_factor: 0.02,
        }
    }
}

/// Skew detection and correction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeskewConfig {
    /// Gaussian blur sigma applied before edge detection
    pub blur_sigma: f32,
    /// Canny low threshold
    pub canny_low: f32,
    /// Canny high threshold
    pub canny_high: f32,
    /// Minimum Hough accumulator votes for a line
    pub hough_vote_threshold: u32,
    /// Suppression radius between accepted Hough lines
    pub hough_suppression_radius: u32,
    /// Plausible skew range in degrees; deviations outside are discarded
    pub angle_range: [f32; 2],
    /// Rotation is only applied when |median deviation| exceeds this
    pub min_rotation_deg: f32,
}

/// Binarization of the aligned sheet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinarizeConfig {
    /// Median filter radius for despeckling
    pub median_radius: u32,
    /// Morphological opening kernel radius applied to the binary image
    pub morph_open_k: u8,
    /// Adaptive threshold neighbourhood radius
    pub block_radius: u32,
    /// Constant subtracted from the local mean
    pub offset: i32,
}

/// Multi-scale keypoint alignment against the reference template
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlignmentConfig {
    /// Keep at most this many strongest FAST corners per image
    pub max_keypoints: usize,
    /// FAST-9 corner threshold
    pub fast_threshold: u8,
    /// Discard descriptor matches with Hamming distance above this
    pub max_match_distance: u32,
    /// Minimum surviving matches before a homography is attempted
    pub min_matches: usize,
    /// RANSAC iteration count
    pub ransac_iters: usize,
    /// RANSAC reprojection threshold in pixels
    pub reproj_threshold: f64,
}

/// OCR.space request settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrConfig {
    /// Service endpoint URL
    pub endpoint: String,
    /// Environment variable holding the API key
    pub api_key_env: String,
    /// OCR language code
    pub language: String,
    /// Ask the service to auto-detect page orientation
    pub detect_orientation: bool,
    /// Heading similarity threshold (0-100)
    pub similarity_threshold: f64,
}

/// Geometry of a heading-anchored region of interest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoiConfig {
    /// Heading phrases tried in order; first fuzzy match wins
    pub headings: Vec<String>,
    /// Horizontal offset from the heading anchor
    #[serde(default)]
    pub offset_x: i32,
    /// Vertical offset from the heading anchor
    #[serde(default)]
    pub offset_y: i32,
    /// Fixed region width (the detected heading's own size is ignored)
    pub width: u32,
    /// Fixed region height
    pub height: u32,
    /// Extra width margin
    #[serde(default)]
    pub extra_width: u32,
    /// Extra height margin
    #[serde(default)]
    pub extra_height: u32,
    /// Recognized spans shorter than this are never heading candidates
    pub min_text_length: usize,
    /// Recognized spans longer than this are never heading candidates
    pub max_text_length: usize,
}

/// Answer grid layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerGridConfig {
    /// Vertical column bands in the answer area
    pub num_columns: u32,
    /// Question rows per column
    pub num_questions: u32,
    /// Choice cells per question row
    pub num_choices: u32,
    /// Minimum fill ratio for a cell to count as marked
    pub fill_threshold: f64,
}

/// Student number grid layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudentNumberConfig {
    /// Digit columns
    pub num_digits: u32,
    /// Option rows per digit column (conventionally 10, digits 0-9)
    pub num_options: u32,
    /// Minimum fill ratio for a digit bubble to count as marked
    pub fill_threshold: f64,
}

/// Test group selector decision rules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestGroupConfig {
    /// Group labels, one band per label in reading order
    pub groups: Vec<String>,
    /// Contours smaller than this never score
    pub min_contour_area: f64,
    /// Minimum fill score for the winning label
    pub fill_threshold: f64,
    /// Required gap between the best and second-best score
    pub dominance_margin: f64,
}

/// Reference template asset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateConfig {
    /// Path to the grayscale template image
    pub path: PathBuf,
}

/// Debug and result output sinks. Every write here is best-effort; failures
/// are logged and never abort a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Dump intermediate images (binarized sheet, aligned sheet)
    pub save_debug_images: bool,
    /// Dump extracted ROI crops
    pub save_rois: bool,
    /// Render the annotated visualization image
    pub save_visualization: bool,
    /// Write the result record as JSON
    pub save_results: bool,
    /// Directory for intermediate images
    pub debug_dir: PathBuf,
    /// Directory for ROI crops
    pub rois_dir: PathBuf,
    /// Directory for the visualization image
    pub visualization_dir: PathBuf,
    /// Path of the results JSON file
    pub results_path: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            save_debug_images: false,
            save_rois: false,
            save_visualization: false,
            save_results: false,
            debug_dir: PathBuf::from("debug"),
            rois_dir: PathBuf::from("debug/rois"),
            visualization_dir: PathBuf::from("debug"),
            results_path: PathBuf::from("results.json"),
        }
    }
}

impl ScanConfig {
    /// Range checks that serde cannot express. Runs once at load time so
    /// nested accesses never need to re-validate.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.deskew.blur_sigma <= 0.0 {
            return Err(ConfigError::Invalid(
                "deskew.blur_sigma must be positive".into(),
            ));
        }
        if self.deskew.angle_range[0] >= self.deskew.angle_range[1] {
            return Err(ConfigError::Invalid(
                "deskew.angle_range must be an increasing pair".into(),
            ));
        }
        if self.binarize.block_radius == 0 {
            return Err(ConfigError::Invalid(
                "binarize.block_radius must be at least 1".into(),
            ));
        }
        if self.alignment.min_matches < 4 {
            return Err(ConfigError::Invalid(
                "alignment.min_matches must be at least 4 (homography needs 4 correspondences)"
                    .into(),
            ));
        }
        if self.alignment.ransac_iters == 0 {
            return Err(ConfigError::Invalid(
                "alignment.ransac_iters must be at least 1".into(),
            ));
        }
        if !(0.0..=100.0).contains(&self.ocr.similarity_threshold) {
            return Err(ConfigError::Invalid(
                "ocr.similarity_threshold must be between 0 and 100".into(),
            ));
        }
        for (name, roi) in [
            ("answer_area", &self.answer_area),
            ("answer_key_area", &self.answer_key_area),
            ("student_number_area", &self.student_number_area),
            ("test_group_area", &self.test_group_area),
        ] {
            if roi.headings.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "{name}.headings must list at least one phrase"
                )));
            }
            if roi.width == 0 || roi.height == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{name} width and height must be positive"
                )));
            }
            if roi.min_text_length > roi.max_text_length {
                return Err(ConfigError::Invalid(format!(
                    "{name}.min_text_length exceeds max_text_length"
                )));
            }
        }
        if self.answers.num_columns == 0
            || self.answers.num_questions == 0
            || self.answers.num_choices == 0
        {
            return Err(ConfigError::Invalid(
                "answers grid dimensions must all be positive".into(),
            ));
        }
        if self.student_number.num_digits == 0 || self.student_number.num_options == 0 {
            return Err(ConfigError::Invalid(
                "student_number grid dimensions must all be positive".into(),
            ));
        }
        if self.test_group.groups.is_empty() {
            return Err(ConfigError::Invalid(
                "test_group.groups must list at least one label".into(),
            ));
        }
        for (name, threshold) in [
            ("answers.fill_threshold", self.answers.fill_threshold),
            (
                "student_number.fill_threshold",
                self.student_number.fill_threshold,
            ),
            ("test_group.fill_threshold", self.test_group.fill_threshold),
            (
                "test_group.dominance_margin",
                self.test_group.dominance_margin,
            ),
        ] {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be between 0.0 and 1.0"
                )));
            }
        }
        Ok(())
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            input: InputConfig::default(),
            normalize: NormalizeConfig::default(),
            deskew: DeskewConfig {
                blur_sigma: 1.2,
                canny_low: 50.0,
                canny_high: 150.0,
                hough_vote_threshold: 200,
                hough_suppression_radius: 8,
                angle_range: [-15.0, 15.0],
                min_rotation_deg: 0.5,
            },
            binarize: BinarizeConfig {
                median_radius: 1,
                morph_open_k: 1,
                block_radius: 15,
                offset: 10,
            },
            alignment: AlignmentConfig {
                max_keypoints: 1500,
                fast_threshold: 20,
                max_match_distance: 64,
                min_matches: 10,
                ransac_iters: 1000,
                reproj_threshold: 5.0,
            },
            ocr: OcrConfig {
                endpoint: "https://apipro1.ocr.space/parse/image".into(),
                api_key_env: "OCR_SPACE_API_KEY".into(),
                language: "tur".into(),
                detect_orientation: true,
                similarity_threshold: 80.0,
            },
            answer_area: RoiConfig {
                headings: vec!["CEVAPLAR".into(), "ANSWERS".into()],
                offset_x: 0,
                offset_y: 0,
                width: 900,
                height: 620,
                extra_width: 0,
                extra_height: 0,
                min_text_length: 6,
                max_text_length: 15,
            },
            answer_key_area: RoiConfig {
                headings: vec!["CEVAP ANAHTARI".into(), "ANSWER KEY".into()],
                offset_x: 0,
                offset_y: 0,
                width: 900,
                height: 620,
                extra_width: 0,
                extra_height: 0,
                min_text_length: 6,
                max_text_length: 15,
            },
            student_number_area: RoiConfig {
                headings: vec!["ÖĞRENCİ NUMARASI".into(), "STUDENT NUMBER".into()],
                offset_x: 0,
                offset_y: 0,
                width: 260,
                height: 380,
                extra_width: 0,
                extra_height: 0,
                min_text_length: 10,
                max_text_length: 20,
            },
            test_group_area: RoiConfig {
                headings: vec!["TEST GRUBU".into(), "TEST GROUP".into()],
                offset_x: 0,
                offset_y: 0,
                width: 200,
                height: 60,
                extra_width: 0,
                extra_height: 0,
                min_text_length: 8,
                max_text_length: 10,
            },
            answers: AnswerGridConfig {
                num_columns: 4,
                num_questions: 10,
                num_choices: 5,
                fill_threshold: 0.3,
            },
            student_number: StudentNumberConfig {
                num_digits: 8,
                num_options: 10,
                fill_threshold: 0.3,
            },
            test_group: TestGroupConfig {
                groups: vec!["A".into(), "B".into(), "C".into(), "D".into()],
                min_contour_area: 50.0,
                fill_threshold: 0.2,
                dominance_margin: 0.05,
            },
            template: TemplateConfig {
                path: PathBuf::from("template.png"),
            },
            output: OutputConfig::default(),
        }
    }
}

/// Load and validate configuration from a TOML file
pub fn load_config(path: &Path) -> Result<ScanConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config: ScanConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    config.validate()?;
    Ok(config)
}

/// Save configuration to a TOML file
pub fn save_config(config: &ScanConfig, path: &Path) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)
        .map_err(|err| ConfigError::Invalid(err.to_string()))?;
    std::fs::write(path, content).map_err(|source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}
