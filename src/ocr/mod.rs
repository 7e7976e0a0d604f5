//! OCR.space collaborator client
//!
//! One blocking multipart POST per recognition call: a JPEG encoding of the
//! image plus language and orientation flags. The response carries the full
//! parsed text and per-line word geometry; line envelopes are derived here as
//! the min/max corners of each line's words. Transport failures and responses
//! flagged as errored both collapse to an empty scan — callers cannot and
//! must not distinguish "nothing recognized" from "OCR failed".

use anyhow::{Context, Result};
use image::{DynamicImage, GrayImage};
use serde::Deserialize;
use std::io::Cursor;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::config::OcrConfig;

/// Axis-aligned envelope of a recognized text line, in image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanBounds {
    pub x_min: i64,
    pub y_min: i64,
    pub x_max: i64,
    pub y_max: i64,
}

/// One recognized line of text with its envelope.
#[derive(Debug, Clone)]
pub struct TextSpan {
    pub text: String,
    pub bounds: SpanBounds,
}

/// Result of one OCR invocation.
#[derive(Debug, Clone, Default)]
pub struct OcrScan {
    pub full_text: String,
    pub spans: Vec<TextSpan>,
}

/// Text recognition collaborator. The pipeline only ever sees this trait;
/// tests substitute canned providers.
pub trait OcrProvider {
    /// Recognize text in the image. Never fails: any error on the way yields
    /// an empty scan.
    fn recognize(&self, image: &GrayImage) -> OcrScan;
}

/// HTTP client for the OCR.space parse endpoint.
pub struct OcrSpaceClient {
    http: reqwest::blocking::Client,
    endpoint: String,
    api_key: String,
    language: String,
    detect_orientation: bool,
}

impl OcrSpaceClient {
    /// Build a client from configuration. The API key comes from the
    /// environment variable the config names; a missing key is a setup error
    /// reported before any image work.
    pub fn from_config(config: &OcrConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env).with_context(|| {
            format!(
                "OCR API key environment variable {} is not set",
                config.api_key_env
            )
        })?;

        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            http,
            endpoint: config.endpoint.clone(),
            api_key,
            language: config.language.clone(),
            detect_orientation: config.detect_orientation,
        })
    }

    fn request(&self, jpeg: Vec<u8>) -> Result<ParseResponse> {
        let part = reqwest::blocking::multipart::Part::bytes(jpeg)
            .file_name("image.jpg")
            .mime_str("image/jpeg")?;
        let form = reqwest::blocking::multipart::Form::new()
            .text("isOverlayRequired", "true")
            .text("apikey", self.api_key.clone())
            .text("language", self.language.clone())
            .text(
                "detectOrientation",
                if self.detect_orientation { "true" } else { "false" },
            )
            .part("file", part);

        let response = self
            .http
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .context("OCR request failed")?;
        response.json().context("OCR response was not valid JSON")
    }
}

impl OcrProvider for OcrSpaceClient {
    fn recognize(&self, image: &GrayImage) -> OcrScan {
        let jpeg = match encode_jpeg(image) {
            Ok(bytes) => bytes,
            Err(err) => {
                error!("could not encode image for OCR: {err}");
                return OcrScan::default();
            }
        };

        match self.request(jpeg) {
            Ok(response) => scan_from_response(response),
            Err(err) => {
                error!("OCR call failed, treating as empty result: {err:#}");
                OcrScan::default()
            }
        }
    }
}

fn encode_jpeg(image: &GrayImage) -> image::ImageResult<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    DynamicImage::ImageLuma8(image.clone()).write_to(&mut buffer, image::ImageFormat::Jpeg)?;
    Ok(buffer.into_inner())
}

// -- OCR.space wire format ----------------------------------------------------

#[derive(Debug, Deserialize)]
struct ParseResponse {
    #[serde(rename = "ParsedResults", default)]
    parsed_results: Vec<ParsedResult>,
    #[serde(rename = "IsErroredOnProcessing", default)]
    is_errored_on_processing: bool,
    #[serde(rename = "ErrorMessage", default)]
    error_message: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ParsedResult {
    #[serde(rename = "ParsedText", default)]
    parsed_text: String,
    #[serde(rename = "TextOverlay", default)]
    text_overlay: TextOverlay,
}

#[derive(Debug, Default, Deserialize)]
struct TextOverlay {
    #[serde(rename = "Lines", default)]
    lines: Vec<OverlayLine>,
}

#[derive(Debug, Deserialize)]
struct OverlayLine {
    #[serde(rename = "LineText", default)]
    line_text: String,
    #[serde(rename = "Words", default)]
    words: Vec<OverlayWord>,
}

#[derive(Debug, Deserialize)]
struct OverlayWord {
    #[serde(rename = "Left", default)]
    left: f64,
    #[serde(rename = "Top", default)]
    top: f64,
    #[serde(rename = "Width", default)]
    width: f64,
    #[serde(rename = "Height", default)]
    height: f64,
}

fn scan_from_response(response: ParseResponse) -> OcrScan {
    if response.is_errored_on_processing {
        warn!(
            "OCR service reported a processing error: {:?}",
            response.error_message
        );
        return OcrScan::default();
    }

    let Some(result) = response.parsed_results.into_iter().next() else {
        return OcrScan::default();
    };

    let mut spans = Vec::new();
    for line in result.text_overlay.lines {
        if line.words.is_empty() {
            continue;
        }

        let mut bounds = SpanBounds {
            x_min: i64::MAX,
            y_min: i64::MAX,
            x_max: i64::MIN,
            y_max: i64::MIN,
        };
        for word in &line.words {
            bounds.x_min = bounds.x_min.min(word.left.round() as i64);
            bounds.y_min = bounds.y_min.min(word.top.round() as i64);
            bounds.x_max = bounds.x_max.max((word.left + word.width).round() as i64);
            bounds.y_max = bounds.y_max.max((word.top + word.height).round() as i64);
        }

        spans.push(TextSpan {
            text: line.line_text.trim().to_string(),
            bounds,
        });
    }

    debug!(spans = spans.len(), "OCR scan parsed");
    OcrScan {
        full_text: result.parsed_text,
        spans,
    }
}
