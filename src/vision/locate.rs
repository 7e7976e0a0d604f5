//! Heading-anchored region localization
//!
//! Headings like "CEVAPLAR" or "ÖĞRENCİ NUMARASI" drift from sheet to sheet
//! with printing and cropping, so regions are never expressed as absolute
//! coordinates: the OCR collaborator finds the heading text, fuzzy matching
//! tolerates recognition noise, and the region is a configured offset and
//! fixed size from the detected anchor.

use image::GrayImage;
use tracing::{debug, warn};

use crate::config::RoiConfig;
use crate::ocr::{OcrProvider, SpanBounds};
use crate::vision::Roi;

/// A recognized span scored against a target heading phrase.
#[derive(Debug, Clone)]
pub struct HeadingMatch {
    pub text: String,
    /// Similarity against the target, 0-100.
    pub similarity: f64,
    pub bounds: SpanBounds,
}

/// Uppercase, strip everything outside the sheet alphabet (Turkish letters,
/// digits, whitespace, hyphen) and collapse runs of whitespace.
pub fn normalize_text(text: &str) -> String {
    let upper = text.to_uppercase();
    let filtered: String = upper
        .chars()
        .filter(|c| {
            c.is_ascii_uppercase()
                || c.is_ascii_digit()
                || matches!(c, 'Ç' | 'Ğ' | 'İ' | 'Ö' | 'Ş' | 'Ü')
                || c.is_whitespace()
                || *c == '-'
        })
        .collect();
    filtered.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Fuzzy similarity between two normalized strings on a 0-100 scale.
pub fn similarity(a: &str, b: &str) -> f64 {
    strsim::normalized_levenshtein(a, b) * 100.0
}

/// Locate the region anchored to one of the configured heading phrases.
///
/// Phrases are tried in order and the first recognized span whose similarity
/// meets the threshold wins — deliberately not a best-match search, so the
/// outcome is insensitive to span enumeration order beyond the first hit.
/// Returns `None` when every phrase misses; the caller decides whether that
/// is fatal.
pub fn locate_region(
    image: &GrayImage,
    ocr: &dyn OcrProvider,
    area: &RoiConfig,
    similarity_threshold: f64,
) -> Option<Roi> {
    for heading in &area.headings {
        let target = normalize_text(heading);
        // One OCR call per phrase attempt; a failed call is an empty scan and
        // counts as a miss for this phrase only.
        let scan = ocr.recognize(image);
        debug!(
            spans = scan.spans.len(),
            full_text_len = scan.full_text.len(),
            "OCR scan received"
        );

        let mut best: Option<HeadingMatch> = None;
        for span in &scan.spans {
            let raw = span.text.trim();
            if raw.is_empty() {
                continue;
            }
            let length = raw.chars().count();
            if length < area.min_text_length || length > area.max_text_length {
                continue;
            }

            let candidate = HeadingMatch {
                text: raw.to_string(),
                similarity: similarity(&target, &normalize_text(raw)),
                bounds: span.bounds,
            };

            if candidate.similarity >= similarity_threshold {
                debug!(heading = %heading, text = raw, score = candidate.similarity, "heading matched");
                return roi_from_anchor(&candidate.bounds, area, image.width(), image.height());
            }

            if best.as_ref().map_or(true, |b| candidate.similarity > b.similarity) {
                best = Some(candidate);
            }
        }

        match best {
            Some(b) => warn!(
                heading = %heading,
                best_text = %b.text,
                best_similarity = b.similarity,
                "best candidate stayed below the similarity threshold"
            ),
            None => warn!(heading = %heading, "no candidate span for heading"),
        }
    }
    None
}

/// Offset the anchor's start corner and fix the region size from
/// configuration, then clamp into the image.
fn roi_from_anchor(anchor: &SpanBounds, area: &RoiConfig, width: u32, height: u32) -> Option<Roi> {
    let x_start = anchor.x_min + i64::from(area.offset_x);
    let y_start = anchor.y_min + i64::from(area.offset_y);
    let x_end = x_start + i64::from(area.width) + i64::from(area.extra_width);
    let y_end = y_start + i64::from(area.height) + i64::from(area.extra_height);

    let roi = Roi::clamped(x_start, y_start, x_end, y_end, width, height);
    if roi.is_none() {
        warn!("computed region degenerated after clamping");
    }
    roi
}
