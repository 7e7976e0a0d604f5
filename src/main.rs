//! markscan - OMR answer-sheet scanner
//!
//! Extracts a student number, a test group and a grid of marked answers from
//! a photographed optical form, or the analogous record from an answer-key
//! sheet, and stores the results for grading.

mod config;
mod ocr;
mod pipeline;
mod storage;
mod vision;

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use crate::ocr::OcrSpaceClient;
use crate::storage::SheetStore;

/// markscan - extract structured answers from photographed OMR sheets
#[derive(Parser, Debug)]
#[command(name = "markscan")]
#[command(about = "Extract student number, test group and marked answers from photographed OMR sheets")]
struct Args {
    /// Sheet photograph to process
    #[arg(required_unless_present = "init_config")]
    image: Option<PathBuf>,

    /// Scanner configuration file
    #[arg(short, long, default_value = "markscan.toml")]
    config: PathBuf,

    /// Treat the image as an answer-key sheet instead of a student sheet
    #[arg(long)]
    answer_key: bool,

    /// SQLite database for results (defaults to the user data directory)
    #[arg(long)]
    database: Option<PathBuf>,

    /// Decode only; do not persist anything
    #[arg(long)]
    no_store: bool,

    /// Write a default configuration file to the --config path and exit
    #[arg(long)]
    init_config: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    if args.init_config {
        config::save_config(&config::ScanConfig::default(), &args.config)?;
        println!("Wrote default configuration to {}", args.config.display());
        return Ok(());
    }
    let image = args
        .image
        .as_deref()
        .ok_or_else(|| anyhow!("an image path is required"))?;

    let config = config::load_config(&args.config).map_err(pipeline::ScanError::Config)?;
    let ocr = OcrSpaceClient::from_config(&config.ocr)?;

    let store = if args.no_store {
        None
    } else {
        let path = match &args.database {
            Some(path) => path.clone(),
            None => storage::default_database_path()?,
        };
        Some(SheetStore::open(&path)?)
    };

    if args.answer_key {
        let result = pipeline::process_answer_key(image, &config, &ocr, store.as_ref())
            .map_err(|err| anyhow!("answer key scan failed: {err}"))?;
        println!("Test group: {}", result.test_group);
        println!("Keyed questions: {}", count_marked(&result.answers));
    } else {
        let result = pipeline::process_sheet(image, &config, &ocr, store.as_ref())
            .map_err(|err| anyhow!("sheet scan failed: {err}"))?;
        println!(
            "Student number: {}",
            result.student_number.as_deref().unwrap_or("unknown")
        );
        println!(
            "Test group: {}",
            result.test_group.as_deref().unwrap_or("unknown")
        );
        println!("Marked answers: {}", count_marked(&result.answers));
    }

    Ok(())
}

fn count_marked(answers: &vision::marks::AnswerGrid) -> usize {
    answers
        .values()
        .flat_map(|column| column.values())
        .filter(|mark| mark.is_some())
        .count()
}
