//! Storage Layer
//!
//! Persists scan results, answer keys and the course roster in SQLite.

pub mod database;

pub use database::{SheetStore, StoreError};

use anyhow::Result;
use std::path::PathBuf;

/// Default database location inside the user's data directory.
pub fn default_database_path() -> Result<PathBuf> {
    let proj_dirs = directories::ProjectDirs::from("dev", "markscan", "markscan")
        .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))?;

    let data_dir = proj_dirs.data_dir().to_path_buf();
    std::fs::create_dir_all(&data_dir)?;

    Ok(data_dir.join("markscan.db"))
}
