use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use chrono::Utc;
use std::fs;

/// Get the path to the why.txt file for a given failed file
pub fn why_txt_path(file_path: &Path) -> PathBuf {
    let mut path = file_path.to_path_buf();
    path.set_extension("why.txt");
    path
}

/// Write a why.txt file explaining why a file was routed to the failure folder
pub fn write_why_txt(file_path: &Path, reason: &str) -> Result<()> {
    let why_path = why_txt_path(file_path);
    let name = file_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let body = format!(
        "file: {}\nfailed_at: {}\n\n{}\n",
        name,
        Utc::now().to_rfc3339(),
        reason.trim_end()
    );
    fs::write(&why_path, body)
        .with_context(|| format!("Failed to write why.txt: {}", why_path.display()))?;
    Ok(())
}

/// Read back a why.txt, if present
pub fn read_why_txt(file_path: &Path) -> Option<String> {
    fs::read_to_string(why_txt_path(file_path)).ok()
}
