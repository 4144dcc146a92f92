use crate::error::Result;
use crate::report::{RunReport, generate_json_report};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

pub const DEFAULT_OUTPUT_DIR: &str = "results";

/// `<dir>/<base_domain>.json`, with the port separator made filesystem-safe.
pub fn report_path(dir: &Path, base_domain: &str) -> PathBuf {
    dir.join(format!("{}.json", base_domain.replace(':', "_")))
}

pub fn save_report(content: &str, path: &Path) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(content.as_bytes())?;
    Ok(())
}

/// Write the report as pretty JSON, creating `dir` if needed.
pub fn write_report(report: &RunReport, dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = report_path(dir, &report.base_domain);
    save_report(&generate_json_report(report)?, &path)?;
    info!("Report written to {}", path.display());
    Ok(path)
}

pub fn read_report(path: &Path) -> Result<RunReport> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}
