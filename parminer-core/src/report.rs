// Run report model and renderers

use crate::options::ScanOptions;
use chrono::{DateTime, Utc};
use parminer_scanner::extract::{ExtractionResult, Stage, StageIssue};
use parminer_scanner::ScanError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReportFormat {
    Text,
    Json,
}

impl ReportFormat {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "text" | "txt" => Some(ReportFormat::Text),
            "json" => Some(ReportFormat::Json),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Cancelled,
}

/// One entry of the run-wide error list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub url: String,
    /// `None` for page fetch failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    pub kind: String,
    pub message: String,
}

impl RunError {
    pub fn fetch(url: impl Into<String>, error: &ScanError) -> Self {
        Self {
            url: url.into(),
            stage: None,
            kind: error.kind().to_string(),
            message: error.to_string(),
        }
    }

    pub fn stage(url: impl Into<String>, stage: Stage, error: &ScanError) -> Self {
        Self {
            url: url.into(),
            stage: Some(stage),
            kind: error.kind().to_string(),
            message: error.to_string(),
        }
    }

    pub fn from_issue(stage: Stage, issue: StageIssue) -> Self {
        Self {
            url: issue.url,
            stage: Some(stage),
            kind: issue.kind,
            message: issue.message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageRecord {
    /// Normalized requested URL, as it appears in the visited list.
    pub url: String,
    pub resolved_url: String,
    pub status_code: u16,
    pub depth: usize,
    pub results: BTreeMap<Stage, ExtractionResult>,
}

impl PageRecord {
    pub fn result(&self, stage: Stage) -> Option<&ExtractionResult> {
        self.results.get(&stage)
    }

    pub fn finding_count(&self) -> usize {
        self.results.values().map(ExtractionResult::len).sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub base_domain: String,
    pub seed_url: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub options: ScanOptions,
    pub pages: Vec<PageRecord>,
    pub errors: Vec<RunError>,
    pub visited: Vec<String>,
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<String>,
}

impl RunReport {
    pub fn new(base_domain: impl Into<String>, seed_url: impl Into<String>, options: ScanOptions) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            base_domain: base_domain.into(),
            seed_url: seed_url.into(),
            started_at: Utc::now(),
            finished_at: None,
            status: RunStatus::Completed,
            options,
            pages: Vec::new(),
            errors: Vec::new(),
            visited: Vec::new(),
            valid: false,
            violations: Vec::new(),
        }
    }

    /// Stamp the finish time and run the shape check. Idempotent.
    pub fn finalize(&mut self, status: RunStatus) {
        self.status = status;
        if self.finished_at.is_none() {
            self.finished_at = Some(Utc::now());
        }
        self.violations = crate::validate::validate_report(self);
        self.valid = self.violations.is_empty();
    }

    pub fn findings_for(&self, stage: Stage) -> usize {
        self.pages
            .iter()
            .filter_map(|p| p.result(stage))
            .map(ExtractionResult::len)
            .sum()
    }

    pub fn reflected(&self) -> impl Iterator<Item = &parminer_scanner::extract::ReflectedFinding> {
        self.pages
            .iter()
            .filter_map(|p| match p.result(Stage::ReflectedProbe) {
                Some(ExtractionResult::ReflectedFindings(found)) => Some(found.iter()),
                _ => None,
            })
            .flatten()
    }

    pub fn duration_seconds(&self) -> Option<i64> {
        self.finished_at.map(|end| (end - self.started_at).num_seconds())
    }
}

/// Extract the path (plus query) component from a URL
pub fn extract_url_path(url: &str) -> String {
    Url::parse(url)
        .ok()
        .map(|u| match u.query() {
            Some(q) => format!("{}?{}", u.path(), q),
            None => u.path().to_string(),
        })
        .unwrap_or_else(|| url.to_string())
}

fn stage_label(stage: Stage) -> &'static str {
    match stage {
        Stage::InputFields => "Input fields",
        Stage::HiddenParameters => "Hidden parameters",
        Stage::NetworkTransactions => "Network transactions",
        Stage::JsScan => "Script findings",
        Stage::ReflectedProbe => "Reflected parameters",
    }
}

fn colored_status(status: u16) -> String {
    match status {
        100..=199 => format!("\x1b[37m{}\x1b[0m", status),
        200..=299 => format!("\x1b[32m{}\x1b[0m", status),
        300..=399 => format!("\x1b[36m{}\x1b[0m", status),
        400..=499 => format!("\x1b[33m{}\x1b[0m", status),
        500..=599 => format!("\x1b[31m{}\x1b[0m", status),
        _ => format!("{}", status),
    }
}

const DIVIDER: &str = "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n";

/// Human-readable summary of a run.
pub fn generate_summary(report: &RunReport) -> String {
    let mut out = String::new();
    out.push_str(DIVIDER);
    out.push('\n');
    out.push_str("# Summary:\n");
    out.push_str(&format!("  Target: {}\n", report.seed_url));
    out.push_str(&format!("  Run: {}\n", report.run_id));
    out.push_str(&format!(
        "  Status: {}\n",
        match report.status {
            RunStatus::Completed => "Completed",
            RunStatus::Cancelled => "Cancelled",
        }
    ));
    out.push_str(&format!("  Pages analysed: {}\n", report.pages.len()));
    out.push_str(&format!("  URLs visited: {}\n", report.visited.len()));
    for stage in Stage::ALL {
        out.push_str(&format!(
            "  {}: {}\n",
            stage_label(stage),
            report.findings_for(stage)
        ));
    }
    out.push_str(&format!("  Errors: {}\n", report.errors.len()));
    if !report.valid {
        out.push_str(&format!(
            "  Report shape violations: {}\n",
            report.violations.len()
        ));
    }
    out.push('\n');
    out.push_str(DIVIDER);
    out.push('\n');

    out.push_str(&format!("## {}\n", report.base_domain));
    for page in &report.pages {
        let mut line = format!(
            "  {} {}",
            colored_status(page.status_code),
            extract_url_path(&page.url)
        );
        let count = page.finding_count();
        if count > 0 {
            line.push_str(&format!(" \x1b[90m{} findings\x1b[0m", count));
        }
        out.push_str(&line);
        out.push('\n');
    }
    out.push('\n');

    let reflected: Vec<_> = report.reflected().collect();
    if !reflected.is_empty() {
        out.push_str("## Reflected parameters\n");
        for finding in reflected {
            out.push_str(&format!(
                "  \x1b[31m[!]\x1b[0m {} {} '{}' ({} -> {} occurrences)\n",
                finding.method.as_str(),
                finding.url,
                finding.parameter,
                finding.baseline_count,
                finding.probe_count
            ));
            if let Some(ref decoded) = finding.decoded_value {
                out.push_str(&format!("      original value decodes to: {}\n", decoded));
            }
        }
        out.push('\n');
    }

    if !report.errors.is_empty() {
        out.push_str("## Errors\n");
        for error in &report.errors {
            match error.stage {
                Some(stage) => out.push_str(&format!(
                    "  [{}] {} ({}): {}\n",
                    stage, error.url, error.kind, error.message
                )),
                None => out.push_str(&format!(
                    "  [fetch] {} ({}): {}\n",
                    error.url, error.kind, error.message
                )),
            }
        }
        out.push('\n');
    }

    out
}

pub fn generate_json_report(report: &RunReport) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(report)
}

pub fn render_report(report: &RunReport, format: &ReportFormat) -> Result<String, serde_json::Error> {
    match format {
        ReportFormat::Text => Ok(generate_summary(report)),
        ReportFormat::Json => generate_json_report(report),
    }
}
