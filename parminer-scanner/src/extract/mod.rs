//! Per-page extraction stages.
//!
//! Every stage reads the same immutable [`PageSnapshot`]. Only the
//! reflected-value prober issues requests that change server-side state,
//! and it does so through the probe client, never the renderer session.

pub mod hidden;
pub mod inputs;
pub mod network;
pub mod reflect;
pub mod scripts;

use crate::error::{Result, ScanError};
use crate::rate::{RateLimiter, RetryPolicy};
use crate::renderer::ProbeClient;
use crate::scope::ScopePolicy;
use crate::snapshot::PageSnapshot;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use hidden::{HiddenParameter, HiddenParameterExtractor, HiddenSource};
pub use inputs::{InputField, InputFieldExtractor};
pub use network::{NetworkFinding, NetworkExtractor, SensitiveKind, SensitiveTag};
pub use reflect::{ProbeSettings, ReflectedFinding, ReflectionProber};
pub use scripts::{ConfigPair, ScriptFinding, ScriptScanner};

/// Extraction stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    InputFields,
    HiddenParameters,
    NetworkTransactions,
    JsScan,
    ReflectedProbe,
}

impl Stage {
    /// Read-only stages first; the prober always runs last.
    pub const ALL: [Stage; 5] = [
        Stage::InputFields,
        Stage::HiddenParameters,
        Stage::NetworkTransactions,
        Stage::JsScan,
        Stage::ReflectedProbe,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::InputFields => "input_fields",
            Stage::HiddenParameters => "hidden_parameters",
            Stage::NetworkTransactions => "network_transactions",
            Stage::JsScan => "js_scan",
            Stage::ReflectedProbe => "reflected_probe",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "input_fields" | "inputs" => Some(Stage::InputFields),
            "hidden_parameters" | "hidden" => Some(Stage::HiddenParameters),
            "network_transactions" | "network" => Some(Stage::NetworkTransactions),
            "js_scan" | "js" | "scripts" => Some(Stage::JsScan),
            "reflected_probe" | "reflected" | "reflect" => Some(Stage::ReflectedProbe),
            _ => None,
        }
    }

    fn bit(&self) -> u8 {
        1 << (*self as u8)
    }

    pub fn empty_result(&self) -> ExtractionResult {
        match self {
            Stage::InputFields => ExtractionResult::InputFields(Vec::new()),
            Stage::HiddenParameters => ExtractionResult::HiddenParameters(Vec::new()),
            Stage::NetworkTransactions => ExtractionResult::NetworkFindings(Vec::new()),
            Stage::JsScan => ExtractionResult::JsFindings(Vec::new()),
            Stage::ReflectedProbe => ExtractionResult::ReflectedFindings(Vec::new()),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bitmask of enabled stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageMask(u8);

impl StageMask {
    pub const NONE: StageMask = StageMask(0);
    pub const ALL: StageMask = StageMask(0b1_1111);

    pub fn from_bits(bits: u8) -> Self {
        StageMask(bits & Self::ALL.0)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn with(mut self, stage: Stage) -> Self {
        self.0 |= stage.bit();
        self
    }

    pub fn without(mut self, stage: Stage) -> Self {
        self.0 &= !stage.bit();
        self
    }

    pub fn contains(&self, stage: Stage) -> bool {
        self.0 & stage.bit() != 0
    }

    /// Parse a comma separated list of stage names, e.g. `inputs,js`.
    pub fn parse_list(list: &str) -> Result<Self> {
        list.split(',')
            .filter(|s| !s.trim().is_empty())
            .try_fold(StageMask::NONE, |mask, name| {
                Stage::from_name(name)
                    .map(|stage| mask.with(stage))
                    .ok_or_else(|| ScanError::ParseError(format!("unknown stage '{}'", name.trim())))
            })
    }

    pub fn stages(&self) -> impl Iterator<Item = Stage> + '_ {
        Stage::ALL.into_iter().filter(|s| self.contains(*s))
    }
}

impl Default for StageMask {
    fn default() -> Self {
        StageMask::ALL
    }
}

/// One stage's typed output for one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "findings", rename_all = "snake_case")]
pub enum ExtractionResult {
    InputFields(Vec<InputField>),
    HiddenParameters(Vec<HiddenParameter>),
    NetworkFindings(Vec<NetworkFinding>),
    JsFindings(Vec<ScriptFinding>),
    ReflectedFindings(Vec<ReflectedFinding>),
}

impl ExtractionResult {
    pub fn stage(&self) -> Stage {
        match self {
            ExtractionResult::InputFields(_) => Stage::InputFields,
            ExtractionResult::HiddenParameters(_) => Stage::HiddenParameters,
            ExtractionResult::NetworkFindings(_) => Stage::NetworkTransactions,
            ExtractionResult::JsFindings(_) => Stage::JsScan,
            ExtractionResult::ReflectedFindings(_) => Stage::ReflectedProbe,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ExtractionResult::InputFields(v) => v.len(),
            ExtractionResult::HiddenParameters(v) => v.len(),
            ExtractionResult::NetworkFindings(v) => v.len(),
            ExtractionResult::JsFindings(v) => v.len(),
            ExtractionResult::ReflectedFindings(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A failure inside a stage that did not sink the whole stage, such as one
/// script that would not download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageIssue {
    pub url: String,
    pub kind: String,
    pub message: String,
}

impl StageIssue {
    pub fn from_error(url: impl Into<String>, error: &ScanError) -> Self {
        Self {
            url: url.into(),
            kind: error.kind().to_string(),
            message: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageOutput {
    pub result: ExtractionResult,
    pub issues: Vec<StageIssue>,
}

impl From<ExtractionResult> for StageOutput {
    fn from(result: ExtractionResult) -> Self {
        Self {
            result,
            issues: Vec::new(),
        }
    }
}

/// Everything a stage may look at for one page.
pub struct PageContext<'a> {
    pub snapshot: &'a PageSnapshot,
    pub scope: &'a ScopePolicy,
    pub probe: &'a dyn ProbeClient,
    pub limiter: &'a RateLimiter,
    pub retry: &'a RetryPolicy,
    pub probe_settings: &'a ProbeSettings,
    /// Upper bound on concurrent script downloads.
    pub script_concurrency: usize,
}

#[async_trait]
pub trait Extractor: Send + Sync {
    fn stage(&self) -> Stage;

    async fn extract(&self, page: &PageContext<'_>) -> Result<StageOutput>;
}

/// The five built-in extractors in execution order.
pub fn default_extractors() -> Vec<Box<dyn Extractor>> {
    vec![
        Box::new(InputFieldExtractor),
        Box::new(HiddenParameterExtractor),
        Box::new(NetworkExtractor),
        Box::new(ScriptScanner),
        Box::new(ReflectionProber),
    ]
}
