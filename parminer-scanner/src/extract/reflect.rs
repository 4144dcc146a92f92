//! Reflected-value prober.
//!
//! For every query parameter of the page URL and every named form field,
//! the prober substitutes a marker and counts how often the marker comes
//! back verbatim. A finding needs the probe count to exceed the count from
//! a control request that did not carry the marker, so markers that were
//! already on the page, or that come back HTML-escaped, do not count.

use super::{ExtractionResult, Extractor, PageContext, Stage, StageIssue, StageOutput};
use crate::error::{Result, ScanError};
use crate::renderer::{ProbeMethod, ProbeRequest};
use crate::scope::resolve_href;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, info, warn};
use url::Url;

/// Contains `"`, `'` and `<>` so that escaped echoes never match.
pub const DEFAULT_MARKER: &str = "pRm1n3r\"'<x>";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeSettings {
    pub marker: String,
    pub probe_query: bool,
    pub probe_forms: bool,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            marker: DEFAULT_MARKER.to_string(),
            probe_query: true,
            probe_forms: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterLocation {
    Query,
    Form,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReflectedFinding {
    pub location: ParameterLocation,
    /// URL that was probed: the page URL for query parameters, the form
    /// action otherwise.
    pub url: String,
    pub method: ProbeMethod,
    pub parameter: String,
    pub original_value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decoded_value: Option<String>,
    pub marker: String,
    pub baseline_count: usize,
    pub probe_count: usize,
    pub reflected: bool,
}

/// Best-effort decoding of a parameter value: base64 first, then percent
/// decoding. Returns `None` when neither changes anything readable.
pub fn decode_value(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.len() >= 4 {
        for engine in [&STANDARD, &URL_SAFE] {
            if let Ok(bytes) = engine.decode(trimmed)
                && let Ok(text) = String::from_utf8(bytes)
                && !text.is_empty()
                && text.chars().all(|c| !c.is_control() || c.is_whitespace())
            {
                return Some(text);
            }
        }
    }

    if value.contains('%') || value.contains('+') {
        let encoded = format!("v={}", value);
        let decoded = url::form_urlencoded::parse(encoded.as_bytes())
            .next()
            .map(|(_, v)| v.into_owned())?;
        if decoded != value {
            return Some(decoded);
        }
    }

    None
}

/// A form field that can be submitted on its own.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FormTarget {
    pub action: String,
    pub method: ProbeMethod,
    pub field: String,
    pub original_value: String,
}

/// Named, user-submittable fields of every form, with the form action
/// resolved against `base`. Duplicates collapse to the first occurrence.
pub fn form_targets(dom: &str, base: &Url) -> Vec<FormTarget> {
    let document = Html::parse_document(dom);
    let form_selector = Selector::parse("form").expect("static selector");
    let field_selector = Selector::parse("input[name], textarea[name], select[name]")
        .expect("static selector");

    let mut seen = HashSet::new();
    let mut targets = Vec::new();
    for form in document.select(&form_selector) {
        let action = match form.value().attr("action").map(str::trim) {
            Some(action) if !action.is_empty() => match resolve_href(base, action) {
                Some(url) => url,
                None => continue,
            },
            _ => base.clone(),
        };
        let method = ProbeMethod::from_form_attr(form.value().attr("method"));

        for field in form.select(&field_selector) {
            let kind = field.value().attr("type").unwrap_or("text").to_ascii_lowercase();
            if matches!(kind.as_str(), "submit" | "button" | "reset" | "image" | "file") {
                continue;
            }
            let Some(name) = field.value().attr("name") else {
                continue;
            };
            let target = FormTarget {
                action: action.to_string(),
                method,
                field: name.to_string(),
                original_value: field.value().attr("value").unwrap_or_default().to_string(),
            };
            if seen.insert((target.action.clone(), target.method, target.field.clone())) {
                targets.push(target);
            }
        }
    }
    targets
}

/// `url` with the `index`-th query pair's value replaced.
fn with_query_value(url: &Url, index: usize, value: &str) -> Url {
    let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    let mut probe = url.clone();
    probe
        .query_pairs_mut()
        .clear()
        .extend_pairs(pairs.iter().enumerate().map(|(i, (k, v))| {
            if i == index {
                (k.as_str(), value)
            } else {
                (k.as_str(), v.as_str())
            }
        }));
    probe
}

pub struct ReflectionProber;

impl ReflectionProber {
    async fn count(page: &PageContext<'_>, request: ProbeRequest) -> Result<usize> {
        let label = format!("probe {} {}", request.method.as_str(), request.url);
        let response = page
            .retry
            .run(page.limiter, &label, || page.probe.send(request.clone()))
            .await?;
        Ok(response.body.matches(page.probe_settings.marker.as_str()).count())
    }

    async fn probe_query(
        page: &PageContext<'_>,
        url: &Url,
        findings: &mut Vec<ReflectedFinding>,
        issues: &mut Vec<StageIssue>,
    ) {
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        if pairs.is_empty() {
            return;
        }

        let baseline = match Self::count(page, ProbeRequest::get(url.as_str())).await {
            Ok(count) => count,
            Err(e) => {
                warn!("Baseline request for {} failed: {}", url, e);
                issues.push(StageIssue::from_error(url.as_str(), &e));
                return;
            }
        };

        let marker = &page.probe_settings.marker;
        let mut probed = HashSet::new();
        for (index, (name, value)) in pairs.iter().enumerate() {
            if !probed.insert(name.clone()) {
                continue;
            }
            let probe_url = with_query_value(url, index, marker);
            match Self::count(page, ProbeRequest::get(probe_url.as_str())).await {
                Ok(count) if count > baseline => {
                    info!("Reflected query parameter '{}' on {}", name, url);
                    findings.push(ReflectedFinding {
                        location: ParameterLocation::Query,
                        url: url.to_string(),
                        method: ProbeMethod::Get,
                        parameter: name.clone(),
                        original_value: value.clone(),
                        decoded_value: decode_value(value),
                        marker: marker.clone(),
                        baseline_count: baseline,
                        probe_count: count,
                        reflected: true,
                    });
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("Probe of '{}' on {} failed: {}", name, url, e);
                    issues.push(StageIssue::from_error(probe_url.as_str(), &e));
                }
            }
        }
    }

    async fn probe_form(
        page: &PageContext<'_>,
        target: &FormTarget,
        findings: &mut Vec<ReflectedFinding>,
        issues: &mut Vec<StageIssue>,
    ) {
        let marker = &page.probe_settings.marker;
        let control = ProbeRequest::submit(
            target.method,
            target.action.as_str(),
            vec![(target.field.clone(), target.original_value.clone())],
        );
        let baseline = match Self::count(page, control).await {
            Ok(count) => count,
            Err(e) => {
                warn!("Control submission to {} failed: {}", target.action, e);
                issues.push(StageIssue::from_error(target.action.as_str(), &e));
                return;
            }
        };

        let probe = ProbeRequest::submit(
            target.method,
            target.action.as_str(),
            vec![(target.field.clone(), marker.clone())],
        );
        match Self::count(page, probe).await {
            Ok(count) if count > baseline => {
                info!("Reflected form field '{}' at {}", target.field, target.action);
                findings.push(ReflectedFinding {
                    location: ParameterLocation::Form,
                    url: target.action.clone(),
                    method: target.method,
                    parameter: target.field.clone(),
                    original_value: target.original_value.clone(),
                    decoded_value: decode_value(&target.original_value),
                    marker: marker.clone(),
                    baseline_count: baseline,
                    probe_count: count,
                    reflected: true,
                });
            }
            Ok(_) => {}
            Err(e) => {
                debug!("Probe of '{}' at {} failed: {}", target.field, target.action, e);
                issues.push(StageIssue::from_error(target.action.as_str(), &e));
            }
        }
    }
}

#[async_trait]
impl Extractor for ReflectionProber {
    fn stage(&self) -> Stage {
        Stage::ReflectedProbe
    }

    async fn extract(&self, page: &PageContext<'_>) -> Result<StageOutput> {
        if page.probe_settings.marker.is_empty() {
            return Err(ScanError::Setup("reflection marker must not be empty".to_string()));
        }
        let url = Url::parse(&page.snapshot.resolved_url)
            .map_err(|e| ScanError::InvalidUrl(format!("{}: {}", page.snapshot.resolved_url, e)))?;

        let mut findings = Vec::new();
        let mut issues = Vec::new();

        if page.probe_settings.probe_query {
            if page.scope.is_same_domain(&url) {
                Self::probe_query(page, &url, &mut findings, &mut issues).await;
            } else if url.query().is_some() {
                warn!("Page resolved to off-domain {}, query parameters not probed", url);
                issues.push(StageIssue {
                    url: url.to_string(),
                    kind: "out_of_scope".to_string(),
                    message: format!("resolved URL is outside {}", page.scope.base_domain()),
                });
            }
        }

        if page.probe_settings.probe_forms {
            let targets: Vec<FormTarget> = form_targets(&page.snapshot.dom, &url)
                .into_iter()
                .filter(|t| page.scope.is_same_domain_str(&t.action))
                .collect();
            for target in &targets {
                Self::probe_form(page, target, &mut findings, &mut issues).await;
            }
        }

        Ok(StageOutput {
            result: ExtractionResult::ReflectedFindings(findings),
            issues,
        })
    }
}
