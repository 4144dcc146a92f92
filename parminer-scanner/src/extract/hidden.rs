use super::{ExtractionResult, Extractor, PageContext, Stage, StageOutput};
use crate::error::Result;
use crate::scope::ScopePolicy;
use crate::snapshot::{Cookie, PageSnapshot};
use async_trait::async_trait;
use regex::Regex;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::LazyLock;
use url::Url;

static TOKEN_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)["']?\b((?:api[_-]?key|apikey|access[_-]?key|client[_-]?secret|secret|(?:access|auth|csrf|refresh)?[_-]?token|password|passwd|auth))\b["']?\s*[:=]\s*["']([^"'\s]{3,})["']"#,
    )
    .expect("static regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HiddenSource {
    HiddenInput,
    Cookie,
    LocalStorage,
    SessionStorage,
    QueryString,
    Fragment,
    JsonBody,
    ScriptToken,
}

/// A parameter the user never sees on screen but the page still carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HiddenParameter {
    pub source: HiddenSource,
    pub name: String,
    pub value: String,
    /// Cookie attributes, only for [`HiddenSource::Cookie`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cookie: Option<Cookie>,
    /// Request URL, only for [`HiddenSource::JsonBody`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_url: Option<String>,
}

impl HiddenParameter {
    fn new(source: HiddenSource, name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            source,
            name: name.into(),
            value: value.into(),
            cookie: None,
            request_url: None,
        }
    }
}

fn hidden_inputs(document: &Html) -> Vec<HiddenParameter> {
    let selector = Selector::parse(r#"input[type="hidden" i]"#).expect("static selector");
    document
        .select(&selector)
        .filter_map(|e| {
            let name = e.value().attr("name").or_else(|| e.value().attr("id"))?;
            Some(HiddenParameter::new(
                HiddenSource::HiddenInput,
                name,
                e.value().attr("value").unwrap_or_default(),
            ))
        })
        .collect()
}

fn script_tokens(document: &Html) -> Vec<HiddenParameter> {
    let selector = Selector::parse("script:not([src])").expect("static selector");
    document
        .select(&selector)
        .flat_map(|script| {
            let text = script.text().collect::<String>();
            TOKEN_PATTERN
                .captures_iter(&text)
                .map(|c| HiddenParameter::new(HiddenSource::ScriptToken, &c[1], &c[2]))
                .collect::<Vec<_>>()
        })
        .collect()
}

fn url_parameters(url: &Url) -> Vec<HiddenParameter> {
    let mut params: Vec<HiddenParameter> = url
        .query_pairs()
        .map(|(k, v)| HiddenParameter::new(HiddenSource::QueryString, k, v))
        .collect();

    if let Some(fragment) = url.fragment()
        && fragment.contains('=')
    {
        let fragment = fragment.trim_start_matches(['!', '/', '?']);
        params.extend(
            url::form_urlencoded::parse(fragment.as_bytes())
                .map(|(k, v)| HiddenParameter::new(HiddenSource::Fragment, k, v)),
        );
    }

    params
}

/// Flatten a JSON document into dotted leaf paths. Arrays are leaves.
pub fn flatten_json(value: &Value) -> Vec<(String, String)> {
    fn walk(prefix: &str, value: &Value, out: &mut Vec<(String, String)>) {
        match value {
            Value::Object(map) => {
                for (key, child) in map {
                    let path = if prefix.is_empty() {
                        key.clone()
                    } else {
                        format!("{}.{}", prefix, key)
                    };
                    walk(&path, child, out);
                }
            }
            Value::String(s) if !prefix.is_empty() => out.push((prefix.to_string(), s.clone())),
            other if !prefix.is_empty() => out.push((prefix.to_string(), other.to_string())),
            _ => {}
        }
    }

    let mut out = Vec::new();
    walk("", value, &mut out);
    out
}

fn json_body_keys(snapshot: &PageSnapshot, scope: &ScopePolicy) -> Vec<HiddenParameter> {
    snapshot
        .transactions
        .iter()
        .filter(|t| t.method.eq_ignore_ascii_case("POST") && scope.is_same_domain_str(&t.url))
        .filter_map(|t| {
            let value: Value = serde_json::from_str(t.request_body.as_text()?).ok()?;
            Some(flatten_json(&value).into_iter().map(move |(name, value)| HiddenParameter {
                request_url: Some(t.url.clone()),
                ..HiddenParameter::new(HiddenSource::JsonBody, name, value)
            }))
        })
        .flatten()
        .collect()
}

/// Hidden inputs, cookies, storage, URL parameters, JSON POST keys and
/// token-like assignments in inline scripts.
pub fn extract_hidden_parameters(snapshot: &PageSnapshot, scope: &ScopePolicy) -> Vec<HiddenParameter> {
    let document = Html::parse_document(&snapshot.dom);
    let mut params = hidden_inputs(&document);

    params.extend(snapshot.cookies.iter().map(|c| HiddenParameter {
        cookie: Some(c.clone()),
        ..HiddenParameter::new(HiddenSource::Cookie, &c.name, &c.value)
    }));
    params.extend(
        snapshot
            .local_storage
            .iter()
            .map(|(k, v)| HiddenParameter::new(HiddenSource::LocalStorage, k, v)),
    );
    params.extend(
        snapshot
            .session_storage
            .iter()
            .map(|(k, v)| HiddenParameter::new(HiddenSource::SessionStorage, k, v)),
    );

    // the requested URL may carry a fragment the resolved one lost
    for raw in [&snapshot.requested_url, &snapshot.resolved_url] {
        if let Ok(url) = Url::parse(raw) {
            for param in url_parameters(&url) {
                if !params.contains(&param) {
                    params.push(param);
                }
            }
        }
    }

    params.extend(json_body_keys(snapshot, scope));
    params.extend(script_tokens(&document));
    params
}

pub struct HiddenParameterExtractor;

#[async_trait]
impl Extractor for HiddenParameterExtractor {
    fn stage(&self) -> Stage {
        Stage::HiddenParameters
    }

    async fn extract(&self, page: &PageContext<'_>) -> Result<StageOutput> {
        let params = extract_hidden_parameters(page.snapshot, page.scope);
        Ok(ExtractionResult::HiddenParameters(params).into())
    }
}
