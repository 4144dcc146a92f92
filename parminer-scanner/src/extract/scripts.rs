use super::{ExtractionResult, Extractor, PageContext, Stage, StageIssue, StageOutput};
use crate::error::{Result, ScanError};
use crate::renderer::ProbeRequest;
use crate::scope::resolve_href;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use regex::Regex;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::LazyLock;
use tracing::{debug, warn};
use url::Url;

static ABSOLUTE_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s'"`<>\\]+"#).expect("static regex"));
static CONFIG_PAIR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"['"](\w+)['"]\s*:\s*['"](\w+)['"]"#).expect("static regex")
});

pub const DEFAULT_SCRIPT_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigPair {
    pub key: String,
    pub value: String,
}

/// What one same-domain external script revealed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptFinding {
    pub url: String,
    pub endpoints: Vec<String>,
    pub config_pairs: Vec<ConfigPair>,
}

/// Absolute http(s) URLs in a piece of script text, first occurrence order.
pub fn absolute_urls(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    ABSOLUTE_URL
        .find_iter(text)
        .map(|m| m.as_str().trim_end_matches([',', ';', ')', '.']).to_string())
        .filter(|u| seen.insert(u.clone()))
        .collect()
}

pub fn config_pairs(text: &str) -> Vec<ConfigPair> {
    let mut seen = HashSet::new();
    CONFIG_PAIR
        .captures_iter(text)
        .map(|c| ConfigPair {
            key: c[1].to_string(),
            value: c[2].to_string(),
        })
        .filter(|p| seen.insert((p.key.clone(), p.value.clone())))
        .collect()
}

/// Absolute URLs embedded in inline `<script>` blocks.
pub fn inline_script_urls(dom: &str) -> Vec<String> {
    let document = Html::parse_document(dom);
    let selector = Selector::parse("script:not([src])").expect("static selector");
    let mut seen = HashSet::new();
    document
        .select(&selector)
        .flat_map(|s| absolute_urls(&s.text().collect::<String>()))
        .filter(|u| seen.insert(u.clone()))
        .collect()
}

/// `<script src>` targets resolved against `base`, de-duplicated.
pub fn external_script_urls(dom: &str, base: &Url) -> Vec<Url> {
    let document = Html::parse_document(dom);
    let selector = Selector::parse("script[src]").expect("static selector");
    let mut seen = HashSet::new();
    document
        .select(&selector)
        .filter_map(|s| resolve_href(base, s.value().attr("src")?))
        .filter(|u| seen.insert(u.to_string()))
        .collect()
}

/// Downloads same-domain external scripts and scans them for endpoints and
/// key/value configuration. One failing script is reported as an issue and
/// does not affect the others.
pub struct ScriptScanner;

impl ScriptScanner {
    async fn fetch(page: &PageContext<'_>, url: &Url) -> Result<String> {
        let target = url.to_string();
        let response = page
            .retry
            .run(page.limiter, "script download", || {
                page.probe.send(ProbeRequest::get(target.clone()))
            })
            .await?;
        if !response.is_success() {
            return Err(ScanError::Other(format!(
                "script {} returned status {}",
                target, response.status
            )));
        }
        Ok(response.body)
    }
}

#[async_trait]
impl Extractor for ScriptScanner {
    fn stage(&self) -> Stage {
        Stage::JsScan
    }

    async fn extract(&self, page: &PageContext<'_>) -> Result<StageOutput> {
        let base = Url::parse(&page.snapshot.resolved_url)
            .map_err(|e| ScanError::InvalidUrl(format!("{}: {}", page.snapshot.resolved_url, e)))?;
        let scripts: Vec<Url> = external_script_urls(&page.snapshot.dom, &base)
            .into_iter()
            .filter(|u| page.scope.is_same_domain(u))
            .collect();
        debug!("{} same-domain scripts on {}", scripts.len(), base);

        let concurrency = page.script_concurrency.max(1);
        let fetched: Vec<(Url, Result<String>)> = stream::iter(scripts)
            .map(|url| async move {
                let result = Self::fetch(page, &url).await;
                (url, result)
            })
            .buffered(concurrency)
            .collect()
            .await;

        let mut findings = Vec::new();
        let mut issues = Vec::new();
        for (url, result) in fetched {
            match result {
                Ok(source) => {
                    let endpoints = absolute_urls(&source);
                    let pairs = config_pairs(&source);
                    if !endpoints.is_empty() || !pairs.is_empty() {
                        findings.push(ScriptFinding {
                            url: url.to_string(),
                            endpoints,
                            config_pairs: pairs,
                        });
                    }
                }
                Err(e) => {
                    warn!("Script {} failed: {}", url, e);
                    issues.push(StageIssue::from_error(url.as_str(), &e));
                }
            }
        }

        Ok(StageOutput {
            result: ExtractionResult::JsFindings(findings),
            issues,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::reflect::ProbeSettings;
    use crate::rate::{RateLimiter, RetryPolicy};
    use crate::renderer::{ClientSettings, HttpProbeClient};
    use crate::scope::{RobotsRules, ScopePolicy, authority};
    use crate::snapshot::PageSnapshot;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    #[test]
    fn endpoints_and_pairs() {
        let source = r#"
            fetch("https://example.com/api/v1/users");
            const cfg = {"env": "prod", 'region': 'eu1'};
            load('https://cdn.example.com/x.js'), load("https://example.com/api/v1/users");
        "#;
        assert_eq!(
            absolute_urls(source),
            vec!["https://example.com/api/v1/users", "https://cdn.example.com/x.js"]
        );
        assert_eq!(
            config_pairs(source),
            vec![
                ConfigPair {
                    key: "env".into(),
                    value: "prod".into()
                },
                ConfigPair {
                    key: "region".into(),
                    value: "eu1".into()
                }
            ]
        );
    }

    #[test]
    fn script_sources_are_resolved() {
        let base = Url::parse("https://example.com/app/").unwrap();
        let dom = r#"<script src="main.js"></script><script src="/main.js"></script>
                     <script src="https://example.com/app/main.js"></script><script>inline()</script>"#;
        let urls: Vec<String> = external_script_urls(dom, &base)
            .into_iter()
            .map(|u| u.to_string())
            .collect();
        assert_eq!(
            urls,
            vec!["https://example.com/app/main.js", "https://example.com/main.js"]
        );
    }

    #[tokio::test]
    async fn failing_script_does_not_hide_the_others() {
        let site = MockServer::start().await;
        let elsewhere = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/app.js"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"fetch("https://example.com/api/orders"); var cfg = {"env": "staging"};"#,
            ))
            .expect(1)
            .mount(&site)
            .await;
        Mock::given(method("GET"))
            .and(path("/broken.js"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&site)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("var x = 'https://a.b/c';"))
            .expect(0)
            .mount(&elsewhere)
            .await;

        let page_url = format!("{}/index.html", site.uri());
        let mut snapshot = PageSnapshot::new(page_url.clone(), page_url);
        snapshot.dom = format!(
            r#"<script src="/app.js"></script><script src="/broken.js"></script>
               <script src="{}/vendor.js"></script>"#,
            elsewhere.uri()
        );
        let base = Url::parse(&site.uri()).unwrap();
        let scope = ScopePolicy::new(authority(&base).unwrap(), RobotsRules::allow_all());
        let probe = HttpProbeClient::new(&ClientSettings::default()).unwrap();
        let limiter = RateLimiter::unlimited();
        let retry = RetryPolicy::none();
        let settings = ProbeSettings::default();
        let page = PageContext {
            snapshot: &snapshot,
            scope: &scope,
            probe: &probe,
            limiter: &limiter,
            retry: &retry,
            probe_settings: &settings,
            script_concurrency: 2,
        };

        let output = ScriptScanner.extract(&page).await.unwrap();
        let findings = match &output.result {
            ExtractionResult::JsFindings(f) => f,
            other => panic!("unexpected result {:?}", other),
        };
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].url, format!("{}/app.js", site.uri()));
        assert_eq!(findings[0].endpoints, vec!["https://example.com/api/orders"]);
        assert_eq!(findings[0].config_pairs.len(), 1);
        assert_eq!(output.issues.len(), 1);
        assert_eq!(output.issues[0].url, format!("{}/broken.js", site.uri()));
    }

    #[test]
    fn inline_urls() {
        let dom = r#"<script>var next = "https://example.com/hidden";</script><script src="/x.js"></script>"#;
        assert_eq!(inline_script_urls(dom), vec!["https://example.com/hidden"]);
    }
}
