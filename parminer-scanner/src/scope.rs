use crate::rate::{RateLimiter, RetryPolicy};
use crate::renderer::{ProbeClient, ProbeRequest};
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, info, warn};
use url::Url;

/// `host[:port]` of a URL, the unit the scope policy compares on.
/// Default ports are omitted by the URL parser.
pub fn authority(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

/// Resolve an href relative to `base` and strip its fragment. Non-navigable
/// hrefs (`javascript:`, `mailto:`, `tel:`, `data:`, fragment-only) and
/// non-http(s) results yield `None`.
pub fn resolve_href(base: &Url, href: &str) -> Option<Url> {
    let href = href.trim();
    if href.is_empty()
        || href.starts_with('#')
        || href.starts_with("javascript:")
        || href.starts_with("mailto:")
        || href.starts_with("tel:")
        || href.starts_with("data:")
    {
        return None;
    }

    let mut url = base.join(href).ok()?;
    url.set_fragment(None);

    match url.scheme() {
        "http" | "https" => Some(url),
        _ => None,
    }
}

/// Parse and normalize an absolute URL: scheme-qualified, fragment removed.
pub fn normalize_url(raw: &str) -> Option<String> {
    let mut url = Url::parse(raw.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.set_fragment(None);
    Some(url.to_string())
}

/// Add `https://` to bare hosts such as `example.com/path`.
pub fn ensure_scheme(raw: &str) -> String {
    let raw = raw.trim();
    if raw.starts_with("http://") || raw.starts_with("https://") {
        raw.to_string()
    } else {
        format!("https://{}", raw)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScopeDecision {
    pub allowed: bool,
    pub reason: &'static str,
}

impl ScopeDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: "in scope",
        }
    }

    fn deny(reason: &'static str) -> Self {
        Self {
            allowed: false,
            reason,
        }
    }
}

#[derive(Debug, Clone)]
struct RobotsRule {
    allow: bool,
    pattern: String,
    matcher: Regex,
}

impl RobotsRule {
    /// `*` spans any run of characters and a trailing `$` anchors the end;
    /// everything else is a literal prefix.
    fn new(allow: bool, pattern: &str) -> Option<Self> {
        let (body, anchored) = match pattern.strip_suffix('$') {
            Some(p) => (p, true),
            None => (pattern, false),
        };
        let mut expr = String::from("^");
        expr.push_str(
            &body
                .split('*')
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join(".*"),
        );
        if anchored {
            expr.push('$');
        }

        Some(Self {
            allow,
            pattern: pattern.to_string(),
            matcher: Regex::new(&expr).ok()?,
        })
    }

    fn matches(&self, path: &str) -> bool {
        self.matcher.is_match(path)
    }
}

/// Allow/Disallow rules from the `User-agent: *` groups of a robots.txt.
#[derive(Debug, Clone, Default)]
pub struct RobotsRules {
    rules: Vec<RobotsRule>,
}

impl RobotsRules {
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn parse(body: &str) -> Self {
        let mut rules = Vec::new();
        let mut in_wildcard = false;
        // consecutive User-agent lines belong to the same group
        let mut reading_agents = false;

        for line in body.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();

            match key.as_str() {
                "user-agent" => {
                    if !reading_agents {
                        in_wildcard = false;
                    }
                    reading_agents = true;
                    if value == "*" {
                        in_wildcard = true;
                    }
                }
                "allow" | "disallow" => {
                    reading_agents = false;
                    if !in_wildcard || value.is_empty() {
                        continue;
                    }
                    if let Some(rule) = RobotsRule::new(key == "allow", value) {
                        rules.push(rule);
                    }
                }
                _ => reading_agents = false,
            }
        }

        debug!("Parsed {} robots.txt rules for wildcard agent", rules.len());
        Self { rules }
    }

    /// Longest matching rule wins; `Allow` wins ties.
    pub fn is_allowed(&self, url: &Url) -> bool {
        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }

        let mut best: Option<&RobotsRule> = None;
        for rule in self.rules.iter().filter(|r| r.matches(&path)) {
            best = match best {
                None => Some(rule),
                Some(current) => {
                    let (len, cur_len) = (rule.pattern.len(), current.pattern.len());
                    if len > cur_len || (len == cur_len && rule.allow && !current.allow) {
                        Some(rule)
                    } else {
                        Some(current)
                    }
                }
            };
        }

        best.map(|r| r.allow).unwrap_or(true)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Fetch `/robots.txt` for the seed's origin once. A missing, unreadable or
/// unparseable file means everything is allowed.
pub async fn load_robots(
    probe: &dyn ProbeClient,
    limiter: &RateLimiter,
    retry: &RetryPolicy,
    seed: &Url,
) -> RobotsRules {
    let Ok(robots_url) = seed.join("/robots.txt") else {
        return RobotsRules::allow_all();
    };

    let response = retry
        .run(limiter, "robots.txt", || {
            probe.send(ProbeRequest::get(robots_url.as_str()))
        })
        .await;

    match response {
        Ok(response) if response.is_success() => {
            let rules = RobotsRules::parse(&response.body);
            info!("Loaded {} robots.txt rules from {}", rules.len(), robots_url);
            rules
        }
        Ok(response) => {
            debug!("No robots.txt at {} (status {})", robots_url, response.status);
            RobotsRules::allow_all()
        }
        Err(e) => {
            warn!("Could not fetch {}: {}", robots_url, e);
            RobotsRules::allow_all()
        }
    }
}

/// Decides whether a candidate URL may enter the frontier.
#[derive(Debug, Clone)]
pub struct ScopePolicy {
    base_domain: String,
    robots: RobotsRules,
}

impl ScopePolicy {
    pub fn new(base_domain: impl Into<String>, robots: RobotsRules) -> Self {
        Self {
            base_domain: base_domain.into(),
            robots,
        }
    }

    pub fn base_domain(&self) -> &str {
        &self.base_domain
    }

    pub fn robots(&self) -> &RobotsRules {
        &self.robots
    }

    pub fn is_same_domain(&self, url: &Url) -> bool {
        authority(url).is_some_and(|a| a == self.base_domain)
    }

    pub fn is_same_domain_str(&self, url: &str) -> bool {
        Url::parse(url).is_ok_and(|u| self.is_same_domain(&u))
    }

    /// Host, then robots, then visited. Never fails: anything that does not
    /// parse is simply denied.
    pub fn check(&self, candidate: &str, visited: &HashSet<String>) -> ScopeDecision {
        let Some(normalized) = normalize_url(candidate) else {
            return ScopeDecision::deny("malformed url");
        };
        let Ok(url) = Url::parse(&normalized) else {
            return ScopeDecision::deny("malformed url");
        };

        if !self.is_same_domain(&url) {
            return ScopeDecision::deny("off domain");
        }
        if !self.robots.is_allowed(&url) {
            return ScopeDecision::deny("disallowed by robots.txt");
        }
        if visited.contains(&normalized) {
            return ScopeDecision::deny("already visited");
        }

        ScopeDecision::allow()
    }
}
