use super::{ExtractionResult, Extractor, PageContext, Stage, StageOutput};
use crate::error::Result;
use crate::scope::ScopePolicy;
use crate::snapshot::{Body, NetworkTransaction};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;

static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("static regex")
});
static BEARER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bbearer\s+[A-Za-z0-9\-._~+/]{8,}=*").expect("static regex")
});
static JWT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\beyJ[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+\.[A-Za-z0-9_-]*").expect("static regex")
});
static CARD_CANDIDATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:\d[ -]?){12,18}\d\b").expect("static regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensitiveKind {
    CardNumber,
    Email,
    BearerToken,
    Jwt,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensitiveTag {
    pub kind: SensitiveKind,
    /// `request` or `response`.
    pub location: String,
    /// Masked sample of the match.
    pub sample: String,
}

/// A same-domain GET or POST captured during the page load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkFinding {
    pub url: String,
    pub method: String,
    pub request_headers: BTreeMap<String, String>,
    pub request_body: Body,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub response_headers: BTreeMap<String, String>,
    pub response_body: Body,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<SensitiveTag>,
}

/// Luhn checksum over the digits of `candidate`.
pub fn luhn_valid(candidate: &str) -> bool {
    let digits: Vec<u32> = candidate.chars().filter_map(|c| c.to_digit(10)).collect();
    if !(13..=19).contains(&digits.len()) {
        return false;
    }
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 { doubled - 9 } else { doubled }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}

fn mask(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}…{}", head, tail)
}

/// Sensitive-looking values in `text`.
pub fn scan_sensitive(text: &str, location: &str) -> Vec<SensitiveTag> {
    let mut tags = Vec::new();
    let mut push = |kind, matched: &str| {
        let tag = SensitiveTag {
            kind,
            location: location.to_string(),
            sample: mask(matched),
        };
        if !tags.contains(&tag) {
            tags.push(tag);
        }
    };

    for m in CARD_CANDIDATE.find_iter(text) {
        if luhn_valid(m.as_str()) {
            push(SensitiveKind::CardNumber, m.as_str());
        }
    }
    for m in EMAIL.find_iter(text) {
        push(SensitiveKind::Email, m.as_str());
    }
    for m in BEARER.find_iter(text) {
        push(SensitiveKind::BearerToken, m.as_str());
    }
    for m in JWT.find_iter(text) {
        push(SensitiveKind::Jwt, m.as_str());
    }
    tags
}

fn tag_transaction(transaction: &NetworkTransaction) -> Vec<SensitiveTag> {
    let mut tags = Vec::new();
    for value in transaction.request_headers.values() {
        tags.extend(scan_sensitive(value, "request"));
    }
    if let Some(text) = transaction.request_body.as_text() {
        tags.extend(scan_sensitive(text, "request"));
    }
    if let Some(text) = transaction.response_body.as_text() {
        tags.extend(scan_sensitive(text, "response"));
    }
    tags
}

/// Same-domain GET/POST transactions, with binary bodies left as size
/// placeholders and sensitive-looking values tagged.
pub fn extract_network_findings(
    transactions: &[NetworkTransaction],
    scope: &ScopePolicy,
) -> Vec<NetworkFinding> {
    transactions
        .iter()
        .filter(|t| matches!(t.method.to_ascii_uppercase().as_str(), "GET" | "POST"))
        .filter(|t| scope.is_same_domain_str(&t.url))
        .map(|t| NetworkFinding {
            url: t.url.clone(),
            method: t.method.to_ascii_uppercase(),
            request_headers: t.request_headers.clone(),
            request_body: t.request_body.clone(),
            status: t.status,
            response_headers: t.response_headers.clone(),
            response_body: t.response_body.clone(),
            tags: tag_transaction(t),
        })
        .collect()
}

pub struct NetworkExtractor;

#[async_trait]
impl Extractor for NetworkExtractor {
    fn stage(&self) -> Stage {
        Stage::NetworkTransactions
    }

    async fn extract(&self, page: &PageContext<'_>) -> Result<StageOutput> {
        let findings = extract_network_findings(&page.snapshot.transactions, page.scope);
        Ok(ExtractionResult::NetworkFindings(findings).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::RobotsRules;

    fn transaction(url: &str, method: &str, response: Body) -> NetworkTransaction {
        NetworkTransaction {
            url: url.to_string(),
            method: method.to_string(),
            request_headers: BTreeMap::new(),
            request_body: Body::Empty,
            status: Some(200),
            response_headers: BTreeMap::new(),
            response_body: response,
        }
    }

    #[test]
    fn keeps_same_domain_get_and_post_only() {
        let scope = ScopePolicy::new("example.com", RobotsRules::allow_all());
        let transactions = vec![
            transaction("https://example.com/api/a", "GET", Body::Empty),
            transaction("https://example.com/api/b", "post", Body::Empty),
            transaction("https://example.com/api/c", "PUT", Body::Empty),
            transaction("https://cdn.other.net/lib.js", "GET", Body::Empty),
        ];
        let findings = extract_network_findings(&transactions, &scope);
        let urls: Vec<&str> = findings.iter().map(|f| f.url.as_str()).collect();
        assert_eq!(urls, vec!["https://example.com/api/a", "https://example.com/api/b"]);
        assert_eq!(findings[1].method, "POST");
    }

    #[test]
    fn binary_bodies_stay_placeholders() {
        let scope = ScopePolicy::new("example.com", RobotsRules::allow_all());
        let body = Body::classify(&[0x89, 0x50, 0x4e, 0x47], Some("image/png"));
        let findings =
            extract_network_findings(&[transaction("https://example.com/logo.png", "GET", body)], &scope);
        assert!(findings[0].response_body.is_binary());
        assert!(findings[0].tags.is_empty());
    }

    #[test]
    fn tags_sensitive_values() {
        let text = r#"{"email":"alice@example.com","card":"4111 1111 1111 1111","bad":"4111111111111112",
            "auth":"Bearer abcdefghijklmnop","jwt":"eyJhbGciOiJIUzI1NiJ9.eyJzdWIiOiIxIn0.sig"}"#;
        let tags = scan_sensitive(text, "response");
        let kinds: Vec<SensitiveKind> = tags.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                SensitiveKind::CardNumber,
                SensitiveKind::Email,
                SensitiveKind::BearerToken,
                SensitiveKind::Jwt
            ]
        );
        assert!(!tags[0].sample.contains("1111 1111 1111"));
    }

    #[test]
    fn luhn() {
        assert!(luhn_valid("4111111111111111"));
        assert!(luhn_valid("5500-0000-0000-0004"));
        assert!(!luhn_valid("4111111111111112"));
        assert!(!luhn_valid("1234"));
    }
}
