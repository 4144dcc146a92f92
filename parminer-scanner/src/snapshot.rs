use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Content-type fragments that mark a body as decodable text.
const TEXTUAL_TYPES: &[&str] = &[
    "text",
    "json",
    "xml",
    "html",
    "javascript",
    "x-www-form-urlencoded",
];

/// One fetched page as seen by the renderer. Every extractor for the page
/// reads the same snapshot; nothing mutates it after construction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageSnapshot {
    pub requested_url: String,
    pub resolved_url: String,
    pub status_code: u16,
    pub dom: String,
    /// Absolute links as reported by the renderer, fragment already stripped.
    pub links: Vec<String>,
    pub cookies: Vec<Cookie>,
    pub local_storage: BTreeMap<String, String>,
    pub session_storage: BTreeMap<String, String>,
    pub transactions: Vec<NetworkTransaction>,
}

impl PageSnapshot {
    pub fn new(requested_url: String, resolved_url: String) -> Self {
        Self {
            requested_url,
            resolved_url,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub http_only: bool,
    pub secure: bool,
    pub same_site: String,
}

impl Cookie {
    /// Parse a single `Set-Cookie` header value. Returns `None` when the
    /// leading `name=value` pair is missing.
    pub fn parse_set_cookie(header: &str) -> Option<Self> {
        let mut parts = header.split(';');
        let (name, value) = parts.next()?.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }

        let mut cookie = Cookie {
            name: name.to_string(),
            value: value.trim().trim_matches('"').to_string(),
            domain: None,
            path: None,
            http_only: false,
            secure: false,
            same_site: "None".to_string(),
        };

        for attr in parts {
            let attr = attr.trim();
            let (key, val) = attr.split_once('=').unwrap_or((attr, ""));
            match key.trim().to_ascii_lowercase().as_str() {
                "httponly" => cookie.http_only = true,
                "secure" => cookie.secure = true,
                "samesite" => cookie.same_site = val.trim().to_string(),
                "domain" => cookie.domain = Some(val.trim().to_string()),
                "path" => cookie.path = Some(val.trim().to_string()),
                _ => {}
            }
        }

        Some(cookie)
    }
}

/// A captured HTTP exchange made while the page loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkTransaction {
    pub url: String,
    pub method: String,
    pub request_headers: BTreeMap<String, String>,
    pub request_body: Body,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub response_headers: BTreeMap<String, String>,
    pub response_body: Body,
}

impl NetworkTransaction {
    pub fn request_content_type(&self) -> Option<&str> {
        header_value(&self.request_headers, "content-type")
    }

    pub fn response_content_type(&self) -> Option<&str> {
        header_value(&self.response_headers, "content-type")
    }
}

/// Case-insensitive header lookup.
pub fn header_value<'a>(headers: &'a BTreeMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Body {
    Empty,
    Text { text: String },
    /// Not decoded: either the content type is not textual or the bytes
    /// are not valid UTF-8.
    Binary {
        #[serde(skip_serializing_if = "Option::is_none")]
        content_type: Option<String>,
        len: usize,
    },
}

impl Body {
    /// Classify raw bytes by their declared content type. Bytes are only
    /// decoded when the type is textual and they are valid UTF-8.
    pub fn classify(bytes: &[u8], content_type: Option<&str>) -> Self {
        if bytes.is_empty() {
            return Body::Empty;
        }

        if is_textual(content_type)
            && let Ok(text) = std::str::from_utf8(bytes)
        {
            return Body::Text {
                text: text.to_string(),
            };
        }

        Body::Binary {
            content_type: content_type.map(str::to_string),
            len: bytes.len(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Body::Text { text } => Some(text),
            _ => None,
        }
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, Body::Binary { .. })
    }
}

pub fn is_textual(content_type: Option<&str>) -> bool {
    content_type
        .map(|ct| {
            let ct = ct.to_ascii_lowercase();
            TEXTUAL_TYPES.iter().any(|t| ct.contains(t))
        })
        .unwrap_or(false)
}
