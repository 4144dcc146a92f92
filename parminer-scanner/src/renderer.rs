use crate::error::{Result, ScanError};
use crate::scope::resolve_href;
use crate::snapshot::{Body, Cookie, NetworkTransaction, PageSnapshot, is_textual};
use async_trait::async_trait;
use reqwest::Client;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

pub const DEFAULT_USER_AGENT: &str = "parminer/0.2 (https://github.com/trapdoorsec/parminer)";

/// Loads a URL and exposes what the page looked like once loaded.
/// Implementations own the navigation session; the traversal loop is the
/// only caller.
#[async_trait]
pub trait PageRenderer: Send + Sync {
    async fn render(&self, url: &str) -> Result<PageSnapshot>;
}

/// Out-of-band HTTP capability, separate from the navigation session.
/// Used for robots.txt, script downloads and reflection probes.
#[async_trait]
pub trait ProbeClient: Send + Sync {
    async fn send(&self, request: ProbeRequest) -> Result<ProbeResponse>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProbeMethod {
    Get,
    Post,
}

impl ProbeMethod {
    /// Form `method` attribute semantics: anything but POST submits as GET.
    pub fn from_form_attr(method: Option<&str>) -> Self {
        match method.map(|m| m.trim().to_ascii_uppercase()) {
            Some(m) if m == "POST" => ProbeMethod::Post,
            _ => ProbeMethod::Get,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeMethod::Get => "GET",
            ProbeMethod::Post => "POST",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeRequest {
    pub method: ProbeMethod,
    pub url: String,
    /// GET: appended to the query string. POST: form-encoded body.
    pub form: Vec<(String, String)>,
}

impl ProbeRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: ProbeMethod::Get,
            url: url.into(),
            form: Vec::new(),
        }
    }

    pub fn submit(method: ProbeMethod, url: impl Into<String>, form: Vec<(String, String)>) -> Self {
        Self {
            method,
            url: url.into(),
            form,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResponse {
    pub url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
}

impl ProbeResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Connection settings shared by both HTTP adapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    pub user_agent: String,
    pub timeout: Duration,
    pub headers: Vec<(String, String)>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout: Duration::from_secs(30),
            headers: Vec::new(),
        }
    }
}

impl ClientSettings {
    fn header_map(&self) -> Result<HeaderMap> {
        let mut map = HeaderMap::new();
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.trim().as_bytes())
                .map_err(|e| ScanError::Setup(format!("bad header name '{}': {}", name, e)))?;
            let value = HeaderValue::from_str(value.trim())
                .map_err(|e| ScanError::Setup(format!("bad header value for {}: {}", name, e)))?;
            map.insert(name, value);
        }
        Ok(map)
    }

    fn client(&self, jar: Option<Arc<Jar>>) -> Result<Client> {
        let builder = Client::builder()
            .user_agent(self.user_agent.clone())
            .default_headers(self.header_map()?)
            .timeout(self.timeout)
            .connect_timeout(self.timeout / 2)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .redirect(reqwest::redirect::Policy::limited(5));
        let builder = match jar {
            Some(jar) => builder.cookie_provider(jar),
            None => builder,
        };
        builder
            .build()
            .map_err(|e| ScanError::Setup(format!("failed to create HTTP client: {}", e)))
    }

    /// Headers as the document request carried them, for the captured
    /// transaction.
    fn request_headers(&self) -> BTreeMap<String, String> {
        let mut headers: BTreeMap<String, String> = self
            .headers
            .iter()
            .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
            .collect();
        headers.insert("user-agent".to_string(), self.user_agent.clone());
        headers
    }
}

fn collect_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        out.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    out
}

/// Navigable links in a document: `a`, `area`, `iframe` and `frame`
/// targets resolved against `base`, de-duplicated in document order.
pub fn extract_links(dom: &str, base: &Url) -> Vec<String> {
    let document = Html::parse_document(dom);
    let selector = Selector::parse("a[href], area[href], iframe[src], frame[src]")
        .expect("static selector");

    let mut seen = HashSet::new();
    let mut links = Vec::new();
    for element in document.select(&selector) {
        let target = element
            .value()
            .attr("href")
            .or_else(|| element.value().attr("src"));
        if let Some(href) = target
            && let Some(url) = resolve_href(base, href)
        {
            let url = url.to_string();
            if seen.insert(url.clone()) {
                links.push(url);
            }
        }
    }
    links
}

/// Cookies from the final response, plus whatever the session jar holds
/// for `url` under a name not already seen. Redirect hops set cookies that
/// only the jar remembers.
fn merge_jar_cookies(mut cookies: Vec<Cookie>, jar: &Jar, url: &Url) -> Vec<Cookie> {
    let Some(header) = jar.cookies(url) else {
        return cookies;
    };
    let Ok(header) = header.to_str() else {
        return cookies;
    };
    for pair in header.split(';') {
        if let Some(cookie) = Cookie::parse_set_cookie(pair)
            && !cookies.iter().any(|c| c.name == cookie.name)
        {
            cookies.push(cookie);
        }
    }
    cookies
}

/// Static-HTTP renderer: one reqwest session backed by a cookie jar. It does
/// not execute JavaScript, so storage maps stay empty and the only captured
/// transaction is the document request itself.
pub struct HttpRenderer {
    client: Client,
    jar: Arc<Jar>,
    settings: ClientSettings,
}

impl HttpRenderer {
    pub fn new(settings: ClientSettings) -> Result<Self> {
        let jar = Arc::new(Jar::default());
        Ok(Self {
            client: settings.client(Some(jar.clone()))?,
            jar,
            settings,
        })
    }
}

#[async_trait]
impl PageRenderer for HttpRenderer {
    async fn render(&self, url: &str) -> Result<PageSnapshot> {
        debug!("Rendering {}", url);
        let target = Url::parse(url).map_err(|e| ScanError::InvalidUrl(format!("{}: {}", url, e)))?;

        let response = self.client.get(target.clone()).send().await?;
        let status = response.status();
        if status.is_server_error() {
            return Err(ScanError::ServerStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let resolved = response.url().clone();
        let headers = response.headers().clone();
        let bytes = response.bytes().await?;

        let response_headers = collect_headers(&headers);
        let content_type = headers
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let cookies = headers
            .get_all(reqwest::header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(Cookie::parse_set_cookie)
            .collect();
        let cookies = merge_jar_cookies(cookies, &self.jar, &resolved);

        let response_body = Body::classify(&bytes, content_type.as_deref());
        let dom = if is_textual(content_type.as_deref()) {
            String::from_utf8_lossy(&bytes).into_owned()
        } else {
            String::new()
        };

        let mut snapshot = PageSnapshot::new(url.to_string(), resolved.to_string());
        snapshot.status_code = status.as_u16();
        snapshot.links = extract_links(&dom, &resolved);
        snapshot.dom = dom;
        snapshot.cookies = cookies;
        snapshot.transactions.push(NetworkTransaction {
            url: resolved.to_string(),
            method: "GET".to_string(),
            request_headers: self.settings.request_headers(),
            request_body: Body::Empty,
            status: Some(status.as_u16()),
            response_headers,
            response_body,
        });

        Ok(snapshot)
    }
}

/// Plain reqwest client without a cookie store, so probes never leak
/// state into the navigation session.
pub struct HttpProbeClient {
    client: Client,
}

impl HttpProbeClient {
    pub fn new(settings: &ClientSettings) -> Result<Self> {
        Ok(Self {
            client: settings.client(None)?,
        })
    }
}

#[async_trait]
impl ProbeClient for HttpProbeClient {
    async fn send(&self, request: ProbeRequest) -> Result<ProbeResponse> {
        let builder = match request.method {
            ProbeMethod::Get => self.client.get(&request.url).query(&request.form),
            ProbeMethod::Post => self.client.post(&request.url).form(&request.form),
        };

        let response = builder.send().await?;
        let status = response.status();
        if status.is_server_error() {
            return Err(ScanError::ServerStatus {
                url: request.url,
                status: status.as_u16(),
            });
        }

        let url = response.url().to_string();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await?;

        Ok(ProbeResponse {
            url,
            status: status.as_u16(),
            content_type,
            body,
        })
    }
}
