use crate::error::{Result, ScanError};
use crate::extract::scripts::inline_script_urls;
use crate::rate::{RateLimiter, RetryPolicy};
use crate::renderer::PageRenderer;
use crate::scope::{ScopePolicy, normalize_url, resolve_href};
use crate::snapshot::PageSnapshot;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

pub const DEFAULT_MAX_DEPTH: usize = 2;
pub const DEFAULT_LINK_CAP: usize = 10;

pub type ProgressCallback = Arc<dyn Fn(usize, String) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FrontierEntry {
    pub url: String,
    pub depth: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlState {
    Running,
    Completed,
    Cancelled,
}

/// What happened to one popped frontier entry.
#[derive(Debug)]
pub enum PageOutcome {
    Fetched { snapshot: PageSnapshot, depth: usize },
    Failed { url: String, depth: usize, error: ScanError },
}

impl PageOutcome {
    pub fn url(&self) -> &str {
        match self {
            PageOutcome::Fetched { snapshot, .. } => &snapshot.requested_url,
            PageOutcome::Failed { url, .. } => url,
        }
    }

    pub fn depth(&self) -> usize {
        match self {
            PageOutcome::Fetched { depth, .. } | PageOutcome::Failed { depth, .. } => *depth,
        }
    }
}

/// Breadth-first traversal over one site. Pages are handed out one at a
/// time through [`Crawler::next_page`] so callers can run per-page work
/// between fetches.
pub struct Crawler<'r> {
    renderer: &'r dyn PageRenderer,
    scope: ScopePolicy,
    limiter: RateLimiter,
    retry: RetryPolicy,
    max_depth: usize,
    link_cap: usize,
    queue: VecDeque<FrontierEntry>,
    queued: HashSet<String>,
    visited: HashSet<String>,
    visit_order: Vec<String>,
    cancel: CancellationToken,
    progress_callback: Option<ProgressCallback>,
    state: CrawlState,
}

impl<'r> Crawler<'r> {
    /// The seed is only checked for being parseable; it defines the scope
    /// and is fetched even when robots.txt would disallow it.
    pub fn new(renderer: &'r dyn PageRenderer, scope: ScopePolicy, seed: &str) -> Result<Self> {
        let parsed = Url::parse(seed)
            .map_err(|e| ScanError::InvalidUrl(format!("Invalid URL {}: {}", seed, e)))?;
        if !scope.is_same_domain(&parsed) {
            return Err(ScanError::InvalidUrl(format!(
                "seed {} is outside {}",
                seed,
                scope.base_domain()
            )));
        }

        let mut queue = VecDeque::new();
        let mut queued = HashSet::new();
        queued.insert(normalize_url(seed).unwrap_or_else(|| seed.to_string()));
        queue.push_back(FrontierEntry {
            url: seed.to_string(),
            depth: 0,
        });

        Ok(Self {
            renderer,
            scope,
            limiter: RateLimiter::default(),
            retry: RetryPolicy::default(),
            max_depth: DEFAULT_MAX_DEPTH,
            link_cap: DEFAULT_LINK_CAP,
            queue,
            queued,
            visited: HashSet::new(),
            visit_order: Vec::new(),
            cancel: CancellationToken::new(),
            progress_callback: None,
            state: CrawlState::Running,
        })
    }

    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn with_link_cap(mut self, cap: usize) -> Self {
        self.link_cap = cap;
        self
    }

    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.progress_callback = Some(callback);
        self
    }

    pub fn scope(&self) -> &ScopePolicy {
        &self.scope
    }

    pub fn state(&self) -> CrawlState {
        self.state
    }

    /// Normalized URLs in the order they were fetched.
    pub fn visited(&self) -> &[String] {
        &self.visit_order
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Pop entries until one is fetched or fails. `None` once the frontier
    /// is exhausted or the run was cancelled; [`Crawler::state`] tells which.
    pub async fn next_page(&mut self) -> Option<PageOutcome> {
        if self.state != CrawlState::Running {
            return None;
        }

        loop {
            if self.cancel.is_cancelled() {
                info!("Crawl cancelled with {} entries pending", self.queue.len());
                self.state = CrawlState::Cancelled;
                return None;
            }

            let Some(entry) = self.queue.pop_front() else {
                info!("Crawl complete. Visited {} pages", self.visit_order.len());
                self.state = CrawlState::Completed;
                return None;
            };

            if entry.depth > self.max_depth {
                continue;
            }

            let key = normalize_url(&entry.url).unwrap_or_else(|| entry.url.clone());
            if !self.visited.insert(key.clone()) {
                debug!("Skipping already visited {}", key);
                continue;
            }
            self.visit_order.push(key);

            if let Some(ref callback) = self.progress_callback {
                callback(self.visit_order.len(), entry.url.clone());
            }

            let renderer = self.renderer;
            let url = entry.url.as_str();
            let fetch = self.retry.run(&self.limiter, "render", || async move {
                renderer.render(url).await
            });

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                result = fetch => Some(result),
            };
            let Some(result) = result else {
                info!("Crawl cancelled while fetching {}", entry.url);
                self.state = CrawlState::Cancelled;
                return None;
            };

            return Some(match result {
                Ok(snapshot) => {
                    self.mark_resolved(&snapshot);
                    self.enqueue_links(&snapshot, entry.depth);
                    PageOutcome::Fetched {
                        snapshot,
                        depth: entry.depth,
                    }
                }
                Err(error) => {
                    warn!("Crawl error for {}: {}", entry.url, error);
                    PageOutcome::Failed {
                        url: entry.url,
                        depth: entry.depth,
                        error,
                    }
                }
            });
        }
    }

    /// Drain the frontier without doing any per-page work.
    pub async fn run(&mut self) -> Vec<PageOutcome> {
        let mut outcomes = Vec::new();
        while let Some(outcome) = self.next_page().await {
            outcomes.push(outcome);
        }
        outcomes
    }

    /// A redirect target counts as visited so it is not fetched again.
    fn mark_resolved(&mut self, snapshot: &PageSnapshot) {
        if snapshot.resolved_url != snapshot.requested_url
            && self.scope.is_same_domain_str(&snapshot.resolved_url)
            && let Some(key) = normalize_url(&snapshot.resolved_url)
        {
            self.visited.insert(key);
        }
    }

    fn enqueue_links(&mut self, snapshot: &PageSnapshot, depth: usize) {
        let next_depth = depth + 1;
        if next_depth > self.max_depth {
            return;
        }
        let Ok(base) = Url::parse(&snapshot.resolved_url) else {
            return;
        };

        let mut candidates = snapshot.links.clone();
        candidates.extend(inline_script_urls(&snapshot.dom));

        let mut seen = HashSet::new();
        let mut admitted = 0;
        for raw in candidates {
            if admitted >= self.link_cap {
                debug!("Link cap of {} reached on {}", self.link_cap, snapshot.resolved_url);
                break;
            }
            let Some(url) = resolve_href(&base, &raw) else {
                continue;
            };
            let url = url.to_string();
            if !seen.insert(url.clone()) || self.queued.contains(&url) {
                continue;
            }

            let decision = self.scope.check(&url, &self.visited);
            if !decision.allowed {
                debug!("Rejected {}: {}", url, decision.reason);
                continue;
            }

            debug!("Queuing {} at depth {}", url, next_depth);
            self.queued.insert(url.clone());
            self.queue.push_back(FrontierEntry {
                url,
                depth: next_depth,
            });
            admitted += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::{ClientSettings, HttpRenderer};
    use crate::scope::{RobotsRules, authority};
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    fn html(body: String) -> ResponseTemplate {
        ResponseTemplate::new(200)
            .insert_header("content-type", "text/html")
            .set_body_bytes(body.into_bytes())
    }

    async fn page(server: &MockServer, at: &str, body: String, times: u64) {
        Mock::given(method("GET"))
            .and(path(at))
            .respond_with(html(body))
            .expect(times)
            .mount(server)
            .await;
    }

    fn scope_for(server: &MockServer, robots: RobotsRules) -> ScopePolicy {
        let base = Url::parse(&server.uri()).unwrap();
        ScopePolicy::new(authority(&base).unwrap(), robots)
    }

    fn renderer() -> HttpRenderer {
        HttpRenderer::new(ClientSettings::default()).unwrap()
    }

    fn fetched_paths(outcomes: &[PageOutcome]) -> Vec<String> {
        outcomes
            .iter()
            .filter_map(|o| match o {
                PageOutcome::Fetched { snapshot, .. } => {
                    Some(Url::parse(&snapshot.requested_url).unwrap().path().to_string())
                }
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_link_discovery() {
        let mock_server = MockServer::start().await;
        let uri = mock_server.uri();
        page(
            &mock_server,
            "/",
            format!(r#"<a href="{uri}/page1">1</a><a href="/page2">2</a>"#),
            1,
        )
        .await;
        page(&mock_server, "/page1", "<p>P1</p>".to_string(), 1).await;
        page(&mock_server, "/page2", "<p>P2</p>".to_string(), 1).await;

        let renderer = renderer();
        let mut crawler = Crawler::new(&renderer, scope_for(&mock_server, RobotsRules::allow_all()), &uri)
            .unwrap()
            .with_rate_limiter(RateLimiter::unlimited());
        let outcomes = crawler.run().await;

        assert_eq!(fetched_paths(&outcomes), vec!["/", "/page1", "/page2"]);
        assert_eq!(crawler.state(), CrawlState::Completed);
        assert_eq!(outcomes[1].depth(), 1);
    }

    #[tokio::test]
    async fn off_domain_links_are_never_fetched() {
        let mock_server = MockServer::start().await;
        let other = MockServer::start().await;
        page(&other, "/", "<p>elsewhere</p>".to_string(), 0).await;
        page(
            &mock_server,
            "/",
            format!(r#"<a href="{}/">away</a>"#, other.uri()),
            1,
        )
        .await;

        let renderer = renderer();
        let mut crawler =
            Crawler::new(&renderer, scope_for(&mock_server, RobotsRules::allow_all()), &mock_server.uri())
                .unwrap()
                .with_rate_limiter(RateLimiter::unlimited());
        let outcomes = crawler.run().await;
        assert_eq!(outcomes.len(), 1);
    }

    #[tokio::test]
    async fn depth_limit_is_respected() {
        let mock_server = MockServer::start().await;
        page(&mock_server, "/", r#"<a href="/a">a</a>"#.to_string(), 1).await;
        page(&mock_server, "/a", r#"<a href="/b">b</a>"#.to_string(), 1).await;
        page(&mock_server, "/b", "<p>too deep</p>".to_string(), 0).await;

        let renderer = renderer();
        let mut crawler =
            Crawler::new(&renderer, scope_for(&mock_server, RobotsRules::allow_all()), &mock_server.uri())
                .unwrap()
                .with_max_depth(1)
                .with_rate_limiter(RateLimiter::unlimited());
        let outcomes = crawler.run().await;
        assert_eq!(fetched_paths(&outcomes), vec!["/", "/a"]);
        assert!(outcomes.iter().all(|o| o.depth() <= 1));
    }

    #[tokio::test]
    async fn cycles_terminate_without_refetching() {
        let mock_server = MockServer::start().await;
        page(&mock_server, "/", r#"<a href="/a">a</a><a href="/#top">self</a>"#.to_string(), 1).await;
        page(&mock_server, "/a", r#"<a href="/">home</a><a href="/a">me</a>"#.to_string(), 1).await;

        let renderer = renderer();
        let mut crawler =
            Crawler::new(&renderer, scope_for(&mock_server, RobotsRules::allow_all()), &mock_server.uri())
                .unwrap()
                .with_max_depth(10)
                .with_rate_limiter(RateLimiter::unlimited());
        let outcomes = crawler.run().await;
        assert_eq!(outcomes.len(), 2);
        assert_eq!(crawler.visited().len(), 2);
    }

    #[tokio::test]
    async fn link_cap_limits_children_per_page() {
        let mock_server = MockServer::start().await;
        let links: String = (1..=15).map(|i| format!(r#"<a href="/p{i}">{i}</a>"#)).collect();
        page(&mock_server, "/", links, 1).await;
        Mock::given(method("GET"))
            .respond_with(html("<p>leaf</p>".to_string()))
            .mount(&mock_server)
            .await;

        let renderer = renderer();
        let mut crawler =
            Crawler::new(&renderer, scope_for(&mock_server, RobotsRules::allow_all()), &mock_server.uri())
                .unwrap()
                .with_rate_limiter(RateLimiter::unlimited());
        let outcomes = crawler.run().await;
        assert_eq!(outcomes.len(), 1 + DEFAULT_LINK_CAP);
        assert!(!fetched_paths(&outcomes).contains(&"/p11".to_string()));
    }

    #[tokio::test]
    async fn robots_disallowed_links_are_skipped() {
        let mock_server = MockServer::start().await;
        page(
            &mock_server,
            "/",
            r#"<a href="/private/x">p</a><a href="/public">o</a>"#.to_string(),
            1,
        )
        .await;
        page(&mock_server, "/private/x", "<p>secret</p>".to_string(), 0).await;
        page(&mock_server, "/public", "<p>ok</p>".to_string(), 1).await;

        let robots = RobotsRules::parse("User-agent: *\nDisallow: /private\n");
        let renderer = renderer();
        let mut crawler = Crawler::new(&renderer, scope_for(&mock_server, robots), &mock_server.uri())
            .unwrap()
            .with_rate_limiter(RateLimiter::unlimited());
        let outcomes = crawler.run().await;
        assert_eq!(fetched_paths(&outcomes), vec!["/", "/public"]);
    }

    #[tokio::test]
    async fn inline_script_urls_are_followed() {
        let mock_server = MockServer::start().await;
        let uri = mock_server.uri();
        page(
            &mock_server,
            "/",
            format!(r#"<script>window.next = "{uri}/from-script";</script>"#),
            1,
        )
        .await;
        page(&mock_server, "/from-script", "<p>found</p>".to_string(), 1).await;

        let renderer = renderer();
        let mut crawler = Crawler::new(&renderer, scope_for(&mock_server, RobotsRules::allow_all()), &uri)
            .unwrap()
            .with_rate_limiter(RateLimiter::unlimited());
        let outcomes = crawler.run().await;
        assert_eq!(fetched_paths(&outcomes), vec!["/", "/from-script"]);
    }

    #[tokio::test]
    async fn failed_pages_do_not_stop_the_crawl() {
        let mock_server = MockServer::start().await;
        page(
            &mock_server,
            "/",
            r#"<a href="/broken">b</a><a href="/fine">f</a>"#.to_string(),
            1,
        )
        .await;
        Mock::given(method("GET"))
            .and(path("/broken"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&mock_server)
            .await;
        page(&mock_server, "/fine", "<p>fine</p>".to_string(), 1).await;

        let renderer = renderer();
        let mut crawler =
            Crawler::new(&renderer, scope_for(&mock_server, RobotsRules::allow_all()), &mock_server.uri())
                .unwrap()
                .with_rate_limiter(RateLimiter::unlimited())
                .with_retry_policy(RetryPolicy::none());
        let outcomes = crawler.run().await;

        assert_eq!(outcomes.len(), 3);
        assert!(matches!(
            &outcomes[1],
            PageOutcome::Failed { error: ScanError::ServerStatus { status: 500, .. }, .. }
        ));
        assert_eq!(fetched_paths(&outcomes), vec!["/", "/fine"]);
    }

    #[tokio::test]
    async fn cancelled_crawl_fetches_nothing() {
        let mock_server = MockServer::start().await;
        page(&mock_server, "/", "<p>never</p>".to_string(), 0).await;

        let token = CancellationToken::new();
        token.cancel();
        let renderer = renderer();
        let mut crawler =
            Crawler::new(&renderer, scope_for(&mock_server, RobotsRules::allow_all()), &mock_server.uri())
                .unwrap()
                .with_cancellation(token);
        assert!(crawler.next_page().await.is_none());
        assert_eq!(crawler.state(), CrawlState::Cancelled);
        assert!(crawler.visited().is_empty());
    }

    #[test]
    fn off_domain_seed_is_rejected() {
        let renderer = renderer();
        let scope = ScopePolicy::new("example.com", RobotsRules::allow_all());
        assert!(Crawler::new(&renderer, scope.clone(), "https://other.org/").is_err());
        assert!(Crawler::new(&renderer, scope, "not a url").is_err());
    }

    #[tokio::test]
    async fn progress_callback_sees_every_fetch() {
        use std::sync::Mutex;

        let mock_server = MockServer::start().await;
        page(&mock_server, "/", r#"<a href="/a">a</a>"#.to_string(), 1).await;
        page(&mock_server, "/a", "<p>a</p>".to_string(), 1).await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let renderer = renderer();
        let mut crawler =
            Crawler::new(&renderer, scope_for(&mock_server, RobotsRules::allow_all()), &mock_server.uri())
                .unwrap()
                .with_rate_limiter(RateLimiter::unlimited())
                .with_progress_callback(Arc::new(move |count, url| {
                    sink.lock().unwrap().push((count, url));
                }));
        crawler.run().await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].0, 2);
    }
}
