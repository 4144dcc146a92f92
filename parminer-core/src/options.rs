use parminer_scanner::extract::ProbeSettings;
use parminer_scanner::extract::scripts::DEFAULT_SCRIPT_CONCURRENCY;
use parminer_scanner::frontier::{DEFAULT_LINK_CAP, DEFAULT_MAX_DEPTH};
use parminer_scanner::rate::DEFAULT_REQUESTS_PER_SECOND;
use parminer_scanner::{ClientSettings, RetryPolicy, StageMask};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Options for configuring a scan run. Recorded verbatim in the report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanOptions {
    pub max_depth: usize,
    /// Children admitted per page.
    pub link_cap: usize,
    /// When false only the seed page is analysed.
    pub crawl: bool,
    pub stages: StageMask,
    pub requests_per_second: u32,
    pub retry: RetryPolicy,
    pub renderer: ClientSettings,
    pub probe_client: ClientSettings,
    pub probe: ProbeSettings,
    pub script_concurrency: usize,
    /// Wall-clock limit for the whole run.
    pub budget: Option<Duration>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            link_cap: DEFAULT_LINK_CAP,
            crawl: true,
            stages: StageMask::ALL,
            requests_per_second: DEFAULT_REQUESTS_PER_SECOND,
            retry: RetryPolicy::default(),
            renderer: ClientSettings::default(),
            probe_client: ClientSettings::default(),
            probe: ProbeSettings::default(),
            script_concurrency: DEFAULT_SCRIPT_CONCURRENCY,
            budget: None,
        }
    }
}

impl ScanOptions {
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn with_crawl(mut self, crawl: bool) -> Self {
        self.crawl = crawl;
        self
    }

    pub fn with_stages(mut self, stages: StageMask) -> Self {
        self.stages = stages;
        self
    }

    pub fn with_requests_per_second(mut self, rps: u32) -> Self {
        self.requests_per_second = rps;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.renderer.timeout = timeout;
        self.probe_client.timeout = timeout;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        let user_agent = user_agent.into();
        self.renderer.user_agent = user_agent.clone();
        self.probe_client.user_agent = user_agent;
        self
    }

    /// Extra header sent on every request of both clients.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let header = (name.into(), value.into());
        self.renderer.headers.push(header.clone());
        self.probe_client.headers.push(header);
        self
    }

    pub fn with_marker(mut self, marker: impl Into<String>) -> Self {
        self.probe.marker = marker.into();
        self
    }

    pub fn with_budget(mut self, budget: Option<Duration>) -> Self {
        self.budget = budget;
        self
    }

    /// Depth actually used by the frontier.
    pub fn effective_depth(&self) -> usize {
        if self.crawl { self.max_depth } else { 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parminer_scanner::Stage;

    #[test]
    fn defaults() {
        let options = ScanOptions::default();
        assert_eq!(options.max_depth, 2);
        assert_eq!(options.link_cap, 10);
        assert_eq!(options.requests_per_second, 8);
        assert!(options.stages.contains(Stage::ReflectedProbe));
        assert_eq!(options.retry.max_retries, 3);
    }

    #[test]
    fn no_crawl_means_depth_zero() {
        let options = ScanOptions::default().with_max_depth(5).with_crawl(false);
        assert_eq!(options.effective_depth(), 0);
    }

    #[test]
    fn zero_rate_disables_throttling() {
        let options = ScanOptions::default().with_requests_per_second(0);
        assert!(parminer_scanner::RateLimiter::new(options.requests_per_second).is_unlimited());
        assert!(!parminer_scanner::RateLimiter::new(ScanOptions::default().requests_per_second).is_unlimited());
    }

    #[test]
    fn headers_and_agent_apply_to_both_clients() {
        let options = ScanOptions::default()
            .with_user_agent("researcher")
            .with_header("X-Researcher-Username", "alice");
        assert_eq!(options.renderer.user_agent, "researcher");
        assert_eq!(options.probe_client.headers.len(), 1);
        assert_eq!(options.renderer.headers[0].0, "X-Researcher-Username");
    }
}
