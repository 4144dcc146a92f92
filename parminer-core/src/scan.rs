use crate::error::{CoreError, Result};
use crate::options::ScanOptions;
use crate::report::{PageRecord, RunError, RunReport, RunStatus};
use futures::FutureExt;
use parminer_scanner::extract::{PageContext, default_extractors};
use parminer_scanner::frontier::{CrawlState, PageOutcome};
use parminer_scanner::scope::{authority, load_robots, normalize_url};
use parminer_scanner::{
    Crawler, Extractor, HttpProbeClient, HttpRenderer, PageRenderer, PageSnapshot, ProbeClient,
    RateLimiter, ScanError, ScopePolicy, Stage,
};
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// Callback for reporting scan progress
pub type ScanProgressCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Drives one run: frontier traversal, then every enabled extractor on each
/// fetched page, collecting per-stage failures into the report instead of
/// aborting.
pub struct Aggregator<'a> {
    renderer: &'a dyn PageRenderer,
    probe: &'a dyn ProbeClient,
    options: ScanOptions,
    extractors: Vec<Box<dyn Extractor>>,
    progress_callback: Option<ScanProgressCallback>,
}

impl<'a> Aggregator<'a> {
    pub fn new(renderer: &'a dyn PageRenderer, probe: &'a dyn ProbeClient, options: ScanOptions) -> Self {
        Self {
            renderer,
            probe,
            options,
            extractors: default_extractors(),
            progress_callback: None,
        }
    }

    /// Replace the built-in extractor for the same stage.
    pub fn with_extractor(mut self, extractor: Box<dyn Extractor>) -> Self {
        let stage = extractor.stage();
        self.extractors.retain(|e| e.stage() != stage);
        self.extractors.push(extractor);
        self.extractors.sort_by_key(|e| e.stage());
        self
    }

    pub fn with_progress_callback(mut self, callback: ScanProgressCallback) -> Self {
        self.progress_callback = Some(callback);
        self
    }

    fn progress(&self, message: String) {
        if let Some(ref callback) = self.progress_callback {
            callback(message);
        }
    }

    /// Scan `seed`. Only an unusable seed is an error; everything that goes
    /// wrong afterwards ends up in the report's error list.
    pub async fn run(&self, seed: &str, cancel: CancellationToken) -> Result<RunReport> {
        let seed_url = Url::parse(seed).map_err(|e| CoreError::InvalidSeed(format!("{}: {}", seed, e)))?;
        if !matches!(seed_url.scheme(), "http" | "https") {
            return Err(CoreError::InvalidSeed(format!("{}: unsupported scheme", seed)));
        }
        let base_domain =
            authority(&seed_url).ok_or_else(|| CoreError::InvalidSeed(format!("{}: no host", seed)))?;

        info!("Starting scan of {} (depth {})", seed, self.options.effective_depth());
        let mut report = RunReport::new(base_domain.clone(), seed, self.options.clone());

        let run_token = cancel.child_token();
        let budget_timer = self.options.budget.map(|budget| {
            let token = run_token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(budget).await;
                info!("Time budget of {:?} exhausted", budget);
                token.cancel();
            })
        });

        let limiter = RateLimiter::new(self.options.requests_per_second);
        let robots = load_robots(self.probe, &limiter, &self.options.retry, &seed_url).await;
        let scope = ScopePolicy::new(base_domain, robots);

        let fetched = Arc::new(AtomicUsize::new(0));
        let progress = self.progress_callback.clone();
        let counter = fetched.clone();
        let mut crawler = Crawler::new(self.renderer, scope, seed)?
            .with_max_depth(self.options.effective_depth())
            .with_link_cap(self.options.link_cap)
            .with_rate_limiter(limiter.clone())
            .with_retry_policy(self.options.retry.clone())
            .with_cancellation(run_token.clone())
            .with_progress_callback(Arc::new(move |_visited: usize, url: String| {
                let count = counter.fetch_add(1, Ordering::Relaxed) + 1;
                if let Some(ref callback) = progress {
                    callback(format!("Scanning... {} pages, now {}", count, url));
                }
            }));

        while let Some(outcome) = crawler.next_page().await {
            match outcome {
                PageOutcome::Fetched { snapshot, depth } => {
                    let record = self
                        .extract_page(&snapshot, depth, crawler.scope(), &limiter, &run_token, &mut report.errors)
                        .await;
                    report.pages.push(record);
                }
                PageOutcome::Failed { url, error, .. } => {
                    self.progress(format!("[!]  Failed to fetch {}: {}", url, error));
                    report.errors.push(RunError::fetch(url, &error));
                }
            }
        }

        if let Some(timer) = budget_timer {
            timer.abort();
        }

        report.visited = crawler.visited().to_vec();
        let status = match crawler.state() {
            CrawlState::Cancelled => RunStatus::Cancelled,
            _ => RunStatus::Completed,
        };
        report.finalize(status);

        info!(
            "Scan of {} finished: {} pages, {} errors, valid={}",
            seed,
            report.pages.len(),
            report.errors.len(),
            report.valid
        );
        if !report.valid {
            warn!("Report shape violations: {:?}", report.violations);
        }
        Ok(report)
    }

    async fn extract_page(
        &self,
        snapshot: &PageSnapshot,
        depth: usize,
        scope: &ScopePolicy,
        limiter: &RateLimiter,
        cancel: &CancellationToken,
        errors: &mut Vec<RunError>,
    ) -> PageRecord {
        let url = normalize_url(&snapshot.requested_url).unwrap_or_else(|| snapshot.requested_url.clone());
        let page = PageContext {
            snapshot,
            scope,
            probe: self.probe,
            limiter,
            retry: &self.options.retry,
            probe_settings: &self.options.probe,
            script_concurrency: self.options.script_concurrency,
        };

        let mut results = BTreeMap::new();
        for extractor in &self.extractors {
            let stage = extractor.stage();
            if !self.options.stages.contains(stage) || cancel.is_cancelled() {
                continue;
            }

            debug!("Running {} on {}", stage, url);
            match AssertUnwindSafe(extractor.extract(&page)).catch_unwind().await {
                Ok(Ok(output)) if output.result.stage() == stage => {
                    errors.extend(output.issues.into_iter().map(|i| RunError::from_issue(stage, i)));
                    results.insert(stage, output.result);
                }
                Ok(Ok(output)) => {
                    let error = ScanError::Other(format!("extractor returned a {} result", output.result.stage()));
                    errors.push(RunError::stage(url.as_str(), stage, &error));
                }
                Ok(Err(error)) => {
                    warn!("Stage {} failed on {}: {}", stage, url, error);
                    errors.push(RunError::stage(url.as_str(), stage, &error));
                }
                Err(_) => {
                    warn!("Stage {} panicked on {}", stage, url);
                    errors.push(RunError {
                        url: url.clone(),
                        stage: Some(stage),
                        kind: "panic".to_string(),
                        message: format!("{} extractor panicked", stage),
                    });
                }
            }
        }

        // disabled, skipped and failed stages still get an empty result
        for stage in Stage::ALL {
            results.entry(stage).or_insert_with(|| stage.empty_result());
        }

        PageRecord {
            url,
            resolved_url: snapshot.resolved_url.clone(),
            status_code: snapshot.status_code,
            depth,
            results,
        }
    }
}

/// Execute a scan with the HTTP adapters.
/// Fails only when the clients cannot be built or the seed is unusable.
pub async fn execute_scan(
    options: ScanOptions,
    seed: &str,
    cancel: CancellationToken,
    progress_callback: Option<ScanProgressCallback>,
) -> Result<RunReport> {
    let renderer = HttpRenderer::new(options.renderer.clone())
        .map_err(|e| CoreError::Setup(format!("renderer: {}", e)))?;
    let probe = HttpProbeClient::new(&options.probe_client)
        .map_err(|e| CoreError::Setup(format!("probe client: {}", e)))?;

    let mut aggregator = Aggregator::new(&renderer, &probe, options);
    if let Some(callback) = progress_callback {
        aggregator = aggregator.with_progress_callback(callback);
    }
    aggregator.run(seed, cancel).await
}
