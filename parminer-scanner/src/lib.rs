pub mod error;
pub mod extract;
pub mod frontier;
pub mod rate;
pub mod renderer;
pub mod scope;
pub mod snapshot;

pub use error::ScanError;
pub use extract::{ExtractionResult, Extractor, PageContext, Stage, StageMask};
pub use frontier::{Crawler, CrawlState, PageOutcome};
pub use rate::{RateLimiter, RetryPolicy};
pub use renderer::{ClientSettings, HttpProbeClient, HttpRenderer, PageRenderer, ProbeClient};
pub use scope::{RobotsRules, ScopePolicy};
pub use snapshot::PageSnapshot;
