pub mod error;
pub mod options;
pub mod persist;
pub mod report;
pub mod scan;
pub mod validate;

pub use error::CoreError;
pub use options::ScanOptions;
pub use report::{PageRecord, ReportFormat, RunError, RunReport, RunStatus};
pub use scan::{Aggregator, ScanProgressCallback, execute_scan};
