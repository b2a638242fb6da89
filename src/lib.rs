pub mod cache;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod model;
pub mod output;
pub mod platform;
pub mod rate_limit;
pub mod retry;
pub mod scanner;

pub use cache::{CacheStore, Lookup};
pub use config::{Config, ScanSettings};
pub use coordinator::{RunStatus, ScanCoordinator, ScanRun};
pub use model::{Extension, RiskLevel, ScanOutcome, ScanTask, Source};
pub use scanner::Scanner;
