pub mod browser;
pub mod config;
pub mod crawler;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod job;
pub mod models;
pub mod navigate;
pub mod ratelimit;
pub mod server;

pub use config::AppConfig;
pub use error::EngineError;
pub use models::{CrawlTarget, JobResult, PageRange};
