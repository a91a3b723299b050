//! Worker tier: the crawl engine and everything it drives.
//!
//! A worker pulls prioritized requests from the [`scheduler`], fetches pages
//! through the [`fetcher`] under the task's rate limits, runs native or
//! scripted parse rules, feeds discovered links back in, and hands extracted
//! records to the storage sink.

pub mod engine;
pub mod fetcher;
pub mod rules;
pub mod scheduler;
pub mod script;
pub mod server;
pub mod useragent;

pub use engine::{Crawler, CrawlerBuilder};
pub use fetcher::BrowserFetcher;
pub use scheduler::Scheduler;
