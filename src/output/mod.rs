//! Output module for crawl summaries
//!
//! This module handles printing the crawler's counters at the end of a run.

pub mod stats;

pub use stats::{print_statistics, CrawlStatistics};
