//! Statistics snapshot of a crawl
//!
//! This module reads the crawler's counters and prints them in a
//! human-readable summary.

use crate::crawler::Crawler;

/// Crawl statistics summary
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrawlStatistics {
    /// Items handed to the queue (seeds, discovered links, on-demand fetches)
    pub queued: u64,

    /// Items actually downloaded
    pub downloaded: u64,

    /// Links found in downloaded bodies
    pub links_found: u64,
}

impl CrawlStatistics {
    /// Snapshots the crawler's counters
    pub fn from_crawler(crawler: &Crawler) -> Self {
        Self {
            queued: crawler.queued_count(),
            downloaded: crawler.downloaded_count(),
            links_found: crawler.link_found_count(),
        }
    }

    /// Queued items that were never downloaded
    ///
    /// Either already cached when dequeued, or discarded by a stop.
    pub fn skipped(&self) -> u64 {
        self.queued.saturating_sub(self.downloaded)
    }
}

/// Prints statistics to stdout in a formatted manner
///
/// # Arguments
///
/// * `stats` - The statistics to display
pub fn print_statistics(stats: &CrawlStatistics) {
    println!("=== Crawl Statistics ===\n");

    println!("Overview:");
    println!("  URLs queued: {}", stats.queued);
    println!("  URLs downloaded: {}", stats.downloaded);
    println!("  URLs skipped: {}", stats.skipped());
    println!("  Links found: {}", stats.links_found);
    println!();

    let download_rate = if stats.queued > 0 {
        (stats.downloaded as f64 / stats.queued as f64) * 100.0
    } else {
        0.0
    };

    println!(
        "Download Rate: {:.1}% ({} / {} queued URLs downloaded)",
        download_rate, stats.downloaded, stats.queued
    );
}
