//! Site-Mirror main entry point
//!
//! This is the command-line interface for the Site-Mirror crawling cache.

use anyhow::Context;
use clap::Parser;
use site_mirror::cache::{CacheStore, DiskFs};
use site_mirror::config::{load_config_with_hash, Config};
use site_mirror::crawler::{build_http_client, Crawler};
use site_mirror::output::{print_statistics, CrawlStatistics};
use site_mirror::Mirror;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Site-Mirror: a crawling, self-refilling site mirror
///
/// Site-Mirror crawls the configured sites into an on-disk cache and serves
/// that cache over HTTP, fetching missing pages on demand and refreshing
/// expired ones in the background.
#[derive(Parser, Debug)]
#[command(name = "site-mirror")]
#[command(version = "0.1.0")]
#[command(about = "A crawling, self-refilling site mirror", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Validate config and show what would be mirrored without doing it
    #[arg(long, conflicts_with = "crawl_only")]
    dry_run: bool,

    /// Crawl the seeds until idle, then exit without serving
    #[arg(long, conflicts_with = "dry_run")]
    crawl_only: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    setup_logging(cli.verbose, cli.quiet);

    // Load and validate configuration
    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (config, config_hash) = load_config_with_hash(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    tracing::info!("Configuration loaded successfully (hash: {})", config_hash);

    if cli.dry_run {
        handle_dry_run(&config);
        return Ok(());
    }

    handle_mirror(config, cli.crawl_only).await
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        // Only show errors
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("site_mirror=info,warn"),
            1 => EnvFilter::new("site_mirror=debug,info"),
            2 => EnvFilter::new("site_mirror=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

/// Handles the --dry-run mode: validates config and shows what would happen
fn handle_dry_run(config: &Config) {
    println!("=== Site-Mirror Dry Run ===\n");

    println!("Crawler Configuration:");
    println!("  Workers: {}", config.crawler.workers);
    println!("  Auto-download depth: {}", config.crawler.auto_download_depth);
    println!("  Queue capacity: {}", config.crawler.queue_capacity);

    println!("\nUser Agent:");
    println!("  Name: {}", config.user_agent.crawler_name);
    println!("  Version: {}", config.user_agent.crawler_version);
    println!("  Contact URL: {}", config.user_agent.contact_url);
    println!("  Contact Email: {}", config.user_agent.contact_email);

    println!("\nCache:");
    println!("  Root: {}", config.cache.root);
    println!("  TTL: {}s", config.cache.ttl);
    println!("  Placeholder TTL: {}s", config.cache.placeholder_ttl);

    println!("\nServer:");
    println!("  Listen: {}", config.server.listen);
    if config.server.cross_host {
        println!("  Mode: cross-host (/<scheme>/<host>/<path>)");
    } else {
        println!(
            "  Mode: bound to {}",
            config.server.origin.as_deref().unwrap_or("?")
        );
    }
    println!("  Inline timeout: {}s", config.server.inline_timeout);

    println!("\nMirrored Sites ({}):", config.site.len());
    for entry in &config.site {
        println!("  - {} ({} seeds)", entry.host, entry.seeds.len());
        for seed in &entry.seeds {
            println!("    * {}", seed);
        }
    }

    if !config.rewrite.is_empty() {
        println!("\nHost Rewrites ({}):", config.rewrite.len());
        for entry in &config.rewrite {
            println!("  - {} -> {}", entry.from, entry.to);
        }
    }

    println!("\n✓ Configuration is valid");
    println!(
        "✓ Would start mirroring with {} seed URLs",
        config.site.iter().map(|s| s.seeds.len()).sum::<usize>()
    );
}

/// Handles the main operation: crawl, and serve unless `crawl_only`
async fn handle_mirror(config: Config, crawl_only: bool) -> anyhow::Result<()> {
    let client = build_http_client(&config.user_agent)?;
    let store = Arc::new(CacheStore::new(Arc::new(DiskFs), &config.cache.root)?);
    tracing::info!("Cache root: {}", store.root().display());

    let crawler = Crawler::new(client, config.crawler.queue_capacity);
    crawler.set_worker_count(config.crawler.workers as usize)?;
    crawler.set_auto_download_depth(config.crawler.auto_download_depth);

    let listen = config.server.listen.clone();
    let mirror = Mirror::new(config, store, crawler)?;
    mirror.crawler().start();
    mirror.seed().await?;

    if crawl_only {
        tokio::select! {
            _ = mirror.crawler().wait_idle() => tracing::info!("Crawl finished"),
            _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted, stopping crawl"),
        }
        mirror.stop().await;
    } else {
        let listener = TcpListener::bind(&listen)
            .await
            .with_context(|| format!("Failed to listen on {}", listen))?;
        let engine = Arc::clone(mirror.engine());
        let server = tokio::spawn(async move { engine.start(listener).await });

        tokio::signal::ctrl_c().await?;
        tracing::info!("Shutting down");
        mirror.stop().await;
        server.await??;
    }

    print_statistics(&CrawlStatistics::from_crawler(mirror.crawler()));
    Ok(())
}
