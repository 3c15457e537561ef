use crate::config::types::{
    CacheConfig, Config, CrawlerConfig, RewriteEntry, ServerConfig, SiteEntry, UserAgentConfig,
};
use crate::url::matches_host;
use crate::ConfigError;
use std::net::SocketAddr;
use url::Url;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_crawler_config(&config.crawler)?;
    validate_user_agent_config(&config.user_agent)?;
    validate_cache_config(&config.cache)?;
    validate_server_config(&config.server)?;
    validate_sites(&config.site)?;
    validate_rewrites(&config.rewrite)?;
    Ok(())
}

fn validate_crawler_config(config: &CrawlerConfig) -> Result<(), ConfigError> {
    if config.workers < 1 || config.workers > 256 {
        return Err(ConfigError::Validation(format!(
            "workers must be between 1 and 256, got {}",
            config.workers
        )));
    }

    if config.queue_capacity < 1 {
        return Err(ConfigError::Validation(
            "queue-capacity must be >= 1".to_string(),
        ));
    }

    Ok(())
}

fn validate_user_agent_config(config: &UserAgentConfig) -> Result<(), ConfigError> {
    if config.crawler_name.is_empty() {
        return Err(ConfigError::Validation(
            "crawler-name cannot be empty".to_string(),
        ));
    }

    if !config
        .crawler_name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-')
    {
        return Err(ConfigError::Validation(format!(
            "crawler-name must contain only alphanumeric characters and hyphens, got '{}'",
            config.crawler_name
        )));
    }

    Url::parse(&config.contact_url)
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid contact-url: {}", e)))?;

    validate_email(&config.contact_email)?;

    Ok(())
}

fn validate_cache_config(config: &CacheConfig) -> Result<(), ConfigError> {
    if config.root.is_empty() {
        return Err(ConfigError::Validation("cache root cannot be empty".to_string()));
    }

    if config.ttl < 1 {
        return Err(ConfigError::Validation("ttl must be >= 1 second".to_string()));
    }

    if config.placeholder_ttl < 1 {
        return Err(ConfigError::Validation(
            "placeholder-ttl must be >= 1 second".to_string(),
        ));
    }

    Ok(())
}

fn validate_server_config(config: &ServerConfig) -> Result<(), ConfigError> {
    config.listen.parse::<SocketAddr>().map_err(|e| {
        ConfigError::Validation(format!("Invalid listen address '{}': {}", config.listen, e))
    })?;

    match (&config.origin, config.cross_host) {
        (Some(origin), _) => {
            let url = Url::parse(origin)
                .map_err(|e| ConfigError::InvalidUrl(format!("Invalid origin '{}': {}", origin, e)))?;
            if url.scheme() != "http" && url.scheme() != "https" {
                return Err(ConfigError::InvalidUrl(format!(
                    "Origin '{}' must use http or https",
                    origin
                )));
            }
        }
        (None, false) => {
            return Err(ConfigError::Validation(
                "server.origin is required unless cross-host is enabled".to_string(),
            ));
        }
        (None, true) => {}
    }

    if config.inline_timeout < 1 {
        return Err(ConfigError::Validation(
            "inline-timeout must be >= 1 second".to_string(),
        ));
    }

    Ok(())
}

fn validate_sites(sites: &[SiteEntry]) -> Result<(), ConfigError> {
    if sites.is_empty() {
        return Err(ConfigError::Validation(
            "at least one [[site]] must be configured".to_string(),
        ));
    }

    for site in sites {
        validate_host_pattern(&site.host)?;

        for seed in &site.seeds {
            let url = Url::parse(seed).map_err(|e| {
                ConfigError::InvalidUrl(format!("Invalid seed URL '{}': {}", seed, e))
            })?;

            if url.scheme() != "http" && url.scheme() != "https" {
                return Err(ConfigError::Validation(format!(
                    "Seed URL '{}' must use http or https",
                    seed
                )));
            }

            let host = url.host_str().unwrap_or_default();
            if !matches_host(&site.host, host) {
                return Err(ConfigError::Validation(format!(
                    "Seed URL '{}' is not on site '{}'",
                    seed, site.host
                )));
            }
        }
    }

    Ok(())
}

fn validate_rewrites(rewrites: &[RewriteEntry]) -> Result<(), ConfigError> {
    for entry in rewrites {
        validate_host(&entry.from)?;
        validate_host(&entry.to)?;
    }
    Ok(())
}

/// Validates a host pattern (supports a leading `*.` wildcard)
fn validate_host_pattern(pattern: &str) -> Result<(), ConfigError> {
    validate_host(pattern.strip_prefix("*.").unwrap_or(pattern))
}

/// Validates a bare host name or IP address
fn validate_host(host: &str) -> Result<(), ConfigError> {
    if host.is_empty() {
        return Err(ConfigError::InvalidHost("host cannot be empty".to_string()));
    }

    if !host
        .chars()
        .all(|c| c.is_alphanumeric() || c == '.' || c == '-')
    {
        return Err(ConfigError::InvalidHost(format!(
            "Host '{}' contains invalid characters",
            host
        )));
    }

    if host.starts_with('.')
        || host.ends_with('.')
        || host.starts_with('-')
        || host.ends_with('-')
        || host.contains("..")
    {
        return Err(ConfigError::InvalidHost(format!(
            "Host '{}' is malformed",
            host
        )));
    }

    Ok(())
}

/// Basic email validation
fn validate_email(email: &str) -> Result<(), ConfigError> {
    let Some((local, domain)) = email.split_once('@') else {
        return Err(ConfigError::Validation(format!(
            "Invalid email format: '{}'",
            email
        )));
    };

    if local.is_empty() || domain.is_empty() || domain.contains('@') || !domain.contains('.') {
        return Err(ConfigError::Validation(format!(
            "Invalid email format: '{}'",
            email
        )));
    }

    Ok(())
}
