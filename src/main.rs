use std::error::Error;
use std::path::{Path, PathBuf};

use patron::{ContentQuery, PatronConfig, build_client};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "patron.yaml";

fn load_config() -> Result<PatronConfig, Box<dyn Error>> {
    let explicit = std::env::args().nth(1).map(PathBuf::from);
    let mut config = match explicit {
        Some(path) => PatronConfig::from_file(&path)?,
        None if Path::new(DEFAULT_CONFIG).exists() => PatronConfig::from_file(DEFAULT_CONFIG)?,
        None => PatronConfig::default(),
    };
    config.apply_env_overrides()?;
    Ok(config)
}

fn init_tracing(config: &PatronConfig) -> Result<(), Box<dyn Error>> {
    let filter = EnvFilter::try_new(&config.logging.level)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    if config.logging.json {
        builder.json().try_init().map_err(|e| e as Box<dyn Error>)?;
    } else {
        builder.try_init().map_err(|e| e as Box<dyn Error>)?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let config = load_config()?;
    init_tracing(&config)?;
    info!(name = ?config.name, base_url = %config.api.base_url, "config_loaded");

    let client = build_client(&config).await?;

    match client.get_content(&ContentQuery::page(1)).await {
        Ok(page) => {
            println!(
                "content page {}/{}: {} items ({} total)",
                page.pagination.page,
                page.pagination.pages,
                page.items.len(),
                page.pagination.total
            );
            for item in &page.items {
                println!("  {}  {}", item.id, item.title);
            }
        }
        Err(err) => warn!(error = %err, kind = err.kind(), "content_fetch_failed"),
    }

    let stats = client.stats();
    println!("circuit:          {}", client.circuit_state());
    println!("cache entries:    {}", client.cache_size());
    println!("cache hit rate:   {:.2}", stats.cache.hit_rate());
    println!("network calls:    {}", stats.network_calls);
    println!("active / queued:  {} / {}", stats.active_requests, stats.queued_requests);
    println!("token refreshes:  {}", stats.token_refreshes);

    Ok(())
}
