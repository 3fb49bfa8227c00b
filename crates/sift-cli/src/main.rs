//! Sift CLI
//!
//! Compiles filter lists, inspects the filter cache and drives the update
//! cycle outside the browser.

mod compile;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use sift_service::{
    CacheMetadata, FileExportEngine, FileFilterStore, FilterConfig, FilterManager, FilterState,
    FilterStore,
};

use crate::compile::{compile_files, payload_bytes, write_file};

#[derive(Parser)]
#[command(name = "sift")]
#[command(about = "Sift filter list compiler and cache tools")]
struct Cli {
    /// Filtering configuration (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the cache directory from the configuration
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile local filter list files into the cache
    Compile {
        /// Input filter list files
        #[arg(short, long, required = true)]
        input: Vec<String>,

        /// Also write the deduplicated network payload here
        #[arg(short, long)]
        payload: Option<PathBuf>,
    },

    /// Verify the cached filters
    Validate,

    /// Show cache metadata and rule counts
    Info,

    /// Run one update cycle against the configured subscriptions
    Update {
        /// Ignore the update interval
        #[arg(short, long)]
        force: bool,

        /// Recompile every list instead of applying diffs
        #[arg(long)]
        full: bool,
    },

    /// Print the cosmetic filtering script for a domain
    Script {
        /// Page domain
        #[arg(short, long)]
        domain: String,
    },

    /// Compile the active filters into an exported payload
    Export {
        /// Output directory
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Delete the filter cache
    Clear,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match load_config(cli.config.as_deref(), cli.cache_dir) {
        Ok(config) => match cli.command {
            Commands::Compile { input, payload } => {
                cmd_compile(&config, &input, payload.as_deref(), cli.verbose)
            }
            Commands::Validate => cmd_validate(&config),
            Commands::Info => cmd_info(&config),
            Commands::Update { force, full } => cmd_update(config, force, full).await,
            Commands::Script { domain } => cmd_script(config, &domain).await,
            Commands::Export { output } => cmd_export(config, &output).await,
            Commands::Clear => cmd_clear(&config),
        },
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if verbose { "debug" } else { "info" };
        tracing_subscriber::EnvFilter::new(format!("{level},reqwest=warn,hyper=warn"))
    });
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>, cache_dir: Option<PathBuf>) -> Result<FilterConfig, String> {
    let mut config = match path {
        Some(path) => FilterConfig::load(path).map_err(|e| e.to_string())?,
        None => FilterConfig::default(),
    };
    if let Some(dir) = cache_dir {
        config.cache_dir = dir;
    }
    Ok(config)
}

fn cmd_compile(
    config: &FilterConfig,
    inputs: &[String],
    payload: Option<&Path>,
    verbose: bool,
) -> Result<(), String> {
    let (set, stats) = compile_files(inputs, verbose)?;

    let store = FileFilterStore::new(config.cache_dir.clone());
    store
        .save_cache(&set)
        .map_err(|e| format!("Failed to write cache: {}", e))?;

    println!("Compiled {} filter lists to '{}'", stats.lists, store.dir().display());
    println!("  Lines:    {} ({} invalid)", stats.lines, stats.invalid);
    println!("  Rules:    {} ({} network)", stats.rules, stats.network_rules);
    if stats.cosmetic_exceptions > 0 {
        println!("  Skipped:  {} cosmetic exceptions", stats.cosmetic_exceptions);
    }
    println!("  Time:     {:.1}ms", stats.total_ms);

    if let Some(path) = payload {
        let (bytes, deduped) = payload_bytes(&set)?;
        write_file(path, &bytes)?;
        println!(
            "  Payload:  '{}' ({} bytes, dedupe removed {})",
            path.display(),
            bytes.len(),
            deduped
        );
    }

    Ok(())
}

fn cmd_validate(config: &FilterConfig) -> Result<(), String> {
    let store = FileFilterStore::new(config.cache_dir.clone());
    let set = store
        .load_cached()
        .map_err(|e| format!("Invalid cache: {}", e))?;

    println!("Cache '{}' is valid", store.dir().display());
    println!("  Version:     {}", set.version);
    println!("  Rules:       {}", set.rule_count());
    Ok(())
}

fn cmd_info(config: &FilterConfig) -> Result<(), String> {
    let store = FileFilterStore::new(config.cache_dir.clone());
    let info = store.cache_info();
    if !info.exists {
        return Err(format!("No cache in '{}'", store.dir().display()));
    }

    println!("Cache: {}", store.dir().display());
    if let Some(CacheMetadata {
        format_version,
        created_at,
        last_used,
        data_hash,
        source_versions,
        last_check_time,
    }) = store.metadata()
    {
        println!("  Format:      v{}", format_version);
        println!("  Created:     {}", created_at);
        println!("  Last used:   {}", last_used);
        match last_check_time {
            Some(at) => println!("  Last check:  {}", at),
            None => println!("  Last check:  never"),
        }
        println!("  Hash:        {}", data_hash);
        println!();
        println!("Sources:");
        for (url, version) in &source_versions {
            println!("  {}  {}", version, url);
        }
        println!();
    }

    let set = store
        .load_cached()
        .map_err(|e| format!("Invalid cache: {}", e))?;
    println!("Rules:");
    println!("  Network:     {}", set.network_len());
    println!(
        "  Cosmetic:    {} selectors on {} domains",
        set.cosmetic_rules.selector_count(),
        set.cosmetic_rules.domain_count()
    );
    println!("  Generic:     {}", set.generic_hiding.len());
    Ok(())
}

async fn start_manager(mut config: FilterConfig) -> Result<std::sync::Arc<FilterManager>, String> {
    config.auto_update = false;
    let manager = FilterManager::with_defaults(config).map_err(|e| e.to_string())?;
    match manager.initialize().await {
        FilterState::Active => Ok(manager),
        state => Err(format!("Filters not available ({}): {}", state, manager.status().message)),
    }
}

async fn cmd_update(config: FilterConfig, force: bool, full: bool) -> Result<(), String> {
    let manager = start_manager(config).await?;

    if full {
        let count = manager
            .refresh_from_sources()
            .await
            .map_err(|e| e.to_string())?;
        println!("Recompiled {} rules", count);
        return Ok(());
    }

    let report = manager.updater().check_and_update(force).await;
    if report.disabled {
        println!("Content filtering is disabled, nothing to update");
        return Ok(());
    }
    if report.throttled {
        println!("Checked recently, skipping (use --force to override)");
        return Ok(());
    }
    println!("Checked:     {}", report.checked);
    println!("Unchanged:   {}", report.unchanged);
    println!("Applied:     {}", report.applied);
    println!("Failed:      {}", report.failed);
    if report.full_refresh {
        println!("Fell back to a full recompile");
    }
    println!("Status:      {} ({})", manager.status().state, manager.status().message);
    Ok(())
}

async fn cmd_script(config: FilterConfig, domain: &str) -> Result<(), String> {
    let manager = start_manager(config).await?;
    println!("{}", manager.cosmetic_script_for_domain(domain));
    Ok(())
}

async fn cmd_export(config: FilterConfig, output: &Path) -> Result<(), String> {
    let manager = start_manager(config).await?;
    let engine = FileExportEngine::new(output);
    let count = manager
        .publish_to(&engine)
        .await
        .map_err(|e| e.to_string())?;
    println!("Exported {} network rules to '{}'", count, output.display());
    Ok(())
}

fn cmd_clear(config: &FilterConfig) -> Result<(), String> {
    let store = FileFilterStore::new(config.cache_dir.clone());
    store.invalidate().map_err(|e| e.to_string())?;
    println!("Cleared '{}'", store.dir().display());
    Ok(())
}
