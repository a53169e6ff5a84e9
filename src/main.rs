use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use firemap_index::cluster::MergePolicy;
use firemap_index::config::AppConfig;
use firemap_index::planner::QueryRegion;
use firemap_index::rebuild::{IndexOptions, RebuildMode, query, rebuild_category};
use firemap_index::record::Category;
use firemap_index::source::{SourceCache, load_collection, normalize};
use firemap_index::store::FileStore;
use firemap_index::IndexError;

#[derive(Parser)]
#[command(about = "Geohash cluster index for fire-department map features")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Merge a category's source collection into the cluster index
    Rebuild {
        category: Category,

        /// Source location, overriding the configured one
        #[arg(long)]
        source: Option<String>,

        /// Fail on conflicting records instead of overwriting them
        #[arg(long)]
        strict: bool,
    },
    /// Recompute a category's membership in every cell, dropping stale entries
    Reconcile {
        category: Category,

        #[arg(long)]
        source: Option<String>,

        #[arg(long)]
        strict: bool,
    },
    /// Features within a radius of a point or inside a bounding box
    Query {
        #[arg(
            long,
            allow_hyphen_values = true,
            requires_all = ["lng", "radius"],
            conflicts_with = "bbox"
        )]
        lat: Option<f64>,

        #[arg(long, allow_hyphen_values = true)]
        lng: Option<f64>,

        /// Radius in meters
        #[arg(long)]
        radius: Option<f64>,

        /// swLng,swLat,neLng,neLat[,swZ,neZ]
        #[arg(long, allow_hyphen_values = true)]
        bbox: Option<String>,

        /// Write GeoJSON here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Convert a survey-grid coordinate to WGS84
    Convert {
        #[arg(allow_hyphen_values = true)]
        x: f64,
        #[arg(allow_hyphen_values = true)]
        y: f64,

        #[arg(long)]
        system: Option<String>,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            let invalid = err
                .downcast_ref::<IndexError>()
                .is_some_and(IndexError::is_validation);
            if invalid { ExitCode::from(2) } else { ExitCode::FAILURE }
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => AppConfig::load_from_file(path)?,
        None => AppConfig::default(),
    };

    match cli.command {
        Commands::Rebuild { category, source, strict } => {
            rebuild(&config, category, source, strict, RebuildMode::Incremental)
        }
        Commands::Reconcile { category, source, strict } => {
            rebuild(&config, category, source, strict, RebuildMode::Reconcile)
        }
        Commands::Query { lat, lng, radius, bbox, output } => {
            let region = QueryRegion::from_params(lat, lng, radius, bbox.as_deref())?;
            let store = open_store(&config)?;
            let features = query(&store, &options(&config, false), &region)?;
            let json = serde_json::to_string_pretty(&features)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json)?;
                    eprintln!("Wrote {} features to {}", features.features.len(), path.display());
                }
                None => println!("{}", json),
            }
            Ok(())
        }
        Commands::Convert { x, y, system } => {
            let system = system.unwrap_or_else(|| config.projection.default_system.clone());
            let registry = config.registry();
            let (lat, lng) = registry.convert(x, y, &system).with_context(|| {
                let mut known: Vec<&str> = registry.systems().collect();
                known.sort_unstable();
                format!("Known systems: {}", known.join(", "))
            })?;
            println!("{:.8} {:.8}", lat, lng);
            Ok(())
        }
    }
}

fn options(config: &AppConfig, strict: bool) -> IndexOptions {
    let policy = if strict {
        MergePolicy::Strict
    } else {
        MergePolicy::LastWriterWins
    };
    config.index_options(policy)
}

fn open_store(config: &AppConfig) -> Result<FileStore> {
    let path = &config.store.path;
    FileStore::open(path)
        .with_context(|| format!("Failed to open store at {}", path.display()))
}

fn rebuild(
    config: &AppConfig,
    category: Category,
    source: Option<String>,
    strict: bool,
    mode: RebuildMode,
) -> Result<()> {
    let configured = config.source(category);
    let location = source
        .or_else(|| configured.map(|s| s.location.clone()))
        .ok_or_else(|| anyhow!("No source configured for category {}", category))?;
    let cache_dir = configured
        .map(|s| s.cache_dir.clone())
        .unwrap_or_else(|| PathBuf::from(".cache"));
    let default_system = configured
        .and_then(|s| s.system.clone())
        .unwrap_or_else(|| config.projection.default_system.clone());
    let ttl = configured.map(|s| s.cache_ttl()).unwrap_or(Duration::ZERO);

    let spinner = ProgressBar::new_spinner();
    spinner.set_message(format!("Loading {} from {}...", category, location));
    spinner.enable_steady_tick(Duration::from_millis(120));

    let registry = config.registry();
    let cache = SourceCache::new(ttl);
    let records = cache.get_or_load(category, || {
        let raw = load_collection(&location, &cache_dir, ttl)?;
        let (records, report) = normalize(category, raw, &registry, &default_system);
        spinner.set_message(format!(
            "Normalized {} records ({} skipped)",
            report.imported, report.skipped
        ));
        Ok(records)
    })?;
    spinner.finish_and_clear();

    let store = open_store(config)?;

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::with_template("{msg} [{bar:40}] {pos}/{len} batches")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    pb.set_message(format!("Writing {} clusters", category));
    let options = options(config, strict);
    let report = rebuild_category(&store, &options, category, &records, mode, Some(&pb))?;
    pb.finish_and_clear();

    eprintln!(
        "{} {}: {} records, {} inserted, {} updated, {} removed, {} duplicates dropped",
        match mode {
            RebuildMode::Incremental => "Rebuilt",
            RebuildMode::Reconcile => "Reconciled",
        },
        category,
        report.records,
        report.merge.inserted,
        report.merge.updated,
        report.merge.removed,
        report.merge.duplicates_dropped,
    );
    eprintln!(
        "  {} clusters changed, {} writes in {} batches ({} clusters total)",
        report.merge.changed.len(),
        report.batches.writes,
        report.batches.batches,
        report.clusters
    );
    Ok(())
}
