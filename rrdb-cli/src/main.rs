//! CLI for the rrdb round-robin database engine.
//!
//! Provides commands for creating, updating, fetching from and inspecting
//! round-robin databases.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use rrdb::consolidate::current_time;
use rrdb::{ConsolFun, EngineConfig, FactoryRegistry, FetchRequest, RrdDb, RrdDef};
use tracing_subscriber::EnvFilter;

/// Command line front end for rrdb round-robin databases.
#[derive(Parser)]
#[command(name = "rrdb", version, about)]
struct Cli {
    /// Engine configuration file (JSON).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Backend provider for bare paths (FILE, MMAP, LOCKED).
    #[arg(long, global = true)]
    backend: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Create a new database.
    Create {
        /// Database path or `scheme:path` identifier.
        path: String,

        /// Primary step in seconds.
        #[arg(long, default_value = "300")]
        step: i64,

        /// Start time in seconds since the epoch (default: now - 10s).
        #[arg(long)]
        start: Option<i64>,

        /// Datasource definition, e.g. `DS:temp:GAUGE:600:U:U`.
        #[arg(long = "ds", required = true)]
        datasources: Vec<String>,

        /// Archive definition, e.g. `RRA:AVERAGE:0.5:1:288`.
        #[arg(long = "rra", required = true)]
        archives: Vec<String>,

        /// Layout version (1 or 2).
        #[arg(long, default_value = "2")]
        layout: u32,
    },

    /// Apply samples in `timestamp:value[:value...]` form (`N` = now, `U` = unknown).
    Update {
        /// Database path.
        path: String,

        /// Samples, applied in order.
        #[arg(required = true)]
        samples: Vec<String>,
    },

    /// Fetch consolidated values.
    Fetch {
        /// Database path.
        path: String,

        /// Consolidation function (AVERAGE, MIN, MAX, LAST, FIRST, TOTAL).
        consol_fun: String,

        /// Start of the range in seconds (default: end - 1 day).
        #[arg(long)]
        start: Option<i64>,

        /// End of the range in seconds (default: now).
        #[arg(long)]
        end: Option<i64>,

        /// Preferred resolution in seconds.
        #[arg(long, default_value = "1")]
        resolution: i64,

        /// Restrict the output to these datasources.
        #[arg(long = "ds")]
        datasources: Vec<String>,

        /// Output format.
        #[arg(long, default_value = "text")]
        format: OutputFormat,
    },

    /// Display the definition and state of a database.
    Info {
        /// Database path.
        path: String,

        /// Output format.
        #[arg(long, default_value = "text")]
        format: OutputFormat,
    },

    /// Dump header, datasources and archive contents.
    Dump {
        /// Database path.
        path: String,
    },

    /// Print the last update time.
    Last {
        /// Database path.
        path: String,
    },
}

/// Output format for fetch and info.
#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// rrdtool-like text.
    Text,
    /// JSON document.
    Json,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = registry(&cli).and_then(|registry| run(cli.command, &registry));

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Builds the provider registry from `--config` and `--backend`.
fn registry(cli: &Cli) -> Result<FactoryRegistry, Box<dyn std::error::Error>> {
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    let registry = FactoryRegistry::from_config(&config)?;
    if let Some(name) = &cli.backend {
        registry.set_default(name)?;
    }
    Ok(registry)
}

fn run(command: Commands, registry: &FactoryRegistry) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Create {
            path,
            step,
            start,
            datasources,
            archives,
            layout,
        } => cmd_create(registry, &path, step, start, &datasources, &archives, layout),
        Commands::Update { path, samples } => cmd_update(registry, &path, &samples),
        Commands::Fetch {
            path,
            consol_fun,
            start,
            end,
            resolution,
            datasources,
            format,
        } => {
            let end = end.unwrap_or_else(current_time);
            let start = start.unwrap_or(end - 86_400);
            let mut request = FetchRequest::new(consol_fun.parse()?, start, end)?
                .with_resolution(resolution)?;
            if !datasources.is_empty() {
                request = request.with_filter(datasources);
            }
            cmd_fetch(registry, &path, &request, &format)
        }
        Commands::Info { path, format } => cmd_info(registry, &path, &format),
        Commands::Dump { path } => {
            let db = RrdDb::open_read_only(&path, registry)?;
            print!("{}", db.dump()?);
            Ok(())
        }
        Commands::Last { path } => {
            let db = RrdDb::open_read_only(&path, registry)?;
            println!("{}", db.last_update_time()?);
            Ok(())
        }
    }
}

/// Implements `rrdb create <path>`.
fn cmd_create(
    registry: &FactoryRegistry,
    path: &str,
    step: i64,
    start: Option<i64>,
    datasources: &[String],
    archives: &[String],
    layout: u32,
) -> Result<(), Box<dyn std::error::Error>> {
    let start = start.unwrap_or_else(|| current_time() - 10);
    let mut def = RrdDef::new(path, start, step)?;
    def.set_version(layout)?;
    for ds in datasources {
        def.add_datasource(ds.parse()?)?;
    }
    for rra in archives {
        def.add_archive(rra.parse()?)?;
    }

    let db = RrdDb::create(&def, registry)?;
    println!(
        "Created {} ({} datasources, {} archives, {} bytes)",
        db.uri(),
        db.ds_count(),
        db.arc_count(),
        def.estimated_size()
    );
    db.close()?;
    Ok(())
}

/// Implements `rrdb update <path> <sample>...`.
fn cmd_update(
    registry: &FactoryRegistry,
    path: &str,
    samples: &[String],
) -> Result<(), Box<dyn std::error::Error>> {
    let db = RrdDb::open(path, registry)?;
    let mut sample = db.create_sample(0);
    for input in samples {
        sample.set_and_update(input)?;
    }
    db.close()?;
    Ok(())
}

/// Implements `rrdb fetch <path> <cf>`.
fn cmd_fetch(
    registry: &FactoryRegistry,
    path: &str,
    request: &FetchRequest,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let db = RrdDb::open_read_only(path, registry)?;
    let data = db.fetch(request)?;

    match format {
        OutputFormat::Text => print!("{data}"),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&data)?),
    }
    Ok(())
}

/// Implements `rrdb info <path>`.
fn cmd_info(
    registry: &FactoryRegistry,
    path: &str,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let db = RrdDb::open_read_only(path, registry)?;

    if let OutputFormat::Json = format {
        let mut def = db.rrd_def()?;
        def.path = db.uri().to_string();
        println!("{}", serde_json::to_string_pretty(&def)?);
        return Ok(());
    }

    println!("Database: {}", db.uri());
    println!("  Signature: {}", db.signature()?);
    println!("  Step: {}s", db.step()?);
    println!("  Last update: {}", db.last_update_time()?);
    println!();

    println!("Datasources: {}", db.ds_count());
    for i in 0..db.ds_count() {
        let ds = db.datasource(i)?;
        println!(
            "  ds[{}]: type={}, heartbeat={}, min={}, max={}",
            ds.name,
            ds.ds_type,
            ds.heartbeat,
            format_bound(ds.min),
            format_bound(ds.max)
        );
        println!(
            "    last_value={}, accum_value={}, unknown_sec={}",
            ds.last_value, ds.accum_value, ds.nan_seconds
        );
    }
    println!();

    println!("Archives: {}", db.arc_count());
    for i in 0..db.arc_count() {
        let arc = db.archive(i)?;
        println!(
            "  rra[{i}]: cf={}, xff={}, steps={}, rows={} ({}s per row)",
            arc.consol_fun, arc.xff, arc.steps, arc.rows, arc.arc_step
        );
        println!("    covers {} .. {}", arc.start_time, arc.end_time);
    }

    // Consolidation functions with at least one archive
    let served: Vec<&str> = ConsolFun::ALL
        .into_iter()
        .filter(|&cf| (0..db.arc_count()).any(|i| db.archive(i).is_ok_and(|a| a.consol_fun == cf)))
        .map(ConsolFun::name)
        .collect();
    println!();
    println!("Fetchable with: {}", served.join(", "));

    Ok(())
}

/// Formats a datasource bound, `U` when unbounded.
fn format_bound(value: f64) -> String {
    if value.is_nan() {
        "U".to_string()
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_registry() -> FactoryRegistry {
        let registry = FactoryRegistry::default();
        registry.set_default("FILE").unwrap();
        registry
    }

    #[test]
    fn test_create_update_last() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cli.rrd");
        let path = path.to_str().unwrap();
        let registry = file_registry();

        cmd_create(
            &registry,
            path,
            60,
            Some(960),
            &["DS:x:GAUGE:120:U:U".to_string()],
            &["RRA:AVERAGE:0.5:1:10".to_string()],
            2,
        )
        .unwrap();
        cmd_update(
            &registry,
            path,
            &["1020:1".to_string(), "1080:U".to_string()],
        )
        .unwrap();

        let db = RrdDb::open_read_only(path, &registry).unwrap();
        assert_eq!(db.last_update_time().unwrap(), 1080);
    }

    #[test]
    fn test_create_rejects_bad_definitions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.rrd");
        let registry = file_registry();

        let result = cmd_create(
            &registry,
            path.to_str().unwrap(),
            60,
            Some(0),
            &["DS:x:NOPE:120:U:U".to_string()],
            &["RRA:AVERAGE:0.5:1:10".to_string()],
            2,
        );
        assert!(result.is_err());
        assert!(!path.exists());
    }

    #[test]
    fn test_format_bound() {
        assert_eq!(format_bound(f64::NAN), "U");
        assert_eq!(format_bound(1.5), "1.5");
    }
}
