//! ephemvault - Temporal fragment store
//!
//! Usage:
//!   ephemvault init                 - Write a default configuration
//!   ephemvault demo                 - Create, reconstruct and expire a set in-process
//!   ephemvault odds --real <n>      - Canary detection probability table
//!   ephemvault audit                - Print the audit log
//!   ephemvault config               - Print the effective configuration

use clap::{Parser, Subcommand};
use ephemvault::{
    canary::{detection_probability, tokens_for_probability},
    config::{Config, LoggingConfig},
    domain::{DomainRef, MemoryDomain, SledDomain, StorageDomain},
    metadata::AuditLog,
    store::STATE_DB,
    types::{DomainId, SetId},
    Error, FragmentStore, Result,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Sled database holding the persistent demo domains
const DOMAINS_DB: &str = "domains.db";

#[derive(Parser)]
#[command(name = "ephemvault")]
#[command(author = "ephemvault Contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Temporal fragment store")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "~/.config/ephemvault/config.json")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Directory for persisted metadata and the audit log
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Run the store in-process: create a set, reconstruct it, watch it expire
    Demo {
        /// Payload to protect
        #[arg(long, default_value = "attack at dawn")]
        payload: String,

        /// Number of storage domains
        #[arg(long, default_value_t = 7)]
        domains: u16,

        /// Fragments per set (N)
        #[arg(short = 'n', long, default_value_t = 7)]
        total: usize,

        /// Fragments needed to reconstruct (K)
        #[arg(short = 'k', long, default_value_t = 4)]
        threshold: usize,

        /// Fragment lifetime in milliseconds
        #[arg(long, default_value_t = 100)]
        lifetime_ms: u64,

        /// Domains to bulk-scan after creation, simulating an intruder
        #[arg(long, value_delimiter = ',')]
        scan: Vec<u16>,

        /// Keep domains in a sled database under the data directory
        #[arg(long)]
        persistent: bool,
    },

    /// Probability that a partial scan trips at least one canary
    Odds {
        /// Real fragments in the domain
        #[arg(long)]
        real: usize,

        /// Fraction of the domain's blobs the attacker reads
        #[arg(long, default_value_t = 0.1)]
        fraction: f64,

        /// Largest token count to tabulate
        #[arg(long, default_value_t = 10)]
        max_tokens: usize,

        /// Report the fewest tokens reaching this probability
        #[arg(long)]
        target: Option<f64>,
    },

    /// Print the audit log as JSON lines
    Audit {
        /// Only entries about this set
        #[arg(long)]
        set: Option<SetId>,
    },

    /// Print the effective configuration
    Config,
}

fn main() {
    let cli = Cli::parse();

    // Expand ~ in config path
    let config_path = expand_tilde(&cli.config);

    let config = match load_config(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = init_logging(cli.verbose, &config.logging) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = run_command(cli.command, &config_path, config) {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Level comes from `--verbose`, then `RUST_LOG`, then the config file
fn init_logging(verbose: bool, logging: &LoggingConfig) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level))
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match &logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            builder
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .try_init()
        }
        None => builder.try_init(),
    }
    .map_err(|e| Error::Internal(format!("Failed to set subscriber: {}", e)))
}

/// Load the config file if present, defaults otherwise
fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        Config::load(path)
    } else {
        let mut config = Config::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}

fn run_command(command: Commands, config_path: &Path, config: Config) -> Result<()> {
    match command {
        Commands::Init { data_dir, force } => cmd_init(config_path, data_dir, force),

        Commands::Demo {
            payload,
            domains,
            total,
            threshold,
            lifetime_ms,
            scan,
            persistent,
        } => {
            let runtime =
                tokio::runtime::Runtime::new().map_err(|e| Error::Internal(e.to_string()))?;
            runtime.block_on(cmd_demo(
                config,
                DemoOptions {
                    payload,
                    domains,
                    total,
                    threshold,
                    lifetime: Duration::from_millis(lifetime_ms),
                    scan,
                    persistent,
                },
            ))
        }

        Commands::Odds {
            real,
            fraction,
            max_tokens,
            target,
        } => cmd_odds(real, fraction, max_tokens, target),

        Commands::Audit { set } => cmd_audit(&config, set),

        Commands::Config => cmd_config(config_path, &config),
    }
}

fn cmd_init(config_path: &Path, data_dir: Option<PathBuf>, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        return Err(Error::Config(format!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        )));
    }

    let mut config = Config::default();
    config.data_dir = Some(data_dir.unwrap_or_else(|| {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ephemvault")
    }));
    config.validate()?;
    config.ensure_directories()?;
    config.save(config_path)?;

    info!("Configuration written to {}", config_path.display());
    println!("Configuration: {}", config_path.display());
    if let Some(dir) = &config.data_dir {
        println!("Data directory: {}", dir.display());
    }
    Ok(())
}

struct DemoOptions {
    payload: String,
    domains: u16,
    total: usize,
    threshold: usize,
    lifetime: Duration,
    scan: Vec<u16>,
    persistent: bool,
}

async fn cmd_demo(config: Config, options: DemoOptions) -> Result<()> {
    let mut memory = Vec::new();
    let domains: Vec<DomainRef> = if options.persistent {
        let dir = config.data_dir.clone().ok_or_else(|| {
            Error::Config("--persistent needs a data_dir (run 'ephemvault init')".to_string())
        })?;
        config.ensure_directories()?;
        let db = sled::open(dir.join(DOMAINS_DB))?;
        (0..options.domains)
            .map(|i| SledDomain::open(&db, DomainId(i)).map(|d| Arc::new(d) as DomainRef))
            .collect::<Result<_>>()?
    } else {
        memory = MemoryDomain::pool(options.domains);
        memory.iter().map(|d| d.clone() as DomainRef).collect()
    };

    let store = FragmentStore::builder(config).domains(domains.clone()).build()?;
    let resumed = store.resume().await?;
    if resumed.live + resumed.expired > 0 {
        println!(
            "Resumed {} live and {} expired sets from an earlier run",
            resumed.live, resumed.expired
        );
    }

    let set_id = store
        .create_fragment_set(
            options.payload.as_bytes(),
            options.total,
            options.threshold,
            options.lifetime,
        )
        .await?;
    println!(
        "Created set {} ({}-of-{}, lifetime {:?})",
        set_id, options.threshold, options.total, options.lifetime
    );

    let recovered = store.reconstruct(set_id, Duration::from_secs(1)).await?;
    println!("Reconstructed: {}", String::from_utf8_lossy(&recovered));
    print_status(&store, set_id)?;

    if !options.scan.is_empty() {
        let mut alerts = store.subscribe();
        for index in &options.scan {
            let Some(domain) = domains.iter().find(|d| d.id() == DomainId(*index)) else {
                warn!("No domain d{} to scan", index);
                continue;
            };
            let keys = domain.scan("demo-intruder").await?;
            println!("Scanned {}: {} blobs listed", domain.id(), keys.len());
        }

        match tokio::time::timeout(Duration::from_millis(500), alerts.recv()).await {
            Ok(Ok(alert)) => println!(
                "Alert {}: {} ({} tightened, {} rehomed, {} sets purged)",
                alert.alert_id,
                alert.reason,
                alert.tightened,
                alert.rehomed,
                alert.purged_sets.len()
            ),
            _ => println!("No escalation (state: {})", store.escalation_state()),
        }
        print_status(&store, set_id)?;
    }

    let status = store.status(set_id)?;
    tokio::time::sleep(status.remaining + Duration::from_millis(20)).await;

    match store.reconstruct(set_id, Duration::from_secs(1)).await {
        Ok(_) => println!("Set {} still reconstructible after its deadline", set_id),
        Err(e) => println!("After expiry: {}", e),
    }
    print_status(&store, set_id)?;

    if !memory.is_empty() {
        let remaining: usize = memory.iter().map(|d| d.blob_count()).sum();
        println!("Blobs left across domains (unbound canaries only): {}", remaining);
    }

    store.shutdown().await
}

fn print_status(store: &FragmentStore, set_id: SetId) -> Result<()> {
    let status = store.status(set_id)?;
    println!(
        "  live {}/{} (threshold {}), remaining {:?}, escalation {}",
        status.fragments_live,
        status.total_fragments,
        status.threshold,
        status.remaining,
        status.escalation_state
    );
    Ok(())
}

fn cmd_odds(real: usize, fraction: f64, max_tokens: usize, target: Option<f64>) -> Result<()> {
    if !(fraction > 0.0 && fraction <= 1.0) {
        return Err(Error::InvalidParameters(format!(
            "fraction must be in (0, 1], got {}",
            fraction
        )));
    }

    println!("Canary detection odds");
    println!("=====================");
    println!("Real fragments: {}, scanned fraction: {:.0}%", real, fraction * 100.0);
    println!();
    println!("{:>6}  {:>11}", "tokens", "probability");
    for tokens in 1..=max_tokens {
        println!(
            "{:>6}  {:>10.1}%",
            tokens,
            detection_probability(real, tokens, fraction) * 100.0
        );
    }

    if let Some(target) = target {
        println!();
        match tokens_for_probability(real, fraction, target) {
            Some(tokens) => println!("{} tokens reach {:.0}%", tokens, target * 100.0),
            None => println!("No token count up to {} reaches {:.0}%", real.max(1), target * 100.0),
        }
    }
    Ok(())
}

fn cmd_audit(config: &Config, set: Option<SetId>) -> Result<()> {
    let dir = config
        .data_dir
        .as_ref()
        .ok_or_else(|| Error::Config("No data_dir configured (run 'ephemvault init')".to_string()))?;
    let db = sled::open(dir.join(STATE_DB))?;
    let log = AuditLog::with_db(db)?;

    let entries = match set {
        Some(set_id) => log.entries_for(set_id)?,
        None => log.entries()?,
    };
    for entry in entries {
        println!("{}", serde_json::to_string(&entry)?);
    }
    Ok(())
}

fn cmd_config(config_path: &Path, config: &Config) -> Result<()> {
    println!("# {}", config_path.display());
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
