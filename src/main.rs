//! # Harvest CLI (`harvest`)
//!
//! Fetches items from configured connectors and writes them as JSON, keeping
//! an archive of the raw traffic so a fetch can be replayed later without
//! touching the source.
//!
//! ## Usage
//!
//! ```bash
//! harvest --config ./config/harvest.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `harvest fetch <type>:<name>` | Fetch items and write them to stdout or a file |
//! | `harvest connectors` | List connector types and configured instances |
//! | `harvest archives list` | List stored archives |
//! | `harvest archives remove <path>` | Delete one archive |
//! | `harvest cache backup\|recover\|clean <type>:<name>` | Maintain a connector's cache |
//! | `harvest completions <shell>` | Print shell completions |
//!
//! ## Examples
//!
//! ```bash
//! # Fetch issues updated since March, one JSON object per line
//! harvest fetch http_json:tracker --from-date 2024-03-01 --json-line
//!
//! # Replay everything archived for that tracker, without network access
//! harvest fetch http_json:tracker --fetch-archive
//!
//! # Redact classified fields (archiving must be off)
//! harvest fetch http_json:tracker --filter-classified --no-archive
//! ```
//!
//! Logs go to stderr; set `RUST_LOG` or pass `--debug` for more detail.

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use item_harvest::archive::ArchiveFilter;
use item_harvest::config::{self, Config, DEFAULT_CONFIG_PATH};
use item_harvest::ingest::{self, CacheAction, FetchArgs};
use item_harvest::models::parse_datetime;
use item_harvest::progress::ProgressMode;
use item_harvest::sources;
use item_harvest::traits::ConnectorRegistry;

/// Harvest CLI: incremental fetching of items from heterogeneous sources.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. When the flag is omitted and `./config/harvest.toml` does not exist,
/// built-in defaults are used.
#[derive(Parser)]
#[command(
    name = "harvest",
    about = "Fetch items from heterogeneous sources into a uniform, replayable envelope",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level (overrides RUST_LOG).
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Fetch items from a connector.
    ///
    /// Items are written as JSON to stdout (or `--output`). Unless archiving
    /// is disabled, the raw traffic is stored so the fetch can be replayed
    /// with `--fetch-archive`.
    Fetch {
        /// Connector instance as `<type>:<name>`, e.g. `http_json:tracker`.
        connector: String,

        /// Category of items to fetch. Defaults to the connector's first one.
        #[arg(long)]
        category: Option<String>,

        /// Only items updated on or after this date (RFC 3339 or YYYY-MM-DD).
        #[arg(long)]
        from_date: Option<String>,

        /// Only items updated before this date (RFC 3339 or YYYY-MM-DD).
        #[arg(long)]
        to_date: Option<String>,

        /// Start at this item offset (offset-based connectors).
        #[arg(long)]
        offset: Option<i64>,

        /// Tag stamped on items. Defaults to the connector's origin.
        #[arg(long)]
        tag: Option<String>,

        /// Remove classified fields from items. Requires `--no-archive`
        /// for connectors that archive.
        #[arg(long)]
        filter_classified: bool,

        /// Drop items whose origin-unique field has one of these values.
        #[arg(long, num_args = 1..)]
        blacklist_ids: Vec<String>,

        /// Do not store an archive of this fetch.
        #[arg(long)]
        no_archive: bool,

        /// Replay stored archives instead of contacting the source.
        #[arg(long)]
        fetch_archive: bool,

        /// With `--fetch-archive`, only archives created on or after this date.
        #[arg(long)]
        archived_since: Option<String>,

        /// Rebuild items from the connector's cache.
        #[arg(long)]
        fetch_cache: bool,

        /// Empty the connector's cache (keeping a backup) before fetching.
        #[arg(long)]
        clean_cache: bool,

        /// Write items to this file instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// One JSON object per line.
        #[arg(long)]
        json_line: bool,

        /// Progress on stderr. Defaults to `human` on a terminal, `off` otherwise.
        #[arg(long, value_enum)]
        progress: Option<ProgressArg>,
    },

    /// List connector types and configured instances.
    Connectors,

    /// Manage stored archives.
    Archives {
        #[command(subcommand)]
        action: ArchivesAction,
    },

    /// Maintain a connector's cache.
    Cache {
        #[command(subcommand)]
        action: CacheCommand,
    },

    /// Print shell completions to stdout.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum ArchivesAction {
    /// List archives, oldest first.
    List {
        #[arg(long)]
        origin: Option<String>,
        #[arg(long)]
        backend: Option<String>,
        #[arg(long)]
        category: Option<String>,
        /// Only archives created on or after this date.
        #[arg(long)]
        since: Option<String>,
    },
    /// Delete an archive file.
    Remove { path: PathBuf },
}

#[derive(Subcommand)]
enum CacheCommand {
    /// Copy the cache to its recovery area.
    Backup { connector: String },
    /// Restore the cache from its recovery area.
    Recover { connector: String },
    /// Empty the cache, backing it up first unless `--erase` is given.
    Clean {
        connector: String,
        /// Also wipe the backup.
        #[arg(long)]
        erase: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    Off,
    Human,
    Json,
}

impl From<ProgressArg> for ProgressMode {
    fn from(arg: ProgressArg) -> Self {
        match arg {
            ProgressArg::Off => ProgressMode::Off,
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
        }
    }
}

fn init_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load(path: Option<&PathBuf>, registry: &ConnectorRegistry) -> anyhow::Result<Config> {
    match path {
        Some(path) => config::load_config(path, registry),
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG_PATH);
            if default.exists() {
                config::load_config(&default, registry)
            } else {
                Ok(Config::default())
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Commands that don't require config
    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "harvest", &mut std::io::stdout());
        return Ok(());
    }

    init_logging(cli.debug);

    let registry = ConnectorRegistry::with_builtins();
    let cfg = load(cli.config.as_ref(), &registry)?;

    match cli.command {
        Commands::Fetch {
            connector,
            category,
            from_date,
            to_date,
            offset,
            tag,
            filter_classified,
            blacklist_ids,
            no_archive,
            fetch_archive,
            archived_since,
            fetch_cache,
            clean_cache,
            output,
            json_line,
            progress,
        } => {
            let args = FetchArgs {
                label: connector,
                category,
                from_date,
                to_date,
                offset,
                tag,
                filter_classified,
                blacklist_ids,
                no_archive,
                fetch_archive,
                archived_since,
                fetch_cache,
                clean_cache,
                output,
                json_line,
            };
            let mode = progress
                .map(ProgressMode::from)
                .unwrap_or_else(ProgressMode::default_for_tty);
            let reporter = mode.reporter();
            ingest::run_fetch(&cfg, &registry, &args, reporter.as_ref()).await?;
        }
        Commands::Connectors => {
            sources::list_connectors(&cfg, &registry)?;
        }
        Commands::Archives { action } => match action {
            ArchivesAction::List {
                origin,
                backend,
                category,
                since,
            } => {
                let filter = ArchiveFilter {
                    origin,
                    backend_name: backend,
                    category,
                    archived_after: since.as_deref().map(parse_datetime).transpose()?,
                };
                ingest::run_list_archives(&cfg, &filter).await?;
            }
            ArchivesAction::Remove { path } => {
                ingest::run_remove_archive(&cfg, &path)?;
            }
        },
        Commands::Cache { action } => {
            let (connector, action) = match action {
                CacheCommand::Backup { connector } => (connector, CacheAction::Backup),
                CacheCommand::Recover { connector } => (connector, CacheAction::Recover),
                CacheCommand::Clean { connector, erase } => {
                    (connector, CacheAction::Clean { erase })
                }
            };
            ingest::run_cache(&cfg, &connector, action)?;
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}
