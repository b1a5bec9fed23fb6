use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::Result;
use color_eyre::eyre::{WrapErr, eyre};
use medsavant_filter::config::Settings;
use medsavant_filter::core::state::{load_filter_sets_from_files, write_filter_sets};
use medsavant_filter::services::FilterRegistry;
use medsavant_filter::sql::{Row, row_to_sql};
use std::path::PathBuf;
use tracing::{debug, info};

/// Inspect saved filter sets
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Enable file logging at the given level (overrides RUST_LOG)
    #[arg(long = "logging", value_enum, global = true)]
    logging: Option<LogLevel>,
    /// Path to a config file (overrides default config discovery)
    #[arg(long = "config", value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the compiled conditions of every saved set
    Inspect {
        /// Saved filter files; sets are numbered across files in order
        #[arg(required = true, value_name = "FILE")]
        files: Vec<PathBuf>,
        /// A record as a JSON object; prints whether each set matches it
        #[arg(long = "record", value_name = "JSON")]
        record: Option<String>,
    },
    /// Combine saved files into one document on stdout
    Merge {
        #[arg(required = true, value_name = "FILE")]
        files: Vec<PathBuf>,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum LogLevel { Error, Warn, Info, Debug, Trace }

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();
    if let Some(level) = args.logging {
        medsavant_filter::logging::init_with(None, Some(level.into()))?;
    }

    let settings = Settings::from_path(args.config.as_deref()).wrap_err("failed to load settings")?;
    debug!(?settings, "settings loaded");
    let registry = FilterRegistry::from_settings(&settings);

    match args.command {
        Command::Inspect { files, record } => {
            let record = record.as_deref().map(parse_record).transpose()?;
            load(&registry, &files)?;
            for scope in registry.scopes() {
                let conditions = registry.query_filter_conditions(scope);
                let (sql, params) = row_to_sql(&conditions);
                println!("set {scope}: {sql}");
                for filter in registry.query_filters(scope) {
                    println!("  - {}", filter.summary());
                }
                if !params.is_empty() {
                    println!("  params: [{}]", params.join(", "));
                }
                if let Some(row) = &record {
                    let mut matches = true;
                    for condition in &conditions {
                        if !condition.evaluate_row(row)? {
                            matches = false;
                            break;
                        }
                    }
                    println!("  matches: {matches}");
                }
            }
        }
        Command::Merge { files } => {
            load(&registry, &files)?;
            print!("{}", write_filter_sets(&registry.to_filter_states())?);
        }
    }
    Ok(())
}

fn load(registry: &FilterRegistry, files: &[PathBuf]) -> Result<()> {
    let sets = load_filter_sets_from_files(files).wrap_err("failed to read saved filters")?;
    let scopes = registry.load_filter_states(sets)?;
    info!(sets = scopes.len(), files = files.len(), "saved filters loaded");
    Ok(())
}

/// JSON object to row; non-string values keep their JSON text, nulls are left out.
fn parse_record(json: &str) -> Result<Row> {
    let value: serde_json::Value = serde_json::from_str(json).wrap_err("--record is not valid JSON")?;
    let serde_json::Value::Object(map) = value else {
        return Err(eyre!("--record must be a JSON object"));
    };
    Ok(map
        .into_iter()
        .filter_map(|(k, v)| match v {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => Some((k, s)),
            other => Some((k, other.to_string())),
        })
        .collect())
}
