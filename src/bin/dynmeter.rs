use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};

use dynmeter::meter::types::{DisplayMode, RawValues};
use dynmeter::{MeterEngine, MetricResult};

#[derive(Parser)]
#[command(name = "dynmeter", about = "Evaluate dashboard meters against SQLite collections")]
struct Cli {
    /// Database path (default: ~/.dynmeter/dynmeter.db)
    #[arg(long)]
    db: Option<String>,

    /// SQLite file holding the data collections (default: the database itself)
    #[arg(long)]
    data: Option<String>,

    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate a meter configuration file
    Eval {
        /// JSON configuration (tagged or panel-options form)
        #[arg(long)]
        config: PathBuf,
        /// Evaluation instant (RFC 3339, YYYY-MM-DD or $NOW expression)
        #[arg(long)]
        now: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Manage saved meters
    Meter {
        #[command(subcommand)]
        action: MeterAction,
    },
    /// Manage variables substituted into {{name}} placeholders
    Var {
        #[command(subcommand)]
        action: VarAction,
    },
    /// Inspect collections and register their timestamp fields
    Collection {
        #[command(subcommand)]
        action: CollectionAction,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Show database status
    Status,
}

#[derive(Subcommand)]
enum MeterAction {
    /// Save a meter from a configuration file (replaces an existing one)
    Add {
        name: String,
        #[arg(long)]
        config: PathBuf,
    },
    /// List saved meters
    List {
        #[arg(long)]
        json: bool,
    },
    /// Print a saved meter's configuration
    Show { name: String },
    /// Delete a saved meter
    Remove { name: String },
    /// Evaluate a saved meter
    Eval {
        name: String,
        #[arg(long)]
        now: Option<String>,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum VarAction {
    /// Set a variable
    Set { name: String, value: String },
    /// Print a variable
    Get { name: String },
    /// List variables
    List,
    /// Remove a variable
    Unset { name: String },
}

#[derive(Subcommand)]
enum CollectionAction {
    /// Designate the timestamp field used to date-bound a collection
    Register {
        collection: String,
        timestamp_field: String,
    },
    /// List collections in the data store
    List {
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get { key: String },
    /// Set a config value
    Set { key: String, value: String },
    /// List all config values
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let db = match &cli.db {
        Some(path) => dynmeter::Database::open_at(path).await?,
        None => dynmeter::Database::open().await?,
    };
    let engine = match &cli.data {
        Some(path) => {
            MeterEngine::with_data_store(db, dynmeter::Database::open_data_at(path).await?)
        }
        None => MeterEngine::new(db),
    };

    match cli.command {
        Commands::Eval { config, now, json } => {
            let config = read_config(&config)?;
            let result = engine.evaluate(&config, parse_now(now.as_deref())?).await?;
            print_result(&result, json)?;
        }
        Commands::Meter { action } => handle_meter(&engine, action).await?,
        Commands::Var { action } => handle_var(&engine, action).await?,
        Commands::Collection { action } => handle_collection(&engine, action).await?,
        Commands::Config { action } => handle_config(&engine, action).await?,
        Commands::Status => print_status(&engine).await?,
    }

    Ok(())
}

fn read_config(path: &Path) -> anyhow::Result<dynmeter::MeterConfiguration> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("cannot read {}: {e}", path.display()))?;
    Ok(dynmeter::parse_config_json(&text)?)
}

fn parse_now(now: Option<&str>) -> anyhow::Result<Option<DateTime<Utc>>> {
    match now {
        Some(expr) => Ok(Some(dynmeter::query::date_expr::resolve(expr, Utc::now())?)),
        None => Ok(None),
    }
}

fn print_result(result: &MetricResult, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }

    match result.display_mode {
        DisplayMode::Percentage if result.undefined_ratio => {
            println!("Value:  n/a (denominator is zero)")
        }
        DisplayMode::Percentage => println!("Value:  {:.2}%", result.value),
        DisplayMode::Numeric => println!("Value:  {}", result.value),
    }
    println!("Color:  {}", result.color);
    match result.raw {
        RawValues::Standard { primary, secondary } => {
            println!("  Primary:   {primary}");
            println!("  Secondary: {secondary}");
        }
        RawValues::Retention { start, end, cancelled } => {
            println!("  Start:     {start}");
            println!("  End:       {end}");
            println!("  Cancelled: {cancelled}");
        }
    }
    if let Some(range) = result.range {
        println!("  Range:     {} .. {}", range.from.to_rfc3339(), range.to.to_rfc3339());
    }
    Ok(())
}

async fn handle_meter(engine: &MeterEngine, action: MeterAction) -> anyhow::Result<()> {
    match action {
        MeterAction::Add { name, config } => {
            let config = read_config(&config)?;
            engine.save_meter(&name, &config).await?;
            println!("Saved {} meter: {name}", config.mode());
        }
        MeterAction::List { json } => {
            let meters = engine.list_meters().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&meters)?);
            } else if meters.is_empty() {
                println!("No saved meters.");
            } else {
                for m in meters {
                    println!("  {:<24} {:<10} updated {}", m.name, m.mode, m.updated_at);
                }
            }
        }
        MeterAction::Show { name } => {
            let config = engine.meter(&name).await?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        MeterAction::Remove { name } => {
            if engine.remove_meter(&name).await? {
                println!("Removed: {name}");
            } else {
                println!("Not found: {name}");
            }
        }
        MeterAction::Eval { name, now, json } => {
            let result = engine.evaluate_saved(&name, parse_now(now.as_deref())?).await?;
            print_result(&result, json)?;
        }
    }
    Ok(())
}

async fn handle_var(engine: &MeterEngine, action: VarAction) -> anyhow::Result<()> {
    match action {
        VarAction::Set { name, value } => {
            engine.set_variable(&name, &value).await?;
            println!("{{{{{name}}}}} = {value}");
        }
        VarAction::Get { name } => match engine.variable(&name).await? {
            Some(value) => println!("{{{{{name}}}}} = {value}"),
            None => println!("{name} is not set"),
        },
        VarAction::List => {
            let vars = engine.list_variables().await?;
            if vars.is_empty() {
                println!("No variables set.");
            }
            for (name, value) in vars {
                println!("{{{{{name}}}}} = {value}");
            }
        }
        VarAction::Unset { name } => {
            if engine.remove_variable(&name).await? {
                println!("Removed: {name}");
            } else {
                println!("Not found: {name}");
            }
        }
    }
    Ok(())
}

async fn handle_collection(engine: &MeterEngine, action: CollectionAction) -> anyhow::Result<()> {
    match action {
        CollectionAction::Register {
            collection,
            timestamp_field,
        } => {
            engine.register_collection(&collection, &timestamp_field).await?;
            println!("{collection} is date-bounded by {timestamp_field}");
        }
        CollectionAction::List { json } => {
            let collections = engine.list_collections().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&collections)?);
            } else if collections.is_empty() {
                println!("No collections found.");
            } else {
                for c in collections {
                    let marker = if c.registered { "" } else { " (default)" };
                    println!(
                        "  {:<24} {:>8} rows  timestamp: {}{marker}",
                        c.name, c.row_count, c.timestamp_field
                    );
                }
            }
        }
    }
    Ok(())
}

async fn handle_config(engine: &MeterEngine, action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => match engine.config_get(&key).await? {
            Some(v) => println!("{key} = {v}"),
            None => println!("{key} is not set"),
        },
        ConfigAction::Set { key, value } => {
            engine.config_set(&key, &value).await?;
            println!("Config updated.");
        }
        ConfigAction::List => {
            let items = engine.config_list().await?;
            if items.is_empty() {
                println!("No configuration set.");
            } else {
                for (k, v) in items {
                    println!("{k} = {v}");
                }
            }
        }
    }
    Ok(())
}

async fn print_status(engine: &MeterEngine) -> anyhow::Result<()> {
    let meters = engine.list_meters().await?;
    let variables = engine.list_variables().await?;
    let collections = engine.list_collections().await?;
    let registered = collections.iter().filter(|c| c.registered).count();
    let default_ts = engine
        .config_get(dynmeter::DEFAULT_TIMESTAMP_FIELD_KEY)
        .await?
        .unwrap_or_else(|| dynmeter::store::sqlite::DEFAULT_TIMESTAMP_FIELD.to_string());

    println!("Meter Status");
    println!("  Saved meters:  {}", meters.len());
    println!("  Variables:     {}", variables.len());
    println!("  Collections:   {} ({registered} registered)", collections.len());
    println!("  Timestamp:     {default_ts} (default)");
    Ok(())
}
