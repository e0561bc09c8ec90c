//! zonectl: inspect a zoneweave world and play it headless.
//!
//! ## Subcommands
//!
//! - `status`: leader liveness rows and how stale they are
//! - `locate`: where a character is recorded and its last saved position
//! - `play`: join as a character and follow redirects between zones

mod play;

use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use zoneweave_core::config::{load_config, resolve_config_path};
use zoneweave_core::store::{parse_online_timestamp, CharacterPersistence};
use zoneweave_core::{Db, LaunchArgs, ZoneConfig, ZoneError};
use zoneweave_protocol::{ErrorInfo, Position};

#[derive(Debug, thiserror::Error)]
pub enum CtlError {
    #[error(transparent)]
    Zone(#[from] ZoneError),

    #[error("Zone refused the request: {0}")]
    Server(ErrorInfo),

    #[error("Failed to render output: {0}")]
    Output(#[from] serde_json::Error),

    #[error("Gave up after {0} redirects")]
    TooManyRedirects(usize),
}

#[derive(Parser)]
#[command(name = "zonectl")]
#[command(about = "Inspect and play a zoneweave world")]
#[command(version)]
struct Cli {
    /// Zone configuration file (defaults to $ZONEWEAVE_CONFIG, then ~/.zoneweave/zones.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show liveness rows
    Status {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show where a character is recorded
    Locate {
        #[arg(value_name = "CHARACTER")]
        character: String,
    },

    /// Join the world as a character and follow redirects
    Play {
        #[arg(value_name = "CHARACTER")]
        character: String,

        /// Region to connect to first (defaults to the home region)
        #[arg(long, value_name = "REGION_PATH")]
        region: Option<String>,

        /// Position to walk to after joining, as x,y,z; repeatable
        #[arg(long = "move", value_name = "X,Y,Z", value_parser = parse_position)]
        moves: Vec<Position>,

        #[arg(long, default_value_t = 8)]
        max_redirects: usize,

        /// How long to wait for the zone before sending the next move
        #[arg(long, default_value_t = 750)]
        idle_ms: u64,
    },
}

fn main() {
    init_logging();
    let cli = Cli::parse();

    let config = match load(cli.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("zonectl: {}", err);
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Status { json } => status(&config, json),
        Commands::Locate { character } => locate(&config, &character),
        Commands::Play {
            character,
            region,
            moves,
            max_redirects,
            idle_ms,
        } => {
            let start_region = region.unwrap_or_else(|| config.home_region().to_string());
            play::run(
                &config,
                play::PlayOptions {
                    character,
                    start_region,
                    moves,
                    max_redirects,
                    read_timeout: Duration::from_millis(idle_ms.max(1)),
                },
            )
            .map(|summary| {
                if let Some(region) = summary.region_path {
                    println!("finished in {} after {} redirect(s)", region, summary.redirects);
                }
            })
        }
    };

    if let Err(err) = result {
        eprintln!("zonectl: {}", err);
        std::process::exit(1);
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load(path: Option<PathBuf>) -> Result<ZoneConfig, CtlError> {
    let path = match path {
        Some(path) => path,
        None => resolve_config_path(&LaunchArgs::new("zonectl", Vec::new()))?,
    };
    Ok(load_config(&path)?)
}

fn status(config: &ZoneConfig, json: bool) -> Result<(), CtlError> {
    let db = Db::new(config.database_path()?)?;
    let rows = db.list_zones()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    if rows.is_empty() {
        println!("no liveness rows");
        return Ok(());
    }

    let timeout = config.liveness.timeout_interval();
    let now = Utc::now();
    println!("{:<16} {:<26} {:>10}  STATE", "ZONE", "ONLINE", "AGE");
    for row in rows {
        let (age, state) = match parse_online_timestamp(&row.online) {
            Some(at) => {
                let age = now.signed_duration_since(at);
                let state = if age <= timeout { "alive" } else { "stale" };
                (format!("{:.1}s", age.num_milliseconds() as f64 / 1000.0), state)
            }
            None if row.online.trim().is_empty() => ("-".to_string(), "offline"),
            None => ("-".to_string(), "malformed"),
        };
        println!("{:<16} {:<26} {:>10}  {}", row.zone_name, row.online, age, state);
    }
    Ok(())
}

fn locate(config: &ZoneConfig, character: &str) -> Result<(), CtlError> {
    let db = Db::new(config.database_path()?)?;
    match db.get_last_known_region(character)? {
        Some(region) => println!("{} is in {}", character, region),
        None => println!("{} has no recorded region", character),
    }
    if let Some(saved) = db.get_character_position(character)? {
        let position = saved.position;
        println!(
            "last saved at ({}, {}, {}) on {}",
            position.x, position.y, position.z, saved.saved_at
        );
    }
    Ok(())
}

fn parse_position(value: &str) -> Result<Position, String> {
    let parts: Vec<&str> = value.split(',').map(str::trim).collect();
    let [x, y, z] = parts.as_slice() else {
        return Err(format!("expected X,Y,Z, got {}", value));
    };
    let coordinate = |raw: &str| {
        raw.parse::<f32>()
            .map_err(|err| format!("invalid coordinate {}: {}", raw, err))
    };
    let position = Position::new(coordinate(*x)?, coordinate(*y)?, coordinate(*z)?);
    if !position.is_finite() {
        return Err("coordinates must be finite".to_string());
    }
    Ok(position)
}
