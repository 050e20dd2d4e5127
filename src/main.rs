use std::process::ExitCode;

use anyhow::{anyhow, bail, Context};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use diesel::SqliteConnection;
use tracing::{error, info};
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Registry;

use crate::classifier::{Classified, PurchaseDetails};
use crate::config::Settings;
use crate::database::connect::{establish_connection, run_migrations};
use crate::database::queries::load_purchase;
use crate::pipeline::Pipeline;
use crate::portal::http::HttpPortal;
use crate::portal::{session, DateRange, SessionStore};

mod classifier;
mod config;
mod database;
mod error;
mod money;
mod parser;
mod pipeline;
mod portal;
mod schema;

/// Carwash payment portal to SQLite loader.
#[derive(Parser, Debug)]
#[command(name = "carwash-etl")]
#[command(version, about, long_about = None)]
struct Cli {
    /// SQLite database path (overrides DATABASE_URL)
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log in to the portal and cache the session
    Login,

    /// Fetch purchases from the portal and load them
    Run(RunArgs),

    /// Create the database schema
    InitDb,

    /// Print a stored purchase
    Show {
        transaction_id: i64,
    },
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// First purchase date to fetch (YYYY-MM-DD)
    #[arg(long)]
    from: Option<NaiveDate>,

    /// Last purchase date to fetch (YYYY-MM-DD)
    #[arg(long)]
    to: Option<NaiveDate>,

    /// Read the whole listing instead of stopping at the newest stored purchase
    #[arg(long)]
    full: bool,

    /// Ignore the cached session and log in again
    #[arg(long)]
    force_login: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // setup tracing and use bunyan formatter
    let max_level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    let formatting_layer = BunyanFormattingLayer::new("carwash-etl".into(), std::io::stdout);
    let subscriber = Registry::default()
        .with(filter_fn(move |metadata| *metadata.level() <= max_level))
        .with(JsonStorageLayer)
        .with(formatting_layer);
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("cannot install log subscriber: {e}");
    }

    match execute(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn execute(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut settings = Settings::from_env().context("reading configuration")?;
    if let Some(url) = cli.database_url {
        settings.database_url = url;
    }

    match cli.command {
        Command::Login => {
            let portal = HttpPortal::new(&settings.portal_base_url, settings.fetch_timeout)?;
            let store = SessionStore::new(&settings.session_state_path);
            session::login(&portal, &store, &settings.credentials()?).await?;
            info!(path = %store.path().display(), "portal session saved");
            Ok(ExitCode::SUCCESS)
        }
        Command::InitDb => {
            let mut conn = open_database(&settings)?;
            let applied = migrate(&mut conn)?;
            info!(applied, database = %settings.database_url, "schema ready");
            Ok(ExitCode::SUCCESS)
        }
        Command::Show { transaction_id } => {
            let mut conn = open_database(&settings)?;
            match load_purchase(&mut conn, transaction_id)? {
                Some(stored) => {
                    print_purchase(&stored);
                    Ok(ExitCode::SUCCESS)
                }
                None => {
                    error!(transaction_id, "purchase not found");
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Command::Run(args) => {
            let Some(range) = DateRange::between(args.from, args.to) else {
                bail!("--from must not be after --to");
            };
            let mut conn = open_database(&settings)?;
            migrate(&mut conn)?;

            let portal = HttpPortal::new(&settings.portal_base_url, settings.fetch_timeout)?;
            let store = SessionStore::new(&settings.session_state_path);
            let options = settings.pipeline_options(!args.full, args.force_login);
            let mut pipeline = Pipeline::new(&portal, store, settings.credentials(), &mut conn, options);

            match pipeline.run(range).await {
                Ok(report) => {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                    Ok(ExitCode::SUCCESS)
                }
                // already logged by the pipeline
                Err(_) => Ok(ExitCode::FAILURE),
            }
        }
    }
}

fn open_database(settings: &Settings) -> anyhow::Result<SqliteConnection> {
    establish_connection(&settings.database_url).with_context(|| format!("opening {}", settings.database_url))
}

fn migrate(conn: &mut SqliteConnection) -> anyhow::Result<usize> {
    run_migrations(conn).map_err(|e| anyhow!("running migrations: {e}"))
}

fn print_purchase(stored: &Classified) {
    let p = &stored.purchase;
    println!("transaction_id   {}", p.transaction_id);
    println!("purchased        {} {}", p.purchase_date, p.purchase_time);
    println!("cardholder       {} ({})", p.cardholder_name, p.cardholder_last4);
    println!("total            ${}", p.total_amount);
    match &stored.details {
        PurchaseDetails::Vacuum(vacuum) => println!("vacuum           {}", vacuum.vacuum_number),
        PurchaseDetails::WashBay(lines) => {
            for line in lines {
                println!("wash bay         {}  ${}", line.bay_number, line.wash_purchase_total);
            }
        }
    }
}
